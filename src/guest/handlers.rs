//! The hypervisor SDK's handler-chain abstraction (spec §4.5 step 2): a
//! fixed sequence of named phases, with extra handlers spliced in via
//! `append_after_phase`. [`super::lifecycle::start`] uses this to inject the
//! pseudo-cloud-init handler immediately before the boot-source phase
//! without hardcoding that placement into the start sequence itself.

use std::{future::Future, pin::Pin, sync::Arc};

use stacked_errors::{Result, StackableErr};

/// Well-known phases of a jailed hypervisor boot, in the order the control
/// socket expects them to be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    MachineConfig,
    Drives,
    NetworkInterfaces,
    BootSource,
    StartInstance,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::MachineConfig => "machine-config",
            Phase::Drives => "drives",
            Phase::NetworkInterfaces => "network-interfaces",
            Phase::BootSource => "boot-source",
            Phase::StartInstance => "start-instance",
        }
    }
}

pub type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type Handler = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

enum Entry {
    Phase(Phase, Handler),
    Extra(&'static str, Handler),
}

/// An ordered list of async steps. Built from the builtin phase handlers,
/// then extended with `append_after_phase` placements before `run` drives
/// the whole chain to completion, in order, stopping at the first error.
pub struct HandlerChain {
    entries: Vec<Entry>,
}

impl HandlerChain {
    pub fn new(builtin: Vec<(Phase, Handler)>) -> Self {
        Self {
            entries: builtin.into_iter().map(|(p, h)| Entry::Phase(p, h)).collect(),
        }
    }

    /// Inserts `handler` immediately after the last entry belonging to
    /// `phase`. Appends to the end of the chain if `phase` is not present
    /// (defensive: every builtin phase is always present in practice).
    pub fn append_after_phase(&mut self, phase: Phase, label: &'static str, handler: Handler) {
        let insert_at = self
            .entries
            .iter()
            .rposition(|e| matches!(e, Entry::Phase(p, _) if *p == phase))
            .map(|i| i + 1)
            .unwrap_or(self.entries.len());
        self.entries.insert(insert_at, Entry::Extra(label, handler));
    }

    /// Inserts `handler` immediately before the first entry belonging to
    /// `phase` (used to splice pseudo-cloud-init before boot-source).
    pub fn prepend_before_phase(&mut self, phase: Phase, label: &'static str, handler: Handler) {
        let insert_at = self
            .entries
            .iter()
            .position(|e| matches!(e, Entry::Phase(p, _) if *p == phase))
            .unwrap_or(0);
        self.entries.insert(insert_at, Entry::Extra(label, handler));
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&self) -> Result<()> {
        for entry in &self.entries {
            let (label, handler) = match entry {
                Entry::Phase(phase, handler) => (phase.label(), handler),
                Entry::Extra(label, handler) => (*label, handler),
            };
            tracing::debug!(phase = label, "running handler chain step");
            (handler)()
                .await
                .stack_err_with(|| format!("HandlerChain::run -> phase {label}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn record(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Handler {
        Arc::new(move || {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(name);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn cloud_init_splices_before_boot_source() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut chain = HandlerChain::new(vec![
            (Phase::MachineConfig, record(log.clone(), "machine-config")),
            (Phase::Drives, record(log.clone(), "drives")),
            (Phase::NetworkInterfaces, record(log.clone(), "network-interfaces")),
            (Phase::BootSource, record(log.clone(), "boot-source")),
            (Phase::StartInstance, record(log.clone(), "start-instance")),
        ]);
        chain.prepend_before_phase(Phase::BootSource, "cloud-init", record(log.clone(), "cloud-init"));
        chain.run().await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "machine-config",
                "drives",
                "network-interfaces",
                "cloud-init",
                "boot-source",
                "start-instance",
            ]
        );
    }

    #[tokio::test]
    async fn run_stops_at_first_error() {
        let log = Arc::new(Mutex::new(vec![]));
        let failing: Handler = Arc::new(|| Box::pin(async { stacked_errors::bail_locationless!("boom") }));
        let mut chain = HandlerChain::new(vec![(Phase::MachineConfig, record(log.clone(), "machine-config"))]);
        chain.append_after_phase(Phase::MachineConfig, "failing", failing);
        chain.append_after_phase(Phase::MachineConfig, "never", record(log.clone(), "never"));
        assert!(chain.run().await.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["machine-config"]);
    }
}
