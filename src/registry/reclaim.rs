//! `ls`, `inspect`, `kill`, and `purge` (spec §4.9).

use std::{path::Path, time::Duration};

use stacked_errors::{Result, StackableErr};

use super::{liveness, metadata::VMMetadata};
use crate::{
    cni::CniDriver,
    firewall::{FirewallController, PortSpec},
};

/// Budget for `kill` step 3's pid poll (spec §4.9, §5 "kill-wait (15 s)").
pub const KILL_WAIT_BUDGET: Duration = Duration::from_secs(15);

/// One line of `ls` output (spec §4.9: "emits one line per entry with
/// `{id, running, pid, image, started_at, ip}`").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ListEntry {
    pub id: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub image: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ip: Option<String>,
}

/// Lists every VM with a persisted record under `run_cache_dir`. Entries
/// whose `metadata.json` fails to parse are skipped with a warning rather
/// than failing the whole listing.
#[tracing::instrument]
pub async fn ls(run_cache_dir: &Path) -> Result<Vec<ListEntry>> {
    let mut entries = vec![];
    for id in VMMetadata::list_ids(run_cache_dir).await.stack_err("registry::ls")? {
        match VMMetadata::load(run_cache_dir, &id).await {
            Ok(meta) => {
                let running = meta.pid.map(liveness::is_pid_alive).unwrap_or(false);
                entries.push(ListEntry {
                    id: meta.vm_id,
                    running,
                    pid: meta.pid,
                    image: meta.image_tag.to_string(),
                    started_at: meta.started_at_utc,
                    ip: meta.network_interfaces.first().map(|n| n.ip.clone()),
                });
            }
            Err(e) => tracing::warn!(vm_id = %id, error = %e, "skipping entry with unreadable metadata"),
        }
    }
    Ok(entries)
}

/// Pretty-prints the persisted record for `vm_id`.
pub async fn inspect(run_cache_dir: &Path, vm_id: &str) -> Result<String> {
    let meta = VMMetadata::load(run_cache_dir, vm_id)
        .await
        .stack_err_with(|| format!("registry::inspect -> {vm_id}"))?;
    serde_json::to_string_pretty(&meta).stack_err("registry::inspect -> serialize")
}

/// Whether `kill` found and acted on a record, or found nothing (spec §8
/// "Kill idempotence": a second `kill` "exits non-fatally and changes no
/// host state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    NotFound,
}

/// Runs the spec §4.9 `kill` sequence. `firewall` is optional because a
/// `run` started with no `--expose-port` never published any rules.
#[tracing::instrument(skip(cni, firewall))]
pub async fn kill(
    run_cache_dir: &Path,
    vm_id: &str,
    cni: &CniDriver,
    firewall: Option<&FirewallController>,
) -> Result<KillOutcome> {
    let meta = match VMMetadata::load(run_cache_dir, vm_id).await {
        Ok(meta) => meta,
        Err(_) => return Ok(KillOutcome::NotFound),
    };

    let jail_dir = meta.jail.location(vm_id).path();
    if !jail_dir_looks_valid(&jail_dir, &meta.jail.hypervisor_basename) {
        stacked_errors::bail_locationless!(
            "kill -> {jail_dir:?} missing expected jail contents (root/dev, root/run, root/{})",
            meta.jail.hypervisor_basename
        );
    }

    let control_socket_path = jail_dir.join("firecracker.socket");
    if tokio::fs::metadata(&control_socket_path).await.is_ok() {
        let _sent = crate::control_socket::send_ctrl_alt_del(&control_socket_path)
            .await
            .stack_err("registry::kill -> send_ctrl_alt_del")?;
    }

    if let Some(pid) = meta.pid {
        if !liveness::wait_for_exit(pid, KILL_WAIT_BUDGET)
            .await
            .stack_err("registry::kill -> waiting for process exit")?
        {
            tracing::warn!(vm_id, pid, "process still alive after kill-wait budget");
        }
    }

    if let Err(e) = cni
        .cleanup(&meta.cni.net_name, vm_id, &meta.cni.runtime.veth_name, &meta.cni.runtime.net_ns)
        .await
    {
        tracing::warn!(vm_id, error = %e, "CNI cleanup failed during kill");
    }

    if let Some(firewall) = firewall {
        if !meta.exposed_ports.is_empty() {
            let ports = parse_ports(&meta.exposed_ports);
            if let Err(e) = firewall.unpublish(vm_id, &meta.cni.runtime.ip, &ports).await {
                tracing::warn!(vm_id, error = %e, "firewall unpublish failed during kill");
            }
        }
    }

    VMMetadata::remove(run_cache_dir, vm_id)
        .await
        .stack_err("registry::kill -> removing run-cache entry")?;

    if let Err(e) = tokio::fs::remove_dir_all(&jail_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(vm_id, error = %e, "failed to remove jail directory during kill");
        }
    }

    Ok(KillOutcome::Killed)
}

/// Reclaims every non-running entry in `run_cache_dir` (spec §4.9 `purge`,
/// §8 "Purge safety": never touches an entry whose pid is live). Individual
/// entry failures are warned and skipped rather than aborting the whole
/// purge (spec §7 "Reclamation ... warnings only, never fatal to a purge").
#[tracing::instrument(skip(cni, firewall))]
pub async fn purge(run_cache_dir: &Path, cni: &CniDriver, firewall: Option<&FirewallController>) -> Result<Vec<String>> {
    let mut purged = vec![];
    for id in VMMetadata::list_ids(run_cache_dir).await.stack_err("registry::purge")? {
        let meta = match VMMetadata::load(run_cache_dir, &id).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(vm_id = %id, error = %e, "purge: skipping entry with unreadable metadata");
                continue;
            }
        };
        if meta.pid.map(liveness::is_pid_alive).unwrap_or(false) {
            tracing::debug!(vm_id = %id, "purge: skipping live VM");
            continue;
        }

        if let Err(e) = cni
            .cleanup(&meta.cni.net_name, &id, &meta.cni.runtime.veth_name, &meta.cni.runtime.net_ns)
            .await
        {
            tracing::warn!(vm_id = %id, error = %e, "purge: CNI cleanup failed, continuing");
        }

        if let Some(firewall) = firewall {
            if !meta.exposed_ports.is_empty() {
                let ports = parse_ports(&meta.exposed_ports);
                if let Err(e) = firewall.unpublish(&id, &meta.cni.runtime.ip, &ports).await {
                    tracing::warn!(vm_id = %id, error = %e, "purge: firewall unpublish failed, continuing");
                }
            }
        }

        let jail_dir = meta.jail.location(&id).path();
        if let Err(e) = tokio::fs::remove_dir_all(&jail_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(vm_id = %id, error = %e, "purge: failed to remove jail directory, continuing");
            }
        }

        if let Err(e) = VMMetadata::remove(run_cache_dir, &id).await {
            tracing::warn!(vm_id = %id, error = %e, "purge: failed to remove run-cache entry");
            continue;
        }
        purged.push(id);
    }
    Ok(purged)
}

fn jail_dir_looks_valid(jail_dir: &Path, hypervisor_basename: &str) -> bool {
    jail_dir.join("root").join("dev").exists()
        && jail_dir.join("root").join("run").exists()
        && jail_dir.join("root").join(hypervisor_basename).exists()
}

fn parse_ports(raw: &[String]) -> Vec<PortSpec> {
    raw.iter()
        .filter_map(|s| match PortSpec::parse(s) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(spec = %s, error = %e, "skipping unparseable persisted port spec");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jail_dir_invalid_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!jail_dir_looks_valid(dir.path(), "firecracker"));
    }

    #[test]
    fn jail_dir_valid_when_expected_paths_exist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("root/dev")).unwrap();
        std::fs::create_dir_all(dir.path().join("root/run")).unwrap();
        std::fs::write(dir.path().join("root/firecracker"), b"").unwrap();
        assert!(jail_dir_looks_valid(dir.path(), "firecracker"));
    }
}
