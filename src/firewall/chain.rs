//! Two-level packet-filter chain structure (spec §4.8): a host-wide filter
//! chain, and one NAT chain per running VM.

use stacked_errors::{Result, StackableErr};

use super::{lock::IptablesLock, portspec::PortSpec};
use crate::Command;

/// `FBD-<vm_id>`, truncated to fit the 29-character iptables chain-name
/// limit (spec §4.8).
const CHAIN_NAME_LIMIT: usize = 29;

fn vm_chain_name(vm_id: &str) -> String {
    let mut name = format!("FBD-{vm_id}");
    name.truncate(CHAIN_NAME_LIMIT);
    name
}

/// The structured comment spec §4.8 mandates for rule identification:
/// `firebuild:<iface|*>:<host_port>:<dest_port>:/<proto>`.
fn rule_comment(port: &PortSpec) -> String {
    format!(
        "firebuild:{}:{}:{}:/{}",
        port.interface.as_deref().unwrap_or("*"),
        port.host_port,
        port.dest_port,
        port.protocol
    )
}

/// Manages the host-wide `FIREBUILD-FILTER` chain and one `FBD-<vm_id>` NAT
/// chain per published VM, serialised by [`IptablesLock`].
pub struct FirewallController {
    pub filter_chain_name: String,
    lock: IptablesLock,
}

impl FirewallController {
    pub fn new(filter_chain_name: impl Into<String>, lock: IptablesLock) -> Self {
        Self {
            filter_chain_name: filter_chain_name.into(),
            lock,
        }
    }

    /// Publishes firewall and NAT rules for each port in `ports`, targeting
    /// `target_ip` inside the VM's network namespace. Idempotent: running
    /// this twice leaves the same rule set (spec §8 "Firewall idempotence").
    #[tracing::instrument(skip(self, ports))]
    pub async fn publish(&self, vm_id: &str, target_ip: &str, ports: &[PortSpec]) -> Result<()> {
        let _guard = self.lock.acquire().await.stack_err("FirewallController::publish")?;
        self.ensure_filter_chain().await?;
        let nat_chain = vm_chain_name(vm_id);
        self.ensure_nat_chain(&nat_chain).await?;
        for port in ports {
            self.append_filter_rule(target_ip, port).await?;
            self.append_nat_rule(&nat_chain, target_ip, port).await?;
        }
        Ok(())
    }

    /// Removes the rules `publish` added; when the per-VM NAT chain becomes
    /// empty, removes the `PREROUTING` jump and the chain itself (spec §4.8,
    /// §8 "Firewall inverse").
    #[tracing::instrument(skip(self, ports))]
    pub async fn unpublish(&self, vm_id: &str, target_ip: &str, ports: &[PortSpec]) -> Result<()> {
        let _guard = self.lock.acquire().await.stack_err("FirewallController::unpublish")?;
        let nat_chain = vm_chain_name(vm_id);
        for port in ports {
            self.delete_filter_rule(target_ip, port).await?;
            self.delete_nat_rule(&nat_chain, target_ip, port).await?;
        }
        if self.nat_chain_is_empty(&nat_chain).await? {
            self.remove_nat_chain(&nat_chain).await?;
        }
        Ok(())
    }

    async fn ensure_filter_chain(&self) -> Result<()> {
        if !self.chain_exists("filter", &self.filter_chain_name).await? {
            self.run(&["-t", "filter", "-N", &self.filter_chain_name]).await?;
        }
        self.run(&[
            "-t",
            "filter",
            "-C",
            "FORWARD",
            "-j",
            &self.filter_chain_name,
        ])
        .await
        .or_else_append(self, &["-t", "filter", "-A", "FORWARD", "-j", &self.filter_chain_name])
        .await
    }

    async fn ensure_nat_chain(&self, chain: &str) -> Result<()> {
        if !self.chain_exists("nat", chain).await? {
            self.run(&["-t", "nat", "-N", chain]).await?;
        }
        self.run(&["-t", "nat", "-C", "PREROUTING", "-j", chain])
            .await
            .or_else_append(self, &["-t", "nat", "-A", "PREROUTING", "-j", chain])
            .await
    }

    async fn remove_nat_chain(&self, chain: &str) -> Result<()> {
        // ignore failure: the jump may already be gone if unpublish is being
        // retried (spec's kill-idempotence property extends here)
        let _ = self.run(&["-t", "nat", "-D", "PREROUTING", "-j", chain]).await;
        self.run(&["-t", "nat", "-F", chain]).await?;
        self.run(&["-t", "nat", "-X", chain]).await
    }

    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        let result = Command::new("iptables")
            .arg("-t")
            .arg(table)
            .arg("-L")
            .arg(chain)
            .arg("-n")
            .run_to_completion()
            .await
            .stack_err("FirewallController::chain_exists")?;
        Ok(result.successful())
    }

    async fn nat_chain_is_empty(&self, chain: &str) -> Result<bool> {
        let result = Command::new("iptables")
            .args(["-t", "nat", "-S", chain])
            .run_to_completion()
            .await
            .stack_err("FirewallController::nat_chain_is_empty")?;
        // the chain's own `-N <chain>` declaration is always the first line
        Ok(result.stdout_as_utf8_lossy().lines().count() <= 1)
    }

    async fn append_filter_rule(&self, target_ip: &str, port: &PortSpec) -> Result<()> {
        let mut args = vec![
            "-t".to_owned(),
            "filter".to_owned(),
            "-A".to_owned(),
            self.filter_chain_name.clone(),
            "-p".to_owned(),
            port.protocol.to_string(),
        ];
        if let Some(iface) = &port.interface {
            args.push("-i".to_owned());
            args.push(iface.clone());
        }
        args.extend([
            "-d".to_owned(),
            target_ip.to_owned(),
            "--dport".to_owned(),
            port.host_port.to_string(),
            "-m".to_owned(),
            "state".to_owned(),
            "--state".to_owned(),
            "NEW,ESTABLISHED,RELATED".to_owned(),
            "-j".to_owned(),
            "ACCEPT".to_owned(),
            "-m".to_owned(),
            "comment".to_owned(),
            "--comment".to_owned(),
            rule_comment(port),
        ]);
        self.run_owned_unique(args).await
    }

    async fn delete_filter_rule(&self, target_ip: &str, port: &PortSpec) -> Result<()> {
        let mut args = vec![
            "-t".to_owned(),
            "filter".to_owned(),
            "-D".to_owned(),
            self.filter_chain_name.clone(),
            "-p".to_owned(),
            port.protocol.to_string(),
        ];
        if let Some(iface) = &port.interface {
            args.push("-i".to_owned());
            args.push(iface.clone());
        }
        args.extend([
            "-d".to_owned(),
            target_ip.to_owned(),
            "--dport".to_owned(),
            port.host_port.to_string(),
            "-m".to_owned(),
            "state".to_owned(),
            "--state".to_owned(),
            "NEW,ESTABLISHED,RELATED".to_owned(),
            "-j".to_owned(),
            "ACCEPT".to_owned(),
            "-m".to_owned(),
            "comment".to_owned(),
            "--comment".to_owned(),
            rule_comment(port),
        ]);
        self.run_owned_ignore_missing(args).await
    }

    async fn append_nat_rule(&self, chain: &str, target_ip: &str, port: &PortSpec) -> Result<()> {
        let mut args = vec![
            "-t".to_owned(),
            "nat".to_owned(),
            "-A".to_owned(),
            chain.to_owned(),
            "-p".to_owned(),
            port.protocol.to_string(),
        ];
        if let Some(iface) = &port.interface {
            args.push("-i".to_owned());
            args.push(iface.clone());
        }
        args.extend([
            "--dport".to_owned(),
            port.host_port.to_string(),
            "-j".to_owned(),
            "DNAT".to_owned(),
            "--to-destination".to_owned(),
            format!("{target_ip}:{}", port.dest_port),
            "-m".to_owned(),
            "comment".to_owned(),
            "--comment".to_owned(),
            rule_comment(port),
        ]);
        self.run_owned_unique(args).await
    }

    async fn delete_nat_rule(&self, chain: &str, target_ip: &str, port: &PortSpec) -> Result<()> {
        let mut args = vec![
            "-t".to_owned(),
            "nat".to_owned(),
            "-D".to_owned(),
            chain.to_owned(),
            "-p".to_owned(),
            port.protocol.to_string(),
        ];
        if let Some(iface) = &port.interface {
            args.push("-i".to_owned());
            args.push(iface.clone());
        }
        args.extend([
            "--dport".to_owned(),
            port.host_port.to_string(),
            "-j".to_owned(),
            "DNAT".to_owned(),
            "--to-destination".to_owned(),
            format!("{target_ip}:{}", port.dest_port),
            "-m".to_owned(),
            "comment".to_owned(),
            "--comment".to_owned(),
            rule_comment(port),
        ]);
        self.run_owned_ignore_missing(args).await
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        Command::new("iptables")
            .args(args)
            .run_to_completion()
            .await
            .stack_err_with(|| format!("iptables {}", args.join(" ")))?
            .assert_success()
    }

    /// Appends a rule with `-A`, first checking for its presence with `-C`
    /// so the append is `append-unique` (spec §4.8).
    async fn run_owned_unique(&self, args: Vec<String>) -> Result<()> {
        let mut check_args = args.clone();
        check_args[2] = "-C".to_owned();
        let exists = Command::new("iptables")
            .args(&check_args)
            .run_to_completion()
            .await
            .stack_err("FirewallController rule check")?
            .successful();
        if exists {
            return Ok(());
        }
        Command::new("iptables")
            .args(&args)
            .run_to_completion()
            .await
            .stack_err_with(|| format!("iptables {}", args.join(" ")))?
            .assert_success()
    }

    /// Deletes a rule, tolerating the rule already being absent (spec §8
    /// "Kill idempotence" extends to repeated unpublish calls).
    async fn run_owned_ignore_missing(&self, args: Vec<String>) -> Result<()> {
        let result = Command::new("iptables")
            .args(&args)
            .run_to_completion()
            .await
            .stack_err_with(|| format!("iptables {}", args.join(" ")))?;
        if result.successful() {
            return Ok(());
        }
        let stderr = result.stderr_as_utf8_lossy();
        if stderr.contains("No chain") || stderr.contains("does not exist") || stderr.contains("Bad rule") {
            return Ok(());
        }
        result.assert_success()
    }
}

/// Small helper so `ensure_filter_chain`/`ensure_nat_chain` can express
/// "check, then append if absent" without repeating the check/append
/// plumbing for both tables.
trait OrElseAppend {
    #[allow(async_fn_in_trait)]
    async fn or_else_append(self, ctrl: &FirewallController, append_args: &[&str]) -> Result<()>;
}

impl OrElseAppend for Result<()> {
    async fn or_else_append(self, ctrl: &FirewallController, append_args: &[&str]) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        ctrl.run(append_args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_name_truncated_to_limit() {
        let long_id = "a".repeat(40);
        let name = vm_chain_name(&long_id);
        assert!(name.len() <= CHAIN_NAME_LIMIT);
        assert!(name.starts_with("FBD-"));
    }

    #[test]
    fn rule_comment_format() {
        let port = PortSpec::parse("eno1:16687:16686/tcp").unwrap();
        assert_eq!(rule_comment(&port), "firebuild:eno1:16687:16686:/tcp");
        let bare = PortSpec::parse("16686").unwrap();
        assert_eq!(rule_comment(&bare), "firebuild:*:16686:16686:/tcp");
    }
}
