//! CNI plugin chain invocation for per-VM network setup/teardown (C7).
//!
//! The CNI plugin binaries are external collaborators invoked via the
//! standard CNI contract (JSON conflist on stdin, env vars for the
//! operation/container id/netns/interface); this module only shapes that
//! invocation and persists the resulting runtime record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use stacked_errors::{Result, StackableErr};

use crate::Command;

/// The per-VM CNI runtime record persisted under `<run_cache>/<vm_id>/cni`
/// (spec §3 `VMMetadata`, §6 on-disk layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniRuntime {
    pub net_name: String,
    pub net_ns: String,
    pub veth_name: String,
    pub ip: String,
    pub gateway: String,
    pub mask: String,
    pub nameservers: Vec<String>,
}

/// Drives a CNI plugin chain for one VM.
pub struct CniDriver {
    /// CNI plugin binary search path (`CNI_PATH`).
    pub plugin_dir: PathBuf,
    /// Directory holding the conflist this network uses.
    pub conf_dir: PathBuf,
    /// Per-VM cache root (`<cache_root>/<net_name>/<container_id>`).
    pub cache_root: PathBuf,
}

impl CniDriver {
    /// Runs the plugin chain's `ADD` command for `vm_id` inside `net_ns`,
    /// returning the resulting runtime record including the `host-local`
    /// IPAM static IP reservation (spec §4.7).
    #[tracing::instrument(skip(self))]
    pub async fn setup(&self, net_name: &str, vm_id: &str, net_ns: &str, if_name: &str) -> Result<CniRuntime> {
        let conflist = self.load_conflist(net_name).await?;
        let output = self
            .invoke(&conflist, "ADD", vm_id, net_ns, if_name)
            .await
            .stack_err("CniDriver::setup")?;
        parse_add_result(net_name, if_name, net_ns, &output)
    }

    /// Runs the plugin chain's `DEL` command, then removes the per-VM cache
    /// directory. Spec §4.7: warnings (not failures) when the cache
    /// directory is already gone.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self, net_name: &str, vm_id: &str, veth: &str, net_ns: &str) -> Result<()> {
        let conflist = self.load_conflist(net_name).await?;
        self.invoke(&conflist, "DEL", vm_id, net_ns, veth)
            .await
            .stack_err("CniDriver::cleanup -> DEL")?;

        let vm_cache_dir = self.cache_root.join(net_name).join(vm_id);
        match tokio::fs::remove_dir_all(&vm_cache_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(?vm_cache_dir, "CNI cache directory already removed");
            }
            Err(e) => {
                return Err(e)
                    .stack_err_with(|| format!("CniDriver::cleanup -> removing {vm_cache_dir:?}"))
            }
        }
        Ok(())
    }

    async fn load_conflist(&self, net_name: &str) -> Result<serde_json::Value> {
        let path = self.conf_dir.join(format!("{net_name}.conflist"));
        let s = tokio::fs::read_to_string(&path)
            .await
            .stack_err_with(|| format!("CniDriver -> reading conflist {path:?}"))?;
        serde_json::from_str(&s).stack_err_with(|| format!("CniDriver -> parsing conflist {path:?}"))
    }

    /// Invokes every plugin named in the conflist's `plugins` array in order,
    /// matching the CNI contract's "list" semantics: each plugin receives the
    /// full network config plus the previous plugin's result.
    async fn invoke(
        &self,
        conflist: &serde_json::Value,
        cni_command: &str,
        vm_id: &str,
        net_ns: &str,
        if_name: &str,
    ) -> Result<serde_json::Value> {
        let plugins = conflist["plugins"]
            .as_array()
            .stack_err_locationless("conflist missing \"plugins\" array")?;
        let mut prev_result: Option<serde_json::Value> = None;
        for plugin in plugins {
            let plugin_type = plugin["type"]
                .as_str()
                .stack_err_locationless("plugin entry missing \"type\"")?;
            let mut config = plugin.clone();
            if let Some(prev) = &prev_result {
                config["prevResult"] = prev.clone();
            }
            config["name"] = json!(conflist["name"].clone());
            config["cniVersion"] = json!(conflist["cniVersion"].clone());

            let bin = self.plugin_dir.join(plugin_type);
            let result = Command::new_os_str(&bin)
                .env("CNI_COMMAND", cni_command)
                .env("CNI_CONTAINERID", vm_id)
                .env("CNI_NETNS", net_ns)
                .env("CNI_IFNAME", if_name)
                .env("CNI_PATH", &self.plugin_dir)
                .run_with_input_to_completion(config.to_string().as_bytes())
                .await
                .stack_err_with(|| format!("CniDriver -> invoking {plugin_type}"))?;
            result
                .assert_success()
                .stack_err_with(|| format!("CniDriver -> {plugin_type} {cni_command} failed"))?;
            if cni_command == "ADD" {
                prev_result = Some(
                    serde_json::from_slice(&result.stdout)
                        .stack_err_with(|| format!("CniDriver -> parsing {plugin_type} result"))?,
                );
            }
        }
        Ok(prev_result.unwrap_or(serde_json::Value::Null))
    }
}

fn parse_add_result(
    net_name: &str,
    if_name: &str,
    net_ns: &str,
    result: &serde_json::Value,
) -> Result<CniRuntime> {
    let ips = result["ips"]
        .as_array()
        .stack_err_locationless("CNI ADD result missing \"ips\"")?;
    let first = ips
        .first()
        .stack_err_locationless("CNI ADD result has an empty \"ips\" array")?;
    let ip_with_mask = first["address"]
        .as_str()
        .stack_err_locationless("CNI ADD result ip missing \"address\"")?;
    let (ip, mask) = ip_with_mask
        .split_once('/')
        .unwrap_or((ip_with_mask, "32"));
    let gateway = first["gateway"].as_str().unwrap_or_default().to_owned();
    let nameservers = result["dns"]["nameservers"]
        .as_array()
        .map(|ns| {
            ns.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();
    Ok(CniRuntime {
        net_name: net_name.to_owned(),
        net_ns: net_ns.to_owned(),
        veth_name: if_name.to_owned(),
        ip: ip.to_owned(),
        gateway,
        mask: mask.to_owned(),
        nameservers,
    })
}

/// Persists `runtime` under `<run_cache>/<vm_id>/cni` (spec §3, §6).
pub async fn save_runtime(run_cache_vm_dir: &Path, runtime: &CniRuntime) -> Result<()> {
    let s = serde_json::to_string_pretty(runtime).stack_err("cni::save_runtime -> serialize")?;
    crate::FileOptions::write_str(run_cache_vm_dir.join("cni"), &s)
        .await
        .stack_err("cni::save_runtime -> write")
}

/// Loads a previously-persisted runtime record.
pub async fn load_runtime(run_cache_vm_dir: &Path) -> Result<CniRuntime> {
    let s = crate::FileOptions::read_to_string(run_cache_vm_dir.join("cni"))
        .await
        .stack_err("cni::load_runtime -> read")?;
    serde_json::from_str(&s).stack_err("cni::load_runtime -> parse")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_result_ip_and_mask() {
        let result = json!({
            "ips": [{"address": "10.0.0.2/24", "gateway": "10.0.0.1"}],
            "dns": {"nameservers": ["8.8.8.8"]}
        });
        let runtime = parse_add_result("firebuild0", "veth0", "/var/run/netns/abc", &result).unwrap();
        assert_eq!(runtime.ip, "10.0.0.2");
        assert_eq!(runtime.mask, "24");
        assert_eq!(runtime.gateway, "10.0.0.1");
        assert_eq!(runtime.nameservers, vec!["8.8.8.8".to_owned()]);
    }

    #[tokio::test]
    async fn runtime_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = CniRuntime {
            net_name: "firebuild0".into(),
            net_ns: "/var/run/netns/abc".into(),
            veth_name: "veth0".into(),
            ip: "10.0.0.2".into(),
            gateway: "10.0.0.1".into(),
            mask: "24".into(),
            nameservers: vec!["8.8.8.8".into()],
        };
        save_runtime(dir.path(), &runtime).await.unwrap();
        let loaded = load_runtime(dir.path()).await.unwrap();
        assert_eq!(loaded.ip, runtime.ip);
    }
}
