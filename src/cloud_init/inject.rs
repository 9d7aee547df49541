//! The six concurrent injections of spec §4.6 step 3.

use std::{collections::BTreeMap, path::Path};

use serde::Serialize;
use serde_json::Value;
use stacked_errors::{Result, StackableErr};

/// Resolved network info written to `/etc/firebuild-netinfo.json` (spec §3,
/// §4.6 step 3 "Network info").
#[derive(Debug, Clone, Serialize)]
pub struct NetInfo {
    pub mac: String,
    pub host_dev: String,
    pub ip: String,
    pub mask: String,
    pub gateway: String,
    pub nameservers: Vec<String>,
}

/// Everything [`super::run`] needs to perform the six injections.
#[derive(Clone)]
pub struct CloudInitRequest {
    pub env: BTreeMap<String, String>,
    pub hostname: Option<String>,
    /// The guest's CNI-assigned IP, used for the `/etc/hosts` entry when
    /// both it and `hostname` are present (spec §4.6 step 3 "Hosts").
    pub cni_ip: Option<String>,
    pub ssh_user: String,
    pub ssh_public_keys: Vec<String>,
    pub metadata: Value,
    pub netinfo: Option<NetInfo>,
}

/// Runs all six injections concurrently, accumulating failures rather than
/// stopping at the first (spec §4.6: "errors are accumulated into a
/// multi-error, and partial success is tolerated").
pub async fn inject_all(mount_point: &Path, request: &CloudInitRequest) -> Result<()> {
    let (env_res, hostname_res, hosts_res, metadata_res, netinfo_res, ssh_res) = tokio::join!(
        inject_env(mount_point, &request.env),
        inject_hostname(mount_point, request.hostname.as_deref()),
        inject_hosts(mount_point, request.hostname.as_deref(), request.cni_ip.as_deref()),
        inject_metadata(mount_point, &request.metadata),
        inject_netinfo(mount_point, request.netinfo.as_ref()),
        inject_ssh_keys(mount_point, &request.ssh_user, &request.ssh_public_keys),
    );

    let mut failures = vec![];
    for (name, res) in [
        ("environment", env_res),
        ("hostname", hostname_res),
        ("hosts", hosts_res),
        ("metadata", metadata_res),
        ("netinfo", netinfo_res),
        ("ssh_keys", ssh_res),
    ] {
        if let Err(e) = res {
            tracing::warn!(injection = name, error = %e, "cloud-init injection failed");
            failures.push(format!("{name}: {e}"));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        stacked_errors::bail_locationless!(
            "cloud-init injection had {} failure(s): {}",
            failures.len(),
            failures.join("; ")
        )
    }
}

async fn inject_env(mount_point: &Path, env: &BTreeMap<String, String>) -> Result<()> {
    let path = mount_point.join("etc/profile.d/run-env.sh");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .stack_err_with(|| format!("inject_env -> creating {parent:?}"))?;
    }
    let mut body = String::new();
    for (k, v) in env {
        body.push_str(&format!("export {k}=\"{}\"\n", v.replace('"', "\\\"")));
    }
    let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    existing.push_str(&body);
    tokio::fs::write(&path, existing)
        .await
        .stack_err_with(|| format!("inject_env -> writing {path:?}"))
}

async fn inject_hostname(mount_point: &Path, hostname: Option<&str>) -> Result<()> {
    let Some(hostname) = hostname else {
        return Ok(());
    };
    let path = mount_point.join("etc/hostname");
    let _guard = writable_guard(&path).await?;
    tokio::fs::write(&path, format!("{hostname}\n"))
        .await
        .stack_err_with(|| format!("inject_hostname -> writing {path:?}"))
}

async fn inject_hosts(mount_point: &Path, hostname: Option<&str>, cni_ip: Option<&str>) -> Result<()> {
    let path = mount_point.join("etc/hosts");
    let mut body = String::from("127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n");
    match (cni_ip, hostname) {
        (Some(ip), Some(host)) => {
            body.push_str(&format!("{ip}\t{host}\n"));
        }
        (None, Some(host)) => {
            body = format!(
                "127.0.0.1\tlocalhost {host}\n::1\tlocalhost ip6-localhost ip6-loopback {host}\n"
            );
        }
        _ => {}
    }
    tokio::fs::write(&path, body)
        .await
        .stack_err_with(|| format!("inject_hosts -> writing {path:?}"))
}

async fn inject_metadata(mount_point: &Path, metadata: &Value) -> Result<()> {
    let path = mount_point.join("etc/firebuild-metadata.json");
    let body = serde_json::to_string_pretty(metadata).stack_err("inject_metadata -> serializing")?;
    tokio::fs::write(&path, body)
        .await
        .stack_err_with(|| format!("inject_metadata -> writing {path:?}"))
}

async fn inject_netinfo(mount_point: &Path, netinfo: Option<&NetInfo>) -> Result<()> {
    let Some(netinfo) = netinfo else {
        return Ok(());
    };
    let path = mount_point.join("etc/firebuild-netinfo.json");
    let body = serde_json::to_string_pretty(netinfo).stack_err("inject_netinfo -> serializing")?;
    tokio::fs::write(&path, body)
        .await
        .stack_err_with(|| format!("inject_netinfo -> writing {path:?}"))
}

async fn inject_ssh_keys(mount_point: &Path, ssh_user: &str, keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let home = if ssh_user == "root" {
        mount_point.join("root")
    } else {
        mount_point.join("home").join(ssh_user)
    };
    let ssh_dir = home.join(".ssh");
    tokio::fs::create_dir_all(&ssh_dir)
        .await
        .stack_err_with(|| format!("inject_ssh_keys -> creating {ssh_dir:?}"))?;
    let path = ssh_dir.join("authorized_keys");

    let _guard = writable_guard(&path).await?;
    let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    if !existing.is_empty() && !existing.ends_with('\n') {
        existing.push('\n');
    }
    for key in keys {
        existing.push_str(key.trim_end());
        existing.push('\n');
    }
    tokio::fs::write(&path, existing)
        .await
        .stack_err_with(|| format!("inject_ssh_keys -> writing {path:?}"))
}

/// chmod's `path` writable, restoring its previous mode when the guard
/// drops (spec §4.6: "Chmod-back ... registered as scoped cleanup").
struct WritableGuard {
    path: std::path::PathBuf,
    previous_mode: u32,
}

impl Drop for WritableGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(
                &self.path,
                std::fs::Permissions::from_mode(self.previous_mode),
            ) {
                tracing::warn!(path = ?self.path, error = %e, "failed to restore permissions after cloud-init injection");
            }
        }
    }
}

#[cfg(unix)]
async fn writable_guard(path: &Path) -> Result<WritableGuard> {
    use std::os::unix::fs::PermissionsExt;
    let previous_mode = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.permissions().mode(),
        Err(_) => 0o644,
    };
    if path.exists() {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
            .await
            .stack_err_with(|| format!("writable_guard -> chmod {path:?}"))?;
    } else {
        tokio::fs::write(path, "")
            .await
            .stack_err_with(|| format!("writable_guard -> creating {path:?}"))?;
    }
    Ok(WritableGuard {
        path: path.to_owned(),
        previous_mode,
    })
}

#[cfg(not(unix))]
async fn writable_guard(path: &Path) -> Result<WritableGuard> {
    Ok(WritableGuard {
        path: path.to_owned(),
        previous_mode: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hosts_with_cni_interface_and_hostname() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("etc")).await.unwrap();
        inject_hosts(dir.path(), Some("api"), Some("10.0.0.2")).await.unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join("etc/hosts")).await.unwrap();
        assert!(contents.contains("127.0.0.1\tlocalhost"));
        assert!(contents.contains("10.0.0.2\tapi"));
    }

    #[tokio::test]
    async fn hosts_without_cni_interface_appends_to_loopback() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("etc")).await.unwrap();
        inject_hosts(dir.path(), Some("api"), None).await.unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join("etc/hosts")).await.unwrap();
        assert!(contents.contains("127.0.0.1\tlocalhost api"));
        assert!(contents.contains("::1\tlocalhost ip6-localhost ip6-loopback api"));
    }

    #[tokio::test]
    async fn env_injection_appends_export_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("FOO".to_owned(), "bar".to_owned());
        inject_env(dir.path(), &env).await.unwrap();
        let contents =
            tokio::fs::read_to_string(dir.path().join("etc/profile.d/run-env.sh")).await.unwrap();
        assert_eq!(contents, "export FOO=\"bar\"\n");
    }

    #[tokio::test]
    async fn ssh_keys_appended_to_authorized_keys() {
        let dir = tempfile::tempdir().unwrap();
        inject_ssh_keys(dir.path(), "root", &["ssh-rsa AAAA test".to_owned()])
            .await
            .unwrap();
        let contents =
            tokio::fs::read_to_string(dir.path().join("root/.ssh/authorized_keys")).await.unwrap();
        assert_eq!(contents, "ssh-rsa AAAA test\n");
    }
}
