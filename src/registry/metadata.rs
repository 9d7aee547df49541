//! The persisted per-VM run record (spec §3 `VMMetadata`) and its on-disk
//! layout under `<run_cache>/<vm_id>/` (spec §6).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stacked_errors::{Result, StackableErr};

use crate::{cni::CniRuntime, guest::JailLocation, storage::ImageTag, FileOptions};

const METADATA_FILE: &str = "metadata.json";
const PID_FILE: &str = "pid";

/// A block device attached to the guest (spec §3 `VMMetadata.drives`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveInfo {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// One guest network interface, including the CNI `host-local` IPAM
/// reservation (spec §3: "static IP, gateway, mask, network, DNS").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfaceInfo {
    pub iface_id: String,
    pub host_dev_name: String,
    pub ip: String,
    pub mask: String,
    pub gateway: String,
    pub network: String,
    pub nameservers: Vec<String>,
}

impl NetworkInterfaceInfo {
    /// Derives a [`NetworkInterfaceInfo`] from the CNI runtime reservation
    /// produced by [`crate::cni::CniDriver::setup`], computing `network`
    /// from the `ip`/`mask` pair.
    pub fn from_cni_runtime(iface_id: &str, runtime: &CniRuntime) -> Self {
        let network = format!("{}/{}", runtime.ip, runtime.mask)
            .parse::<ipnet::IpNet>()
            .map(|net| net.network().to_string())
            .unwrap_or_else(|_| runtime.ip.clone());
        Self {
            iface_id: iface_id.to_owned(),
            host_dev_name: runtime.veth_name.clone(),
            ip: runtime.ip.clone(),
            mask: runtime.mask.clone(),
            gateway: runtime.gateway.clone(),
            network,
            nameservers: runtime.nameservers.clone(),
        }
    }
}

/// The jailer placement a running VM was started with (spec §3
/// `JailLocation`), kept alongside the metadata so `kill`/`purge` can locate
/// the jail directory without re-deriving it from current CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JailInfo {
    pub chroot_base: PathBuf,
    pub hypervisor_basename: String,
}

impl JailInfo {
    pub fn location(&self, vm_id: &str) -> JailLocation {
        JailLocation::new(self.chroot_base.clone(), self.hypervisor_basename.clone(), vm_id)
    }
}

/// CPU/memory/kernel configuration the guest was booted with (spec §3
/// "machine config (cpu, mem, kernel args, kernel id)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub cpu: u8,
    pub mem_mib: u32,
    pub kernel_args: Vec<String>,
    pub kernel_id: String,
}

/// The resolved `CMD`/`ENTRYPOINT` an image was tagged with, carried through
/// so `run` knows what to execute without re-fetching image metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EntrypointInfo {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
}

/// The per-VM CNI configuration a run was started with: the network name
/// requested on the command line, plus the resulting runtime reservation
/// (also persisted standalone under `<run_cache>/<vm_id>/cni`, spec §6, so
/// [`crate::cni::CniDriver`] can load it without the rest of this struct).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniSection {
    pub net_name: String,
    pub runtime: CniRuntime,
}

/// The full per-VM run record (spec §3 `VMMetadata`). Persisted at
/// `<run_cache>/<vm_id>/metadata.json`; created by the guest lifecycle
/// orchestrator (C5) on start, read by `ls`/`inspect`/`kill`/`purge`,
/// deleted once the process is confirmed dead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VMMetadata {
    pub vm_id: String,
    pub pid: Option<u32>,
    pub drives: Vec<DriveInfo>,
    pub network_interfaces: Vec<NetworkInterfaceInfo>,
    pub jail: JailInfo,
    pub machine: MachineInfo,
    pub cni: CniSection,
    pub image_tag: ImageTag,
    pub entrypoint: EntrypointInfo,
    pub exposed_ports: Vec<String>,
    pub run_cache_dir: PathBuf,
    pub started_at_utc: chrono::DateTime<chrono::Utc>,
}

impl VMMetadata {
    fn vm_dir(run_cache_dir: &Path, vm_id: &str) -> PathBuf {
        run_cache_dir.join(vm_id)
    }

    /// Persists this record at `<run_cache>/<vm_id>/metadata.json`, and the
    /// pid alongside it for callers that only need a liveness check (spec
    /// §6 on-disk layout: "optionally a PID file").
    pub async fn save(&self) -> Result<()> {
        let dir = Self::vm_dir(&self.run_cache_dir, &self.vm_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .stack_err_with(|| format!("VMMetadata::save -> creating {dir:?}"))?;
        let s = serde_json::to_string_pretty(self).stack_err("VMMetadata::save -> serialize")?;
        FileOptions::write_str(dir.join(METADATA_FILE), &s)
            .await
            .stack_err_with(|| format!("VMMetadata::save -> writing metadata for {}", self.vm_id))?;
        if let Some(pid) = self.pid {
            FileOptions::write_str(dir.join(PID_FILE), &pid.to_string())
                .await
                .stack_err_with(|| format!("VMMetadata::save -> writing pid file for {}", self.vm_id))?;
        }
        crate::cni::save_runtime(&dir, &self.cni.runtime)
            .await
            .stack_err_with(|| format!("VMMetadata::save -> writing cni record for {}", self.vm_id))?;
        Ok(())
    }

    /// Loads the record persisted for `vm_id` under `run_cache_dir`.
    pub async fn load(run_cache_dir: &Path, vm_id: &str) -> Result<Self> {
        let path = Self::vm_dir(run_cache_dir, vm_id).join(METADATA_FILE);
        let s = FileOptions::read_to_string(&path)
            .await
            .stack_err_with(|| format!("VMMetadata::load -> reading {path:?}"))?;
        serde_json::from_str(&s).stack_err_with(|| format!("VMMetadata::load -> parsing {path:?}"))
    }

    /// Lists every `vm_id` with a persisted record under `run_cache_dir`.
    pub async fn list_ids(run_cache_dir: &Path) -> Result<Vec<String>> {
        let mut ids = vec![];
        let mut rd = match tokio::fs::read_dir(run_cache_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(e)
                    .stack_err_with(|| format!("VMMetadata::list_ids -> reading {run_cache_dir:?}"))
            }
        };
        while let Some(entry) = rd
            .next_entry()
            .await
            .stack_err("VMMetadata::list_ids -> iterating entries")?
        {
            if entry
                .file_type()
                .await
                .stack_err("VMMetadata::list_ids -> file_type")?
                .is_dir()
            {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_owned());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes the `<run_cache>/<vm_id>` entry entirely.
    pub async fn remove(run_cache_dir: &Path, vm_id: &str) -> Result<()> {
        let dir = Self::vm_dir(run_cache_dir, vm_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).stack_err_with(|| format!("VMMetadata::remove -> {dir:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(run_cache_dir: PathBuf) -> VMMetadata {
        VMMetadata {
            vm_id: "vm-test".to_owned(),
            pid: Some(4242),
            drives: vec![DriveInfo {
                drive_id: "rootfs".to_owned(),
                path_on_host: "root/rootfs.ext4".to_owned(),
                is_root_device: true,
                is_read_only: false,
            }],
            network_interfaces: vec![],
            jail: JailInfo {
                chroot_base: PathBuf::from("/srv/jail"),
                hypervisor_basename: "firecracker".to_owned(),
            },
            machine: MachineInfo {
                cpu: 1,
                mem_mib: 512,
                kernel_args: vec!["console=ttyS0".to_owned()],
                kernel_id: "vmlinux-5.10".to_owned(),
            },
            cni: CniSection {
                net_name: "firebuild0".to_owned(),
                runtime: CniRuntime {
                    net_name: "firebuild0".to_owned(),
                    net_ns: "/var/run/netns/vm-test".to_owned(),
                    veth_name: "veth0".to_owned(),
                    ip: "10.0.0.2".to_owned(),
                    gateway: "10.0.0.1".to_owned(),
                    mask: "24".to_owned(),
                    nameservers: vec!["8.8.8.8".to_owned()],
                },
            },
            image_tag: ImageTag::parse("combust-labs/alpine-base:3.12.0").unwrap(),
            entrypoint: EntrypointInfo::default(),
            exposed_ports: vec![],
            run_cache_dir,
            started_at_utc: "2024-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample(dir.path().to_owned());
        meta.save().await.unwrap();
        let loaded = VMMetadata::load(dir.path(), "vm-test").await.unwrap();
        assert_eq!(loaded.vm_id, meta.vm_id);
        assert_eq!(loaded.pid, meta.pid);
        assert_eq!(loaded.jail.hypervisor_basename, "firecracker");
    }

    #[tokio::test]
    async fn list_ids_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        sample(dir.path().to_owned()).save().await.unwrap();
        let ids = VMMetadata::list_ids(dir.path()).await.unwrap();
        assert_eq!(ids, vec!["vm-test".to_owned()]);
        VMMetadata::remove(dir.path(), "vm-test").await.unwrap();
        let ids = VMMetadata::list_ids(dir.path()).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn list_ids_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let ids = VMMetadata::list_ids(&missing).await.unwrap();
        assert!(ids.is_empty());
    }
}
