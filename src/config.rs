//! Shared configuration structs and the profile-merge protocol (C12).
//!
//! `clap` parses flags into these structs; [`UpdateFromProfile::update_from_profile`]
//! is then called once to fill in anything left at its `Default`, so that an
//! explicit flag always wins over a profile value.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::profile::{Profile, StorageProviderProperties};

/// Implemented by every per-command config. A profile only ever supplies
/// defaults for fields the user did not set on the command line.
pub trait UpdateFromProfile {
    fn update_from_profile(&mut self, profile: &Profile);
}

/// Binary locations shared by every command that starts a guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, clap::Args)]
pub struct BinariesConfig {
    #[arg(long = "binary-firecracker", env = "FIREBUILD_BINARY_FIRECRACKER")]
    pub firecracker: Option<PathBuf>,
    #[arg(long = "binary-jailer", env = "FIREBUILD_BINARY_JAILER")]
    pub jailer: Option<PathBuf>,
    #[arg(long = "chroot-base", env = "FIREBUILD_CHROOT_BASE")]
    pub chroot_base: Option<PathBuf>,
    /// The container-image toolchain `baseos` wraps (spec §1: base-OS image
    /// production is itself a wrapper around a container toolchain, treated
    /// as an external collaborator this crate does not reimplement).
    #[arg(long = "binary-image-builder", env = "FIREBUILD_BINARY_IMAGE_BUILDER")]
    pub image_builder: Option<PathBuf>,
}

impl UpdateFromProfile for BinariesConfig {
    fn update_from_profile(&mut self, profile: &Profile) {
        if self.firecracker.is_none() {
            self.firecracker = profile.binary_firecracker.clone();
        }
        if self.jailer.is_none() {
            self.jailer = profile.binary_jailer.clone();
        }
        if self.chroot_base.is_none() {
            self.chroot_base = profile.chroot_base.clone();
        }
        if self.image_builder.is_none() {
            self.image_builder = profile.binary_image_builder.clone();
        }
    }
}

/// CPU/memory resource request for the guest.
#[derive(Debug, Clone, Serialize, Deserialize, clap::Args)]
pub struct ResourcesConfig {
    #[arg(long = "resources-cpu", default_value_t = 1)]
    pub cpu: u8,
    #[arg(long = "resources-mem", default_value_t = 512)]
    pub mem_mib: u32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            cpu: 1,
            mem_mib: 512,
        }
    }
}

/// Fields describing how to reach and configure the guest's network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, clap::Args)]
pub struct MachineConfig {
    #[arg(long = "machine-cni-network-name")]
    pub cni_network_name: Option<String>,
    #[arg(long = "machine-ssh-user", default_value = "root")]
    pub ssh_user: String,
    #[arg(long = "machine-vmlinux-id")]
    pub vmlinux_id: Option<String>,
}

/// Which storage provider backs image lookups, and its properties.
#[derive(Debug, Clone, Default, Serialize, Deserialize, clap::Args)]
pub struct StorageConfig {
    #[arg(long = "storage-provider", default_value = "directory")]
    pub provider: String,
    #[arg(long = "storage-provider.directory.rootfs-storage-root")]
    pub directory_rootfs_storage_root: Option<PathBuf>,
    #[arg(long = "storage-provider.directory.kernel-storage-root")]
    pub directory_kernel_storage_root: Option<PathBuf>,
}

impl UpdateFromProfile for StorageConfig {
    fn update_from_profile(&mut self, profile: &Profile) {
        let StorageProviderProperties {
            directory_rootfs_storage_root,
            directory_kernel_storage_root,
        } = &profile.storage_provider_properties;
        if self.directory_rootfs_storage_root.is_none() {
            self.directory_rootfs_storage_root = directory_rootfs_storage_root.clone();
        }
        if self.directory_kernel_storage_root.is_none() {
            self.directory_kernel_storage_root = directory_kernel_storage_root.clone();
        }
    }
}

/// Tracing flags shared by every subcommand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, clap::Args)]
pub struct TracingConfig {
    #[arg(long = "tracing-enable")]
    pub enable: bool,
    #[arg(long = "tracing-collector-host-port")]
    pub collector_host_port: Option<String>,
}

impl UpdateFromProfile for TracingConfig {
    fn update_from_profile(&mut self, profile: &Profile) {
        if !self.enable {
            self.enable = profile.tracing.enable;
        }
        if self.collector_host_port.is_none() {
            self.collector_host_port = profile.tracing.collector_host_port.clone();
        }
    }
}

/// Run-cache location, shared by `run`/`ls`/`inspect`/`kill`/`purge`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, clap::Args)]
pub struct RunCacheConfig {
    #[arg(long = "run-cache-dir", env = "FIREBUILD_RUN_CACHE_DIR")]
    pub run_cache_dir: Option<PathBuf>,
}

impl UpdateFromProfile for RunCacheConfig {
    fn update_from_profile(&mut self, profile: &Profile) {
        if self.run_cache_dir.is_none() {
            self.run_cache_dir = profile.run_cache_dir.clone();
        }
    }
}

/// Firewall env-var-overridable knobs (spec §6 Environment variables).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    pub filter_chain_name: String,
    pub flock_file: PathBuf,
    pub flock_acquire_timeout: std::time::Duration,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            filter_chain_name: std::env::var("FIREBUILD_IPT_FILTER_CHAIN_NAME")
                .unwrap_or_else(|_| "FIREBUILD-FILTER".to_owned()),
            flock_file: std::env::var("FIREBUILD_IPT_FLOCK_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/iptables.lock")),
            flock_acquire_timeout: std::env::var("FIREBUILD_IPT_FLOCK_ACQUIRE_TIMEOUT")
                .ok()
                .and_then(|s| parse_duration_secs(&s))
                .unwrap_or(std::time::Duration::from_secs(10)),
        }
    }
}

/// Parses durations of the form `"10s"` or a bare integer number of seconds.
fn parse_duration_secs(s: &str) -> Option<std::time::Duration> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits
        .parse::<u64>()
        .ok()
        .map(std::time::Duration::from_secs)
}
