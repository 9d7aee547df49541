//! `clap` derive CLI surface (spec §6 External Interfaces).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{
    BinariesConfig, MachineConfig, ResourcesConfig, RunCacheConfig, StorageConfig, TracingConfig,
};

#[derive(Debug, Parser)]
#[command(
    name = "firebuild",
    version,
    about = "Builds jailed microVM root filesystems from Dockerfiles, and runs, inspects, and reclaims the resulting VMs."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build a base-OS rootfs from a Dockerfile; no guest required.
    Baseos(BaseosArgs),
    /// Build a tagged rootfs from a Dockerfile inside a booted VM.
    Rootfs(RootfsArgs),
    /// Boot a tagged rootfs; publish exposed ports; optionally daemonise.
    Run(RunArgs),
    /// List known VMs in the run cache.
    Ls(LsArgs),
    /// Pretty-print metadata for one VM.
    Inspect(InspectArgs),
    /// Stop a VM and reclaim resources.
    Kill(KillArgs),
    /// Reclaim resources for all non-running cache entries.
    Purge(PurgeArgs),
    /// Persist a named configuration bundle.
    ProfileCreate(ProfileCreateArgs),
    /// List persisted configuration bundles.
    ProfileLs(ProfileLsArgs),
    /// Pretty-print a persisted configuration bundle.
    ProfileInspect(ProfileInspectArgs),
}

/// CNI plugin locations. Not profile-backed: these describe fixed host
/// paths (plugin binaries, conflist directory) rather than per-build
/// preferences.
#[derive(Debug, Clone, clap::Args)]
pub struct CniArgs {
    #[arg(long = "cni-plugin-dir", env = "FIREBUILD_CNI_PLUGIN_DIR", default_value = "/opt/cni/bin")]
    pub plugin_dir: PathBuf,
    #[arg(long = "cni-conf-dir", env = "FIREBUILD_CNI_CONF_DIR", default_value = "/etc/cni/net.d")]
    pub conf_dir: PathBuf,
    #[arg(long = "cni-cache-root", env = "FIREBUILD_CNI_CACHE_ROOT", default_value = "/var/lib/cni/cache")]
    pub cache_root: PathBuf,
    #[arg(long = "cni-net-ns")]
    pub net_ns: Option<String>,
    #[arg(long = "cni-if-name", default_value = "eth0")]
    pub if_name: String,
}

/// Flags shared by `baseos` and `rootfs` (spec §6 "Flags (selected)").
#[derive(Debug, clap::Args)]
pub struct BuildArgs {
    /// A URL, filesystem path, or literal Dockerfile content (spec §4.2).
    #[arg(long)]
    pub dockerfile: String,
    /// `<org>/<name>:<version>` (spec §3 `ImageTag`).
    #[arg(long)]
    pub tag: String,
    #[arg(long = "pre-build-command")]
    pub pre_build_command: Vec<String>,
    #[arg(long = "post-build-command")]
    pub post_build_command: Vec<String>,
    /// `KEY=VAL`, repeatable. Injected into the guest environment by
    /// pseudo-cloud-init and available to `RUN`'s shell-style substitution.
    #[arg(long = "env")]
    pub env: Vec<String>,
    #[arg(long = "env-file")]
    pub env_file: Option<PathBuf>,
    /// `KEY=VAL`, repeatable. Supplies values for `ARG` instructions lacking
    /// a default (spec §4.3).
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,
    /// An additional OpenSSH public key to inject alongside the ephemeral
    /// per-build keypair, for operator debug access.
    #[arg(long = "identity-file")]
    pub identity_file: Option<PathBuf>,
    #[arg(long = "shutdown-graceful-timeout-seconds", default_value_t = 10)]
    pub shutdown_graceful_timeout_seconds: u64,
    #[arg(long = "ssh-connect-timeout-seconds", default_value_t = 30)]
    pub ssh_connect_timeout_seconds: u64,
    #[arg(long)]
    pub profile: Option<String>,
    #[arg(long = "profile-dir", env = "FIREBUILD_PROFILE_DIR", default_value = "/etc/firebuild/profiles")]
    pub profile_dir: PathBuf,

    #[command(flatten)]
    pub binaries: BinariesConfig,
    #[command(flatten)]
    pub resources: ResourcesConfig,
    #[command(flatten)]
    pub machine: MachineConfig,
    #[command(flatten)]
    pub storage: StorageConfig,
    #[command(flatten)]
    pub run_cache: RunCacheConfig,
    #[command(flatten)]
    pub tracing: TracingConfig,
    #[command(flatten)]
    pub cni: CniArgs,
}

#[derive(Debug, clap::Args)]
pub struct BaseosArgs {
    #[command(flatten)]
    pub build: BuildArgs,
}

#[derive(Debug, clap::Args)]
pub struct RootfsArgs {
    #[command(flatten)]
    pub build: BuildArgs,
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    #[arg(long)]
    pub tag: String,
    #[arg(long = "env")]
    pub env: Vec<String>,
    #[arg(long = "env-file")]
    pub env_file: Option<PathBuf>,
    #[arg(long = "identity-file")]
    pub identity_file: Option<PathBuf>,
    #[arg(long)]
    pub daemonize: bool,
    /// `[<iface>:]<host_port>:<dest_port>/<proto>`, repeatable (spec §4.8).
    #[arg(long = "expose-port")]
    pub expose_port: Vec<String>,
    #[arg(long = "shutdown-graceful-timeout-seconds", default_value_t = 10)]
    pub shutdown_graceful_timeout_seconds: u64,
    #[arg(long = "ssh-connect-timeout-seconds", default_value_t = 30)]
    pub ssh_connect_timeout_seconds: u64,
    #[arg(long)]
    pub profile: Option<String>,
    #[arg(long = "profile-dir", env = "FIREBUILD_PROFILE_DIR", default_value = "/etc/firebuild/profiles")]
    pub profile_dir: PathBuf,

    #[command(flatten)]
    pub binaries: BinariesConfig,
    #[command(flatten)]
    pub resources: ResourcesConfig,
    #[command(flatten)]
    pub machine: MachineConfig,
    #[command(flatten)]
    pub storage: StorageConfig,
    #[command(flatten)]
    pub run_cache: RunCacheConfig,
    #[command(flatten)]
    pub tracing: TracingConfig,
    #[command(flatten)]
    pub cni: CniArgs,
}

#[derive(Debug, clap::Args)]
pub struct LsArgs {
    #[command(flatten)]
    pub run_cache: RunCacheConfig,
}

#[derive(Debug, clap::Args)]
pub struct InspectArgs {
    pub vm_id: String,
    #[command(flatten)]
    pub run_cache: RunCacheConfig,
}

#[derive(Debug, clap::Args)]
pub struct KillArgs {
    pub vm_id: String,
    #[command(flatten)]
    pub run_cache: RunCacheConfig,
    #[command(flatten)]
    pub cni: CniArgs,
}

#[derive(Debug, clap::Args)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub run_cache: RunCacheConfig,
    #[command(flatten)]
    pub cni: CniArgs,
}

#[derive(Debug, clap::Args)]
pub struct ProfileCreateArgs {
    pub name: String,
    #[arg(long = "profile-dir", env = "FIREBUILD_PROFILE_DIR", default_value = "/etc/firebuild/profiles")]
    pub profile_dir: PathBuf,
    #[command(flatten)]
    pub binaries: BinariesConfig,
    #[command(flatten)]
    pub storage: StorageConfig,
    #[command(flatten)]
    pub run_cache: RunCacheConfig,
    #[command(flatten)]
    pub tracing: TracingConfig,
}

#[derive(Debug, clap::Args)]
pub struct ProfileLsArgs {
    #[arg(long = "profile-dir", env = "FIREBUILD_PROFILE_DIR", default_value = "/etc/firebuild/profiles")]
    pub profile_dir: PathBuf,
}

#[derive(Debug, clap::Args)]
pub struct ProfileInspectArgs {
    pub name: String,
    #[arg(long = "profile-dir", env = "FIREBUILD_PROFILE_DIR", default_value = "/etc/firebuild/profiles")]
    pub profile_dir: PathBuf,
}

/// Parses a repeated `KEY=VAL` flag value into its pair, used for `--env`
/// and `--build-arg`.
pub fn parse_kv(raw: &str) -> stacked_errors::Result<(String, String)> {
    use stacked_errors::StackableErr;
    raw.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .stack_err_with(|| format!("expected KEY=VAL, got {raw:?}"))
}

/// Parses every line of an env-file (`KEY=VAL` per line, blank lines and
/// `#`-comments skipped).
pub fn parse_env_file(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('=').map(|(k, v)| (k.to_owned(), v.to_owned())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kv() {
        assert_eq!(parse_kv("FOO=bar").unwrap(), ("FOO".to_owned(), "bar".to_owned()));
        assert!(parse_kv("no-equals-sign").is_err());
    }

    #[test]
    fn parses_env_file_skipping_comments_and_blanks() {
        let parsed = parse_env_file("FOO=bar\n# a comment\n\nBAZ=qux\n");
        assert_eq!(
            parsed,
            vec![("FOO".to_owned(), "bar".to_owned()), ("BAZ".to_owned(), "qux".to_owned())]
        );
    }
}
