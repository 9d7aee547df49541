//! Shared plumbing every subcommand handler needs: env/build-arg map
//! parsing, profile merging, and CNI/firewall/storage construction from CLI
//! flags.

use std::{collections::BTreeMap, path::Path, time::Duration};

use stacked_errors::{Result, StackableErr};

use crate::{
    cli::{parse_env_file, parse_kv, CniArgs},
    cni::CniDriver,
    config::{FirewallConfig, UpdateFromProfile},
    firewall::{FirewallController, IptablesLock},
    profile::Profile,
};

/// Merges `--env-file` (applied first) with `--env` (applied second, so a
/// repeated flag wins over the file).
pub async fn merged_env(env: &[String], env_file: Option<&Path>) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    if let Some(path) = env_file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .stack_err_with(|| format!("reading env file {path:?}"))?;
        for (k, v) in parse_env_file(&contents) {
            map.insert(k, v);
        }
    }
    for raw in env {
        let (k, v) = parse_kv(raw)?;
        map.insert(k, v);
    }
    Ok(map)
}

/// Parses `--build-arg KEY=VAL` entries into the map `ARG` instructions
/// without a default are resolved against (spec §4.3).
pub fn build_arg_map(build_arg: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for raw in build_arg {
        let (k, v) = parse_kv(raw)?;
        map.insert(k, v);
    }
    Ok(map)
}

/// Loads `profile_name` (if given) and applies it to every config struct
/// that accepts profile defaults. An explicit flag always wins (spec §1
/// Configuration: "profile supplies defaults only").
pub async fn apply_profile(
    profile_name: Option<&str>,
    profile_dir: &Path,
    binaries: &mut crate::config::BinariesConfig,
    storage: &mut crate::config::StorageConfig,
    run_cache: &mut crate::config::RunCacheConfig,
    tracing_cfg: &mut crate::config::TracingConfig,
) -> Result<()> {
    let Some(name) = profile_name else { return Ok(()) };
    let profile = Profile::load(profile_dir, name)
        .await
        .stack_err_with(|| format!("loading profile {name:?}"))?;
    binaries.update_from_profile(&profile);
    storage.update_from_profile(&profile);
    run_cache.update_from_profile(&profile);
    tracing_cfg.update_from_profile(&profile);
    Ok(())
}

pub fn cni_driver(args: &CniArgs) -> CniDriver {
    CniDriver {
        plugin_dir: args.plugin_dir.clone(),
        conf_dir: args.conf_dir.clone(),
        cache_root: args.cache_root.clone(),
    }
}

pub fn cni_net_ns(args: &CniArgs, vm_id: &str) -> String {
    args.net_ns
        .clone()
        .unwrap_or_else(|| format!("/var/run/netns/{vm_id}"))
}

/// Builds the firewall controller from the `FIREBUILD_IPT_*` environment
/// variables (spec §6); there are no CLI flags for these.
pub fn firewall_controller() -> FirewallController {
    let cfg = FirewallConfig::default();
    FirewallController::new(cfg.filter_chain_name, IptablesLock::new(cfg.flock_file, cfg.flock_acquire_timeout))
}

pub fn run_cache_dir(run_cache: &crate::config::RunCacheConfig) -> Result<std::path::PathBuf> {
    run_cache
        .run_cache_dir
        .clone()
        .stack_err_locationless("--run-cache-dir (or FIREBUILD_RUN_CACHE_DIR) is required")
}

/// `Duration::from_secs` wrapper kept for call-site readability at CLI
/// boundaries translating `u64` seconds flags.
pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
