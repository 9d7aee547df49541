//! Named, serialisable configuration bundles (C12).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stacked_errors::{Result, StackableErr};

use crate::FileOptions;

/// Which kind of image storage backend a [`Profile`] points at.
///
/// Only `directory` is implemented; the variant is kept open because the
/// on-disk format already discriminates on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageProviderKind {
    Directory,
}

/// Storage-provider-specific properties. Only the `directory` provider's
/// knobs exist today.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageProviderProperties {
    pub directory_rootfs_storage_root: Option<PathBuf>,
    pub directory_kernel_storage_root: Option<PathBuf>,
}

/// Tracing/observability knobs a profile can pin down.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracingOptions {
    pub enable: bool,
    pub collector_host_port: Option<String>,
}

/// A named, persisted bundle of defaults. `Config::update_from_profile` reads
/// from this; a profile never overrides a flag the user actually passed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Profile {
    pub name: String,
    pub binary_firecracker: Option<PathBuf>,
    pub binary_jailer: Option<PathBuf>,
    pub binary_image_builder: Option<PathBuf>,
    pub chroot_base: Option<PathBuf>,
    pub run_cache_dir: Option<PathBuf>,
    pub storage_provider: Option<StorageProviderKind>,
    pub storage_provider_properties: StorageProviderProperties,
    pub tracing: TracingOptions,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn path_in(profile_dir: &Path, name: &str) -> PathBuf {
        profile_dir.join(name)
    }

    /// Persists this profile under `<profile_dir>/<name>`, pretty-printed.
    pub async fn save(&self, profile_dir: impl AsRef<Path>) -> Result<PathBuf> {
        let path = Self::path_in(profile_dir.as_ref(), &self.name);
        let s = serde_json::to_string_pretty(self).stack_err("Profile::save -> serialize")?;
        FileOptions::write_str(&path, &s)
            .await
            .stack_err_with(|| format!("Profile::save -> writing {path:?}"))?;
        Ok(path)
    }

    /// Loads the profile named `name` from `profile_dir`.
    pub async fn load(profile_dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = Self::path_in(profile_dir.as_ref(), name);
        let s = FileOptions::read_to_string(&path)
            .await
            .stack_err_with(|| format!("Profile::load -> reading {path:?}"))?;
        serde_json::from_str(&s).stack_err_with(|| format!("Profile::load -> parsing {path:?}"))
    }

    /// Lists every profile name persisted under `profile_dir`.
    pub async fn ls(profile_dir: impl AsRef<Path>) -> Result<Vec<String>> {
        let mut names = vec![];
        let mut rd = tokio::fs::read_dir(profile_dir.as_ref())
            .await
            .stack_err_with(|| format!("Profile::ls -> reading {:?}", profile_dir.as_ref()))?;
        while let Some(entry) = rd
            .next_entry()
            .await
            .stack_err("Profile::ls -> iterating entries")?
        {
            if entry
                .file_type()
                .await
                .stack_err("Profile::ls -> file_type")?
                .is_file()
            {
                if let Some(s) = entry.file_name().to_str() {
                    names.push(s.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
