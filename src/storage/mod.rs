//! Rootfs/kernel/metadata storage adapter (C10).
//!
//! Only the `directory` provider is implemented (spec §6
//! `--storage-provider=directory`); the trait is kept open so a future
//! provider can slot in without touching callers.

mod directory;
mod tag;

pub use directory::DirectoryStorage;
pub use tag::ImageTag;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stacked_errors::Result;

/// Metadata stored alongside a rootfs or kernel artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub labels: std::collections::BTreeMap<String, String>,
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub created_at_utc: Option<chrono::DateTime<chrono::Utc>>,
}

/// The storage contract of spec §4.10.
#[async_trait]
pub trait ImageStorage: Send + Sync {
    /// Lookup by flat kernel id.
    async fn fetch_kernel(&self, id: &str) -> Result<(PathBuf, ArtifactMetadata)>;

    /// Lookup by `(org, name, version)`.
    async fn fetch_rootfs(
        &self,
        tag: &ImageTag,
    ) -> Result<(PathBuf, ArtifactMetadata)>;

    /// Moves `local_path` into place and writes metadata alongside it.
    /// Failure to persist metadata is non-fatal (spec §4.10).
    async fn store_rootfs(
        &self,
        local_path: &std::path::Path,
        tag: &ImageTag,
        metadata: &ArtifactMetadata,
    ) -> Result<(PathBuf, Option<PathBuf>)>;
}
