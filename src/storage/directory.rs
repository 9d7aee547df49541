//! The `directory` storage provider (spec §4.10): a plain directory tree
//! rooted at a configured path, laid out `<root>/<org>/<name>/<version>/…`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stacked_errors::{Result, StackableErr};

use super::{ArtifactMetadata, ImageStorage, ImageTag};
use crate::{acquire_file_path, FileOptions};

/// Directory-backed storage for rootfs images and kernels.
pub struct DirectoryStorage {
    rootfs_root: PathBuf,
    kernel_root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(rootfs_root: impl Into<PathBuf>, kernel_root: impl Into<PathBuf>) -> Self {
        Self {
            rootfs_root: rootfs_root.into(),
            kernel_root: kernel_root.into(),
        }
    }

    fn rootfs_dir(&self, tag: &ImageTag) -> PathBuf {
        self.rootfs_root.join(&tag.org).join(&tag.name).join(&tag.version)
    }

    async fn read_metadata(path: &Path) -> ArtifactMetadata {
        match FileOptions::read_to_string(path).await {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                tracing::warn!(?path, error = %e, "metadata.json present but unparsable, using defaults");
                ArtifactMetadata::default()
            }),
            Err(_) => ArtifactMetadata::default(),
        }
    }
}

#[async_trait]
impl ImageStorage for DirectoryStorage {
    #[tracing::instrument(skip(self))]
    async fn fetch_kernel(&self, id: &str) -> Result<(PathBuf, ArtifactMetadata)> {
        let kernel_path = self.kernel_root.join(id);
        let acquired = acquire_file_path(&kernel_path)
            .await
            .stack_err_with(|| format!("fetch_kernel({id:?}) -> not found or not a regular file"))?;
        let metadata = Self::read_metadata(&self.kernel_root.join(format!("{id}.json"))).await;
        Ok((acquired, metadata))
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_rootfs(&self, tag: &ImageTag) -> Result<(PathBuf, ArtifactMetadata)> {
        let dir = self.rootfs_dir(tag);
        let rootfs_path = dir.join("rootfs");
        let acquired = acquire_file_path(&rootfs_path)
            .await
            .stack_err_with(|| format!("fetch_rootfs({tag}) -> rootfs not found at {rootfs_path:?}"))?;
        let metadata = Self::read_metadata(&dir.join("metadata.json")).await;
        Ok((acquired, metadata))
    }

    #[tracing::instrument(skip(self, metadata))]
    async fn store_rootfs(
        &self,
        local_path: &Path,
        tag: &ImageTag,
        metadata: &ArtifactMetadata,
    ) -> Result<(PathBuf, Option<PathBuf>)> {
        let dir = self.rootfs_dir(tag);
        tokio::fs::create_dir_all(&dir)
            .await
            .stack_err_with(|| format!("store_rootfs({tag}) -> creating {dir:?}"))?;
        let dest = dir.join("rootfs");
        move_or_copy(local_path, &dest)
            .await
            .stack_err_with(|| format!("store_rootfs({tag}) -> placing rootfs at {dest:?}"))?;

        let metadata_path = dir.join("metadata.json");
        let metadata_result = async {
            let s = serde_json::to_string_pretty(metadata)
                .stack_err("store_rootfs -> serializing metadata")?;
            FileOptions::write_str(&metadata_path, &s).await
        }
        .await;
        let metadata_path = match metadata_result {
            Ok(()) => Some(metadata_path),
            Err(e) => {
                tracing::warn!(error = %e, ?metadata_path, "failed to persist rootfs metadata, continuing");
                None
            }
        };

        let dest = acquire_file_path(&dest)
            .await
            .stack_err_with(|| format!("store_rootfs({tag}) -> verifying placed rootfs"))?;
        Ok((dest, metadata_path))
    }
}

/// Same-filesystem rename when possible, falling back to copy-then-remove
/// across filesystems (spec §4.10).
async fn move_or_copy(src: &Path, dst: &Path) -> Result<()> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            tokio::fs::copy(src, dst)
                .await
                .stack_err_with(|| format!("move_or_copy -> copying {src:?} to {dst:?}"))?;
            tokio::fs::remove_file(src)
                .await
                .stack_err_with(|| format!("move_or_copy -> removing source {src:?} after copy"))?;
            Ok(())
        }
        Err(e) => Err(e).stack_err_with(|| format!("move_or_copy -> renaming {src:?} to {dst:?}")),
    }
}

/// `EXDEV`: "Invalid cross-device link". Hardcoded rather than pulling in
/// `libc` solely for one errno constant; value is stable across all unixes
/// `nix`/`libc` target.
#[cfg(unix)]
fn libc_exdev() -> i32 {
    18
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_file(path: &Path, content: &[u8]) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, content).await.unwrap();
    }

    #[tokio::test]
    async fn store_then_fetch_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let storage = DirectoryStorage::new(root.path().join("rootfs"), root.path().join("kernel"));
        let tag = ImageTag::parse("acme/app:1.0").unwrap();

        let src = root.path().join("scratch-rootfs");
        write_file(&src, b"rootfs bytes").await;

        let metadata = ArtifactMetadata {
            labels: [("maintainer".to_owned(), "acme".to_owned())].into(),
            ..Default::default()
        };
        let (stored_path, metadata_path) =
            storage.store_rootfs(&src, &tag, &metadata).await.unwrap();
        assert!(stored_path.ends_with("rootfs"));
        assert!(metadata_path.is_some());

        let (fetched_path, fetched_metadata) = storage.fetch_rootfs(&tag).await.unwrap();
        assert_eq!(
            tokio::fs::read(&fetched_path).await.unwrap(),
            b"rootfs bytes"
        );
        assert_eq!(fetched_metadata.labels.get("maintainer").unwrap(), "acme");
    }

    #[tokio::test]
    async fn fetch_missing_rootfs_errors() {
        let root = tempfile::tempdir().unwrap();
        let storage = DirectoryStorage::new(root.path().join("rootfs"), root.path().join("kernel"));
        let tag = ImageTag::parse("acme/app:1.0").unwrap();
        assert!(storage.fetch_rootfs(&tag).await.is_err());
    }
}
