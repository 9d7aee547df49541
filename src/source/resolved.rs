//! `ResolvedResource` (spec §3): materialised content for an `ADD`/`COPY`.

use std::path::PathBuf;

/// Materialised content for a single `ADD`/`COPY` source.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    /// The path or URL this was resolved from, for diagnostics.
    pub source: String,
    /// Destination path inside the guest, as written in the instruction.
    pub target: String,
    /// Preserved for filesystem/Git sources; absent for HTTP sources (spec
    /// §3).
    pub mode: Option<u32>,
    pub chown: Option<String>,
    pub bytes: Vec<u8>,
}

impl ResolvedResource {
    pub fn from_bytes(source: impl Into<String>, target: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode: None,
            chown: None,
            bytes,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_chown(mut self, chown: Option<String>) -> Self {
        self.chown = chown;
        self
    }
}

/// Reads a local filesystem resource, preserving its unix mode bits.
pub async fn resolve_filesystem(
    local_path: &std::path::Path,
    target: &str,
    chown: Option<String>,
) -> stacked_errors::Result<ResolvedResource> {
    use stacked_errors::StackableErr;
    let bytes = tokio::fs::read(local_path)
        .await
        .stack_err_with(|| format!("resolve_filesystem -> reading {local_path:?}"))?;
    let mode = mode_bits(local_path).await?;
    Ok(ResolvedResource::from_bytes(
        local_path.to_string_lossy(),
        target,
        bytes,
    )
    .with_mode(mode)
    .with_chown(chown))
}

#[cfg(unix)]
async fn mode_bits(path: &std::path::Path) -> stacked_errors::Result<u32> {
    use std::os::unix::fs::PermissionsExt;

    use stacked_errors::StackableErr;
    let meta = tokio::fs::metadata(path)
        .await
        .stack_err_with(|| format!("mode_bits -> stat {path:?}"))?;
    Ok(meta.permissions().mode())
}

#[cfg(not(unix))]
async fn mode_bits(_path: &std::path::Path) -> stacked_errors::Result<u32> {
    Ok(0o644)
}

/// Recursively lists every file under `root`, honouring `matcher`, returning
/// paths relative to `root`. Used for directory `ADD`/`COPY` sources from
/// filesystem and Git origins (never from HTTP, spec §4.2).
pub fn walk_directory(
    root: &std::path::Path,
    matcher: &super::IgnoreMatcher,
) -> Vec<PathBuf> {
    let mut out = vec![];
    for entry in walkdir::WalkDir::new(root).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if matcher.is_excluded(rel, false) {
            continue;
        }
        out.push(entry.path().to_owned());
    }
    out
}
