//! Ties [`SourceOrigin`] to concrete `ADD`/`COPY` resolution (spec §4.2,
//! §4.4): the [`crate::remote_exec::ResourceResolver`] implementation the
//! replay loop consults for every non-`--from` source.

use std::path::Path;

use async_trait::async_trait;
use stacked_errors::{bail_locationless, Result, StackableErr};

use super::{
    dockerignore::IgnoreMatcher,
    http,
    resolved::{resolve_filesystem, walk_directory, ResolvedResource},
    SourceOrigin,
};
use crate::remote_exec::ResourceResolver;

/// Resolves `ADD`/`COPY` sources against the same [`SourceOrigin`] a build's
/// Dockerfile was loaded from.
pub struct ContextResolver {
    origin: SourceOrigin,
    excludes: IgnoreMatcher,
}

impl ContextResolver {
    pub fn new(origin: SourceOrigin) -> Self {
        let excludes = match &origin {
            SourceOrigin::Filesystem { context_root }
            | SourceOrigin::Git { context_root, .. } => IgnoreMatcher::load(context_root),
            SourceOrigin::Http { .. } => IgnoreMatcher::load(Path::new("/dev/null")),
        };
        Self { origin, excludes }
    }

    /// The `.dockerignore` matcher loaded alongside this resolver's context
    /// root, for callers (the replay loop) that apply exclusion before even
    /// calling `resolve`.
    pub fn excludes(&self) -> &IgnoreMatcher {
        &self.excludes
    }
}

#[async_trait]
impl ResourceResolver for ContextResolver {
    async fn resolve(&self, src: &str, dst: &str, chown: Option<&str>) -> Result<Vec<ResolvedResource>> {
        match &self.origin {
            SourceOrigin::Http { base_url } => {
                if src.ends_with('/') {
                    bail_locationless!(
                        "ADD/COPY source {src:?} looks like a directory; directory sources are not supported over HTTP"
                    );
                }
                let url = if src.starts_with("http://") || src.starts_with("https://") {
                    src.to_owned()
                } else {
                    format!("{}/{}", base_url.trim_end_matches('/'), src.trim_start_matches('/'))
                };
                let bytes = http::fetch_resource(&url)
                    .await
                    .stack_err_with(|| format!("ContextResolver -> fetching {url}"))?;
                Ok(vec![
                    ResolvedResource::from_bytes(url, dst, bytes).with_chown(chown.map(str::to_owned))
                ])
            }
            SourceOrigin::Filesystem { context_root } | SourceOrigin::Git { context_root, .. } => {
                let local = context_root.join(src.trim_start_matches('/'));
                if local.is_dir() {
                    let files = walk_directory(&local, &self.excludes);
                    let mut out = Vec::with_capacity(files.len());
                    for file in files {
                        let rel = file
                            .strip_prefix(&local)
                            .stack_err_locationless("walk_directory returned a path outside its root")?;
                        let target = Path::new(dst).join(rel).to_string_lossy().into_owned();
                        out.push(
                            resolve_filesystem(&file, &target, chown.map(str::to_owned))
                                .await
                                .stack_err_with(|| format!("ContextResolver -> resolving {file:?}"))?,
                        );
                    }
                    Ok(out)
                } else {
                    let resolved = resolve_filesystem(&local, dst, chown.map(str::to_owned))
                        .await
                        .stack_err_with(|| format!("ContextResolver -> resolving {local:?}"))?;
                    Ok(vec![resolved])
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[tokio::test]
    async fn resolves_single_filesystem_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("app.bin"), b"payload").await.unwrap();
        let resolver = ContextResolver::new(SourceOrigin::Filesystem {
            context_root: dir.path().to_owned(),
        });
        let resolved = resolver.resolve("app.bin", "/app.bin", None).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].bytes, b"payload");
        assert_eq!(resolved[0].target, "/app.bin");
    }

    #[tokio::test]
    async fn resolves_directory_recursively_honouring_dockerignore() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("src/assets")).await.unwrap();
        tokio::fs::write(dir.path().join("src/main.rs"), b"fn main() {}").await.unwrap();
        tokio::fs::write(dir.path().join("src/assets/logo.png"), b"png").await.unwrap();
        tokio::fs::write(dir.path().join(".dockerignore"), "src/assets/\n").await.unwrap();
        let resolver = ContextResolver::new(SourceOrigin::Filesystem {
            context_root: dir.path().to_owned(),
        });
        let resolved = resolver.resolve("src", "/app", None).await.unwrap();
        let targets: Vec<PathBuf> = resolved.iter().map(|r| PathBuf::from(&r.target)).collect();
        assert!(targets.contains(&PathBuf::from("/app/main.rs")));
        assert!(!targets.iter().any(|t| t.to_string_lossy().contains("logo.png")));
    }

    #[tokio::test]
    async fn http_origin_rejects_directory_style_source() {
        let resolver = ContextResolver::new(SourceOrigin::Http {
            base_url: "https://example.com/ctx".to_owned(),
        });
        assert!(resolver.resolve("assets/", "/assets", None).await.is_err());
    }
}
