//! Loading a Dockerfile and its `ADD`/`COPY` inputs from a literal string,
//! filesystem path, HTTP(S) URL, or Git URL (C2).

mod dockerignore;
mod git;
mod http;
mod resolved;
mod resolver;

pub use dockerignore::IgnoreMatcher;
pub use resolved::ResolvedResource;
pub use resolver::ContextResolver;

use std::path::{Path, PathBuf};

use stacked_errors::{bail_locationless, Result, StackableErr};

/// Where a Dockerfile (or an `ADD`/`COPY` source) was ultimately loaded from.
/// Relative resource paths in `ADD`/`COPY` are resolved against the
/// `context_root` carried alongside the loaded text (spec §4.2).
#[derive(Debug, Clone)]
pub enum SourceOrigin {
    /// Loaded from the local filesystem; the parent directory is the
    /// context root.
    Filesystem { context_root: PathBuf },
    /// Cloned from git; the in-repo directory containing the Dockerfile is
    /// the context root, inside the clone's scratch directory.
    Git {
        clone_root: PathBuf,
        context_root: PathBuf,
    },
    /// Fetched over HTTP(S); the context root is the URL with its final
    /// path segment removed. No directory `ADD`/`COPY` inputs are possible.
    Http { base_url: String },
}

/// The loaded Dockerfile text plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedDockerfile {
    pub text: String,
    pub origin: SourceOrigin,
}

/// Dispatches on `input`'s prefix per spec §4.2 / §6 Dockerfile URL grammar.
pub async fn load_dockerfile(input: &str) -> Result<LoadedDockerfile> {
    if is_git_url(input) {
        return git::load(input).await.stack_err("load_dockerfile -> git");
    }
    if input.starts_with("http://") || input.starts_with("https://") {
        return http::load(input).await.stack_err("load_dockerfile -> http");
    }
    let path = Path::new(input);
    if path.exists() {
        let text = tokio::fs::read_to_string(path)
            .await
            .stack_err_with(|| format!("load_dockerfile -> reading {input:?}"))?;
        let context_root = path
            .parent()
            .map(|p| p.to_owned())
            .unwrap_or_else(|| PathBuf::from("."));
        return Ok(LoadedDockerfile {
            text,
            origin: SourceOrigin::Filesystem { context_root },
        });
    }
    // not an existing path: treat the argument itself as literal content
    Ok(LoadedDockerfile {
        text: input.to_owned(),
        origin: SourceOrigin::Filesystem {
            context_root: PathBuf::from("."),
        },
    })
}

fn is_git_url(input: &str) -> bool {
    for prefix in ["git+http://", "git+https://", "git+ssh://", "git://", "ssh://"] {
        if input.starts_with(prefix) {
            return true;
        }
    }
    false
}

/// Parses the `<repo>.git:/<in-repo-path>[#<ref>]` grammar shared by every
/// git-flavoured prefix (spec §6).
pub(crate) fn split_git_locator(rest: &str) -> Result<(String, String, Option<String>)> {
    let (without_frag, frag) = match rest.split_once('#') {
        Some((a, b)) => (a, Some(b.to_owned())),
        None => (rest, None),
    };
    let idx = without_frag
        .find(".git:")
        .stack_err_with(|| format!("git locator missing \".git:\" separator: {rest:?}"))?;
    let repo_end = idx + ".git".len();
    let repo = without_frag[..repo_end].to_owned();
    let in_repo_path = without_frag[repo_end + 1..].to_owned();
    if in_repo_path.is_empty() {
        bail_locationless!("git locator missing in-repo path: {rest:?}");
    }
    Ok((repo, in_repo_path, frag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_locator_parses_ref() {
        let (repo, path, frag) =
            split_git_locator("//host/repo.git:/in/repo/Dockerfile#v1.0").unwrap();
        assert_eq!(repo, "//host/repo.git");
        assert_eq!(path, "/in/repo/Dockerfile");
        assert_eq!(frag.as_deref(), Some("v1.0"));
    }

    #[tokio::test]
    async fn literal_fallback_for_nonexistent_path() {
        let loaded = load_dockerfile("FROM alpine\n").await.unwrap();
        assert_eq!(loaded.text, "FROM alpine\n");
    }
}
