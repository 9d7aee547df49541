//! `.dockerignore` parsing into an exclusion pattern list (spec §4.2), built
//! on the `ignore` crate's gitignore matcher.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Matches paths against a sibling `.dockerignore` file, if one exists.
pub struct IgnoreMatcher {
    inner: Option<Gitignore>,
}

impl IgnoreMatcher {
    /// Looks for `<context_root>/.dockerignore`. If absent, every path is
    /// considered included.
    pub fn load(context_root: &Path) -> Self {
        let candidate = context_root.join(".dockerignore");
        if !candidate.is_file() {
            return Self { inner: None };
        }
        let mut builder = GitignoreBuilder::new(context_root);
        if builder.add(&candidate).is_some() {
            tracing::warn!(path = ?candidate, "failed to parse .dockerignore, ignoring it");
            return Self { inner: None };
        }
        match builder.build() {
            Ok(gi) => Self { inner: Some(gi) },
            Err(e) => {
                tracing::warn!(error = %e, "failed to build .dockerignore matcher");
                Self { inner: None }
            }
        }
    }

    /// True if `path` (relative to the context root) should be excluded.
    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        match &self.inner {
            Some(gi) => gi.matched(path, is_dir).is_ignore(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dockerignore_excludes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let m = IgnoreMatcher::load(dir.path());
        assert!(!m.is_excluded(Path::new("anything"), false));
    }

    #[test]
    fn dockerignore_excludes_matched_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".dockerignore"), "target/\n*.log\n").unwrap();
        let m = IgnoreMatcher::load(dir.path());
        assert!(m.is_excluded(Path::new("target"), true));
        assert!(m.is_excluded(Path::new("debug.log"), false));
        assert!(!m.is_excluded(Path::new("src/main.rs"), false));
    }
}
