//! Git-flavoured Dockerfile loading (spec §4.2, §6 URL grammar):
//! `git+http(s)://`, `git+ssh://`, `git://`, `ssh://`.

use std::path::PathBuf;

use stacked_errors::{bail_locationless, Result, StackableErr};

use super::{split_git_locator, LoadedDockerfile, SourceOrigin};

/// Strips the scheme prefix, and for the `git+` family strips the `git+`
/// part so the remainder is a transport `git2` understands natively.
fn strip_scheme(input: &str) -> (String, String) {
    for (prefix, transport_prefix) in [
        ("git+https://", "https://"),
        ("git+http://", "http://"),
        ("git+ssh://", "ssh://"),
        ("git://", "git://"),
        ("ssh://", "ssh://"),
    ] {
        if let Some(rest) = input.strip_prefix(prefix) {
            return (transport_prefix.to_owned(), rest.to_owned());
        }
    }
    unreachable!("caller already checked the prefix via is_git_url")
}

pub async fn load(input: &str) -> Result<LoadedDockerfile> {
    let (transport_prefix, rest) = strip_scheme(input);
    let (repo_locator, in_repo_path, want_ref) = split_git_locator(&rest)?;
    let clone_url = format!("{transport_prefix}{repo_locator}");
    let clone_root = std::env::temp_dir().join(format!("firebuild-git-{}", uuid::Uuid::new_v4()));

    let clone_url_owned = clone_url.clone();
    let clone_root_owned = clone_root.clone();
    let want_ref_owned = want_ref.clone();
    let repo = tokio::task::spawn_blocking(move || {
        clone_and_checkout(&clone_url_owned, &clone_root_owned, want_ref_owned.as_deref())
    })
    .await
    .stack_err("git::load -> blocking clone task panicked")?
    .stack_err_with(|| format!("git::load -> cloning {clone_url}"))?;
    drop(repo);

    let in_repo_path_trimmed = in_repo_path.trim_start_matches('/');
    let file_path = clone_root.join(in_repo_path_trimmed);
    if file_path.is_dir() {
        bail_locationless!("git::load -> {in_repo_path:?} is a directory, expected a file");
    }
    let text = tokio::fs::read_to_string(&file_path)
        .await
        .stack_err_with(|| format!("git::load -> reading {file_path:?}"))?;
    let context_root = file_path
        .parent()
        .map(|p| p.to_owned())
        .unwrap_or_else(|| clone_root.clone());
    Ok(LoadedDockerfile {
        text,
        origin: SourceOrigin::Git {
            clone_root,
            context_root,
        },
    })
}

fn clone_and_checkout(
    url: &str,
    dest: &std::path::Path,
    want_ref: Option<&str>,
) -> std::result::Result<git2::Repository, git2::Error> {
    let repo = git2::Repository::clone(url, dest)?;
    if let Some(want) = want_ref {
        let (object, reference) = resolve_ref(&repo, want)?;
        repo.checkout_tree(&object, None)?;
        match reference {
            Some(r) => repo.set_head(r.name().unwrap_or("HEAD"))?,
            None => repo.set_head_detached(object.id())?,
        }
    }
    Ok(repo)
}

/// Finds the first remote ref whose hash equals `want` or whose short name
/// matches it (spec §4.2: "the first ref whose hash equals the fragment or
/// whose short name matches").
fn resolve_ref<'a>(
    repo: &'a git2::Repository,
    want: &str,
) -> std::result::Result<(git2::Object<'a>, Option<git2::Reference<'a>>), git2::Error> {
    for reference in repo.references()?.flatten() {
        let matches_hash = reference
            .target()
            .map(|oid| oid.to_string() == want || oid.to_string().starts_with(want))
            .unwrap_or(false);
        let matches_name = reference
            .shorthand()
            .map(|name| name == want)
            .unwrap_or(false);
        if matches_hash || matches_name {
            let object = reference.peel(git2::ObjectType::Commit)?;
            return Ok((object, Some(reference)));
        }
    }
    // fall back to treating `want` directly as a revspec (commit hash)
    let object = repo.revparse_single(want)?;
    Ok((object, None))
}
