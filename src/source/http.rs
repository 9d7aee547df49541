//! `http://`/`https://` Dockerfile loading (spec §4.2). A single GET,
//! buffered in full; no directory inputs are possible for this origin.

use stacked_errors::{Result, StackableErr};

use super::{LoadedDockerfile, SourceOrigin};

pub async fn load(url: &str) -> Result<LoadedDockerfile> {
    let resp = reqwest::get(url)
        .await
        .stack_err_with(|| format!("http::load -> GET {url}"))?;
    let resp = resp
        .error_for_status()
        .stack_err_with(|| format!("http::load -> non-success status from {url}"))?;
    let text = resp
        .text()
        .await
        .stack_err_with(|| format!("http::load -> reading body of {url}"))?;
    let base_url = url
        .rsplit_once('/')
        .map(|(base, _)| base.to_owned())
        .unwrap_or_else(|| url.to_owned());
    Ok(LoadedDockerfile {
        text,
        origin: SourceOrigin::Http { base_url },
    })
}

/// Fetches an `ADD`/`COPY` resource over HTTP. Directory sources are
/// impossible over this transport (spec §4.2); callers never invoke this for
/// anything but a single file.
pub async fn fetch_resource(url: &str) -> Result<Vec<u8>> {
    let resp = reqwest::get(url)
        .await
        .stack_err_with(|| format!("http::fetch_resource -> GET {url}"))?;
    let resp = resp
        .error_for_status()
        .stack_err_with(|| format!("http::fetch_resource -> non-success status from {url}"))?;
    let bytes = resp
        .bytes()
        .await
        .stack_err_with(|| format!("http::fetch_resource -> reading body of {url}"))?;
    Ok(bytes.to_vec())
}
