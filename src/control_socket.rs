//! The hypervisor's local HTTP control socket (spec §1: "a local HTTP
//! control socket" is an external collaborator). Shared by the guest
//! lifecycle orchestrator (graceful shutdown) and the run registry (`kill`'s
//! send-ctrl-alt-del action), so it lives outside both to avoid a module
//! cycle.

use std::path::Path;

use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use stacked_errors::{Result, StackableErr};

/// PUTs `body` to `path` on the unix-socket HTTP server at `socket_path`.
/// Returns `Ok(false)` (rather than an error) when the connection is
/// refused, which callers treat as "already stopped" (spec §4.9 step 2).
pub async fn put(socket_path: &Path, path: &str, body: serde_json::Value) -> Result<bool> {
    let client: hyper_util::client::legacy::Client<UnixConnector, Full<Bytes>> =
        hyper_util::client::legacy::Client::unix();
    let uri: hyper::Uri = Uri::new(socket_path, path).into();
    let req = Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .stack_err("control_socket::put -> building request")?;

    match client.request(req).await {
        Ok(resp) => {
            let status = resp.status();
            let _ = resp.into_body().collect().await;
            if status.is_success() {
                Ok(true)
            } else {
                stacked_errors::bail_locationless!("control socket PUT {path} returned {status}")
            }
        }
        Err(e) if e.is_connect() => {
            tracing::debug!(?socket_path, "control socket connection refused, treating as stopped");
            Ok(false)
        }
        Err(e) => Err(e).stack_err_with(|| format!("control_socket::put -> {path}")),
    }
}

/// Sends the `SendCtrlAltDel` action, the hypervisor SDK's graceful-shutdown
/// request (spec §4.5/§4.9).
pub async fn send_ctrl_alt_del(socket_path: &Path) -> Result<bool> {
    put(
        socket_path,
        "/actions",
        serde_json::json!({"action_type": "SendCtrlAltDel"}),
    )
    .await
}
