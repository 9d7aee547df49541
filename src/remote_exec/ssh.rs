//! A concrete [`GuestClient`] backed by `ssh2`/`libssh2`. The spec treats
//! "the SSH transport" as an external collaborator this crate only assumes
//! is present; this module is that assumption made concrete, wired in as
//! the [`crate::guest::GuestClientFactory`] the build commands hand to
//! [`crate::guest::start`].
//!
//! `libssh2` is synchronous, so every operation runs inside
//! `spawn_blocking`; the session itself is guarded by a `std::sync::Mutex`
//! rather than `tokio::sync::Mutex` since it is only ever touched from
//! blocking threads.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use stacked_errors::{bail_locationless, Result, StackableErr};

use super::client::{GuestClient, RemoteExecResult};
use crate::identity::SshKeypair;

pub struct SshGuestClient {
    session: Arc<Mutex<ssh2::Session>>,
}

impl SshGuestClient {
    /// Connects, handshakes, and authenticates as `user` with the in-memory
    /// keypair this build generated (spec §4.11: private key "never
    /// persisted"). Matches [`crate::guest::GuestClientFactory`]'s shape.
    #[tracing::instrument(skip(keypair))]
    pub async fn connect(addr: SocketAddr, keypair: Arc<SshKeypair>, user: String) -> Result<Arc<dyn GuestClient>> {
        let session = tokio::task::spawn_blocking(move || -> Result<ssh2::Session> {
            let tcp = TcpStream::connect(addr)
                .stack_err_with(|| format!("SshGuestClient::connect -> TCP connect to {addr}"))?;
            let mut session = ssh2::Session::new().stack_err("SshGuestClient::connect -> ssh2::Session::new")?;
            session.set_tcp_stream(tcp);
            session.handshake().stack_err("SshGuestClient::connect -> SSH handshake")?;

            let private_pem = keypair.private_key_pem()?;
            let public_line = keypair.public_authorized_keys_line(&user)?;
            let public_line = public_line.trim_end();
            session
                .userauth_pubkey_memory(&user, Some(public_line), &private_pem, None)
                .stack_err("SshGuestClient::connect -> pubkey auth")?;
            if !session.authenticated() {
                bail_locationless!("SshGuestClient::connect -> authentication as {user:?} was not accepted");
            }
            Ok(session)
        })
        .await
        .stack_err("SshGuestClient::connect -> join blocking handshake task")??;

        Ok(Arc::new(Self {
            session: Arc::new(Mutex::new(session)),
        }))
    }
}

/// `channel.exec` hands its argument to the guest's login shell as a single
/// command line, so the composed argv (`["/bin/sh", "-c", body]`) has to be
/// re-quoted into one line rather than space-joined raw — otherwise the
/// login shell re-splits `body` on its own `&&`/spaces and the
/// `cd`/`export`/`sudo -u` preamble never reaches `/bin/sh -c` as a single
/// argument.
fn render_exec_line(argv: &[String]) -> Option<String> {
    let (program, rest) = argv.split_first()?;
    Some(
        std::iter::once(program.clone())
            .chain(rest.iter().map(|a| super::client::shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

#[async_trait]
impl GuestClient for SshGuestClient {
    async fn run_shell(
        &self,
        shell: &[String],
        user: &str,
        workdir: &str,
        env: &BTreeMap<String, String>,
        command: &str,
    ) -> Result<RemoteExecResult> {
        let argv = super::client::compose_run_command(shell, user, workdir, env, command);
        let full = render_exec_line(&argv)
            .stack_err_locationless("SshGuestClient::run_shell -> empty composed command")?;
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || -> Result<RemoteExecResult> {
            let session = session.lock().unwrap();
            let mut channel = session.channel_session().stack_err("run_shell -> channel_session")?;
            channel.exec(&full).stack_err_with(|| format!("run_shell -> exec {full:?}"))?;
            let mut stdout = vec![];
            channel.read_to_end(&mut stdout).stack_err("run_shell -> reading stdout")?;
            let mut stderr = vec![];
            channel
                .stderr()
                .read_to_end(&mut stderr)
                .stack_err("run_shell -> reading stderr")?;
            channel.wait_close().stack_err("run_shell -> wait_close")?;
            let exit_code = channel.exit_status().stack_err("run_shell -> exit_status")?;
            Ok(RemoteExecResult {
                exit_code,
                stdout,
                stderr,
            })
        })
        .await
        .stack_err("run_shell -> join blocking task")?
    }

    async fn upload(&self, dst: &str, bytes: &[u8], mode: Option<u32>, chown: Option<&str>) -> Result<()> {
        let parent = std::path::Path::new(dst)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_string_lossy().into_owned());
        if let Some(parent) = parent {
            self.run_shell(
                &["/bin/sh".to_owned(), "-c".to_owned()],
                "0:0",
                "/",
                &BTreeMap::new(),
                &format!("mkdir -p {parent}"),
            )
            .await
            .stack_err_with(|| format!("upload -> creating parent directory {parent:?}"))?;
        }

        let session = self.session.clone();
        let dst_owned = dst.to_owned();
        let bytes_owned = bytes.to_vec();
        let mode = mode.unwrap_or(0o644);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let session = session.lock().unwrap();
            let mut channel = session
                .scp_send(std::path::Path::new(&dst_owned), mode as i32, bytes_owned.len() as u64, None)
                .stack_err_with(|| format!("upload -> scp_send {dst_owned:?}"))?;
            channel
                .write_all(&bytes_owned)
                .stack_err_with(|| format!("upload -> writing {dst_owned:?}"))?;
            channel.send_eof().stack_err("upload -> send_eof")?;
            channel.wait_eof().stack_err("upload -> wait_eof")?;
            channel.close().stack_err("upload -> close")?;
            channel.wait_close().stack_err("upload -> wait_close")?;
            Ok(())
        })
        .await
        .stack_err("upload -> join blocking task")??;

        if let Some(chown) = chown {
            self.run_shell(
                &["/bin/sh".to_owned(), "-c".to_owned()],
                "0:0",
                "/",
                &BTreeMap::new(),
                &format!("chown {chown} {dst}"),
            )
            .await
            .stack_err_with(|| format!("upload -> chown {dst:?} to {chown}"))?;
        }
        Ok(())
    }

    async fn mkdir_p(&self, path: &str, user: &str, workdir: &str) -> Result<()> {
        let result = self
            .run_shell(
                &["/bin/sh".to_owned(), "-c".to_owned()],
                user,
                workdir,
                &BTreeMap::new(),
                &format!("mkdir -p {path}"),
            )
            .await
            .stack_err_with(|| format!("mkdir_p -> {path:?}"))?;
        if !result.success() {
            bail_locationless!(
                "mkdir_p -> {path:?} exited {}: {}",
                result.exit_code,
                String::from_utf8_lossy(&result.stderr)
            );
        }
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let session = self.session.clone();
        let path_owned = path.to_owned();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let session = session.lock().unwrap();
            let (mut channel, _stat) = session
                .scp_recv(std::path::Path::new(&path_owned))
                .stack_err_with(|| format!("download -> scp_recv {path_owned:?}"))?;
            let mut out = vec![];
            channel
                .read_to_end(&mut out)
                .stack_err_with(|| format!("download -> reading {path_owned:?}"))?;
            channel.send_eof().stack_err("download -> send_eof")?;
            channel.wait_eof().stack_err("download -> wait_eof")?;
            channel.close().stack_err("download -> close")?;
            channel.wait_close().stack_err("download -> wait_close")?;
            Ok(out)
        })
        .await
        .stack_err("download -> join blocking task")?
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::remote_exec::client::compose_run_command;

    /// The composed `-c` body must survive as one argument to the remote
    /// login shell — not get re-split on its own `&&`/spaces, which would
    /// silently drop the `cd`/`export`/`sudo -u` preamble.
    #[test]
    fn exec_line_keeps_composed_body_as_one_argument() {
        let shell = vec!["/bin/sh".to_owned(), "-c".to_owned()];
        let mut env = BTreeMap::new();
        env.insert("FOO".to_owned(), "bar baz".to_owned());
        let argv = compose_run_command(&shell, "0:0", "/app", &env, "echo hi && echo bye");
        let line = render_exec_line(&argv).unwrap();

        // exactly three space-separated top-level tokens: the program, "-c",
        // and one single-quoted body.
        assert_eq!(line.chars().filter(|&c| c == '\'').count() % 2, 0);
        assert!(line.starts_with("/bin/sh -c '"));
        assert!(line.ends_with('\''));
        // the body itself, unquoted, still contains the whole preamble plus
        // command, proving nothing was flattened/dropped.
        let body = &line["/bin/sh -c '".len()..line.len() - 1];
        assert!(body.contains("cd /app"));
        assert!(body.contains("export FOO='bar baz'"));
        assert!(body.contains("echo hi && echo bye"));
    }

    #[test]
    fn exec_line_quotes_sudo_wrapped_body_for_non_root() {
        let shell = vec!["/bin/sh".to_owned(), "-c".to_owned()];
        let argv = compose_run_command(&shell, "1000:1000", "/", &BTreeMap::new(), "whoami");
        let line = render_exec_line(&argv).unwrap();
        // the whole `sudo -u 1000 sh -c '...'` body is itself single-quoted
        // as the outer `-c` argument, so the nested quotes must be escaped.
        assert!(line.contains("sudo -u 1000 sh -c"));
        assert!(line.starts_with("/bin/sh -c '"));
    }

    #[test]
    fn exec_line_empty_argv_is_none() {
        assert!(render_exec_line(&[]).is_none());
    }
}
