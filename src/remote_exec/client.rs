//! The guest client seam: "SSH/SFTP to a connected guest" is an external
//! collaborator per spec §1, so remote execution is expressed against a
//! trait rather than a concrete SSH implementation.

use async_trait::async_trait;
use stacked_errors::Result;

/// What C4 needs from a connection to a running guest. A concrete
/// implementation wraps an authenticated SSH/SFTP session; tests use an
/// in-memory fake.
#[async_trait]
pub trait GuestClient: Send + Sync {
    /// Runs `command` under the given shell, returning combined exit status
    /// and output. `env` is exported before the command; `cd <workdir> &&`
    /// is prefixed; `sudo -u <user>` wraps non-root users (spec §4.4).
    async fn run_shell(
        &self,
        shell: &[String],
        user: &str,
        workdir: &str,
        env: &std::collections::BTreeMap<String, String>,
        command: &str,
    ) -> Result<RemoteExecResult>;

    /// Uploads `bytes` to `dst` on the guest, creating parent directories,
    /// applying `mode` and `chown` when present.
    async fn upload(
        &self,
        dst: &str,
        bytes: &[u8],
        mode: Option<u32>,
        chown: Option<&str>,
    ) -> Result<()>;

    /// `mkdir -p <path>` under the given user/workdir (spec §4.4 `VOLUME`).
    async fn mkdir_p(&self, path: &str, user: &str, workdir: &str) -> Result<()>;

    /// Reads a single file back from the guest. Used to scavenge a
    /// dependency stage's build output for `COPY --from` (spec §4.4: "the
    /// resulting artifacts are carried as `ResolvedResource` values").
    async fn download(&self, path: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct RemoteExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RemoteExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builds the single shell invocation spec §4.4 describes for `RUN`:
/// `cd <workdir> && export K=V ... && <command>`, wrapped in `sudo -u <user>`
/// for non-root users.
pub fn compose_run_command(
    shell: &[String],
    user: &str,
    workdir: &str,
    env: &std::collections::BTreeMap<String, String>,
    command: &str,
) -> Vec<String> {
    let mut preamble = format!("cd {workdir}");
    for (k, v) in env {
        preamble.push_str(&format!(" && export {k}={}", shell_quote(v)));
    }
    let full = format!("{preamble} && {command}");
    let is_root = user == "0" || user == "0:0" || user == "root";
    let body = if is_root {
        full
    } else {
        let user_name = user.split(':').next().unwrap_or(user);
        format!("sudo -u {user_name} sh -c {}", shell_quote(&full))
    };
    let mut argv = shell.to_vec();
    argv.push(body);
    argv
}

pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
