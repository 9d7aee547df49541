use std::sync::atomic::{AtomicBool, Ordering};

use stacked_errors::{Result, StackableErr};
use tokio::{fs::File, io::AsyncWriteExt};

use crate::Command;

/// Set by the `ctrlc` handler installed in [`std_init`]; consulted by long
/// running loops (the `purge`/`kill` polling loop, `auto_exec`-style
/// foreground commands) that want to cooperatively stop on Ctrl-C instead of
/// being hard-killed mid cleanup.
pub static CTRLC_ISSUED: AtomicBool = AtomicBool::new(false);

/// Installs `tracing-subscriber` with an `EnvFilter` (defaulting to `info`)
/// and a `ctrlc` handler that flips [`CTRLC_ISSUED`].
pub fn std_init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    ctrlc::set_handler(move || {
        CTRLC_ISSUED.store(true, Ordering::SeqCst);
    })
    .stack_err("std_init -> failed to install ctrlc handler")?;
    Ok(())
}

/// Returns if [`CTRLC_ISSUED`] has been set, and resets it to `false`.
pub fn ctrlc_issued_reset() -> bool {
    CTRLC_ISSUED.swap(false, Ordering::SeqCst)
}

/// Runs `cmd_with_args` to completion and asserts success. Equivalent to
/// `Command::new(cmd_with_args).run_to_completion().await?.assert_success()?`.
pub async fn sh(cmd_with_args: impl AsRef<str>) -> Result<()> {
    Command::new(cmd_with_args)
        .run_to_completion()
        .await
        .stack_err("sh")?
        .assert_success()
        .stack_err("sh")
}

/// First, this splits by `separate`, trims outer whitespace, sees if `key` is
/// prefixed, if so it also strips `inter_key_val` and returns the stripped and
/// trimmed value.
///
/// ```
/// use firebuild::get_separated_val;
///
/// let s = "\
///     address:    0x2b4e4d79e3e9dBBB170CCD78419520d1DCBb4B3f\npublic  : 0x04b141241511b1\n  \
///          private  :=\"hello world\" \n";
/// assert_eq!(
///     &get_separated_val(s, "\n", "address", ":").unwrap(),
///     "0x2b4e4d79e3e9dBBB170CCD78419520d1DCBb4B3f"
/// );
/// assert_eq!(
///     &get_separated_val(s, "\n", "public", ":").unwrap(),
///     "0x04b141241511b1"
/// );
/// assert_eq!(
///     &get_separated_val(s, "\n", "private", ":=").unwrap(),
///     "\"hello world\""
/// );
/// ```
pub fn get_separated_val(
    input: &str,
    separate: &str,
    key: &str,
    inter_key_val: &str,
) -> Result<String> {
    let mut value = None;
    for line in input.split(separate) {
        if let Some(x) = line.trim().strip_prefix(key) {
            if let Some(y) = x.trim().strip_prefix(inter_key_val) {
                value = Some(y.trim().to_owned());
                break;
            }
        }
    }
    value.stack_err_with(|| format!("get_separated_val() -> key \"{key}\" not found"))
}

/// Flushes and `sync_all`s a file so that changes are actually durable on
/// disk before a dependent process (the jailer, the hypervisor) reads it.
pub async fn close_file(mut file: File) -> Result<()> {
    file.flush().await.stack_err("close_file")?;
    file.sync_all().await.stack_err("close_file")?;
    Ok(())
}

/// Runs a closure when dropped, in LIFO order relative to other guards
/// created later in the same scope (spec §5: "Defers run LIFO and are
/// registered for every acquired resource"). Generalizes the `forget_on_drop`
/// guard [`crate::CommandRunner`] already carries, for resources that have
/// no natural `CommandRunner` of their own (mounts, writable-mode chmods,
/// jail/cache directories).
pub struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Defer<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }

    /// Cancels the deferred action; used when an explicit, fallible cleanup
    /// call already ran and the `Drop` fallback would be redundant.
    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

pub(crate) use color_cycle::next_terminal_color;

mod color_cycle {
    use std::sync::atomic::AtomicUsize;

    use owo_colors::{AnsiColors, AnsiColors::*};

    const COLOR_CYCLE: [AnsiColors; 8] = [
        White,
        Yellow,
        Green,
        Cyan,
        BrightBlack,
        Blue,
        BrightCyan,
        BrightGreen,
    ];

    static COLOR_NUM: AtomicUsize = AtomicUsize::new(0);

    /// Cycles through a fixed palette so that concurrently running commands
    /// (dependency-stage builds, CNI setup/teardown, the per-VM watcher) each
    /// get a distinct debug-forwarding line color.
    pub(crate) fn next_terminal_color() -> AnsiColors {
        let inx = COLOR_NUM.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        COLOR_CYCLE[inx % COLOR_CYCLE.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_runs_on_drop() {
        let ran = std::sync::Arc::new(AtomicBool::new(false));
        {
            let flag = ran.clone();
            let _guard = Defer::new(move || flag.store(true, Ordering::SeqCst));
            assert!(!ran.load(Ordering::SeqCst));
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn defer_disarm_skips_action() {
        let ran = std::sync::Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let guard = Defer::new(move || flag.store(true, Ordering::SeqCst));
        guard.disarm();
        assert!(!ran.load(Ordering::SeqCst));
    }
}
