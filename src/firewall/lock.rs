//! Cross-process mutual exclusion on the host's packet-filter tables (spec
//! §4.8, §9 Design Notes: "a file lock tied to the inode ... is required").
//! `iptables` is a single process-wide resource; every table-modifying
//! method in [`FirewallController`](super::FirewallController) acquires this
//! lock before touching the tables.

use std::{path::PathBuf, time::Duration};

use fs2::FileExt;
use stacked_errors::{Error, Result, StackableErr};
use tokio::time::sleep;

/// An acquired advisory lock on [`IptablesLock::path`]. Released on drop
/// (spec §5: "the lock is released on all exit paths").
pub struct IptablesLockGuard {
    file: std::fs::File,
}

impl Drop for IptablesLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "failed to release iptables lock, the OS will reclaim it on process exit");
        }
    }
}

/// Names the lock file and the timeout used to acquire it (spec §6 env vars
/// `FIREBUILD_IPT_FLOCK_FILE` / `FIREBUILD_IPT_FLOCK_ACQUIRE_TIMEOUT`).
#[derive(Debug, Clone)]
pub struct IptablesLock {
    pub path: PathBuf,
    pub acquire_timeout: Duration,
}

impl IptablesLock {
    pub fn new(path: impl Into<PathBuf>, acquire_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            acquire_timeout,
        }
    }

    /// Blocks (via backoff polling, since the underlying lock is
    /// synchronous) until the lock is acquired or `acquire_timeout` elapses.
    /// Distinguishes a timeout via [`Error::timeout`] (spec §7 Firewall:
    /// "lock acquire timeout -> retryable at caller's discretion").
    pub async fn acquire(&self) -> Result<IptablesLockGuard> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .stack_err_with(|| format!("IptablesLock::acquire -> opening {:?}", self.path))?;

        let mut waited = Duration::ZERO;
        let mut interval = Duration::from_millis(5);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(IptablesLockGuard { file }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if waited >= self.acquire_timeout {
                        return Err(Error::timeout()).stack_err_with(|| {
                            format!(
                                "IptablesLock::acquire -> timed out after {:?} on {:?}",
                                self.acquire_timeout, self.path
                            )
                        });
                    }
                    sleep(interval).await;
                    waited += interval;
                    interval = (interval * 2).min(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(e)
                        .stack_err_with(|| format!("IptablesLock::acquire -> locking {:?}", self.path))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iptables.lock");
        let lock = IptablesLock::new(&path, Duration::from_millis(50));
        let _guard = lock.acquire().await.unwrap();

        let other = IptablesLock::new(&path, Duration::from_millis(50));
        let err = other.acquire().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn lock_is_reacquirable_after_guard_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iptables.lock");
        let lock = IptablesLock::new(&path, Duration::from_millis(200));
        {
            let _guard = lock.acquire().await.unwrap();
        }
        assert!(lock.acquire().await.is_ok());
    }
}
