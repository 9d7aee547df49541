//! Sudoed loop-mount of the jailed rootfs file (spec §4.6 step 2, §9 Design
//! Notes: "keep the sudo-escalation boundary crisp: one helper; input
//! sanitised; exit code mapped to an error").

use std::path::{Path, PathBuf};

use stacked_errors::{Result, StackableErr};

use crate::Command;

/// A scratch directory with the rootfs file loop-mounted at it. Unmounting
/// and removing the directory is the caller's responsibility via
/// [`MountedRootfs::unmount`] -- modelled as an explicit call rather than
/// `Drop` because unmounting is fallible and async.
pub struct MountedRootfs {
    mount_point: PathBuf,
}

impl MountedRootfs {
    pub fn path(&self) -> &Path {
        &self.mount_point
    }

    /// Unmounts and removes the scratch directory. Idempotent: called even
    /// on the error path by [`super::run`].
    #[tracing::instrument(skip(self))]
    pub async fn unmount(self) -> Result<()> {
        Command::new("sudo")
            .args(["umount", &self.mount_point.to_string_lossy()])
            .run_to_completion()
            .await
            .stack_err_with(|| format!("MountedRootfs::unmount -> umount {:?}", self.mount_point))?
            .assert_success()
            .stack_err_with(|| format!("MountedRootfs::unmount -> umount {:?}", self.mount_point))?;
        tokio::fs::remove_dir(&self.mount_point)
            .await
            .stack_err_with(|| format!("MountedRootfs::unmount -> removing {:?}", self.mount_point))
    }
}

/// Creates a scratch directory and loop-mounts `rootfs_file` at it via
/// `sudo mount -o loop`.
#[tracing::instrument]
pub async fn mount_loop(rootfs_file: &Path) -> Result<MountedRootfs> {
    let mount_point =
        std::env::temp_dir().join(format!("firebuild-cloudinit-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&mount_point)
        .await
        .stack_err_with(|| format!("mount_loop -> creating {mount_point:?}"))?;

    let result = Command::new("sudo")
        .args([
            "mount",
            "-o",
            "loop",
            &rootfs_file.to_string_lossy(),
            &mount_point.to_string_lossy(),
        ])
        .run_to_completion()
        .await;

    match result {
        Ok(command_result) if command_result.successful() => Ok(MountedRootfs { mount_point }),
        Ok(command_result) => {
            let _ = tokio::fs::remove_dir(&mount_point).await;
            command_result
                .assert_success()
                .stack_err("mount_loop -> mount command failed")
        }
        Err(e) => {
            let _ = tokio::fs::remove_dir(&mount_point).await;
            Err(e).stack_err("mount_loop -> running mount")
        }
    }
}
