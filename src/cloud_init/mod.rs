//! Pre-boot host-side injection of identity and network data into the
//! mounted guest rootfs (C6) -- "pseudo-cloud-init" (spec §4.6).

mod inject;
mod mount;

pub use inject::{CloudInitRequest, NetInfo};
pub use mount::{mount_loop, MountedRootfs};

use stacked_errors::{Result, StackableErr};

/// Runs the full spec §4.6 sequence: locate the jailed rootfs file, mount
/// it, perform the six concurrent injections (errors accumulated, partial
/// success tolerated), unmount.
#[tracing::instrument(skip(request))]
pub async fn run(jail_root: &std::path::Path, rootfs_name: &str, request: CloudInitRequest) -> Result<()> {
    let rootfs_file = jail_root.join("root").join(rootfs_name);
    if !rootfs_file.is_file() {
        stacked_errors::bail_locationless!(
            "cloud_init::run -> {rootfs_file:?} is not a regular file"
        );
    }

    let mounted = mount_loop(&rootfs_file)
        .await
        .stack_err("cloud_init::run -> mounting jailed rootfs")?;

    let result = inject::inject_all(mounted.path(), &request).await;

    // unmount always runs, even if injection failed (spec §4.6 step 4 is a
    // deferred cleanup; §5 "Defers run LIFO ... for every acquired resource")
    mounted.unmount().await.stack_err("cloud_init::run -> unmount")?;

    result
}
