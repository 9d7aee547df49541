//! The `(chroot_base, hypervisor_binary_basename, vm_id)` triple spec §3
//! factors a jail directory into. [`lifecycle::start`](super::lifecycle::start)
//! joins it to find where the jailer places guest state; the run registry's
//! `kill` step 1 confirmation and `purge`'s scan recover the triple from a
//! path already on disk.

use std::path::{Path, PathBuf};

/// Joins to `<chroot_base>/<hypervisor_basename>/<vm_id>`, matching the
/// jailer's own `--chroot-base-dir`/`--exec-file`/`--id` placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailLocation {
    pub chroot_base: PathBuf,
    pub hypervisor_basename: String,
    pub vm_id: String,
}

impl JailLocation {
    pub fn new(
        chroot_base: impl Into<PathBuf>,
        hypervisor_basename: impl Into<String>,
        vm_id: impl Into<String>,
    ) -> Self {
        Self {
            chroot_base: chroot_base.into(),
            hypervisor_basename: hypervisor_basename.into(),
            vm_id: vm_id.into(),
        }
    }

    /// The `<chroot_base>/<hypervisor_basename>/<vm_id>` jail directory.
    pub fn path(&self) -> PathBuf {
        self.chroot_base.join(&self.hypervisor_basename).join(&self.vm_id)
    }

    /// The `root/` directory the jailer mounts guest state under.
    pub fn root_dir(&self) -> PathBuf {
        self.path().join("root")
    }

    /// Recovers the triple from a previously-joined path, the inverse of
    /// [`Self::path`].
    pub fn from_path(path: &Path) -> Option<Self> {
        let vm_id = path.file_name()?.to_str()?.to_owned();
        let basename_dir = path.parent()?;
        let hypervisor_basename = basename_dir.file_name()?.to_str()?.to_owned();
        let chroot_base = basename_dir.parent()?.to_owned();
        Some(Self {
            chroot_base,
            hypervisor_basename,
            vm_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_from_path_round_trip() {
        let loc = JailLocation::new("/srv/jail", "firecracker", "vm-abc123");
        let path = loc.path();
        assert_eq!(path, PathBuf::from("/srv/jail/firecracker/vm-abc123"));
        assert_eq!(JailLocation::from_path(&path), Some(loc));
    }
}
