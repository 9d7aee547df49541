//! Per-VM run metadata persistence, listing, inspection, kill, and purge
//! (C9).

mod liveness;
mod metadata;
mod reclaim;

pub use liveness::{is_pid_alive, wait_for_exit};
pub use metadata::{
    CniSection, DriveInfo, EntrypointInfo, JailInfo, MachineInfo, NetworkInterfaceInfo, VMMetadata,
};
pub use reclaim::{inspect, kill, ls, purge, KillOutcome, ListEntry, KILL_WAIT_BUDGET};
