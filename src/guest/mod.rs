//! Jailed microVM lifecycle: start, wait-for-ready, stop (C5).

mod handlers;
mod jail;
mod lifecycle;

pub use handlers::{Handler, HandlerChain, Phase};
pub use jail::JailLocation;
pub use lifecycle::{
    start, EgressCheck, GuestClientFactory, GuestHandle, StartRequest, StopOutcome, ROOTFS_NAME,
};
