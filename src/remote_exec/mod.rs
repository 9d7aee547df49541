//! Replays a stage's decorated instructions against a connected guest
//! client (C4).

mod client;
mod replay;
mod ssh;

pub use client::{compose_run_command, GuestClient, RemoteExecResult};
pub use replay::{replay_stage, ResourceResolver, StageArtifacts};
pub use ssh::SshGuestClient;
