//! Host packet-filter chain management and the port-spec grammar (C8).

mod chain;
mod lock;
mod portspec;

pub use chain::FirewallController;
pub use lock::IptablesLock;
pub use portspec::PortSpec;
