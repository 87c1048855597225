//! muster-agent: Compute agent daemon for Muster
//!
//! The agent accepts inbound connections from lease initiators, correlates
//! each connection with its dispatched lease by the 64-byte nonce it
//! presents, and executes the leased payload in a sandbox supervised by an
//! inactivity watchdog.

pub mod executor;
pub mod listener;
pub mod registry;

pub use executor::{ComputeTask, PayloadExecutor, TaskExecutor};
pub use listener::ComputeListener;
pub use registry::{PendingConnection, PendingConnectionRegistry};
