//! muster-client: Lease broker client and connection establishment
//!
//! The client side of a compute lease: ask the broker for a cluster and an
//! agent assignment over HTTP, reach the agent over the assigned connection
//! mode (direct, tunnel or relayed), present the nonce, wrap the socket in
//! the assigned transport, and hand back a [`ComputeLease`] that owns the
//! socket and its keepalive task.

pub mod broker;
pub mod establish;
pub mod lease;

pub use broker::ServerComputeClient;
pub use establish::ConnectionEstablisher;
pub use lease::{ComputeLease, LeaseState};
