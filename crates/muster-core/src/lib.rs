//! muster-core: Core domain types and configuration for Muster
//!
//! This crate provides the shared vocabulary of the compute lease system:
//! identifiers, agent requirements, broker request/response bodies, the
//! error taxonomy, and TOML configuration for the client and agent.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use error::{ComputeClientError, ExecutorError};
pub use types::{
    AgentId, AssignComputeRequest, AssignComputeResponse, ClusterId, ConnectionMode,
    ConnectionPreferences, DeclareResourceNeedsRequest, GetClusterResponse, LeaseId, RequestId,
    Requirements,
};
