//! Error taxonomy for the compute lease system
//!
//! Status-code mapping on the client side: 404 means no matching agents,
//! 503/429 mean "no capacity right now" and are surfaced as `Ok(None)` from
//! the assignment call rather than as an error. Everything else carries
//! enough context (cluster, requirements, target address) for an operator
//! to diagnose without reproducing.

use thiserror::Error;

use muster_proto::{ProtocolError, TransportError};

use crate::types::{ClusterId, ConnectionMode, Requirements};

/// Errors raised by the lease broker client and connection establisher
#[derive(Error, Debug)]
pub enum ComputeClientError {
    /// No agents matched the requirements (HTTP 404)
    #[error("No compute agents found (cluster: {cluster:?}, requirements: {requirements:?})")]
    NoAgentsFound {
        /// Cluster the request targeted, if any
        cluster: Option<ClusterId>,
        /// Requirements that could not be satisfied
        requirements: Requirements,
    },

    /// Broker rejected or failed the request (401/403/500 and other non-2xx)
    #[error("Compute broker returned status {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body, retained for diagnosis
        body: String,
    },

    /// Socket-level connection failure
    #[error("{mode} connection to {addr} failed: {source}")]
    Connect {
        /// Connection mode being attempted
        mode: ConnectionMode,
        /// Target address
        addr: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Tunnel negotiation rejected or timed out
    #[error("Tunnel handshake with relay {relay} for target {target} failed: {reason}")]
    TunnelHandshake {
        /// Relay endpoint the handshake ran against
        relay: String,
        /// Target the relay was asked to forward to
        target: String,
        /// Rejection message or timeout description
        reason: String,
    },

    /// Relay retry budget exhausted
    #[error("Timed out connecting to relay {host}:{port} after {attempts} attempts")]
    RelayTimeout {
        /// Relay host
        host: String,
        /// Relay port
        port: u16,
        /// Number of attempts made
        attempts: u32,
        /// Last socket error observed, if the final attempt did not time out
        #[source]
        source: Option<std::io::Error>,
    },

    /// Assignment response could not be interpreted
    #[error("Invalid assignment response: {0}")]
    InvalidResponse(String),

    /// HTTP transport failure
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Protocol error on the compute socket
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport construction or I/O failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the agent-side task executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Transport silent past the no-data threshold; reported distinctly from
    /// a caller-issued cancellation
    #[error("terminated: no data received for {idle_secs} seconds")]
    IdleTimeout {
        /// Observed idle time in seconds
        idle_secs: u64,
    },

    /// Execution cancelled by the caller
    #[error("Execution cancelled")]
    Cancelled,

    /// Transport construction or I/O failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload execution failed
    #[error("Payload execution failed: {0}")]
    Payload(#[source] anyhow::Error),

    /// I/O error (sandbox creation, cleanup)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_timeout_message() {
        let err = ExecutorError::IdleTimeout { idle_secs: 30 };
        assert_eq!(err.to_string(), "terminated: no data received for 30 seconds");
    }

    #[test]
    fn test_relay_timeout_names_target() {
        let err = ComputeClientError::RelayTimeout {
            host: "relay.example".to_string(),
            port: 9000,
            attempts: 3,
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("relay.example:9000"));
        assert!(msg.contains("3 attempts"));
    }
}
