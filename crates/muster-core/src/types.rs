//! Core domain types
//!
//! JSON bodies exchanged with the broker use PascalCase field names; binary
//! material (certificates, keys) travels base64-encoded and nonces travel as
//! hex strings.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use muster_proto::transport::EncryptionSetup;
use muster_proto::{EncryptionKind, Nonce};

use crate::error::ComputeClientError;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new id
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the raw id string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_type! {
    /// Unique identifier for a compute agent
    AgentId
}

id_type! {
    /// Unique identifier for a lease of one agent to one caller
    LeaseId
}

id_type! {
    /// Opaque cluster identifier returned by the cluster resolver
    ClusterId
}

id_type! {
    /// Caller-supplied correlation id for assignment requests
    RequestId
}

/// Constraint set used to pick an agent; immutable value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Requirements {
    /// Pool the agent must belong to
    pub pool: Option<String>,
    /// Minimum resource amounts, keyed by resource name
    pub resources: BTreeMap<String, i32>,
    /// Whether the agent must be leased exclusively
    pub exclusive: bool,
}

impl Requirements {
    /// Requirements targeting a named pool
    pub fn pool(pool: impl Into<String>) -> Self {
        Self {
            pool: Some(pool.into()),
            ..Default::default()
        }
    }
}

/// How the initiator physically reaches the assigned agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// Connect straight to the agent
    #[default]
    Direct,
    /// Connect via a relay that forwards after a line handshake
    Tunnel,
    /// Connect to a relay endpoint with bounded retry
    Relay,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Direct => write!(f, "direct"),
            ConnectionMode::Tunnel => write!(f, "tunnel"),
            ConnectionMode::Relay => write!(f, "relay"),
        }
    }
}

/// Caller preferences for how the connection should be made
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectionPreferences {
    /// Preferred connection mode, if any
    pub mode: Option<ConnectionMode>,
    /// Candidate ports the caller can reach the agent on
    pub ports: Vec<u16>,
    /// Caller's public IP, required for relayed connections
    pub client_public_ip: Option<IpAddr>,
}

/// Body of `POST /api/v2/compute[/{clusterId}]` and
/// `POST /api/v2/compute/_cluster`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssignComputeRequest {
    /// Constraints used to pick an agent
    pub requirements: Requirements,
    /// Caller-supplied correlation id
    pub request_id: RequestId,
    /// Connection preferences
    pub connection: ConnectionPreferences,
    /// Compute protocol version the caller speaks
    pub protocol: u32,
}

/// Successful assignment returned by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssignComputeResponse {
    /// Agent granted by this lease
    pub agent_id: AgentId,
    /// Canonical agent IP
    pub ip: String,
    /// Canonical agent port
    pub port: u16,
    /// Single-use correlation nonce (hex)
    pub nonce: Nonce,
    /// Transport encryption to apply
    pub encryption: EncryptionKind,
    /// PEM certificate, base64-encoded (TLS kinds)
    #[serde(default)]
    pub certificate: Option<String>,
    /// Key material, base64-encoded (AES key or TLS private key)
    #[serde(default)]
    pub key: Option<String>,
    /// How to reach the agent
    pub connection_mode: ConnectionMode,
    /// Relay or tunnel endpoint (`host:port`), when not direct
    #[serde(default)]
    pub connection_address: Option<String>,
    /// Additional relay ports, keyed by purpose
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    /// Lease granted for this assignment
    pub lease_id: LeaseId,
    /// Cluster the agent was picked from
    pub cluster_id: ClusterId,
    /// Protocol version the agent will speak
    pub protocol: u32,
    /// Agent software version, if reported
    #[serde(default)]
    pub agent_version: Option<String>,
    /// Properties granted with the lease
    #[serde(default)]
    pub properties: Vec<String>,
    /// Resources granted with the lease
    #[serde(default)]
    pub assigned_resources: BTreeMap<String, i32>,
}

impl AssignComputeResponse {
    /// Canonical agent address
    pub fn agent_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// De facto connection address: the relay/tunnel endpoint when present,
    /// otherwise the canonical agent address
    pub fn connection_address(&self) -> String {
        self.connection_address
            .clone()
            .unwrap_or_else(|| self.agent_address())
    }

    /// Decode the certificate and key material into an [`EncryptionSetup`]
    pub fn encryption_setup(&self) -> Result<EncryptionSetup, ComputeClientError> {
        let certificate = self
            .certificate
            .as_deref()
            .map(|c| BASE64_STANDARD.decode(c))
            .transpose()
            .map_err(|e| {
                ComputeClientError::InvalidResponse(format!("bad certificate encoding: {}", e))
            })?;
        let key = self
            .key
            .as_deref()
            .map(|k| BASE64_STANDARD.decode(k))
            .transpose()
            .map_err(|e| {
                ComputeClientError::InvalidResponse(format!("bad key encoding: {}", e))
            })?;

        Ok(EncryptionSetup {
            kind: self.encryption,
            certificate,
            key,
        })
    }
}

/// Body of `POST /api/v2/compute/_cluster` responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetClusterResponse {
    /// Cluster the requirements resolve to
    pub cluster_id: ClusterId,
}

/// Body of `POST /api/v2/compute/{clusterId}/resource-needs`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeclareResourceNeedsRequest {
    /// Session declaring the forecast
    pub session_id: String,
    /// Pool the needs apply to
    pub pool: String,
    /// Forecast resource amounts, keyed by resource name
    pub resource_needs: BTreeMap<String, i32>,
}
