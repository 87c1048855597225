//! Compute client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the lease broker client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker base URL
    pub server_url: String,

    /// Bearer token attached to broker calls (opaque to the client)
    pub token: Option<String>,

    /// Timeout for direct and tunnel TCP connects
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Timeout for the tunnel line handshake
    #[serde(with = "duration_secs")]
    pub tunnel_handshake_timeout: Duration,

    /// Maximum relay connection attempts
    pub relay_attempts: u32,

    /// Per-attempt timeout for relay connects
    #[serde(with = "duration_secs")]
    pub relay_attempt_timeout: Duration,

    /// Linear delay between relay attempts
    #[serde(with = "duration_millis")]
    pub relay_retry_delay: Duration,

    /// Interval between keepalive pings on an active lease
    #[serde(with = "duration_millis")]
    pub keepalive_interval: Duration,

    /// URL returning the caller's public IP as plain text, used when a
    /// relayed connection is requested without an explicit public IP
    pub public_ip_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            tunnel_handshake_timeout: Duration::from_secs(15),
            relay_attempts: 3,
            relay_attempt_timeout: Duration::from_secs(5),
            relay_retry_delay: Duration::from_millis(1000),
            keepalive_interval: Duration::from_millis(5000),
            public_ip_url: None,
        }
    }
}
