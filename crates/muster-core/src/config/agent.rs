//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use muster_proto::transport::DEFAULT_NO_DATA_TIMEOUT;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the compute agent daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker URL leases are dispatched from
    pub server_url: String,

    /// Bearer token attached to broker calls (opaque to the agent)
    pub token: Option<String>,

    /// Address the compute listener binds to
    pub listen_addr: String,

    /// Working directory; sandboxes are created under `<working_dir>/sandbox`
    pub working_dir: PathBuf,

    /// Pool this agent advertises itself in
    pub pool: Option<String>,

    /// Default no-data timeout applied when a task requests a shorter one
    #[serde(with = "duration_secs")]
    pub inactivity_timeout: Duration,

    /// How often the watchdog polls the idle clock
    #[serde(with = "duration_millis")]
    pub watchdog_interval: Duration,

    /// How long an accepted connection has to present its nonce
    #[serde(with = "duration_secs")]
    pub nonce_read_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".to_string(),
            token: None,
            listen_addr: "0.0.0.0:7000".to_string(),
            working_dir: std::env::temp_dir().join("muster-agent"),
            pool: None,
            inactivity_timeout: DEFAULT_NO_DATA_TIMEOUT,
            watchdog_interval: Duration::from_millis(2000),
            nonce_read_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Directory sandboxes are created under
    pub fn sandbox_root(&self) -> PathBuf {
        self.working_dir.join("sandbox")
    }
}
