//! Tunnel handshake line protocol
//!
//! When the connection mode is Tunnel, the initiator first connects to the
//! relay endpoint and negotiates forwarding with a single newline-terminated,
//! tab-separated exchange:
//!
//! ```text
//! HANDSHAKE-REQ\t<version>\t<target host>\t<target port>\n
//! HANDSHAKE-RES\t<version>\t<success>\t<message>\n
//! ```

use std::fmt;

use crate::error::ProtocolError;

/// Current tunnel handshake version
pub const TUNNEL_HANDSHAKE_VERSION: u32 = 1;

const REQUEST_PREFIX: &str = "HANDSHAKE-REQ";
const RESPONSE_PREFIX: &str = "HANDSHAKE-RES";

/// Request to forward a tunnel connection to a target host/port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Handshake protocol version
    pub version: u32,
    /// Target host the relay should forward to
    pub host: String,
    /// Target port the relay should forward to
    pub port: u16,
}

impl HandshakeRequest {
    /// Create a request at the current handshake version
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            version: TUNNEL_HANDSHAKE_VERSION,
            host: host.into(),
            port,
        }
    }

    /// Parse a request line (without trailing newline)
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = line.split('\t');

        let prefix = fields.next().unwrap_or_default();
        if prefix != REQUEST_PREFIX {
            return Err(ProtocolError::MalformedHandshake(format!(
                "expected {}, got '{}'",
                REQUEST_PREFIX, prefix
            )));
        }

        let version = parse_field(fields.next(), "version")?;
        let host = fields
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProtocolError::MalformedHandshake("missing host".to_string()))?
            .to_string();
        let port = parse_field(fields.next(), "port")?;

        Ok(Self {
            version,
            host,
            port,
        })
    }
}

impl fmt::Display for HandshakeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}\t{}\t{}\t{}",
            REQUEST_PREFIX, self.version, self.host, self.port
        )
    }
}

/// Relay's answer to a [`HandshakeRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Handshake protocol version
    pub version: u32,
    /// Whether the relay accepted the forward
    pub success: bool,
    /// Human-readable detail, useful on rejection
    pub message: String,
}

impl HandshakeResponse {
    /// Create a response at the current handshake version
    pub fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            version: TUNNEL_HANDSHAKE_VERSION,
            success,
            message: message.into(),
        }
    }

    /// Parse a response line (without trailing newline)
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = line.split('\t');

        let prefix = fields.next().unwrap_or_default();
        if prefix != RESPONSE_PREFIX {
            return Err(ProtocolError::MalformedHandshake(format!(
                "expected {}, got '{}'",
                RESPONSE_PREFIX, prefix
            )));
        }

        let version = parse_field(fields.next(), "version")?;
        let success = parse_field(fields.next(), "success")?;
        let message = fields.next().unwrap_or_default().to_string();

        Ok(Self {
            version,
            success,
            message,
        })
    }
}

impl fmt::Display for HandshakeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}\t{}\t{}\t{}",
            RESPONSE_PREFIX, self.version, self.success, self.message
        )
    }
}

fn parse_field<T: std::str::FromStr>(
    field: Option<&str>,
    name: &str,
) -> Result<T, ProtocolError> {
    field
        .ok_or_else(|| ProtocolError::MalformedHandshake(format!("missing {}", name)))?
        .parse()
        .map_err(|_| ProtocolError::MalformedHandshake(format!("invalid {}", name)))
}
