//! Connection establishment
//!
//! Resolves a connection mode to an open TCP socket:
//! - Direct: connect straight to the connection address.
//! - Tunnel: connect to the relay, then negotiate forwarding with the
//!   line-based handshake before any protocol bytes flow.
//! - Relay: connect to the relay with bounded, sequential retry.
//!
//! Whatever the mode, the caller writes the nonce bytes on the returned
//! socket before anything else happens on it.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use muster_core::config::ClientConfig;
use muster_core::{ComputeClientError, ConnectionMode};
use muster_proto::handshake::{HandshakeRequest, HandshakeResponse};

/// Resolves connection modes to open sockets
pub struct ConnectionEstablisher {
    connect_timeout: Duration,
    tunnel_handshake_timeout: Duration,
    relay_attempts: u32,
    relay_attempt_timeout: Duration,
    relay_retry_delay: Duration,
}

impl ConnectionEstablisher {
    /// Build an establisher from client configuration
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            tunnel_handshake_timeout: config.tunnel_handshake_timeout,
            relay_attempts: config.relay_attempts.max(1),
            relay_attempt_timeout: config.relay_attempt_timeout,
            relay_retry_delay: config.relay_retry_delay,
        }
    }

    /// Open a socket to the agent according to the connection mode.
    ///
    /// `target_addr` is the canonical agent address; `connection_addr` is
    /// where the initiator actually connects (the relay/tunnel endpoint when
    /// not direct, otherwise equal to the target).
    pub async fn connect(
        &self,
        mode: ConnectionMode,
        target_addr: &str,
        connection_addr: &str,
    ) -> Result<TcpStream, ComputeClientError> {
        match mode {
            ConnectionMode::Direct => self.connect_direct(connection_addr).await,
            ConnectionMode::Tunnel => self.connect_tunnel(connection_addr, target_addr).await,
            ConnectionMode::Relay => self.connect_relay(connection_addr).await,
        }
    }

    async fn connect_direct(&self, addr: &str) -> Result<TcpStream, ComputeClientError> {
        tracing::debug!("Connecting directly to {}", addr);

        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ComputeClientError::Connect {
                mode: ConnectionMode::Direct,
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|e| ComputeClientError::Connect {
                mode: ConnectionMode::Direct,
                addr: addr.to_string(),
                source: e,
            })?;

        Ok(stream)
    }

    /// Connect to the relay and ask it to forward to the target with a
    /// single line-based handshake exchange.
    async fn connect_tunnel(
        &self,
        relay_addr: &str,
        target_addr: &str,
    ) -> Result<TcpStream, ComputeClientError> {
        tracing::debug!("Connecting to tunnel relay {} for {}", relay_addr, target_addr);

        let stream = timeout(self.connect_timeout, TcpStream::connect(relay_addr))
            .await
            .map_err(|_| ComputeClientError::Connect {
                mode: ConnectionMode::Tunnel,
                addr: relay_addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|e| ComputeClientError::Connect {
                mode: ConnectionMode::Tunnel,
                addr: relay_addr.to_string(),
                source: e,
            })?;

        let (host, port) = split_host_port(target_addr)?;
        let request = HandshakeRequest::new(host, port);

        let handshake = async {
            let mut reader = BufReader::new(stream);
            reader
                .get_mut()
                .write_all(request.to_string().as_bytes())
                .await?;

            let mut line = String::new();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                return Err(ComputeClientError::TunnelHandshake {
                    relay: relay_addr.to_string(),
                    target: target_addr.to_string(),
                    reason: "relay closed the connection".to_string(),
                });
            }

            let response = HandshakeResponse::parse(&line)?;
            if !response.success {
                return Err(ComputeClientError::TunnelHandshake {
                    relay: relay_addr.to_string(),
                    target: target_addr.to_string(),
                    reason: response.message,
                });
            }

            tracing::debug!("Tunnel handshake accepted: {}", response.message);
            Ok(reader.into_inner())
        };

        timeout(self.tunnel_handshake_timeout, handshake)
            .await
            .map_err(|_| ComputeClientError::TunnelHandshake {
                relay: relay_addr.to_string(),
                target: target_addr.to_string(),
                reason: format!(
                    "handshake timed out after {:?}",
                    self.tunnel_handshake_timeout
                ),
            })?
    }

    /// Connect to the relay endpoint with bounded, sequential retry.
    async fn connect_relay(&self, relay_addr: &str) -> Result<TcpStream, ComputeClientError> {
        let (host, port) = split_host_port(relay_addr)?;
        let mut last_error: Option<std::io::Error> = None;

        for attempt in 1..=self.relay_attempts {
            tracing::debug!(
                "Relay connection attempt {}/{} to {}",
                attempt,
                self.relay_attempts,
                relay_addr
            );

            match timeout(self.relay_attempt_timeout, TcpStream::connect(relay_addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    tracing::debug!("Relay attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::debug!(
                        "Relay attempt {} timed out after {:?}",
                        attempt,
                        self.relay_attempt_timeout
                    );
                    last_error = None;
                }
            }

            if attempt < self.relay_attempts {
                tokio::time::sleep(self.relay_retry_delay).await;
            }
        }

        Err(ComputeClientError::RelayTimeout {
            host: host.to_string(),
            port,
            attempts: self.relay_attempts,
            source: last_error,
        })
    }
}

fn split_host_port(addr: &str) -> Result<(&str, u16), ComputeClientError> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        ComputeClientError::InvalidResponse(format!("address '{}' has no port", addr))
    })?;
    let port = port.parse().map_err(|_| {
        ComputeClientError::InvalidResponse(format!("address '{}' has a bad port", addr))
    })?;
    Ok((host, port))
}
