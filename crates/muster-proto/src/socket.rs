//! Remote compute socket
//!
//! The application-visible duplex channel over a [`ComputeTransport`]. A
//! pump task owns the transport and shuttles frames both ways: outbound
//! frames arrive over an mpsc channel (so a keepalive task can share the
//! send path), inbound `Data` payloads are surfaced to the caller, and
//! keepalive `Ping` frames are consumed transparently.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameKind};
use crate::transport::{ComputeTransport, TransportError};

/// Capacity of the send and receive channels between the caller and the
/// pump task. Deep enough to absorb bursts without unbounded buffering.
const SOCKET_CHANNEL_CAPACITY: usize = 64;

enum Command {
    Send(Frame),
    Close(oneshot::Sender<()>),
}

/// Application-visible duplex channel over a compute transport
pub struct RemoteComputeSocket {
    protocol: u32,
    command_tx: mpsc::Sender<Command>,
    incoming_rx: mpsc::Receiver<Bytes>,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl RemoteComputeSocket {
    /// Take ownership of a transport and start the pump task
    pub fn new(transport: Box<dyn ComputeTransport>, protocol: u32) -> Self {
        let (command_tx, command_rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);

        let pump = tokio::spawn(run_pump(transport, command_rx, incoming_tx));

        Self {
            protocol,
            command_tx,
            incoming_rx,
            pump: Some(pump),
            closed: false,
        }
    }

    /// Protocol version this socket was negotiated at
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    /// Send application bytes as one data frame
    pub async fn send(&self, payload: Bytes) -> Result<(), ProtocolError> {
        self.command_tx
            .send(Command::Send(Frame::data(payload)))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Receive the next data payload; `None` once the peer has closed
    ///
    /// Keepalive pings never show up here.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming_rx.recv().await
    }

    /// Cloneable handle for sending keepalive pings through this socket
    pub fn ping_sender(&self) -> PingSender {
        PingSender {
            command_tx: self.command_tx.clone(),
        }
    }

    /// Gracefully close: send a close frame, flush, shut the transport down
    /// and join the pump task. Idempotent; a second call is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.command_tx.send(Command::Close(ack_tx)).await.is_ok() {
            // Pump may already be gone if the peer closed first
            let _ = ack_rx.await;
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}

impl Drop for RemoteComputeSocket {
    fn drop(&mut self) {
        // Abrupt disposal: stop the pump without a graceful close frame
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Cloneable handle used by a lease's keepalive task
#[derive(Clone)]
pub struct PingSender {
    command_tx: mpsc::Sender<Command>,
}

impl PingSender {
    /// Send one keepalive ping carrying a millisecond timestamp
    pub async fn send_ping(&self, timestamp_millis: u64) -> Result<(), ProtocolError> {
        self.command_tx
            .send(Command::Send(Frame::ping(timestamp_millis)))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

enum PumpEvent {
    Command(Option<Command>),
    Inbound(Result<Option<Frame>, TransportError>),
}

async fn run_pump(
    mut transport: Box<dyn ComputeTransport>,
    mut command_rx: mpsc::Receiver<Command>,
    incoming_tx: mpsc::Sender<Bytes>,
) {
    loop {
        let event = tokio::select! {
            command = command_rx.recv() => PumpEvent::Command(command),
            inbound = transport.recv() => PumpEvent::Inbound(inbound),
        };

        match event {
            PumpEvent::Command(Some(Command::Send(frame))) => {
                if let Err(e) = transport.send(frame).await {
                    tracing::warn!("Compute socket send failed: {}", e);
                    break;
                }
            }
            PumpEvent::Command(Some(Command::Close(ack))) => {
                if let Err(e) = transport.send(Frame::close()).await {
                    tracing::debug!("Close frame not delivered: {}", e);
                }
                if let Err(e) = transport.close().await {
                    tracing::debug!("Transport shutdown error: {}", e);
                }
                let _ = ack.send(());
                return;
            }
            PumpEvent::Command(None) => {
                // Socket handle dropped without close(); shut down quietly
                let _ = transport.close().await;
                return;
            }
            PumpEvent::Inbound(Ok(Some(frame))) => match frame.kind {
                FrameKind::Data => {
                    if incoming_tx.send(frame.payload).await.is_err() {
                        // Receiver gone; keep draining commands until close
                        tracing::debug!("Data frame dropped, receiver closed");
                    }
                }
                FrameKind::Ping => {
                    tracing::trace!(
                        "Keepalive ping received (timestamp {:?})",
                        frame.ping_timestamp()
                    );
                }
                FrameKind::Close => {
                    tracing::debug!("Peer sent close frame");
                    break;
                }
            },
            PumpEvent::Inbound(Ok(None)) => {
                tracing::debug!("Transport reached EOF");
                break;
            }
            PumpEvent::Inbound(Err(e)) => {
                tracing::warn!("Compute socket receive failed: {}", e);
                break;
            }
        }
    }

    // Dropping incoming_tx signals recv() callers that the peer is gone
    let _ = transport.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;
    use tokio::io::duplex;

    fn socket_pair() -> (RemoteComputeSocket, RemoteComputeSocket) {
        let (a, b) = duplex(64 * 1024);
        (
            RemoteComputeSocket::new(Box::new(StreamTransport::new(a)), 1),
            RemoteComputeSocket::new(Box::new(StreamTransport::new(b)), 1),
        )
    }

    #[tokio::test]
    async fn test_duplex_data() {
        let (mut left, mut right) = socket_pair();

        left.send(Bytes::from_static(b"request")).await.unwrap();
        assert_eq!(right.recv().await.unwrap().as_ref(), b"request");

        right.send(Bytes::from_static(b"response")).await.unwrap();
        assert_eq!(left.recv().await.unwrap().as_ref(), b"response");
    }

    #[tokio::test]
    async fn test_pings_are_transparent() {
        let (left, mut right) = socket_pair();

        left.ping_sender().send_ping(42).await.unwrap();
        left.send(Bytes::from_static(b"after ping")).await.unwrap();

        // The ping is consumed by the pump; only the data frame surfaces
        assert_eq!(right.recv().await.unwrap().as_ref(), b"after ping");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut left, _right) = socket_pair();

        left.close().await;
        left.close().await;
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_as_none() {
        let (mut left, mut right) = socket_pair();

        left.close().await;
        assert!(right.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (mut left, _right) = socket_pair();

        left.close().await;
        let result = left.send(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
