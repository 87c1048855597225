//! Transport layer
//!
//! A [`ComputeTransport`] is a framed duplex byte channel, agnostic of
//! encryption. Concrete implementations are a plain framed stream, a TLS
//! stream (client or server role), and a pre-shared-key AES decorator over
//! any inner transport. The [`IdleTimeoutTransport`] decorator tracks read
//! activity for a watchdog without ever cancelling anything itself.

mod cipher;
mod idle;
mod tls;

pub use cipher::AesTransport;
pub use idle::{IdleClock, IdleTimeoutTransport, DEFAULT_NO_DATA_TIMEOUT};
pub use tls::{tls_accept, tls_connect};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;
use crate::error::ProtocolError;
use crate::frame::Frame;

/// Length of a pre-shared AES-256 key in bytes
pub const AES_KEY_SIZE: usize = 32;

/// Errors raised by transport construction and I/O
#[derive(Error, Debug)]
pub enum TransportError {
    /// Protocol-level failure (framing, unexpected bytes)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Pre-shared key with the wrong length
    #[error("Invalid cipher key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Frame encryption failed
    #[error("Frame encryption failed")]
    Encrypt,

    /// Frame failed authentication or decryption; the payload is discarded
    #[error("Frame decryption failed")]
    Decrypt,

    /// Encryption kind requires key material that was not supplied
    #[error("Missing key material for {0:?} transport")]
    MissingKeyMaterial(EncryptionKind),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bidirectional framed byte channel
///
/// `recv` implementations must be cancel-safe: dropping an in-flight `recv`
/// future must not lose buffered bytes, since callers drive transports from
/// `tokio::select!` loops.
#[async_trait]
pub trait ComputeTransport: Send {
    /// Send one frame
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Receive the next frame; `None` signals an orderly EOF
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Flush pending writes and shut the channel down
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl ComputeTransport for Box<dyn ComputeTransport> {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
}

/// Transport encryption selector, as carried in an assignment response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionKind {
    /// Plaintext passthrough
    #[default]
    None,
    /// Pre-shared-key AES-256-GCM, no handshake
    Aes,
    /// TLS with RSA-2048 certificate material
    SslRsa2048,
    /// TLS with ECDSA P-256 certificate material
    SslEcdsaP256,
}

/// Encryption kind plus the key material it requires
///
/// For the TLS kinds, `certificate` is the PEM trust anchor (and, on the
/// agent side, the presented chain) and `key` the PEM private key. For AES,
/// `key` is the raw 32-byte pre-shared key.
#[derive(Debug, Clone, Default)]
pub struct EncryptionSetup {
    /// Selected encryption kind
    pub kind: EncryptionKind,
    /// PEM certificate material (TLS kinds)
    pub certificate: Option<Vec<u8>>,
    /// PEM private key (agent-side TLS) or raw AES key
    pub key: Option<Vec<u8>>,
}

impl EncryptionSetup {
    /// Plaintext setup
    pub fn none() -> Self {
        Self::default()
    }

    /// AES setup from a raw pre-shared key
    pub fn aes(key: Vec<u8>) -> Self {
        Self {
            kind: EncryptionKind::Aes,
            certificate: None,
            key: Some(key),
        }
    }

    fn certificate(&self) -> Result<&[u8], TransportError> {
        self.certificate
            .as_deref()
            .ok_or(TransportError::MissingKeyMaterial(self.kind))
    }

    fn key(&self) -> Result<&[u8], TransportError> {
        self.key
            .as_deref()
            .ok_or(TransportError::MissingKeyMaterial(self.kind))
    }
}

/// Framed transport over any async byte stream
pub struct StreamTransport<S> {
    framed: Framed<S, FrameCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> StreamTransport<S> {
    /// Wrap a stream in the frame codec
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ComputeTransport for StreamTransport<S> {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.framed.send(frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.framed.next().await {
            Some(result) => Ok(Some(result?)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.framed.close().await?;
        Ok(())
    }
}

/// Build the initiator-side transport for an already-connected socket.
///
/// The caller must have written the nonce bytes on the raw stream first;
/// the TLS handshake (if any) happens here, after that write.
pub async fn establish_client(
    stream: TcpStream,
    setup: &EncryptionSetup,
    server_name: &str,
) -> Result<Box<dyn ComputeTransport>, TransportError> {
    match setup.kind {
        EncryptionKind::None => Ok(Box::new(StreamTransport::new(stream))),
        EncryptionKind::Aes => Ok(Box::new(AesTransport::new(
            StreamTransport::new(stream),
            setup.key()?,
        )?)),
        EncryptionKind::SslRsa2048 | EncryptionKind::SslEcdsaP256 => {
            let transport = tls_connect(stream, setup.certificate()?, server_name).await?;
            Ok(Box::new(transport))
        }
    }
}

/// Build the acceptor-side transport for an already-accepted socket.
///
/// The caller must have consumed and verified the nonce bytes first.
pub async fn establish_server(
    stream: TcpStream,
    setup: &EncryptionSetup,
) -> Result<Box<dyn ComputeTransport>, TransportError> {
    match setup.kind {
        EncryptionKind::None => Ok(Box::new(StreamTransport::new(stream))),
        EncryptionKind::Aes => Ok(Box::new(AesTransport::new(
            StreamTransport::new(stream),
            setup.key()?,
        )?)),
        EncryptionKind::SslRsa2048 | EncryptionKind::SslEcdsaP256 => {
            let transport = tls_accept(stream, setup.certificate()?, setup.key()?).await?;
            Ok(Box::new(transport))
        }
    }
}
