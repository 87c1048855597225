//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame kind tag
    #[error("Unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Nonce with the wrong number of bytes
    #[error("Invalid nonce length: expected {expected} bytes, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    /// Malformed tunnel handshake line
    #[error("Malformed handshake line: {0}")]
    MalformedHandshake(String),

    /// The peer or the local socket has already shut down
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
