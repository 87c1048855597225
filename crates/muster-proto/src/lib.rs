//! muster-proto: Wire protocol and secure transports for Muster compute leases
//!
//! This crate defines the framed binary protocol spoken between a compute
//! client and a compute agent once a lease has been assigned, plus the
//! transport decorators (TLS, pre-shared-key AES, idle tracking) that sit
//! between a raw TCP stream and the application-visible socket.

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod nonce;
pub mod socket;
pub mod transport;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{Frame, FrameHeader, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use handshake::{HandshakeRequest, HandshakeResponse, TUNNEL_HANDSHAKE_VERSION};
pub use nonce::{Nonce, NONCE_SIZE};
pub use socket::{PingSender, RemoteComputeSocket};
pub use transport::{EncryptionKind, EncryptionSetup, TransportError};

/// Current compute protocol version.
///
/// Declared by the client in the assignment request and echoed by the broker;
/// both ends construct their [`RemoteComputeSocket`] at the negotiated value.
pub const PROTOCOL_VERSION: u32 = 1;
