//! Lease correlation nonce
//!
//! A nonce is a single-use 64-byte random token generated once per
//! assignment. It is the only link between the HTTP assignment and the raw
//! socket connection: the initiator writes the raw nonce bytes as the very
//! first bytes on every socket, before any encryption handshake or frame,
//! and the acceptor reads and compares them before trusting anything else.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// Number of raw bytes in a nonce
pub const NONCE_SIZE: usize = 64;

/// Single-use random token correlating an assignment with a socket
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a fresh nonce from OS randomness
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a nonce from raw bytes, checking the length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != NONCE_SIZE {
            return Err(ProtocolError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut out = [0u8; NONCE_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Parse a nonce from its 128-character hex form
    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(s).map_err(|_| ProtocolError::InvalidNonceLength {
            expected: NONCE_SIZE,
            actual: s.len() / 2,
        })?;
        Self::from_bytes(&bytes)
    }

    /// Raw nonce bytes, as transmitted on the wire
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Hex form, as carried in the assignment response
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full nonces are noisy in logs; the first few bytes identify a lease
        write!(f, "Nonce({}..)", hex::encode(&self.0[..6]))
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Nonce::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        let a = Nonce::generate();
        let b = Nonce::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_roundtrip() {
        let nonce = Nonce::generate();
        let parsed = Nonce::from_hex(&nonce.to_hex()).unwrap();
        assert_eq!(nonce, parsed);
    }

    #[test]
    fn test_from_bytes_wrong_length() {
        let result = Nonce::from_bytes(&[0u8; 32]);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidNonceLength {
                expected: 64,
                actual: 32
            })
        ));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let nonce = Nonce::generate();
        let json = serde_json::to_string(&nonce).unwrap();
        assert_eq!(json.len(), NONCE_SIZE * 2 + 2); // hex chars plus quotes

        let parsed: Nonce = serde_json::from_str(&json).unwrap();
        assert_eq!(nonce, parsed);
    }
}
