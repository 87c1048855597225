//! Pre-shared-key AES transport
//!
//! Wraps an inner transport and encrypts every frame payload with
//! AES-256-GCM. There is no handshake: both sides hold the 32-byte key from
//! the assignment. Each frame carries a fresh random 12-byte nonce followed
//! by the ciphertext and tag, so decryption authenticates before returning
//! any bytes; a tampered or foreign-key frame fails closed.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::frame::Frame;

use super::{ComputeTransport, TransportError, AES_KEY_SIZE};

/// Size of the per-frame GCM nonce prefix
const FRAME_NONCE_SIZE: usize = 12;

/// AES-256-GCM frame encryption over an inner transport
pub struct AesTransport<T> {
    inner: T,
    cipher: Aes256Gcm,
}

impl<T: ComputeTransport> AesTransport<T> {
    /// Wrap an inner transport with a raw 32-byte pre-shared key
    pub fn new(inner: T, key: &[u8]) -> Result<Self, TransportError> {
        if key.len() != AES_KEY_SIZE {
            return Err(TransportError::InvalidKeyLength {
                expected: AES_KEY_SIZE,
                actual: key.len(),
            });
        }
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
        Ok(Self { inner, cipher })
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Bytes, TransportError> {
        let mut nonce = [0u8; FRAME_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| TransportError::Encrypt)?;

        let mut sealed = Vec::with_capacity(FRAME_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(Bytes::from(sealed))
    }

    fn open(&self, sealed: &[u8]) -> Result<Bytes, TransportError> {
        if sealed.len() < FRAME_NONCE_SIZE {
            return Err(TransportError::Decrypt);
        }
        let (nonce, ciphertext) = sealed.split_at(FRAME_NONCE_SIZE);

        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| TransportError::Decrypt)?;
        Ok(Bytes::from(plaintext))
    }
}

#[async_trait]
impl<T: ComputeTransport> ComputeTransport for AesTransport<T> {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let sealed = self.seal(&frame.payload)?;
        self.inner.send(Frame::new(frame.kind, sealed)).await
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.inner.recv().await? {
            Some(frame) => {
                let payload = self.open(&frame.payload)?;
                Ok(Some(Frame::new(frame.kind, payload)))
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
