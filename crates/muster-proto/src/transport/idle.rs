//! Idle-timeout transport decorator
//!
//! Records the instant of the most recent successful read and exposes it
//! through a cloneable [`IdleClock`] handle. The decorator is purely
//! observational: it never cancels anything itself. A watchdog owns the
//! cancellation decision and polls the clock.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::frame::Frame;

use super::{ComputeTransport, TransportError};

/// Default no-data timeout applied when a task requests a shorter one
pub const DEFAULT_NO_DATA_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Read-only view of transport activity for a watchdog
#[derive(Clone)]
pub struct IdleClock {
    last_activity: Arc<Mutex<Instant>>,
    no_data_timeout: Duration,
}

impl IdleClock {
    fn new(no_data_timeout: Duration) -> Self {
        Self {
            last_activity: Arc::new(Mutex::new(Instant::now())),
            no_data_timeout,
        }
    }

    /// Time elapsed since the last successful read
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("idle clock lock poisoned")
            .elapsed()
    }

    /// Configured silence threshold
    pub fn no_data_timeout(&self) -> Duration {
        self.no_data_timeout
    }

    /// Whether the transport has been silent past the threshold
    pub fn is_expired(&self) -> bool {
        self.time_since_activity() > self.no_data_timeout
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("idle clock lock poisoned") = Instant::now();
    }
}

/// Decorator tracking time since the last successful read
pub struct IdleTimeoutTransport<T> {
    inner: T,
    clock: IdleClock,
}

impl<T: ComputeTransport> IdleTimeoutTransport<T> {
    /// Wrap an inner transport with the given no-data timeout
    pub fn new(inner: T, no_data_timeout: Duration) -> Self {
        Self {
            inner,
            clock: IdleClock::new(no_data_timeout),
        }
    }

    /// Cloneable activity view for the watchdog
    pub fn clock(&self) -> IdleClock {
        self.clock.clone()
    }
}

#[async_trait]
impl<T: ComputeTransport> ComputeTransport for IdleTimeoutTransport<T> {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner.send(frame).await
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        let result = self.inner.recv().await;
        if let Ok(Some(_)) = result {
            self.clock.touch();
        }
        result
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;
    use bytes::Bytes;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_recv_resets_idle_clock() {
        let (a, b) = duplex(4096);
        let mut sender = StreamTransport::new(a);
        let mut idle = IdleTimeoutTransport::new(
            StreamTransport::new(b),
            Duration::from_millis(100),
        );
        let clock = idle.clock();

        tokio::time::sleep(Duration::from_millis(50)).await;
        sender
            .send(Frame::data(Bytes::from_static(b"x")))
            .await
            .unwrap();
        idle.recv().await.unwrap().unwrap();

        assert!(clock.time_since_activity() < Duration::from_millis(50));
        assert!(!clock.is_expired());
    }

    #[tokio::test]
    async fn test_clock_expires_without_activity() {
        let (_a, b) = duplex(4096);
        let idle = IdleTimeoutTransport::new(
            StreamTransport::new(b),
            Duration::from_millis(10),
        );
        let clock = idle.clock();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(clock.is_expired());
    }

    #[tokio::test]
    async fn test_ping_frames_count_as_activity() {
        let (a, b) = duplex(4096);
        let mut sender = StreamTransport::new(a);
        let mut idle = IdleTimeoutTransport::new(
            StreamTransport::new(b),
            Duration::from_millis(100),
        );
        let clock = idle.clock();

        tokio::time::sleep(Duration::from_millis(40)).await;
        sender.send(Frame::ping(1)).await.unwrap();
        idle.recv().await.unwrap().unwrap();

        assert!(clock.time_since_activity() < Duration::from_millis(40));
    }
}
