//! Pending-connection registry
//!
//! Maps lease nonces to tasks waiting for the matching inbound connection.
//! Either side may arrive first: a connection whose waiter has not yet
//! registered is held in a bounded pen until the waiter shows up or its
//! holding period lapses. Each nonce owns one slot, manipulated through the
//! map's entry API, so a registration racing an arrival always matches;
//! neither side is lost to the race window.

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use muster_proto::Nonce;

/// How many unclaimed connections are held at once
const DEFAULT_HELD_CAPACITY: usize = 32;

/// How long an unclaimed connection is held for a future waiter
const DEFAULT_HELD_TTL: Duration = Duration::from_secs(30);

/// Whichever side of the nonce match arrived first
enum Slot {
    /// A lease is waiting for its connection
    Waiting(oneshot::Sender<TcpStream>),
    /// A connection is waiting for its lease
    Held {
        stream: TcpStream,
        arrived_at: Instant,
    },
}

type SlotMap = Arc<DashMap<Nonce, Slot>>;

/// Registry matching lease nonces to inbound connections
#[derive(Clone)]
pub struct PendingConnectionRegistry {
    slots: SlotMap,
    held_capacity: usize,
    held_ttl: Duration,
}

impl Default for PendingConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingConnectionRegistry {
    /// Registry with the default pen size and holding period
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_HELD_CAPACITY, DEFAULT_HELD_TTL)
    }

    /// Registry with a custom pen size and holding period
    pub fn with_limits(held_capacity: usize, held_ttl: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            held_capacity,
            held_ttl,
        }
    }

    /// Register a waiter for the given nonce.
    ///
    /// If the connection already arrived and is being held, the waiter
    /// resolves immediately. A second registration for the same nonce
    /// replaces the first; the displaced waiter resolves to `None`.
    pub fn register(&self, nonce: Nonce) -> PendingConnection {
        let (tx, rx) = oneshot::channel();
        match self.slots.entry(nonce) {
            Entry::Occupied(mut occupied) => {
                match mem::replace(occupied.get_mut(), Slot::Waiting(tx)) {
                    Slot::Held { stream, arrived_at }
                        if arrived_at.elapsed() <= self.held_ttl =>
                    {
                        // The connection arrived first; resolve immediately
                        if let Slot::Waiting(tx) = occupied.remove() {
                            let _ = tx.send(stream);
                        }
                    }
                    Slot::Held { .. } => {
                        tracing::debug!("Held connection for {:?} lapsed, discarding", nonce);
                    }
                    Slot::Waiting(_) => {
                        tracing::warn!("Displaced existing waiter for {:?}", nonce);
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Waiting(tx));
            }
        }

        PendingConnection {
            nonce,
            rx,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Hand an accepted connection to the waiter registered for `nonce`,
    /// or hold it until that waiter registers.
    ///
    /// Returns `false` when the connection had to be discarded: the pen is
    /// full, or the waiter gave up mid-handoff.
    pub fn offer(&self, nonce: &Nonce, stream: TcpStream) -> bool {
        self.evict_lapsed();
        let held = self.parked();

        match self.slots.entry(*nonce) {
            Entry::Occupied(mut occupied) => {
                let arrival = Slot::Held {
                    stream,
                    arrived_at: Instant::now(),
                };
                match mem::replace(occupied.get_mut(), arrival) {
                    Slot::Waiting(tx) => {
                        if let Slot::Held { stream, .. } = occupied.remove() {
                            tx.send(stream).is_ok()
                        } else {
                            false
                        }
                    }
                    // Duplicate arrival for the same nonce; the newer one wins
                    Slot::Held { .. } => true,
                }
            }
            Entry::Vacant(vacant) => {
                if held >= self.held_capacity {
                    tracing::warn!(
                        "Held-connection limit reached, discarding connection for {:?}",
                        nonce
                    );
                    return false;
                }
                vacant.insert(Slot::Held {
                    stream,
                    arrived_at: Instant::now(),
                });
                true
            }
        }
    }

    /// Number of leases currently waiting for a connection
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Waiting(_)))
            .count()
    }

    /// Number of connections currently held for a future waiter
    pub fn parked(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Held { .. }))
            .count()
    }

    fn evict_lapsed(&self) {
        self.slots.retain(|nonce, slot| match slot {
            Slot::Waiting(_) => true,
            Slot::Held { arrived_at, .. } => {
                let keep = arrived_at.elapsed() <= self.held_ttl;
                if !keep {
                    tracing::debug!("Evicting lapsed connection for {:?}", nonce);
                }
                keep
            }
        });
    }
}

/// Guard held by a lease while it waits for its connection.
///
/// Dropping an unresolved guard removes the registry entry.
pub struct PendingConnection {
    nonce: Nonce,
    rx: oneshot::Receiver<TcpStream>,
    slots: SlotMap,
}

impl PendingConnection {
    /// Wait for the matching connection.
    ///
    /// `None` on timeout or cancellation; a timeout is a legitimate
    /// "no connection arrived" outcome, not a fault.
    pub async fn wait(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<TcpStream> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!("No connection arrived for {:?} within {:?}", self.nonce, timeout);
                None
            }
            result = &mut self.rx => result.ok(),
        }
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        // Only this guard's waiter is removed; a connection held for the
        // same nonce after resolution stays put
        self.slots
            .remove_if(&self.nonce, |_, slot| matches!(slot, Slot::Waiting(_)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_offer_resolves_waiter() {
        let registry = PendingConnectionRegistry::new();
        let nonce = Nonce::generate();
        let pending = registry.register(nonce);

        let (_client, server) = tcp_pair().await;
        assert!(registry.offer(&nonce, server));

        let cancel = CancellationToken::new();
        let stream = pending.wait(Duration::from_secs(1), &cancel).await;
        assert!(stream.is_some());
        assert_eq!(registry.pending(), 0);
        assert_eq!(registry.parked(), 0);
    }

    #[tokio::test]
    async fn test_connection_arriving_before_waiter_is_held() {
        let registry = PendingConnectionRegistry::new();
        let nonce = Nonce::generate();

        let (_client, server) = tcp_pair().await;
        assert!(registry.offer(&nonce, server));
        assert_eq!(registry.parked(), 1);

        let pending = registry.register(nonce);
        let cancel = CancellationToken::new();
        let stream = pending.wait(Duration::from_secs(1), &cancel).await;
        assert!(stream.is_some());
        assert_eq!(registry.parked(), 0);
    }

    #[tokio::test]
    async fn test_held_connection_lapses() {
        let registry = PendingConnectionRegistry::with_limits(4, Duration::from_millis(50));
        let nonce = Nonce::generate();

        let (_client, server) = tcp_pair().await;
        assert!(registry.offer(&nonce, server));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let pending = registry.register(nonce);
        let cancel = CancellationToken::new();
        let stream = pending.wait(Duration::from_millis(50), &cancel).await;
        assert!(stream.is_none());
    }

    #[tokio::test]
    async fn test_pen_capacity_is_bounded() {
        let registry = PendingConnectionRegistry::with_limits(2, Duration::from_secs(30));

        for _ in 0..2 {
            let (_client, server) = tcp_pair().await;
            assert!(registry.offer(&Nonce::generate(), server));
        }
        assert_eq!(registry.parked(), 2);

        let (_client, server) = tcp_pair().await;
        assert!(!registry.offer(&Nonce::generate(), server));
        assert_eq!(registry.parked(), 2);
    }

    #[tokio::test]
    async fn test_foreign_nonce_never_resolves_waiter() {
        let registry = PendingConnectionRegistry::new();
        let nonce = Nonce::generate();
        let pending = registry.register(nonce);

        // A connection for a different lease is held, not matched
        let (_client, server) = tcp_pair().await;
        assert!(registry.offer(&Nonce::generate(), server));

        let cancel = CancellationToken::new();
        let stream = pending.wait(Duration::from_millis(50), &cancel).await;
        assert!(stream.is_none());
    }

    #[tokio::test]
    async fn test_dropped_waiter_removes_entry() {
        let registry = PendingConnectionRegistry::new();
        let nonce = Nonce::generate();

        let pending = registry.register(nonce);
        assert_eq!(registry.pending(), 1);
        drop(pending);
        assert_eq!(registry.pending(), 0);

        // With the waiter gone, an arriving connection is held instead
        let (_client, server) = tcp_pair().await;
        assert!(registry.offer(&nonce, server));
        assert_eq!(registry.parked(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_route_by_nonce() {
        let registry = PendingConnectionRegistry::new();
        let nonce_a = Nonce::generate();
        let nonce_b = Nonce::generate();
        let pending_a = registry.register(nonce_a);
        let pending_b = registry.register(nonce_b);

        let (client_b, server_b) = tcp_pair().await;
        let expected_b = client_b.local_addr().unwrap();
        assert!(registry.offer(&nonce_b, server_b));

        let (client_a, server_a) = tcp_pair().await;
        let expected_a = client_a.local_addr().unwrap();
        assert!(registry.offer(&nonce_a, server_a));

        let cancel = CancellationToken::new();
        let stream_a = pending_a
            .wait(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let stream_b = pending_b
            .wait(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(stream_a.peer_addr().unwrap(), expected_a);
        assert_eq!(stream_b.peer_addr().unwrap(), expected_b);
    }

    #[tokio::test]
    async fn test_cancel_resolves_to_none() {
        let registry = PendingConnectionRegistry::new();
        let pending = registry.register(Nonce::generate());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = pending.wait(Duration::from_secs(5), &cancel).await;
        assert!(stream.is_none());
    }
}
