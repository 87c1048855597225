//! Compute listener
//!
//! Accepts inbound TCP connections and correlates each one with a waiting
//! lease by the raw nonce it presents as its first bytes. A connection whose
//! waiter has not registered yet is held by the registry until it does; one
//! that presents no nonce in time is dropped. The listener itself keeps
//! running either way.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use muster_proto::{Nonce, NONCE_SIZE};

use crate::registry::PendingConnectionRegistry;

/// Inbound connection acceptor for the compute agent
pub struct ComputeListener {
    registry: PendingConnectionRegistry,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl ComputeListener {
    /// Bind the listener and start its accept loop
    pub async fn bind(
        addr: &str,
        registry: PendingConnectionRegistry,
        nonce_read_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        tracing::info!("Compute listener bound on {}", local_addr);

        let accept_task = tokio::spawn(run_accept_loop(
            listener,
            registry.clone(),
            cancel.clone(),
            nonce_read_timeout,
        ));

        Ok(Self {
            registry,
            local_addr,
            cancel,
            accept_task: Some(accept_task),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registry this listener resolves connections through
    pub fn registry(&self) -> &PendingConnectionRegistry {
        &self.registry
    }

    /// Wait for the connection presenting `nonce`.
    ///
    /// `None` when no matching connection arrives within `timeout` or the
    /// listener shuts down first.
    pub async fn wait_for_client(&self, nonce: Nonce, timeout: Duration) -> Option<TcpStream> {
        self.registry
            .register(nonce)
            .wait(timeout, &self.cancel)
            .await
    }

    /// Stop accepting and join the accept loop
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        tracing::info!("Compute listener on {} stopped", self.local_addr);
    }
}

impl Drop for ComputeListener {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    registry: PendingConnectionRegistry,
    cancel: CancellationToken,
    nonce_read_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Accept loop cancelled");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted connection from {}", peer);
                    let registry = registry.clone();
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        registry,
                        nonce_read_timeout,
                    ));
                }
                Err(e) => {
                    // Transient accept errors (fd exhaustion, aborted
                    // connections) must not kill the listener
                    tracing::warn!("Accept failed: {}", e);
                }
            }
        }
    }
}

/// Read the nonce a connection presents and hand it to the registry
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: PendingConnectionRegistry,
    nonce_read_timeout: Duration,
) {
    let mut buf = [0u8; NONCE_SIZE];
    match tokio::time::timeout(nonce_read_timeout, stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::warn!("Connection from {} closed before presenting a nonce: {}", peer, e);
            return;
        }
        Err(_) => {
            tracing::warn!(
                "Connection from {} presented no nonce within {:?}, dropping",
                peer,
                nonce_read_timeout
            );
            return;
        }
    }

    let nonce = match Nonce::from_bytes(&buf) {
        Ok(nonce) => nonce,
        Err(e) => {
            tracing::error!("Nonce from {} rejected: {}", peer, e);
            return;
        }
    };

    if registry.offer(&nonce, stream) {
        tracing::debug!("Connection from {} accepted for nonce {:?}", peer, nonce);
    } else {
        tracing::warn!(
            "Connection from {} with nonce {:?} discarded",
            peer,
            nonce
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn start_listener() -> ComputeListener {
        ComputeListener::bind(
            "127.0.0.1:0",
            PendingConnectionRegistry::new(),
            Duration::from_millis(500),
        )
        .await
        .unwrap()
    }

    async fn connect_with_nonce(addr: SocketAddr, nonce: &Nonce) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(nonce.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        stream
    }

    #[tokio::test]
    async fn test_matching_nonce_resolves_waiter() {
        let mut listener = start_listener().await;
        let nonce = Nonce::generate();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move { connect_with_nonce(addr, &nonce).await });

        let stream = listener
            .wait_for_client(nonce, Duration::from_secs(2))
            .await;
        assert!(stream.is_some());

        let _client = client.await.unwrap();
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_arriving_before_wait_is_matched() {
        let mut listener = start_listener().await;
        let nonce = Nonce::generate();
        let addr = listener.local_addr();

        // The connection lands before anyone waits for it
        let _client = connect_with_nonce(addr, &nonce).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.registry().parked(), 1);

        let stream = listener
            .wait_for_client(nonce, Duration::from_secs(2))
            .await;
        assert!(stream.is_some());

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_foreign_nonce_never_resolves_waiter() {
        let mut listener = start_listener().await;
        let expected = Nonce::generate();
        let addr = listener.local_addr();

        // A stranger presents the wrong nonce first
        let stranger = connect_with_nonce(addr, &Nonce::generate()).await;

        let client = tokio::spawn(async move { connect_with_nonce(addr, &expected).await });

        let stream = listener
            .wait_for_client(expected, Duration::from_secs(2))
            .await;
        assert!(stream.is_some());

        drop(stranger);
        let _client = client.await.unwrap();
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_times_out_without_connection() {
        let mut listener = start_listener().await;

        let stream = listener
            .wait_for_client(Nonce::generate(), Duration::from_millis(50))
            .await;
        assert!(stream.is_none());

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_connection_is_dropped() {
        let mut listener = ComputeListener::bind(
            "127.0.0.1:0",
            PendingConnectionRegistry::new(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        let nonce = Nonce::generate();
        let addr = listener.local_addr();

        // Connects but never writes a nonce
        let _silent = TcpStream::connect(addr).await.unwrap();

        let stream = listener
            .wait_for_client(nonce, Duration::from_millis(200))
            .await;
        assert!(stream.is_none());

        listener.shutdown().await;
    }
}
