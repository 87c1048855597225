//! Agent-side end-to-end: an initiator connects to the listener, presents
//! its nonce, and the matched connection is executed as a lease.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use muster_agent::{ComputeListener, ComputeTask, PayloadExecutor, PendingConnectionRegistry, TaskExecutor};
use muster_core::config::AgentConfig;
use muster_core::LeaseId;
use muster_proto::transport::{establish_client, EncryptionSetup};
use muster_proto::{Nonce, RemoteComputeSocket};

/// Reverses each payload it receives until the initiator closes.
struct Reverser;

#[async_trait]
impl PayloadExecutor for Reverser {
    async fn execute(
        &self,
        socket: &mut RemoteComputeSocket,
        _sandbox: &Path,
        _env: &HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        while let Some(payload) = socket.recv().await {
            let reversed: Vec<u8> = payload.iter().rev().copied().collect();
            socket.send(Bytes::from(reversed)).await?;
        }
        Ok(())
    }
}

async fn run_scenario(setup: EncryptionSetup) {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        working_dir: dir.path().to_path_buf(),
        ..AgentConfig::default()
    };

    let registry = PendingConnectionRegistry::new();
    let mut listener = ComputeListener::bind(
        "127.0.0.1:0",
        registry,
        config.nonce_read_timeout,
    )
    .await
    .unwrap();
    let addr = listener.local_addr();

    let nonce = Nonce::generate();
    let task = ComputeTask::new(
        LeaseId::from("L-e2e"),
        nonce,
        setup.clone(),
        Duration::from_secs(30),
        1,
    );

    // Initiator: connect, present the nonce, then speak frames
    let initiator = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(nonce.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        let transport = establish_client(stream, &setup, "127.0.0.1").await.unwrap();
        let mut socket = RemoteComputeSocket::new(transport, 1);

        socket.send(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(socket.recv().await.unwrap().as_ref(), b"cba");
        socket.close().await;
    });

    let stream = listener
        .wait_for_client(nonce, Duration::from_secs(2))
        .await
        .expect("initiator connection matched");

    let executor = TaskExecutor::new(&config);
    let cancel = CancellationToken::new();
    executor
        .run(task, stream, &Reverser, &cancel)
        .await
        .unwrap();

    initiator.await.unwrap();
    listener.shutdown().await;
    assert!(!dir.path().join("sandbox").join("L-e2e").exists());
}

#[tokio::test]
async fn test_lease_executes_over_plaintext() {
    run_scenario(EncryptionSetup::none()).await;
}

#[tokio::test]
async fn test_lease_executes_over_aes() {
    run_scenario(EncryptionSetup::aes(vec![9u8; 32])).await;
}
