//! Task executor
//!
//! Runs one leased payload over one matched connection. The executor owns
//! the whole lifetime of a lease on the agent side: transport construction,
//! the inactivity watchdog, the sandbox directory, and the classification of
//! a watchdog-triggered cancellation as an idle timeout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use muster_core::config::AgentConfig;
use muster_core::{ExecutorError, LeaseId};
use muster_proto::transport::{establish_server, EncryptionSetup, IdleClock, IdleTimeoutTransport};
use muster_proto::{Nonce, RemoteComputeSocket};

/// One dispatched lease, consumed when its connection is matched
#[derive(Debug, Clone)]
pub struct ComputeTask {
    /// Lease this task executes under
    pub lease_id: LeaseId,
    /// Nonce the initiator presents on its socket
    pub nonce: Nonce,
    /// Transport encryption to apply once the nonce is consumed
    pub encryption: EncryptionSetup,
    /// Requested no-data timeout; the agent enforces a configured floor
    pub inactivity_timeout: Duration,
    /// Protocol version negotiated for the socket
    pub protocol: u32,
    /// Lease this task is nested under, if any
    pub parent_lease_id: Option<LeaseId>,
}

impl ComputeTask {
    /// Task with no parent lease
    pub fn new(
        lease_id: LeaseId,
        nonce: Nonce,
        encryption: EncryptionSetup,
        inactivity_timeout: Duration,
        protocol: u32,
    ) -> Self {
        Self {
            lease_id,
            nonce,
            encryption,
            inactivity_timeout,
            protocol,
            parent_lease_id: None,
        }
    }
}

/// Executes the leased work once the socket and sandbox are ready.
///
/// Implementations receive the live socket, the sandbox path and the lease
/// environment, and must honor the cancellation token promptly.
#[async_trait]
pub trait PayloadExecutor: Send + Sync {
    /// Run the payload to completion
    async fn execute(
        &self,
        socket: &mut RemoteComputeSocket,
        sandbox: &Path,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Outcome of the pre-run termination-signal cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalFileCleanup {
    Absent,
    Removed,
    Failed,
}

/// Supervises one lease execution end to end
pub struct TaskExecutor {
    working_dir: PathBuf,
    watchdog_interval: Duration,
    min_no_data_timeout: Duration,
}

impl TaskExecutor {
    /// Build an executor from agent configuration
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            working_dir: config.working_dir.clone(),
            watchdog_interval: config.watchdog_interval,
            min_no_data_timeout: config.inactivity_timeout,
        }
    }

    /// Execute one task over its matched connection.
    ///
    /// The sandbox directory is removed on every exit path. A cancellation
    /// that coincides with an expired idle clock is reported as
    /// [`ExecutorError::IdleTimeout`]; any other cancellation or failure
    /// propagates as-is.
    pub async fn run(
        &self,
        task: ComputeTask,
        stream: TcpStream,
        payload: &dyn PayloadExecutor,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        self.clear_signal_file(&task.lease_id).await;

        let transport = establish_server(stream, &task.encryption).await?;
        tracing::info!(
            "Lease {} transport established ({:?})",
            task.lease_id,
            task.encryption.kind
        );

        let no_data_timeout = task.inactivity_timeout.max(self.min_no_data_timeout);
        let idle = IdleTimeoutTransport::new(transport, no_data_timeout);
        let clock = idle.clock();

        let child = cancel.child_token();
        let watchdog = tokio::spawn(run_watchdog(
            clock.clone(),
            child.clone(),
            self.watchdog_interval,
            task.lease_id.clone(),
        ));

        let sandbox = self.sandbox_dir(&task.lease_id);
        let mut socket = RemoteComputeSocket::new(Box::new(idle), task.protocol);

        let result: Result<(), ExecutorError> = async {
            let shared = sandbox.join("shared");
            tokio::fs::create_dir_all(&shared).await?;

            let env = lease_environment(&task, &sandbox, &shared);
            tracing::info!("Lease {} executing in {:?}", task.lease_id, sandbox);

            tokio::select! {
                result = payload.execute(&mut socket, &sandbox, &env, &child) => {
                    result.map_err(ExecutorError::Payload)
                }
                _ = child.cancelled() => Err(ExecutorError::Cancelled),
            }
        }
        .await;

        // Decide the classification before tearing the watchdog down
        let idle_expired =
            child.is_cancelled() && clock.time_since_activity() >= no_data_timeout;

        socket.close().await;
        child.cancel();
        let _ = watchdog.await;
        self.remove_sandbox(&task.lease_id, &sandbox).await;

        match result {
            Err(e) if idle_expired => {
                tracing::warn!("Lease {} idle-terminated ({})", task.lease_id, e);
                Err(ExecutorError::IdleTimeout {
                    idle_secs: no_data_timeout.as_secs(),
                })
            }
            Ok(()) => {
                tracing::info!("Lease {} succeeded", task.lease_id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Lease {} failed: {}", task.lease_id, e);
                Err(e)
            }
        }
    }

    fn sandbox_dir(&self, lease_id: &LeaseId) -> PathBuf {
        self.working_dir.join("sandbox").join(lease_id.as_str())
    }

    fn signal_file(&self, lease_id: &LeaseId) -> PathBuf {
        self.working_dir.join(format!("{}.terminate", lease_id))
    }

    /// Remove a stale termination-signal file left by a previous run.
    ///
    /// Best effort: a failure is logged, never fatal on its own.
    async fn clear_signal_file(&self, lease_id: &LeaseId) -> SignalFileCleanup {
        let path = self.signal_file(lease_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Removed stale termination signal {:?}", path);
                SignalFileCleanup::Removed
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SignalFileCleanup::Absent,
            Err(e) => {
                tracing::warn!("Could not remove termination signal {:?}: {}", path, e);
                SignalFileCleanup::Failed
            }
        }
    }

    async fn remove_sandbox(&self, lease_id: &LeaseId, sandbox: &Path) {
        match tokio::fs::remove_dir_all(sandbox).await {
            Ok(()) => tracing::debug!("Lease {} sandbox removed", lease_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("Lease {} sandbox {:?} not removed: {}", lease_id, sandbox, e);
            }
        }
    }
}

fn lease_environment(
    task: &ComputeTask,
    sandbox: &Path,
    shared: &Path,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("MUSTER_LEASE_ID".to_string(), task.lease_id.to_string());
    env.insert(
        "MUSTER_SANDBOX_DIR".to_string(),
        sandbox.display().to_string(),
    );
    env.insert(
        "MUSTER_SHARED_DIR".to_string(),
        shared.display().to_string(),
    );
    if let Some(parent) = &task.parent_lease_id {
        env.insert("MUSTER_PARENT_LEASE_ID".to_string(), parent.to_string());
    }
    env
}

/// Poll the idle clock and cancel the lease scope once it expires
async fn run_watchdog(
    clock: IdleClock,
    cancel: CancellationToken,
    interval: Duration,
    lease_id: LeaseId,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                if clock.is_expired() {
                    tracing::warn!(
                        "Lease {} transport idle for {:?}, terminating",
                        lease_id,
                        clock.time_since_activity()
                    );
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}
