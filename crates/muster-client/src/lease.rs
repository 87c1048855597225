//! Compute lease
//!
//! A lease owns at most one socket, one keepalive task and one cancellation
//! scope. Its lifecycle is monotonic: Created → Connecting → Active →
//! Closing → Closed, with Failed terminal from any earlier state; never
//! reopened. Closing stops the keepalive task *before* the socket is shut
//! down so the keepalive can never write to a disposed transport.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use muster_core::time::current_time_millis;
use muster_core::{AgentId, ClusterId, LeaseId};
use muster_proto::{PingSender, ProtocolError, RemoteComputeSocket};

/// Lease lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Assignment received, nothing connected yet
    Created,
    /// Socket being established
    Connecting,
    /// Socket live, keepalive running
    Active,
    /// Teardown in progress
    Closing,
    /// Torn down cleanly
    Closed,
    /// Connection attempt or lease aborted after an error
    Failed,
}

impl LeaseState {
    fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Closed | LeaseState::Failed)
    }
}

/// A time-bounded, exclusive grant of one remote compute agent
pub struct ComputeLease {
    lease_id: LeaseId,
    agent_id: AgentId,
    cluster_id: ClusterId,
    properties: Vec<String>,
    assigned_resources: BTreeMap<String, i32>,
    socket: Option<RemoteComputeSocket>,
    state: LeaseState,
    cancel: CancellationToken,
    keepalive: Option<JoinHandle<()>>,
}

impl ComputeLease {
    /// Lease in the Created state, before any connection attempt
    pub fn new(
        lease_id: LeaseId,
        agent_id: AgentId,
        cluster_id: ClusterId,
        properties: Vec<String>,
        assigned_resources: BTreeMap<String, i32>,
    ) -> Self {
        Self {
            lease_id,
            agent_id,
            cluster_id,
            properties,
            assigned_resources,
            socket: None,
            state: LeaseState::Created,
            cancel: CancellationToken::new(),
            keepalive: None,
        }
    }

    /// Mark the connection attempt as started
    pub fn begin_connect(&mut self) {
        if self.state == LeaseState::Created {
            self.state = LeaseState::Connecting;
            tracing::debug!("Lease {} connecting to agent {}", self.lease_id, self.agent_id);
        }
    }

    /// Attach the established socket and start the keepalive task
    pub fn activate(&mut self, socket: RemoteComputeSocket, keepalive_interval: Duration) {
        if self.state.is_terminal() {
            return;
        }
        let keepalive = tokio::spawn(run_keepalive(
            socket.ping_sender(),
            keepalive_interval,
            self.cancel.clone(),
            self.lease_id.clone(),
        ));
        self.socket = Some(socket);
        self.keepalive = Some(keepalive);
        self.state = LeaseState::Active;
        tracing::info!("Lease {} active on agent {}", self.lease_id, self.agent_id);
    }

    /// Mark the lease failed; terminal
    pub fn fail(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.cancel.cancel();
        self.state = LeaseState::Failed;
        tracing::warn!("Lease {} failed", self.lease_id);
    }

    /// Lease identifier granted by the broker
    pub fn lease_id(&self) -> &LeaseId {
        &self.lease_id
    }

    /// Agent granted by this lease
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Cluster the agent was picked from
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    /// Properties granted with the lease
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Resources granted with the lease
    pub fn assigned_resources(&self) -> &BTreeMap<String, i32> {
        &self.assigned_resources
    }

    /// Current lifecycle state
    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Send application bytes to the agent
    pub async fn send(&self, payload: Bytes) -> Result<(), ProtocolError> {
        match &self.socket {
            Some(socket) => socket.send(payload).await,
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Receive the next payload from the agent; `None` once the agent closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        match &mut self.socket {
            Some(socket) => socket.recv().await,
            None => None,
        }
    }

    /// Gracefully close the lease: stop the keepalive first, then close the
    /// socket. Idempotent; a failed lease stays failed.
    pub async fn close(&mut self) {
        if matches!(
            self.state,
            LeaseState::Closing | LeaseState::Closed | LeaseState::Failed
        ) {
            return;
        }
        self.state = LeaseState::Closing;

        // The keepalive must be fully stopped before the transport goes away
        self.cancel.cancel();
        if let Some(keepalive) = self.keepalive.take() {
            let _ = keepalive.await;
        }

        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        self.state = LeaseState::Closed;
        tracing::info!("Lease {} closed", self.lease_id);
    }
}

impl Drop for ComputeLease {
    fn drop(&mut self) {
        // Abrupt disposal: make sure no background task outlives the lease
        self.cancel.cancel();
    }
}

/// Send a control ping every `interval` until the lease is cancelled
async fn run_keepalive(
    pings: PingSender,
    interval: Duration,
    cancel: CancellationToken,
    lease_id: LeaseId,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Keepalive for lease {} stopping", lease_id);
                return;
            }
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = pings.send_ping(current_time_millis()).await {
                    tracing::debug!("Keepalive for lease {} ended: {}", lease_id, e);
                    return;
                }
            }
        }
    }
}
