//! Lease broker client
//!
//! HTTP client for the broker's compute assignment API. One successful
//! assignment yields exactly one socket: the client connects according to
//! the assigned mode, writes the raw nonce bytes before anything else, wraps
//! the stream in the assigned transport and hands back a [`ComputeLease`].
//!
//! Status-code contract for assignment calls: 404 means no matching agents
//! exist and is an error; 503 and 429 mean "no capacity right now" and come
//! back as `Ok(None)` so callers can retry on their own schedule.

use std::net::IpAddr;

use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;

use muster_core::config::ClientConfig;
use muster_core::{
    AssignComputeRequest, AssignComputeResponse, ClusterId, ComputeClientError, ConnectionMode,
    ConnectionPreferences, DeclareResourceNeedsRequest, GetClusterResponse, RequestId,
    Requirements,
};
use muster_proto::transport::establish_client;
use muster_proto::{RemoteComputeSocket, PROTOCOL_VERSION};

use crate::establish::ConnectionEstablisher;
use crate::lease::ComputeLease;

/// Client for the broker's compute assignment API
pub struct ServerComputeClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    establisher: ConnectionEstablisher,
    config: ClientConfig,
}

impl ServerComputeClient {
    /// Build a client from configuration
    pub fn new(config: ClientConfig) -> Result<Self, ComputeClientError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            establisher: ConnectionEstablisher::new(&config),
            config,
        })
    }

    /// Resolve the cluster the given requirements would be served from.
    ///
    /// The caller supplies the request id so the lookup and any later
    /// assignment calls correlate in broker logs.
    pub async fn get_cluster(
        &self,
        requirements: &Requirements,
        request_id: &RequestId,
        connection: &ConnectionPreferences,
    ) -> Result<ClusterId, ComputeClientError> {
        let request = AssignComputeRequest {
            requirements: requirements.clone(),
            request_id: request_id.clone(),
            connection: connection.clone(),
            protocol: PROTOCOL_VERSION,
        };

        let url = format!("{}/api/v2/compute/_cluster", self.base_url);
        let response = self.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        let body: GetClusterResponse = response.json().await?;
        tracing::debug!("Requirements resolve to cluster {}", body.cluster_id);
        Ok(body.cluster_id)
    }

    /// Request one agent assignment and connect to it.
    ///
    /// `Ok(Some(lease))` grants an active lease with its keepalive running.
    /// `Ok(None)` means the broker has no capacity right now (503/429) and
    /// the caller may retry later. 404 is an error: no agent matches the
    /// requirements at all.
    pub async fn try_assign_worker(
        &self,
        cluster: Option<&ClusterId>,
        requirements: &Requirements,
        request_id: &RequestId,
        connection: &ConnectionPreferences,
    ) -> Result<Option<ComputeLease>, ComputeClientError> {
        let mut connection = connection.clone();
        if connection.mode == Some(ConnectionMode::Relay) && connection.client_public_ip.is_none()
        {
            connection.client_public_ip = Some(self.resolve_public_ip().await?);
        }

        let request = AssignComputeRequest {
            requirements: requirements.clone(),
            request_id: request_id.clone(),
            connection,
            protocol: PROTOCOL_VERSION,
        };

        let url = match cluster {
            Some(cluster) => format!("{}/api/v2/compute/{}", self.base_url, cluster),
            None => format!("{}/api/v2/compute", self.base_url),
        };

        let response = self.post(&url).json(&request).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ComputeClientError::NoAgentsFound {
                cluster: cluster.cloned(),
                requirements: requirements.clone(),
            }),
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
                tracing::info!(
                    "Broker has no compute capacity right now (status {})",
                    response.status()
                );
                Ok(None)
            }
            status if !status.is_success() => Err(http_error(response).await),
            _ => {
                let assignment: AssignComputeResponse = response.json().await?;
                let lease = self.connect(assignment).await?;
                Ok(Some(lease))
            }
        }
    }

    /// Declare forecast resource needs so the broker can scale the pool.
    ///
    /// Advisory only; a failure here never affects existing leases.
    pub async fn declare_resource_needs(
        &self,
        cluster: &ClusterId,
        request: &DeclareResourceNeedsRequest,
    ) -> Result<(), ComputeClientError> {
        let url = format!("{}/api/v2/compute/{}/resource-needs", self.base_url, cluster);
        let response = self.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        Ok(())
    }

    /// Turn an assignment into a live lease: connect, present the nonce,
    /// wrap the stream in the assigned transport.
    async fn connect(
        &self,
        assignment: AssignComputeResponse,
    ) -> Result<ComputeLease, ComputeClientError> {
        let mut lease = ComputeLease::new(
            assignment.lease_id.clone(),
            assignment.agent_id.clone(),
            assignment.cluster_id.clone(),
            assignment.properties.clone(),
            assignment.assigned_resources.clone(),
        );
        lease.begin_connect();

        match self.establish(&assignment).await {
            Ok(socket) => {
                lease.activate(socket, self.config.keepalive_interval);
                Ok(lease)
            }
            Err(e) => {
                lease.fail();
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        assignment: &AssignComputeResponse,
    ) -> Result<RemoteComputeSocket, ComputeClientError> {
        let target_addr = assignment.agent_address();
        let connection_addr = assignment.connection_address();

        tracing::info!(
            "Assigned agent {} (lease {}), connecting via {} to {}",
            assignment.agent_id,
            assignment.lease_id,
            assignment.connection_mode,
            connection_addr
        );

        let mut stream = self
            .establisher
            .connect(assignment.connection_mode, &target_addr, &connection_addr)
            .await?;

        // The raw nonce bytes go first on every socket, before any
        // encryption handshake, so the agent can correlate the connection
        stream.write_all(assignment.nonce.as_bytes()).await?;
        stream.flush().await?;

        let setup = assignment.encryption_setup()?;
        let transport = establish_client(stream, &setup, &assignment.ip).await?;
        Ok(RemoteComputeSocket::new(transport, assignment.protocol))
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.post(url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn resolve_public_ip(&self) -> Result<IpAddr, ComputeClientError> {
        let url = self.config.public_ip_url.as_deref().ok_or_else(|| {
            ComputeClientError::InvalidResponse(
                "relayed connection requested without a public IP or resolver URL".to_string(),
            )
        })?;

        let text = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        text.trim().parse().map_err(|_| {
            ComputeClientError::InvalidResponse(format!(
                "public IP resolver returned '{}'",
                text.trim()
            ))
        })
    }
}

async fn http_error(response: reqwest::Response) -> ComputeClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ComputeClientError::Http { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    async fn stub_broker(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(base_url: String) -> ServerComputeClient {
        let config = ClientConfig {
            server_url: base_url,
            token: Some("secret-token".to_string()),
            ..ClientConfig::default()
        };
        ServerComputeClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_get_cluster() {
        let app = Router::new().route(
            "/api/v2/compute/_cluster",
            post(|| async {
                Json(GetClusterResponse {
                    cluster_id: ClusterId::from("c-east"),
                })
            }),
        );
        let client = client_for(stub_broker(app).await);

        let cluster = client
            .get_cluster(
                &Requirements::pool("p1"),
                &RequestId::from("r-1"),
                &ConnectionPreferences::default(),
            )
            .await
            .unwrap();
        assert_eq!(cluster.as_str(), "c-east");
    }

    #[tokio::test]
    async fn test_request_id_is_forwarded() {
        let app = Router::new().route(
            "/api/v2/compute/_cluster",
            post(|Json(body): Json<AssignComputeRequest>| async move {
                assert_eq!(body.request_id.as_str(), "r-42");
                Json(GetClusterResponse {
                    cluster_id: ClusterId::from("c-east"),
                })
            }),
        );
        let client = client_for(stub_broker(app).await);

        client
            .get_cluster(
                &Requirements::default(),
                &RequestId::from("r-42"),
                &ConnectionPreferences::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bearer_token_is_attached() {
        let app = Router::new().route(
            "/api/v2/compute/_cluster",
            post(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                assert_eq!(auth, "Bearer secret-token");
                Json(GetClusterResponse {
                    cluster_id: ClusterId::from("c-east"),
                })
            }),
        );
        let client = client_for(stub_broker(app).await);

        client
            .get_cluster(
                &Requirements::default(),
                &RequestId::from("r-1"),
                &ConnectionPreferences::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_404_means_no_agents() {
        let app = Router::new().route(
            "/api/v2/compute",
            post(|| async { (StatusCode::NOT_FOUND, "no agents matched") }),
        );
        let client = client_for(stub_broker(app).await);

        let result = client
            .try_assign_worker(
                None,
                &Requirements::pool("p1"),
                &RequestId::from("r-1"),
                &ConnectionPreferences::default(),
            )
            .await;
        match result {
            Err(ComputeClientError::NoAgentsFound { cluster, .. }) => {
                assert!(cluster.is_none());
            }
            other => panic!("expected NoAgentsFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_503_means_try_later() {
        let app = Router::new().route(
            "/api/v2/compute/:cluster",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "at capacity") }),
        );
        let client = client_for(stub_broker(app).await);

        let lease = client
            .try_assign_worker(
                Some(&ClusterId::from("c-east")),
                &Requirements::default(),
                &RequestId::from("r-1"),
                &ConnectionPreferences::default(),
            )
            .await
            .unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn test_429_means_try_later() {
        let app = Router::new().route(
            "/api/v2/compute",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let client = client_for(stub_broker(app).await);

        let lease = client
            .try_assign_worker(
                None,
                &Requirements::default(),
                &RequestId::from("r-1"),
                &ConnectionPreferences::default(),
            )
            .await
            .unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn test_other_errors_carry_status_and_body() {
        let app = Router::new().route(
            "/api/v2/compute",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "broker exploded") }),
        );
        let client = client_for(stub_broker(app).await);

        let result = client
            .try_assign_worker(
                None,
                &Requirements::default(),
                &RequestId::from("r-1"),
                &ConnectionPreferences::default(),
            )
            .await;
        match result {
            Err(ComputeClientError::Http { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "broker exploded");
            }
            other => panic!("expected Http error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_relay_without_resolver_is_rejected() {
        let app = Router::new();
        let client = client_for(stub_broker(app).await);

        let preferences = ConnectionPreferences {
            mode: Some(ConnectionMode::Relay),
            ..ConnectionPreferences::default()
        };
        let result = client
            .try_assign_worker(
                None,
                &Requirements::default(),
                &RequestId::from("r-1"),
                &preferences,
            )
            .await;
        assert!(matches!(
            result,
            Err(ComputeClientError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_declare_resource_needs() {
        let app = Router::new().route(
            "/api/v2/compute/:cluster/resource-needs",
            post(
                |Json(body): Json<DeclareResourceNeedsRequest>| async move {
                    assert_eq!(body.pool, "p1");
                    StatusCode::OK
                },
            ),
        );
        let client = client_for(stub_broker(app).await);

        let request = DeclareResourceNeedsRequest {
            session_id: "s1".to_string(),
            pool: "p1".to_string(),
            resource_needs: Default::default(),
        };
        client
            .declare_resource_needs(&ClusterId::from("c-east"), &request)
            .await
            .unwrap();
    }
}
