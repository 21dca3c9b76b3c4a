//! Federation HTTP client
//!
//! Drives the runtime lease protocol against a remote control plane: exchange
//! a share token for a node descriptor, reserve a port, apply a forwarding
//! role, release both, and run a live reachability probe. Quota and expiry
//! enforcement happen on the remote side and surface here as ordinary errors.

use portlink_proto::federation::{
    ApiEnvelope, ApplyRoleRequest, ApplyRoleResponse, DiagnoseRequest, ReleaseRoleRequest,
    RemoteNodeDescriptor, RemoteTunnelRequest, RemoteTunnelResponse, ReservePortRequest,
    ReservePortResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("remote request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("remote api error: {0}")]
    Api(String),
    #[error("remote api error: empty payload")]
    EmptyPayload,
}

/// Client for one-or-many remote panels; connection pooling is reqwest's.
#[derive(Debug, Clone)]
pub struct FederationClient {
    client: reqwest::Client,
}

impl FederationClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        FederationClient { client }
    }

    /// Exchange a share token for the remote node descriptor.
    pub async fn connect(
        &self,
        url: &str,
        token: &str,
        local_domain: &str,
    ) -> Result<RemoteNodeDescriptor, FederationError> {
        self.post(url, token, local_domain, "/api/v1/federation/connect", &Value::Null)
            .await
    }

    /// Stand up a direct-forward tunnel on the remote share's node.
    pub async fn create_tunnel(
        &self,
        url: &str,
        token: &str,
        local_domain: &str,
        req: &RemoteTunnelRequest,
    ) -> Result<RemoteTunnelResponse, FederationError> {
        self.post(url, token, local_domain, "/api/v1/federation/tunnel/create", req)
            .await
    }

    /// Reserve a port on the remote share. Idempotent per resource key.
    pub async fn reserve_port(
        &self,
        url: &str,
        token: &str,
        local_domain: &str,
        req: &ReservePortRequest,
    ) -> Result<ReservePortResponse, FederationError> {
        self.post(url, token, local_domain, "/api/v1/federation/runtime/reserve-port", req)
            .await
    }

    /// Apply an exit/middle role to a reservation.
    pub async fn apply_role(
        &self,
        url: &str,
        token: &str,
        local_domain: &str,
        req: &ApplyRoleRequest,
    ) -> Result<ApplyRoleResponse, FederationError> {
        self.post(url, token, local_domain, "/api/v1/federation/runtime/apply-role", req)
            .await
    }

    /// Release a binding and its reservation. Callers on rollback paths
    /// swallow the error; the remote treats repeated releases as success.
    pub async fn release_role(
        &self,
        url: &str,
        token: &str,
        local_domain: &str,
        req: &ReleaseRoleRequest,
    ) -> Result<(), FederationError> {
        let _: Value = self
            .post(url, token, local_domain, "/api/v1/federation/runtime/release-role", req)
            .await?;
        Ok(())
    }

    /// Run a TCP reachability probe from the remote node.
    pub async fn diagnose(
        &self,
        url: &str,
        token: &str,
        local_domain: &str,
        req: &DiagnoseRequest,
    ) -> Result<Value, FederationError> {
        let data: Value = self
            .post(url, token, local_domain, "/api/v1/federation/runtime/diagnose", req)
            .await?;
        if data.is_null() {
            return Err(FederationError::EmptyPayload);
        }
        Ok(data)
    }

    async fn post<B: Serialize, T: DeserializeOwned + Default>(
        &self,
        url: &str,
        token: &str,
        local_domain: &str,
        path: &str,
        body: &B,
    ) -> Result<T, FederationError> {
        let base = url.trim_end_matches('/');
        let mut request = self
            .client
            .post(format!("{base}{path}"))
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .json(body);
        if !local_domain.is_empty() {
            request = request.header("X-Panel-Domain", local_domain);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(FederationError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ApiEnvelope<T> = response.json().await?;
        if envelope.code != 0 {
            return Err(FederationError::Api(envelope.msg));
        }
        Ok(envelope.data.unwrap_or_default())
    }
}

impl Default for FederationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_peer(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn reserve_port_decodes_success_envelope() {
        let url = spawn_peer(Router::new().route(
            "/api/v1/federation/runtime/reserve-port",
            post(|| async {
                Json(json!({
                    "code": 0,
                    "msg": "",
                    "data": {"reservationId": "r-9", "allocatedPort": 30002, "bindingId": ""}
                }))
            }),
        ))
        .await;

        let client = FederationClient::new();
        let res = client
            .reserve_port(
                &url,
                "token",
                "panel.example.com",
                &ReservePortRequest {
                    resource_key: "tunnel:1:node:2:type:3:hop:0".into(),
                    protocol: "tls".into(),
                    requested_port: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(res.reservation_id, "r-9");
        assert_eq!(res.allocated_port, 30002);
    }

    #[tokio::test]
    async fn nonzero_code_surfaces_remote_message() {
        let url = spawn_peer(Router::new().route(
            "/api/v1/federation/runtime/reserve-port",
            post(|| async { Json(json!({"code": 403, "msg": "Share traffic limit exceeded"})) }),
        ))
        .await;

        let client = FederationClient::new();
        let err = client
            .reserve_port(
                &url,
                "token",
                "",
                &ReservePortRequest {
                    resource_key: "rk".into(),
                    protocol: "tls".into(),
                    requested_port: 0,
                },
            )
            .await
            .unwrap_err();
        match err {
            FederationError::Api(msg) => assert_eq!(msg, "Share traffic limit exceeded"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn http_error_carries_status_and_body() {
        let url = spawn_peer(Router::new()).await;

        let client = FederationClient::new();
        let err = client.connect(&url, "token", "").await.unwrap_err();
        match err {
            FederationError::Http { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error: {other}"),
        }
    }
}
