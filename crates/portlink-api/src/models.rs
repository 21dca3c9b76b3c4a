//! Typed request and response bodies
//!
//! Every endpoint has a named request struct; the only untyped payloads in
//! the system are the agent-bound configuration documents. Responses use the
//! `{code, msg, data}` envelope with HTTP 200 throughout, the same envelope
//! the federation protocol speaks.

use axum::Json;
use portlink_control::NodeSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CODE_OK: i32 = 0;
pub const CODE_ERR: i32 = -1;
pub const CODE_INTERNAL: i32 = -2;
pub const CODE_UNAUTHORIZED: i32 = 401;
pub const CODE_FORBIDDEN: i32 = 403;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    pub fn ok(data: impl Serialize) -> Json<ApiResponse> {
        Json(ApiResponse {
            code: CODE_OK,
            msg: String::new(),
            data: serde_json::to_value(data).ok(),
        })
    }

    pub fn ok_empty() -> Json<ApiResponse> {
        Json(ApiResponse {
            code: CODE_OK,
            msg: String::new(),
            data: None,
        })
    }

    /// A user-visible failure (validation, topology, remote rejection).
    pub fn err(msg: impl Into<String>) -> Json<ApiResponse> {
        Json(ApiResponse {
            code: CODE_ERR,
            msg: msg.into(),
            data: None,
        })
    }

    /// Internal/database failures get a distinct generic code.
    pub fn internal(msg: impl Into<String>) -> Json<ApiResponse> {
        Json(ApiResponse {
            code: CODE_INTERNAL,
            msg: msg.into(),
            data: None,
        })
    }

    pub fn with_code(code: i32, msg: impl Into<String>) -> Json<ApiResponse> {
        Json(ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdRequest {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub success_count: usize,
    pub fail_count: usize,
}

// ---------------------------------------------------------------------------
// tunnels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelCreateRequest {
    pub name: String,
    /// 1 = direct forward, 2 = chained
    #[serde(default = "default_tunnel_kind")]
    pub kind: i32,
    #[serde(default)]
    pub ip_preference: Option<String>,
    #[serde(default)]
    pub status: Option<i32>,
    /// Entry address summary override; derived from entry nodes when empty
    #[serde(default)]
    pub entry_ip: Option<String>,
    #[serde(default)]
    pub entries: Vec<NodeSpec>,
    #[serde(default)]
    pub hops: Vec<Vec<NodeSpec>>,
    #[serde(default)]
    pub exits: Vec<NodeSpec>,
}

fn default_tunnel_kind() -> i32 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelUpdateRequest {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_tunnel_kind")]
    pub kind: i32,
    #[serde(default)]
    pub ip_preference: Option<String>,
    #[serde(default)]
    pub status: Option<i32>,
    #[serde(default)]
    pub entries: Vec<NodeSpec>,
    #[serde(default)]
    pub hops: Vec<Vec<NodeSpec>>,
    #[serde(default)]
    pub exits: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDiagnoseRequest {
    pub tunnel_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelLimiterRequest {
    pub tunnel_id: i64,
    pub limiter_id: i64,
    /// Mbit/s
    #[serde(default)]
    pub speed: i64,
}

// ---------------------------------------------------------------------------
// forwards
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardCreateRequest {
    pub name: String,
    pub tunnel_id: i64,
    pub remote_addr: String,
    #[serde(default)]
    pub strategy: Option<String>,
    /// Explicit ingress port; 0 allocates one
    #[serde(default)]
    pub in_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardUpdateRequest {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tunnel_id: Option<i64>,
    #[serde(default)]
    pub remote_addr: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub in_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardDiagnoseRequest {
    pub forward_id: i64,
}

// ---------------------------------------------------------------------------
// nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCreateRequest {
    pub name: String,
    pub server_addr: String,
    #[serde(default)]
    pub server_addr_v4: Option<String>,
    #[serde(default)]
    pub server_addr_v6: Option<String>,
    #[serde(default)]
    pub port_range: Option<String>,
    #[serde(default)]
    pub tcp_listen_addr: Option<String>,
    #[serde(default)]
    pub udp_listen_addr: Option<String>,
    #[serde(default)]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub http: Option<i32>,
    #[serde(default)]
    pub tls: Option<i32>,
    #[serde(default)]
    pub socks: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdateRequest {
    pub id: i64,
    pub name: String,
    pub server_addr: String,
    #[serde(default)]
    pub server_addr_v4: Option<String>,
    #[serde(default)]
    pub server_addr_v6: Option<String>,
    #[serde(default)]
    pub port_range: Option<String>,
    #[serde(default)]
    pub tcp_listen_addr: Option<String>,
    #[serde(default)]
    pub udp_listen_addr: Option<String>,
    #[serde(default)]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub http: Option<i32>,
    #[serde(default)]
    pub tls: Option<i32>,
    #[serde(default)]
    pub socks: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeImportRequest {
    pub remote_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpgradeRequest {
    pub ids: Vec<i64>,
    pub download_url: String,
    pub checksum_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpgradeOutcome {
    pub id: i64,
    pub success: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// peer shares (federation serving side)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerShareCreateRequest {
    pub name: String,
    pub node_id: i64,
    #[serde(default)]
    pub max_bandwidth: i64,
    /// Unix millis; 0 = never expires
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub port_range_start: i32,
    #[serde(default)]
    pub port_range_end: i32,
    #[serde(default)]
    pub allowed_domains: Option<String>,
    #[serde(default)]
    pub allowed_ips: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerShareUpdateRequest {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub max_bandwidth: i64,
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub port_range_start: i32,
    #[serde(default)]
    pub port_range_end: i32,
    #[serde(default)]
    pub allowed_domains: Option<String>,
    #[serde(default)]
    pub allowed_ips: Option<String>,
}
