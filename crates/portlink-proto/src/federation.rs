//! Federation protocol bodies
//!
//! The federation protocol lets one control plane lease a port and a
//! forwarding role on a node owned by another control plane. All endpoints
//! are bearer-token authenticated POSTs returning `{code, msg, data}` with
//! `code = 0` on success.

use serde::{Deserialize, Serialize};

/// Standard response envelope of the federation endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

/// Node descriptor returned by `connect`: what the remote panel shares with
/// us, including the quota and port-range metadata we persist locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNodeDescriptor {
    pub share_id: i64,
    #[serde(default)]
    pub share_name: String,
    pub node_id: i64,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub server_ip: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub max_bandwidth: i64,
    #[serde(default)]
    pub current_flow: i64,
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub port_range_start: u16,
    #[serde(default)]
    pub port_range_end: u16,
}

/// Ask the remote panel to stand up a direct-forward tunnel on its shared
/// node (entry port in the share's range, forwarding to `target`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTunnelRequest {
    pub protocol: String,
    pub remote_port: u16,
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTunnelResponse {
    pub tunnel_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservePortRequest {
    pub resource_key: String,
    pub protocol: String,
    pub requested_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservePortResponse {
    pub reservation_id: String,
    #[serde(default)]
    pub binding_id: String,
    pub allocated_port: u16,
}

/// One downstream address a middle node must forward to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialTarget {
    pub host: String,
    pub port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRoleRequest {
    pub reservation_id: String,
    pub resource_key: String,
    /// "exit" or "middle"
    pub role: String,
    pub protocol: String,
    pub strategy: String,
    #[serde(default)]
    pub targets: Vec<DialTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRoleResponse {
    pub binding_id: String,
    #[serde(default)]
    pub reservation_id: String,
    #[serde(default)]
    pub allocated_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRoleRequest {
    #[serde(default)]
    pub binding_id: String,
    #[serde(default)]
    pub reservation_id: String,
    #[serde(default)]
    pub resource_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnoseRequest {
    pub ip: String,
    pub port: u16,
    pub count: u32,
    pub timeout: u64,
}
