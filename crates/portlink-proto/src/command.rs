//! Agent command frames
//!
//! Every request to an agent is one JSON frame `{type, data, requestId}`;
//! agents answer with `{type, success, message, data, requestId}`. Frames to
//! and from nodes that carry a shared secret are wrapped in an [`Envelope`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command types understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    AddChains,
    DeleteChains,
    AddService,
    UpdateService,
    DeleteService,
    PauseService,
    ResumeService,
    SetProtocol,
    AddLimiters,
    DeleteLimiters,
    TcpPing,
    UpgradeAgent,
    RollbackAgent,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::AddChains => "AddChains",
            CommandKind::DeleteChains => "DeleteChains",
            CommandKind::AddService => "AddService",
            CommandKind::UpdateService => "UpdateService",
            CommandKind::DeleteService => "DeleteService",
            CommandKind::PauseService => "PauseService",
            CommandKind::ResumeService => "ResumeService",
            CommandKind::SetProtocol => "SetProtocol",
            CommandKind::AddLimiters => "AddLimiters",
            CommandKind::DeleteLimiters => "DeleteLimiters",
            CommandKind::TcpPing => "TcpPing",
            CommandKind::UpgradeAgent => "UpgradeAgent",
            CommandKind::RollbackAgent => "RollbackAgent",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound request frame.
///
/// `data` is deliberately untyped: chain/service/limiter configurations are
/// open-ended documents the agent interprets, not something the panel models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

/// Inbound response frame as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "requestId", default)]
    pub request_id: String,
}

/// Result delivered to a `send_command` caller.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub kind: String,
    pub success: bool,
    pub message: String,
    pub data: Option<Value>,
}

impl From<CommandResponse> for CommandResult {
    fn from(resp: CommandResponse) -> Self {
        CommandResult {
            kind: resp.kind,
            success: resp.success,
            message: resp.message,
            data: resp.data,
        }
    }
}

/// Encrypted wrapper around a plain frame.
///
/// `data` is base64 ciphertext of the serialized frame. Frames that do not
/// parse as an envelope (or with `encrypted: false`) pass through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub encrypted: bool,
    pub data: String,
    pub timestamp: i64,
}

/// Telemetry fanned out to admin observer connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminBroadcast {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_wire_shape() {
        let frame = CommandFrame {
            kind: CommandKind::AddService.as_str().to_string(),
            data: serde_json::json!({"services": ["svc_1"]}),
            request_id: "7_abc".to_string(),
        };
        let raw = serde_json::to_value(&frame).unwrap();
        assert_eq!(raw["type"], "AddService");
        assert_eq!(raw["requestId"], "7_abc");
        assert_eq!(raw["data"]["services"][0], "svc_1");
    }

    #[test]
    fn response_defaults_tolerate_sparse_frames() {
        let resp: CommandResponse = serde_json::from_str(r#"{"requestId":"1_x"}"#).unwrap();
        assert_eq!(resp.request_id, "1_x");
        assert!(!resp.success);
        assert!(resp.message.is_empty());
        assert!(resp.data.is_none());
    }

    #[test]
    fn envelope_rejects_plain_frames() {
        let err = serde_json::from_str::<Envelope>(r#"{"type":"TcpPing","data":{}}"#);
        assert!(err.is_err());
    }
}
