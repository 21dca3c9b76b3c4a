//! Node command channel
//!
//! One live session per node id, superseded on reconnect. Commands are
//! correlated request/response pairs multiplexed over the session's
//! connection; unsolicited frames fan out to admin observers. The registry
//! owns all shared state behind one lock; the lock covers map operations
//! only, while writes and waits happen outside it.

use crate::error::{CommandError, CommandErrorKind, Tolerance};
use portlink_proto::{
    AdminBroadcast, CommandFrame, CommandKind, CommandResponse, CommandResult, Envelope,
    EnvelopeCipher,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Bound on queueing an outbound frame, the analog of a write deadline.
const WRITE_WAIT: Duration = Duration::from_secs(5);
/// Outbound queue depth per session; a slow node times out its own commands
/// without affecting other nodes.
const OUTBOUND_QUEUE: usize = 64;

/// A node's live connection as the registry sees it.
#[derive(Debug, Clone)]
struct NodeSession {
    conn_id: u64,
    secret: String,
    outbound: mpsc::Sender<String>,
}

struct PendingCommand {
    node_id: i64,
    tx: oneshot::Sender<CommandResult>,
}

#[derive(Default)]
struct ChannelState {
    nodes: HashMap<i64, NodeSession>,
    admins: HashMap<u64, mpsc::Sender<String>>,
    pending: HashMap<String, PendingCommand>,
}

/// Registry of node sessions, admin observers and in-flight commands.
pub struct CommandChannel {
    state: Mutex<ChannelState>,
    next_conn_id: AtomicU64,
}

impl CommandChannel {
    pub fn new() -> Self {
        CommandChannel {
            state: Mutex::new(ChannelState::default()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a node session, superseding any previous one for the same id.
    ///
    /// The superseded session's pending commands are force-failed before the
    /// new session becomes visible, and its outbound queue is dropped so the
    /// writer task tears the old connection down.
    pub fn register_node(
        &self,
        node_id: i64,
        secret: impl Into<String>,
        outbound: mpsc::Sender<String>,
    ) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let session = NodeSession {
            conn_id,
            secret: secret.into(),
            outbound,
        };

        let (superseded, failed) = {
            let mut state = self.state.lock().unwrap();
            let failed = Self::drain_pending_for(&mut state, node_id);
            let superseded = state.nodes.insert(node_id, session);
            (superseded, failed)
        };

        if superseded.is_some() {
            debug!(node_id = %node_id, "superseded stale node session");
        }
        // dropping the drained entries closes their result channels; every
        // waiter resolves with a connection-closed failure exactly once
        drop(failed);

        conn_id
    }

    /// Remove a node session, but only if `conn_id` still identifies the
    /// current one (a superseded connection's cleanup must not evict its
    /// replacement). Returns true when the current session was removed.
    pub fn unregister_node(&self, node_id: i64, conn_id: u64) -> bool {
        let (removed, failed) = {
            let mut state = self.state.lock().unwrap();
            match state.nodes.get(&node_id) {
                Some(current) if current.conn_id == conn_id => {
                    state.nodes.remove(&node_id);
                    let failed = Self::drain_pending_for(&mut state, node_id);
                    (true, failed)
                }
                _ => (false, Vec::new()),
            }
        };
        drop(failed);
        removed
    }

    pub fn is_node_online(&self, node_id: i64) -> bool {
        self.state.lock().unwrap().nodes.contains_key(&node_id)
    }

    pub fn online_node_ids(&self) -> Vec<i64> {
        self.state.lock().unwrap().nodes.keys().copied().collect()
    }

    /// Register an admin observer; returns its handle for unregistration.
    pub fn register_admin(&self, sender: mpsc::Sender<String>) -> u64 {
        let admin_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().admins.insert(admin_id, sender);
        admin_id
    }

    pub fn unregister_admin(&self, admin_id: u64) {
        self.state.lock().unwrap().admins.remove(&admin_id);
    }

    /// Send a command and block the caller until exactly one of: response,
    /// timeout, or disconnect.
    pub async fn send_command(
        &self,
        node_id: i64,
        kind: CommandKind,
        data: Value,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let session = {
            let state = self.state.lock().unwrap();
            state.nodes.get(&node_id).cloned()
        };
        let Some(session) = session else {
            return Err(CommandError::offline());
        };

        let request_id = format!("{}_{}", node_id, uuid::Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            state
                .pending
                .insert(request_id.clone(), PendingCommand { node_id, tx });
        }

        let frame = CommandFrame {
            kind: kind.as_str().to_string(),
            data,
            request_id: request_id.clone(),
        };
        let message = match self.seal_frame(&frame, &session.secret) {
            Ok(message) => message,
            Err(err) => {
                self.evict_pending(&request_id);
                return Err(err);
            }
        };

        if session
            .outbound
            .send_timeout(message, WRITE_WAIT)
            .await
            .is_err()
        {
            self.evict_pending(&request_id);
            return Err(CommandError::new(
                CommandErrorKind::WriteFailed,
                "failed to write command to node",
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                if result.success {
                    Ok(result)
                } else {
                    Err(CommandError::rejected(result.message))
                }
            }
            Ok(Err(_)) => Err(CommandError::connection_closed()),
            Err(_) => {
                self.evict_pending(&request_id);
                Err(CommandError::timeout())
            }
        }
    }

    /// Tolerant variant used by idempotent reconciliation: an error the given
    /// tolerance accepts is swallowed and reported as an empty success.
    pub async fn send_tolerant(
        &self,
        node_id: i64,
        kind: CommandKind,
        data: Value,
        timeout: Duration,
        tolerance: Tolerance,
    ) -> Result<CommandResult, CommandError> {
        match self.send_command(node_id, kind, data, timeout).await {
            Ok(result) => Ok(result),
            Err(err) if tolerance.accepts(err.kind) => {
                debug!(node_id = %node_id, command = %kind, error = %err, "tolerated command failure");
                Ok(CommandResult::default())
            }
            Err(err) => Err(err),
        }
    }

    /// Process one inbound frame from a node connection: decrypt, resolve a
    /// pending command if the frame correlates, otherwise fan out to admins.
    pub fn handle_inbound(&self, node_id: i64, payload: &str) {
        let text = self.open_frame(node_id, payload);

        if let Ok(response) = serde_json::from_str::<CommandResponse>(&text) {
            if !response.request_id.trim().is_empty() && self.try_resolve(node_id, response) {
                return;
            }
        }

        let kind = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
        match kind.as_deref() {
            Some("UpgradeProgress") => self.broadcast(node_id, "upgrade_progress", Value::String(text)),
            _ => self.broadcast(node_id, "info", Value::String(text)),
        }
    }

    /// Fail every pending command of a node with a connection-closed error.
    /// Invoked when its connection drops so no caller blocks forever.
    pub fn fail_pending_for_node(&self, node_id: i64) {
        let failed = {
            let mut state = self.state.lock().unwrap();
            Self::drain_pending_for(&mut state, node_id)
        };
        drop(failed);
    }

    /// Broadcast a node's online status to admin observers.
    pub fn broadcast_status(&self, node_id: i64, online: bool) {
        self.broadcast(node_id, "status", Value::from(if online { 1 } else { 0 }));
    }

    fn broadcast(&self, node_id: i64, kind: &str, data: Value) {
        let message = AdminBroadcast {
            id: node_id,
            kind: kind.to_string(),
            data,
        };
        let raw = match serde_json::to_string(&message) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "failed to serialize admin broadcast");
                return;
            }
        };

        let admins: Vec<mpsc::Sender<String>> = {
            let state = self.state.lock().unwrap();
            state.admins.values().cloned().collect()
        };
        for admin in admins {
            // a saturated observer loses telemetry rather than stalling nodes
            if admin.try_send(raw.clone()).is_err() {
                debug!("dropped admin broadcast to saturated observer");
            }
        }
    }

    fn try_resolve(&self, node_id: i64, response: CommandResponse) -> bool {
        let entry = {
            let mut state = self.state.lock().unwrap();
            state.pending.remove(&response.request_id)
        };
        let Some(entry) = entry else {
            return false;
        };

        if entry.node_id != node_id {
            warn!(
                expected = entry.node_id,
                got = node_id,
                "response arrived on the wrong node connection"
            );
            let _ = entry.tx.send(CommandResult {
                kind: response.kind,
                success: false,
                message: "response does not match the requesting node".to_string(),
                data: None,
            });
            return true;
        }

        let _ = entry.tx.send(CommandResult::from(response));
        true
    }

    fn seal_frame(&self, frame: &CommandFrame, secret: &str) -> Result<String, CommandError> {
        let raw = serde_json::to_string(frame).map_err(|err| {
            CommandError::new(CommandErrorKind::Protocol, format!("serialize frame: {err}"))
        })?;
        if secret.trim().is_empty() {
            return Ok(raw);
        }

        let cipher = EnvelopeCipher::new(secret);
        let data = cipher.encrypt(raw.as_bytes()).map_err(|err| {
            CommandError::new(CommandErrorKind::Protocol, format!("encrypt frame: {err}"))
        })?;
        let envelope = Envelope {
            encrypted: true,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        serde_json::to_string(&envelope).map_err(|err| {
            CommandError::new(CommandErrorKind::Protocol, format!("serialize envelope: {err}"))
        })
    }

    /// Decrypt an inbound payload when it is a well-formed envelope and the
    /// node has a secret; anything else passes through unchanged.
    fn open_frame(&self, node_id: i64, payload: &str) -> String {
        let Ok(envelope) = serde_json::from_str::<Envelope>(payload) else {
            return payload.to_string();
        };
        if !envelope.encrypted || envelope.data.trim().is_empty() {
            return payload.to_string();
        }

        let secret = {
            let state = self.state.lock().unwrap();
            state.nodes.get(&node_id).map(|s| s.secret.clone())
        };
        let Some(secret) = secret.filter(|s| !s.trim().is_empty()) else {
            return payload.to_string();
        };

        match EnvelopeCipher::new(&secret).decrypt(&envelope.data) {
            Ok(plain) => String::from_utf8(plain).unwrap_or_else(|_| payload.to_string()),
            Err(err) => {
                warn!(node_id = %node_id, error = %err, "failed to decrypt inbound frame");
                payload.to_string()
            }
        }
    }

    fn evict_pending(&self, request_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(request_id);
    }

    fn drain_pending_for(state: &mut ChannelState, node_id: i64) -> Vec<PendingCommand> {
        let ids: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, entry)| entry.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| state.pending.remove(&id))
            .collect()
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register_test_node(channel: &CommandChannel, node_id: i64) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let conn_id = channel.register_node(node_id, "", tx);
        (conn_id, rx)
    }

    /// Echo a success response for the next outbound frame.
    async fn respond_next(channel: &CommandChannel, node_id: i64, rx: &mut mpsc::Receiver<String>) {
        let raw = rx.recv().await.expect("no outbound frame");
        let frame: CommandFrame = serde_json::from_str(&raw).unwrap();
        let response = json!({
            "type": frame.kind,
            "success": true,
            "message": "",
            "data": {"echo": true},
            "requestId": frame.request_id,
        });
        channel.handle_inbound(node_id, &response.to_string());
    }

    #[tokio::test]
    async fn send_command_to_offline_node_fails_immediately() {
        let channel = CommandChannel::new();
        let err = channel
            .send_command(7, CommandKind::TcpPing, json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::Offline);
    }

    #[tokio::test]
    async fn send_command_resolves_on_matching_response() {
        let channel = CommandChannel::new();
        let (_conn, mut rx) = register_test_node(&channel, 1);

        let send = channel.send_command(1, CommandKind::TcpPing, json!({"ip": "10.0.0.1"}), Duration::from_secs(2));
        let respond = respond_next(&channel, 1, &mut rx);
        let (result, _) = tokio::join!(send, respond);

        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.kind, "TcpPing");
        assert_eq!(result.data.unwrap()["echo"], true);
    }

    #[tokio::test]
    async fn failure_response_surfaces_remote_message() {
        let channel = CommandChannel::new();
        let (_conn, mut rx) = register_test_node(&channel, 1);

        let send = channel.send_command(1, CommandKind::AddService, json!({}), Duration::from_secs(2));
        let respond = async {
            let raw = rx.recv().await.unwrap();
            let frame: CommandFrame = serde_json::from_str(&raw).unwrap();
            channel.handle_inbound(
                1,
                &json!({
                    "type": frame.kind,
                    "success": false,
                    "message": "service already exists",
                    "requestId": frame.request_id,
                })
                .to_string(),
            );
        };
        let (result, _) = tokio::join!(send, respond);

        let err = result.unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::AlreadyExists);
        assert_eq!(err.message, "service already exists");
    }

    #[tokio::test]
    async fn timeout_evicts_pending_and_ignores_late_response() {
        let channel = CommandChannel::new();
        let (_conn, mut rx) = register_test_node(&channel, 1);

        let err = channel
            .send_command(1, CommandKind::TcpPing, json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::Timeout);

        // late response must not resolve anything or panic
        let raw = rx.recv().await.unwrap();
        let frame: CommandFrame = serde_json::from_str(&raw).unwrap();
        channel.handle_inbound(
            1,
            &json!({"type": "TcpPing", "success": true, "requestId": frame.request_id}).to_string(),
        );
        assert!(channel.state.lock().unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_all_pending_for_that_node_only() {
        let channel = CommandChannel::new();
        let (conn_a, _rx_a) = register_test_node(&channel, 1);
        let (_conn_b, mut rx_b) = register_test_node(&channel, 2);

        let send_a = channel.send_command(1, CommandKind::TcpPing, json!({}), Duration::from_secs(5));
        let send_b = channel.send_command(2, CommandKind::TcpPing, json!({}), Duration::from_secs(5));
        let drive = async {
            // wait for node 1's frame to be queued, then drop its session
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(channel.unregister_node(1, conn_a));
            respond_next(&channel, 2, &mut rx_b).await;
        };
        let (result_a, result_b, _) = tokio::join!(send_a, send_b, drive);

        assert_eq!(result_a.unwrap_err().kind, CommandErrorKind::ConnectionClosed);
        assert!(result_b.unwrap().success);
    }

    #[tokio::test]
    async fn supersede_fails_old_pending_before_new_session_serves() {
        let channel = CommandChannel::new();
        let (old_conn, _old_rx) = register_test_node(&channel, 1);

        let send = channel.send_command(1, CommandKind::TcpPing, json!({}), Duration::from_secs(5));
        let supersede = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
            channel.register_node(1, "", tx);
            rx
        };
        let (result, _new_rx) = tokio::join!(send, supersede);

        assert_eq!(result.unwrap_err().kind, CommandErrorKind::ConnectionClosed);

        // the stale connection's cleanup must not evict the replacement
        assert!(!channel.unregister_node(1, old_conn));
        assert!(channel.is_node_online(1));
    }

    #[tokio::test]
    async fn tolerant_send_swallows_not_found_on_teardown() {
        let channel = CommandChannel::new();
        let (_conn, mut rx) = register_test_node(&channel, 1);

        let send = channel.send_tolerant(
            1,
            CommandKind::DeleteService,
            json!({"services": ["svc_9"]}),
            Duration::from_secs(2),
            Tolerance::NOT_FOUND,
        );
        let respond = async {
            let raw = rx.recv().await.unwrap();
            let frame: CommandFrame = serde_json::from_str(&raw).unwrap();
            channel.handle_inbound(
                1,
                &json!({
                    "type": frame.kind,
                    "success": false,
                    "message": "service svc_9 not found",
                    "requestId": frame.request_id,
                })
                .to_string(),
            );
        };
        let (result, _) = tokio::join!(send, respond);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn encrypted_round_trip_with_node_secret() {
        let channel = CommandChannel::new();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
        channel.register_node(5, "shared-secret", tx);

        let send = channel.send_command(5, CommandKind::TcpPing, json!({"port": 443}), Duration::from_secs(2));
        let respond = async {
            let raw = rx.recv().await.unwrap();
            let envelope: Envelope = serde_json::from_str(&raw).expect("frame must be enveloped");
            assert!(envelope.encrypted);

            let cipher = EnvelopeCipher::new("shared-secret");
            let plain = cipher.decrypt(&envelope.data).unwrap();
            let frame: CommandFrame = serde_json::from_slice(&plain).unwrap();
            assert_eq!(frame.kind, "TcpPing");

            let response = json!({
                "type": "TcpPing",
                "success": true,
                "requestId": frame.request_id,
            });
            let sealed = Envelope {
                encrypted: true,
                data: cipher.encrypt(response.to_string().as_bytes()).unwrap(),
                timestamp: 0,
            };
            channel.handle_inbound(5, &serde_json::to_string(&sealed).unwrap());
        };
        let (result, _) = tokio::join!(send, respond);
        assert!(result.unwrap().success);
    }

    #[tokio::test]
    async fn unsolicited_frames_fan_out_to_admins() {
        let channel = CommandChannel::new();
        register_test_node(&channel, 3);
        let (admin_tx, mut admin_rx) = mpsc::channel(8);
        let admin_id = channel.register_admin(admin_tx);

        channel.handle_inbound(3, r#"{"type":"SystemInfo","data":{"cpu":12}}"#);
        let raw = admin_rx.recv().await.unwrap();
        let broadcast: AdminBroadcast = serde_json::from_str(&raw).unwrap();
        assert_eq!(broadcast.id, 3);
        assert_eq!(broadcast.kind, "info");

        channel.handle_inbound(3, r#"{"type":"UpgradeProgress","data":{"pct":40}}"#);
        let raw = admin_rx.recv().await.unwrap();
        let broadcast: AdminBroadcast = serde_json::from_str(&raw).unwrap();
        assert_eq!(broadcast.kind, "upgrade_progress");

        channel.unregister_admin(admin_id);
        channel.broadcast_status(3, false);
        assert!(admin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn response_on_wrong_node_connection_fails_the_waiter() {
        let channel = CommandChannel::new();
        let (_conn_a, mut rx_a) = register_test_node(&channel, 1);
        register_test_node(&channel, 2);

        let send = channel.send_command(1, CommandKind::TcpPing, json!({}), Duration::from_secs(2));
        let respond = async {
            let raw = rx_a.recv().await.unwrap();
            let frame: CommandFrame = serde_json::from_str(&raw).unwrap();
            // response delivered over node 2's connection
            channel.handle_inbound(
                2,
                &json!({"type": "TcpPing", "success": true, "requestId": frame.request_id}).to_string(),
            );
        };
        let (result, _) = tokio::join!(send, respond);
        assert!(result.unwrap_err().message.contains("does not match"));
    }
}
