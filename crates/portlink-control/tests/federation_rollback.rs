//! Federation partial-failure rollback
//!
//! Runs the orchestrator against a fake peer panel: the second remote hop's
//! apply-role fails, and the first hop's lease must be released before the
//! error surfaces.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use portlink_control::topology::{TopologyNode, TunnelTopology};
use portlink_control::{CommandChannel, IpPreference, Orchestrator, TopologyError, TunnelKind};
use portlink_db::entities::{chain_node, node};
use portlink_db::{connect, migrate};
use portlink_federation::FederationClient;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct PeerState {
    reserve_count: AtomicUsize,
    apply_count: AtomicUsize,
    released_keys: Mutex<Vec<String>>,
}

async fn reserve_port(State(state): State<Arc<PeerState>>, Json(_): Json<Value>) -> Json<Value> {
    let n = state.reserve_count.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "code": 0,
        "msg": "",
        "data": {
            "reservationId": format!("res-{n}"),
            "bindingId": "",
            "allocatedPort": 40000 + n as u16,
        }
    }))
}

async fn apply_role(State(state): State<Arc<PeerState>>, Json(body): Json<Value>) -> Json<Value> {
    let n = state.apply_count.fetch_add(1, Ordering::SeqCst);
    if n >= 1 {
        return Json(json!({ "code": -1, "msg": "runtime apply rejected" }));
    }
    Json(json!({
        "code": 0,
        "msg": "",
        "data": {
            "bindingId": format!("bind-{}", body["resourceKey"].as_str().unwrap_or("")),
            "reservationId": body["reservationId"],
            "allocatedPort": 0,
        }
    }))
}

async fn release_role(State(state): State<Arc<PeerState>>, Json(body): Json<Value>) -> Json<Value> {
    let key = body["resourceKey"].as_str().unwrap_or("").to_string();
    state.released_keys.lock().unwrap().push(key);
    Json(json!({ "code": 0, "msg": "" }))
}

async fn spawn_fake_peer(state: Arc<PeerState>) -> String {
    let router = Router::new()
        .route("/api/v1/federation/runtime/reserve-port", post(reserve_port))
        .route("/api/v1/federation/runtime/apply-role", post(apply_role))
        .route("/api/v1/federation/runtime/release-role", post(release_role))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn make_node(id: i64, name: &str, v4: &str, remote_url: Option<&str>) -> node::Model {
    let now = Utc::now();
    node::Model {
        id,
        name: name.to_string(),
        secret: String::new(),
        server_addr: String::new(),
        server_addr_v4: Some(v4.to_string()),
        server_addr_v6: None,
        port_range: "1000-65535".to_string(),
        tcp_listen_addr: "[::]".to_string(),
        udp_listen_addr: "[::]".to_string(),
        interface_name: None,
        version: None,
        http: 0,
        tls: 0,
        socks: 0,
        status: 1,
        is_remote: remote_url.is_some(),
        remote_url: remote_url.map(str::to_string),
        remote_token: remote_url.map(|_| "peer-token".to_string()),
        remote_config: None,
        sort_index: 0,
        created_at: now,
        updated_at: now,
    }
}

fn element(node_id: i64, chain_role: i32, hop_index: i32, port: u16) -> TopologyNode {
    TopologyNode {
        node_id,
        chain_role,
        hop_index,
        port,
        protocol: "tls".to_string(),
        strategy: "round".to_string(),
    }
}

#[tokio::test]
async fn apply_failure_on_second_hop_releases_the_first_lease() {
    let peer = Arc::new(PeerState {
        reserve_count: AtomicUsize::new(0),
        apply_count: AtomicUsize::new(0),
        released_keys: Mutex::new(Vec::new()),
    });
    let peer_url = spawn_fake_peer(peer.clone()).await;

    let mut nodes = HashMap::new();
    nodes.insert(1, make_node(1, "entry", "10.0.0.1", None));
    nodes.insert(21, make_node(21, "hop-a", "10.0.0.21", Some(&peer_url)));
    nodes.insert(22, make_node(22, "hop-b", "10.0.0.22", Some(&peer_url)));
    nodes.insert(3, make_node(3, "exit", "10.0.0.3", None));

    let mut topology = TunnelTopology {
        tunnel_id: 42,
        kind: TunnelKind::Chained,
        ip_preference: IpPreference::Auto,
        entries: vec![element(1, chain_node::ROLE_ENTRY, 0, 0)],
        hops: vec![
            vec![element(21, chain_node::ROLE_HOP, 1, 0)],
            vec![element(22, chain_node::ROLE_HOP, 2, 0)],
        ],
        exits: vec![element(3, chain_node::ROLE_EXIT, 0, 43000)],
        nodes,
    };

    let db = connect("sqlite::memory:").await.unwrap();
    migrate(&db).await.unwrap();
    let orchestrator = Orchestrator::new(
        db,
        Arc::new(CommandChannel::new()),
        FederationClient::new(),
        "panel.example.com",
    );

    let err = orchestrator
        .apply_federation_runtime(&mut topology)
        .await
        .unwrap_err();
    assert!(matches!(err, TopologyError::Federation { .. }));
    assert!(err.to_string().contains("runtime apply rejected"));

    // hops are leased last-to-first, so hop-b (hop 2) succeeded first and
    // its lease must have been released when hop-a's apply failed
    let released = peer.released_keys.lock().unwrap().clone();
    let hop_b_key = "tunnel:42:node:22:type:2:hop:2";
    assert!(
        released.iter().any(|key| key == hop_b_key),
        "expected {hop_b_key} to be released, got {released:?}"
    );
}
