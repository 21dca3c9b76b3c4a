//! Federation serving-side contract tests
//!
//! Drives the runtime lease endpoints through the router against an
//! in-memory database, the way a peer panel would call them.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use portlink_api::models::ApiResponse;
use portlink_api::{build_router, AppState};
use portlink_control::{CommandChannel, Orchestrator};
use portlink_db::entities::{chain_node, forward_port, node, peer_share, peer_share_runtime};
use portlink_db::{connect, migrate};
use portlink_federation::FederationClient;
use sea_orm::{ActiveModelTrait, DatabaseConnection, NotSet, Set};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_state() -> Arc<AppState> {
    let db = connect("sqlite::memory:").await.expect("connect");
    migrate(&db).await.expect("migrate");

    let channel = Arc::new(CommandChannel::new());
    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        channel.clone(),
        FederationClient::new(),
        "panel.example.com",
    ));
    Arc::new(AppState::new(db, channel, orchestrator, "test-jwt-secret"))
}

async fn insert_test_node(db: &DatabaseConnection) -> i64 {
    let now = Utc::now();
    node::ActiveModel {
        id: NotSet,
        name: Set("shared".to_string()),
        secret: Set("shared-secret".to_string()),
        server_addr: Set("10.0.0.9".to_string()),
        server_addr_v4: Set(Some("10.0.0.9".to_string())),
        server_addr_v6: Set(None),
        port_range: Set("1000-65535".to_string()),
        tcp_listen_addr: Set("[::]".to_string()),
        udp_listen_addr: Set("[::]".to_string()),
        interface_name: Set(None),
        version: Set(None),
        http: Set(0),
        tls: Set(0),
        socks: Set(0),
        status: Set(1),
        is_remote: Set(false),
        remote_url: Set(None),
        remote_token: Set(None),
        remote_config: Set(None),
        sort_index: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert node")
    .id
}

async fn insert_share(
    db: &DatabaseConnection,
    node_id: i64,
    token: &str,
    range: (i32, i32),
    max_bandwidth: i64,
    current_flow: i64,
) -> i64 {
    let now = Utc::now();
    peer_share::ActiveModel {
        id: NotSet,
        name: Set("share".to_string()),
        node_id: Set(node_id),
        token: Set(token.to_string()),
        max_bandwidth: Set(max_bandwidth),
        current_flow: Set(current_flow),
        expiry_at: Set(None),
        port_range_start: Set(range.0),
        port_range_end: Set(range.1),
        is_active: Set(true),
        allowed_domains: Set(None),
        allowed_ips: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert share")
    .id
}

async fn post_json(
    state: &Arc<AppState>,
    path: &str,
    token: &str,
    body: Value,
) -> (StatusCode, ApiResponse) {
    let router = build_router(state.clone());
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("Authorization", format!("Bearer {token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let payload: ApiResponse = serde_json::from_slice(&bytes).unwrap();
    (status, payload)
}

#[tokio::test]
async fn reserve_port_skips_committed_and_reserved_ports() {
    let state = setup_state().await;
    let node_id = insert_test_node(&state.db).await;
    let share_id = insert_share(&state.db, node_id, "share-token", (3000, 3004), 0, 0).await;

    // 3000 held by a chain row, 3001 by a forward port, 3002 by another
    // active reservation on the same share
    chain_node::ActiveModel {
        id: NotSet,
        tunnel_id: Set(1),
        chain_role: Set(chain_node::ROLE_HOP),
        node_id: Set(node_id),
        hop_index: Set(1),
        port: Set(Some(3000)),
        protocol: Set("tls".to_string()),
        strategy: Set("round".to_string()),
    }
    .insert(&state.db)
    .await
    .unwrap();
    forward_port::ActiveModel {
        id: NotSet,
        forward_id: Set(1),
        node_id: Set(node_id),
        port: Set(3001),
    }
    .insert(&state.db)
    .await
    .unwrap();
    let now = Utc::now();
    peer_share_runtime::ActiveModel {
        id: NotSet,
        share_id: Set(share_id),
        node_id: Set(node_id),
        reservation_id: Set("res-1".to_string()),
        resource_key: Set("rk-1".to_string()),
        binding_id: Set("b-1".to_string()),
        role: Set("exit".to_string()),
        chain_name: Set(String::new()),
        service_name: Set("fed_svc_1".to_string()),
        protocol: Set("tls".to_string()),
        strategy: Set("round".to_string()),
        port: Set(3002),
        target: Set(String::new()),
        applied: Set(true),
        status: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&state.db)
    .await
    .unwrap();

    let (status, payload) = post_json(
        &state,
        "/api/v1/federation/runtime/reserve-port",
        "share-token",
        json!({
            "resourceKey": "tunnel:1:node:1:type:3:hop:0",
            "protocol": "tls",
            "requestedPort": 0,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.code, 0, "unexpected: {}", payload.msg);
    let data = payload.data.unwrap();
    assert_eq!(data["allocatedPort"], 3003);

    // explicitly requesting the busy 3001 must fail
    let (_, payload) = post_json(
        &state,
        "/api/v1/federation/runtime/reserve-port",
        "share-token",
        json!({
            "resourceKey": "tunnel:1:node:1:type:2:hop:1",
            "protocol": "tls",
            "requestedPort": 3001,
        }),
    )
    .await;
    assert_eq!(payload.code, -1);
    assert_eq!(payload.msg, "No available port");
}

#[tokio::test]
async fn reserve_port_is_idempotent_per_resource_key() {
    let state = setup_state().await;
    let node_id = insert_test_node(&state.db).await;
    insert_share(&state.db, node_id, "share-token", (30000, 30010), 0, 0).await;

    let body = json!({
        "resourceKey": "tunnel:5:node:2:type:3:hop:0",
        "protocol": "tls",
        "requestedPort": 0,
    });
    let (_, first) = post_json(
        &state,
        "/api/v1/federation/runtime/reserve-port",
        "share-token",
        body.clone(),
    )
    .await;
    let (_, second) = post_json(
        &state,
        "/api/v1/federation/runtime/reserve-port",
        "share-token",
        body,
    )
    .await;

    let first = first.data.unwrap();
    let second = second.data.unwrap();
    assert_eq!(first["reservationId"], second["reservationId"]);
    assert_eq!(first["allocatedPort"], second["allocatedPort"]);
}

#[tokio::test]
async fn reserve_port_rejects_when_share_flow_exceeded() {
    let state = setup_state().await;
    let node_id = insert_test_node(&state.db).await;
    insert_share(&state.db, node_id, "limited-token", (30000, 30010), 2048, 2048).await;

    let (status, payload) = post_json(
        &state,
        "/api/v1/federation/runtime/reserve-port",
        "limited-token",
        json!({
            "resourceKey": "tunnel:1:node:1:type:3:hop:0",
            "protocol": "tls",
            "requestedPort": 0,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.code, 403);
    assert_eq!(payload.msg, "Share traffic limit exceeded");
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let state = setup_state().await;
    let node_id = insert_test_node(&state.db).await;
    insert_share(&state.db, node_id, "good-token", (30000, 30010), 0, 0).await;

    let (status, payload) = post_json(
        &state,
        "/api/v1/federation/runtime/reserve-port",
        "bad-token",
        json!({ "resourceKey": "rk", "protocol": "tls", "requestedPort": 0 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.code, 401);
}

#[tokio::test]
async fn release_role_is_idempotent() {
    let state = setup_state().await;
    let node_id = insert_test_node(&state.db).await;
    insert_share(&state.db, node_id, "share-token", (30000, 30010), 0, 0).await;

    let (_, reserved) = post_json(
        &state,
        "/api/v1/federation/runtime/reserve-port",
        "share-token",
        json!({
            "resourceKey": "tunnel:9:node:3:type:3:hop:0",
            "protocol": "tls",
            "requestedPort": 0,
        }),
    )
    .await;
    let reservation_id = reserved.data.unwrap()["reservationId"]
        .as_str()
        .unwrap()
        .to_string();

    let release_body = json!({ "reservationId": reservation_id });
    let (_, first) = post_json(
        &state,
        "/api/v1/federation/runtime/release-role",
        "share-token",
        release_body.clone(),
    )
    .await;
    assert_eq!(first.code, 0);

    // re-releasing (and releasing something unknown) must stay a success
    let (_, second) = post_json(
        &state,
        "/api/v1/federation/runtime/release-role",
        "share-token",
        release_body,
    )
    .await;
    assert_eq!(second.code, 0);

    let (_, unknown) = post_json(
        &state,
        "/api/v1/federation/runtime/release-role",
        "share-token",
        json!({ "resourceKey": "never-reserved" }),
    )
    .await;
    assert_eq!(unknown.code, 0);
}
