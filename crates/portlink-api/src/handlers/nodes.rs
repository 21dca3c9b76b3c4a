//! Node registry handlers

use crate::models::*;
use crate::AppState;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use portlink_control::COMMAND_TIMEOUT;
use portlink_db::entities::{chain_node, federation_binding, forward_port, node, prelude::*};
use portlink_proto::CommandKind;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, NotSet, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::info;

/// Upgrades run long; five at a time keeps a big fleet from thundering.
const UPGRADE_WORKERS: usize = 5;
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    match Node::find()
        .order_by_asc(node::Column::SortIndex)
        .order_by_asc(node::Column::Id)
        .all(&state.db)
        .await
    {
        Ok(rows) => ApiResponse::ok(rows),
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn create_node(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NodeCreateRequest>,
) -> Json<ApiResponse> {
    let name = request.name.trim().to_string();
    let server_addr = request.server_addr.trim().to_string();
    if name.is_empty() || server_addr.is_empty() {
        return ApiResponse::err("node name and address are required");
    }

    let now = Utc::now();
    let inserted = node::ActiveModel {
        id: NotSet,
        name: Set(name),
        secret: Set(uuid::Uuid::new_v4().simple().to_string()),
        server_addr: Set(server_addr),
        server_addr_v4: Set(trimmed(request.server_addr_v4)),
        server_addr_v6: Set(trimmed(request.server_addr_v6)),
        port_range: Set(trimmed(request.port_range).unwrap_or_else(|| "1000-65535".to_string())),
        tcp_listen_addr: Set(trimmed(request.tcp_listen_addr).unwrap_or_else(|| "[::]".to_string())),
        udp_listen_addr: Set(trimmed(request.udp_listen_addr).unwrap_or_else(|| "[::]".to_string())),
        interface_name: Set(trimmed(request.interface_name)),
        version: Set(None),
        http: Set(request.http.unwrap_or(0)),
        tls: Set(request.tls.unwrap_or(0)),
        socks: Set(request.socks.unwrap_or(0)),
        status: Set(0),
        is_remote: Set(false),
        remote_url: Set(None),
        remote_token: Set(None),
        remote_config: Set(None),
        sort_index: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&state.db)
    .await;

    match inserted {
        Ok(row) => {
            info!(node_id = row.id, "node created");
            ApiResponse::ok(json!({ "id": row.id, "secret": row.secret }))
        }
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn update_node(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NodeUpdateRequest>,
) -> Json<ApiResponse> {
    if request.id <= 0 {
        return ApiResponse::err("node id is required");
    }
    let existing = match Node::find_by_id(request.id).one(&state.db).await {
        Ok(Some(row)) => row,
        Ok(None) => return ApiResponse::err("node does not exist"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    let http = request.http.unwrap_or(existing.http);
    let tls = request.tls.unwrap_or(existing.tls);
    let socks = request.socks.unwrap_or(existing.socks);

    // protocol toggles on an online node are pushed live before persisting
    if existing.status == 1
        && (http != existing.http || tls != existing.tls || socks != existing.socks)
    {
        if let Err(err) = state
            .orchestrator
            .apply_node_protocols(request.id, http, tls, socks)
            .await
        {
            return ApiResponse::err(err.to_string());
        }
    }

    let update = node::ActiveModel {
        id: Set(request.id),
        name: Set(request.name.trim().to_string()),
        server_addr: Set(request.server_addr.trim().to_string()),
        server_addr_v4: Set(trimmed(request.server_addr_v4)),
        server_addr_v6: Set(trimmed(request.server_addr_v6)),
        port_range: Set(trimmed(request.port_range).unwrap_or_else(|| "1000-65535".to_string())),
        tcp_listen_addr: Set(trimmed(request.tcp_listen_addr).unwrap_or_else(|| "[::]".to_string())),
        udp_listen_addr: Set(trimmed(request.udp_listen_addr).unwrap_or_else(|| "[::]".to_string())),
        interface_name: Set(trimmed(request.interface_name)),
        http: Set(http),
        tls: Set(tls),
        socks: Set(socks),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };
    match update.update(&state.db).await {
        Ok(_) => ApiResponse::ok_empty(),
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn delete_node(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> Json<ApiResponse> {
    if request.id <= 0 {
        return ApiResponse::err("node id is required");
    }

    let deleted: Result<(), sea_orm::DbErr> = async {
        let txn = state.db.begin().await?;
        forward_port::Entity::delete_many()
            .filter(forward_port::Column::NodeId.eq(request.id))
            .exec(&txn)
            .await?;
        chain_node::Entity::delete_many()
            .filter(chain_node::Column::NodeId.eq(request.id))
            .exec(&txn)
            .await?;
        federation_binding::Entity::delete_many()
            .filter(federation_binding::Column::NodeId.eq(request.id))
            .exec(&txn)
            .await?;
        Node::delete_by_id(request.id).exec(&txn).await?;
        txn.commit().await
    }
    .await;

    match deleted {
        Ok(()) => {
            info!(node_id = request.id, "node deleted");
            ApiResponse::ok_empty()
        }
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

/// Batch agent upgrade with a fixed-size worker pool.
pub async fn upgrade_agents(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AgentUpgradeRequest>,
) -> Json<ApiResponse> {
    if request.ids.is_empty() {
        return ApiResponse::err("node ids are required");
    }
    if request.download_url.trim().is_empty() || request.checksum_url.trim().is_empty() {
        return ApiResponse::err("download and checksum urls are required");
    }

    let semaphore = Arc::new(Semaphore::new(UPGRADE_WORKERS));
    let mut tasks = Vec::with_capacity(request.ids.len());
    for node_id in request.ids {
        let state = state.clone();
        let semaphore = semaphore.clone();
        let payload = json!({
            "downloadUrl": request.download_url,
            "checksumUrl": request.checksum_url,
        });
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            match state
                .channel
                .send_command(node_id, CommandKind::UpgradeAgent, payload, UPGRADE_TIMEOUT)
                .await
            {
                Ok(result) => AgentUpgradeOutcome {
                    id: node_id,
                    success: true,
                    message: result.message,
                },
                Err(err) => AgentUpgradeOutcome {
                    id: node_id,
                    success: false,
                    message: err.message,
                },
            }
        }));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        if let Ok(outcome) = task.await {
            outcomes.push(outcome);
        }
    }
    ApiResponse::ok(outcomes)
}

pub async fn rollback_agent(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> Json<ApiResponse> {
    if request.id <= 0 {
        return ApiResponse::err("node id is required");
    }
    match state
        .channel
        .send_command(request.id, CommandKind::RollbackAgent, json!({}), COMMAND_TIMEOUT)
        .await
    {
        Ok(result) => ApiResponse::ok(json!({ "message": result.message })),
        Err(err) => ApiResponse::err(err.message),
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
