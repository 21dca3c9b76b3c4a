//! Forward lifecycle handlers

use crate::models::*;
use crate::AppState;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use portlink_control::topology::{tunnel_entry_node_ids, validate_remote_node_port};
use portlink_control::ports::{pick_forward_ingress_port, FALLBACK_INGRESS_PORT};
use portlink_db::entities::{forward, forward_port, node, prelude::*};
use portlink_proto::CommandKind;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, NotSet, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, warn};

pub async fn list_forwards(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    match Forward::find()
        .order_by_asc(forward::Column::SortIndex)
        .order_by_asc(forward::Column::Id)
        .all(&state.db)
        .await
    {
        Ok(rows) => ApiResponse::ok(rows),
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn create_forward(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForwardCreateRequest>,
) -> Json<ApiResponse> {
    if request.tunnel_id <= 0 {
        return ApiResponse::err("tunnel id is required");
    }
    let name = request.name.trim().to_string();
    let remote_addr = request.remote_addr.trim().to_string();
    if name.is_empty() || remote_addr.is_empty() {
        return ApiResponse::err("forward name and target address are required");
    }

    let tunnel_row = match Tunnel::find_by_id(request.tunnel_id).one(&state.db).await {
        Ok(Some(row)) => row,
        Ok(None) => return ApiResponse::err("tunnel does not exist"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };
    if tunnel_row.status != 1 {
        return ApiResponse::err("tunnel is disabled");
    }

    let entry_nodes = match tunnel_entry_node_ids(&state.db, request.tunnel_id).await {
        Ok(ids) => ids,
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    let mut port = request.in_port;
    if port == 0 {
        port = match pick_forward_ingress_port(&state.db, &entry_nodes).await {
            Ok(picked) => picked.unwrap_or(FALLBACK_INGRESS_PORT),
            Err(err) => return ApiResponse::err(err.to_string()),
        };
    }
    if let Err(response) = check_entry_port_bounds(&state, &entry_nodes, port).await {
        return response;
    }

    let created: Result<forward::Model, sea_orm::DbErr> = async {
        let txn = state.db.begin().await?;
        let now = Utc::now();
        let row = forward::ActiveModel {
            id: NotSet,
            name: Set(name),
            tunnel_id: Set(request.tunnel_id),
            remote_addr: Set(remote_addr),
            strategy: Set(request
                .strategy
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("fifo")
                .to_string()),
            status: Set(1),
            sort_index: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        for &node_id in &entry_nodes {
            forward_port::ActiveModel {
                id: NotSet,
                forward_id: Set(row.id),
                node_id: Set(node_id),
                port: Set(port as i32),
            }
            .insert(&txn)
            .await?;
        }
        txn.commit().await?;
        Ok(row)
    }
    .await;
    let row = match created {
        Ok(row) => row,
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    if let Err(err) = state
        .orchestrator
        .sync_forward_services(&row, CommandKind::AddService, false)
        .await
    {
        // undo the rows so a failed push is not left half-created
        let _ = Forward::delete_by_id(row.id).exec(&state.db).await;
        return ApiResponse::err(err.to_string());
    }

    info!(forward_id = row.id, "forward created");
    ApiResponse::ok_empty()
}

pub async fn update_forward(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForwardUpdateRequest>,
) -> Json<ApiResponse> {
    if request.id <= 0 {
        return ApiResponse::err("forward id is required");
    }
    let existing = match Forward::find_by_id(request.id).one(&state.db).await {
        Ok(Some(row)) => row,
        Ok(None) => return ApiResponse::err("forward does not exist"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };
    let old_ports = match state.orchestrator.list_forward_ports(request.id).await {
        Ok(rows) => rows,
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    let tunnel_id = request.tunnel_id.filter(|id| *id > 0).unwrap_or(existing.tunnel_id);
    let tunnel_row = match Tunnel::find_by_id(tunnel_id).one(&state.db).await {
        Ok(Some(row)) => row,
        Ok(None) => return ApiResponse::err("tunnel does not exist"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };
    if tunnel_row.status != 1 {
        return ApiResponse::err("tunnel is disabled");
    }

    let entry_nodes = match tunnel_entry_node_ids(&state.db, tunnel_id).await {
        Ok(ids) => ids,
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    let mut port = request.in_port;
    if port == 0 {
        port = old_ports
            .iter()
            .map(|p| p.port)
            .filter(|p| *p > 0)
            .min()
            .map(|p| p as u16)
            .unwrap_or(0);
    }
    if port == 0 {
        port = match pick_forward_ingress_port(&state.db, &entry_nodes).await {
            Ok(picked) => picked.unwrap_or(FALLBACK_INGRESS_PORT),
            Err(err) => return ApiResponse::err(err.to_string()),
        };
    }
    if let Err(response) = check_entry_port_bounds(&state, &entry_nodes, port).await {
        return response;
    }

    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&existing.name)
        .to_string();
    let remote_addr = request
        .remote_addr
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&existing.remote_addr)
        .to_string();
    let strategy = request
        .strategy
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&existing.strategy)
        .to_string();

    let updated: Result<(), sea_orm::DbErr> = async {
        let txn = state.db.begin().await?;
        forward::ActiveModel {
            id: Set(request.id),
            name: Set(name),
            tunnel_id: Set(tunnel_id),
            remote_addr: Set(remote_addr),
            strategy: Set(strategy),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(&txn)
        .await?;

        forward_port::Entity::delete_many()
            .filter(forward_port::Column::ForwardId.eq(request.id))
            .exec(&txn)
            .await?;
        for &node_id in &entry_nodes {
            forward_port::ActiveModel {
                id: NotSet,
                forward_id: Set(request.id),
                node_id: Set(node_id),
                port: Set(port as i32),
            }
            .insert(&txn)
            .await?;
        }
        txn.commit().await
    }
    .await;
    if let Err(err) = updated {
        return ApiResponse::internal(err.to_string());
    }

    let refreshed = match Forward::find_by_id(request.id).one(&state.db).await {
        Ok(Some(row)) => row,
        Ok(None) => return ApiResponse::err("forward does not exist"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };
    if let Err(err) = state
        .orchestrator
        .sync_forward_services(&refreshed, CommandKind::UpdateService, true)
        .await
    {
        rollback_forward(&state, &existing, &old_ports).await;
        return ApiResponse::err(err.to_string());
    }

    ApiResponse::ok_empty()
}

pub async fn delete_forward(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> Json<ApiResponse> {
    match delete_one(&state, request.id).await {
        Ok(()) => ApiResponse::ok_empty(),
        Err(msg) => ApiResponse::err(msg),
    }
}

pub async fn pause_forward(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> Json<ApiResponse> {
    match set_forward_status(&state, request.id, CommandKind::PauseService, 0).await {
        Ok(()) => ApiResponse::ok_empty(),
        Err(msg) => ApiResponse::err(msg),
    }
}

pub async fn resume_forward(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> Json<ApiResponse> {
    match set_forward_status(&state, request.id, CommandKind::ResumeService, 1).await {
        Ok(()) => ApiResponse::ok_empty(),
        Err(msg) => ApiResponse::err(msg),
    }
}

pub async fn diagnose_forward(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForwardDiagnoseRequest>,
) -> Json<ApiResponse> {
    let row = match Forward::find_by_id(request.forward_id).one(&state.db).await {
        Ok(Some(row)) => row,
        Ok(None) => return ApiResponse::err("forward does not exist"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };
    match state.orchestrator.diagnose_forward(&row).await {
        Ok(report) => ApiResponse::ok(report),
        Err(err) => ApiResponse::err(err.to_string()),
    }
}

pub async fn batch_delete_forwards(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdsRequest>,
) -> Json<ApiResponse> {
    let mut outcome = BatchOutcome {
        success_count: 0,
        fail_count: 0,
    };
    for id in request.ids {
        match delete_one(&state, id).await {
            Ok(()) => outcome.success_count += 1,
            Err(msg) => {
                warn!(forward_id = id, error = %msg, "forward delete failed");
                outcome.fail_count += 1;
            }
        }
    }
    ApiResponse::ok(outcome)
}

pub async fn batch_pause_forwards(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdsRequest>,
) -> Json<ApiResponse> {
    batch_status(&state, request.ids, CommandKind::PauseService, 0).await
}

pub async fn batch_resume_forwards(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdsRequest>,
) -> Json<ApiResponse> {
    batch_status(&state, request.ids, CommandKind::ResumeService, 1).await
}

pub async fn batch_redeploy_forwards(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdsRequest>,
) -> Json<ApiResponse> {
    let mut outcome = BatchOutcome {
        success_count: 0,
        fail_count: 0,
    };
    for id in request.ids {
        let row = match Forward::find_by_id(id).one(&state.db).await {
            Ok(Some(row)) => row,
            _ => {
                outcome.fail_count += 1;
                continue;
            }
        };
        match state
            .orchestrator
            .sync_forward_services(&row, CommandKind::UpdateService, true)
            .await
        {
            Ok(()) => outcome.success_count += 1,
            Err(err) => {
                error!(forward_id = id, error = %err, "forward redeploy failed");
                outcome.fail_count += 1;
            }
        }
    }
    ApiResponse::ok(outcome)
}

async fn batch_status(
    state: &Arc<AppState>,
    ids: Vec<i64>,
    kind: CommandKind,
    status: i32,
) -> Json<ApiResponse> {
    let mut outcome = BatchOutcome {
        success_count: 0,
        fail_count: 0,
    };
    for id in ids {
        match set_forward_status(state, id, kind, status).await {
            Ok(()) => outcome.success_count += 1,
            Err(_) => outcome.fail_count += 1,
        }
    }
    ApiResponse::ok(outcome)
}

async fn delete_one(state: &Arc<AppState>, forward_id: i64) -> Result<(), String> {
    let row = Forward::find_by_id(forward_id)
        .one(&state.db)
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "forward does not exist".to_string())?;

    state
        .orchestrator
        .control_forward_services(&row, CommandKind::DeleteService, true)
        .await
        .map_err(|err| err.to_string())?;

    Forward::delete_by_id(forward_id)
        .exec(&state.db)
        .await
        .map_err(|err| err.to_string())?;
    Ok(())
}

async fn set_forward_status(
    state: &Arc<AppState>,
    forward_id: i64,
    kind: CommandKind,
    status: i32,
) -> Result<(), String> {
    let row = Forward::find_by_id(forward_id)
        .one(&state.db)
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "forward does not exist".to_string())?;

    state
        .orchestrator
        .control_forward_services(&row, kind, false)
        .await
        .map_err(|err| err.to_string())?;

    forward::ActiveModel {
        id: Set(forward_id),
        status: Set(status),
        updated_at: Set(Utc::now()),
        ..Default::default()
    }
    .update(&state.db)
    .await
    .map_err(|err| err.to_string())?;
    Ok(())
}

/// An ingress port on a federated entry node must fall inside the share's
/// range; the remote plane would reject it later anyway.
async fn check_entry_port_bounds(
    state: &Arc<AppState>,
    entry_nodes: &[i64],
    port: u16,
) -> Result<(), Json<ApiResponse>> {
    for &node_id in entry_nodes {
        let Ok(Some(model)) = node::Entity::find_by_id(node_id).one(&state.db).await else {
            continue;
        };
        if let Err(err) = validate_remote_node_port(&model, port) {
            return Err(ApiResponse::err(err.to_string()));
        }
    }
    Ok(())
}

/// Restore a forward's previous row and ports, then re-push its services.
async fn rollback_forward(
    state: &Arc<AppState>,
    old: &forward::Model,
    old_ports: &[forward_port::Model],
) {
    let restored: Result<(), sea_orm::DbErr> = async {
        let txn = state.db.begin().await?;
        forward::ActiveModel {
            id: Set(old.id),
            name: Set(old.name.clone()),
            tunnel_id: Set(old.tunnel_id),
            remote_addr: Set(old.remote_addr.clone()),
            strategy: Set(old.strategy.clone()),
            status: Set(old.status),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(&txn)
        .await?;

        forward_port::Entity::delete_many()
            .filter(forward_port::Column::ForwardId.eq(old.id))
            .exec(&txn)
            .await?;
        for port_row in old_ports {
            forward_port::ActiveModel {
                id: NotSet,
                forward_id: Set(old.id),
                node_id: Set(port_row.node_id),
                port: Set(port_row.port),
            }
            .insert(&txn)
            .await?;
        }
        txn.commit().await
    }
    .await;

    if let Err(err) = restored {
        warn!(forward_id = old.id, error = %err, "forward rollback failed");
        return;
    }
    if let Err(err) = state
        .orchestrator
        .sync_forward_services(old, CommandKind::UpdateService, true)
        .await
    {
        warn!(forward_id = old.id, error = %err, "forward rollback re-sync failed");
    }
}
