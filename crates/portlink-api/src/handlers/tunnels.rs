//! Tunnel lifecycle handlers
//!
//! Create and update run the four-phase flow: validate/normalize into a
//! topology, allocate local ports, lease remote slots over federation,
//! persist rows in one transaction, then push the live runtime. Leases and
//! pushes unwind in reverse order when a later phase fails.

use crate::models::*;
use crate::AppState;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use portlink_control::topology::{entry_ip_summary, persist_topology};
use portlink_control::{
    build_topology, persist_bindings, reconstruct_topology, IpPreference, TopologySpec,
    TunnelKind, TunnelTopology,
};
use portlink_db::entities::{prelude::*, tunnel};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, NotSet, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info};

pub async fn list_tunnels(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    match Tunnel::find()
        .order_by_asc(tunnel::Column::SortIndex)
        .order_by_asc(tunnel::Column::Id)
        .all(&state.db)
        .await
    {
        Ok(rows) => ApiResponse::ok(rows),
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TunnelCreateRequest>,
) -> Json<ApiResponse> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return ApiResponse::err("tunnel name is required");
    }
    match Tunnel::find()
        .filter(tunnel::Column::Name.eq(name.clone()))
        .one(&state.db)
        .await
    {
        Ok(Some(_)) => return ApiResponse::err("tunnel name already exists"),
        Ok(None) => {}
        Err(err) => return ApiResponse::internal(err.to_string()),
    }

    let kind = TunnelKind::from_i32(request.kind);
    let preference = IpPreference::parse(request.ip_preference.as_deref().unwrap_or(""));
    let spec = TopologySpec {
        entries: request.entries.clone(),
        hops: request.hops.clone(),
        exits: request.exits.clone(),
    };

    let txn = match state.db.begin().await {
        Ok(txn) => txn,
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    let mut topology = match build_topology(&txn, &spec, kind, preference, None).await {
        Ok(topology) => topology,
        Err(err) => return ApiResponse::err(err.to_string()),
    };

    let entry_ip = request
        .entry_ip
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| entry_ip_summary(&topology));

    let now = Utc::now();
    let inserted = tunnel::ActiveModel {
        id: NotSet,
        name: Set(name),
        kind: Set(kind.as_i32()),
        protocol: Set("tls".to_string()),
        ip_preference: Set(preference.as_str().to_string()),
        status: Set(request.status.unwrap_or(1)),
        entry_ip: Set(Some(entry_ip).filter(|s| !s.is_empty())),
        sort_index: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&txn)
    .await;
    let tunnel_row = match inserted {
        Ok(row) => row,
        Err(err) => return ApiResponse::internal(err.to_string()),
    };
    topology.tunnel_id = tunnel_row.id;

    let (bindings, release_refs) = match state
        .orchestrator
        .apply_federation_runtime(&mut topology)
        .await
    {
        Ok(result) => result,
        Err(err) => return ApiResponse::err(err.to_string()),
    };

    if let Err(err) = persist_topology(&txn, &topology).await {
        state.orchestrator.release_refs(&release_refs).await;
        return ApiResponse::internal(err.to_string());
    }
    if let Err(err) = persist_bindings(&txn, topology.tunnel_id, &bindings).await {
        state.orchestrator.release_refs(&release_refs).await;
        return ApiResponse::internal(err.to_string());
    }
    if let Err(err) = txn.commit().await {
        state.orchestrator.release_refs(&release_refs).await;
        return ApiResponse::internal(err.to_string());
    }

    if let Err(err) = apply_runtime_after_commit(&state, &topology, &release_refs, true).await {
        return err;
    }

    info!(tunnel_id = topology.tunnel_id, "tunnel created");
    ApiResponse::ok_empty()
}

pub async fn update_tunnel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TunnelUpdateRequest>,
) -> Json<ApiResponse> {
    if request.id <= 0 {
        return ApiResponse::err("tunnel id is required");
    }
    match Tunnel::find_by_id(request.id).one(&state.db).await {
        Ok(Some(_)) => {}
        Ok(None) => return ApiResponse::err("tunnel does not exist"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    }

    // tear down the previous runtime and leases before rebuilding
    state.orchestrator.cleanup_tunnel_runtime(request.id).await;
    state.orchestrator.cleanup_federation_runtime(request.id).await;

    let kind = TunnelKind::from_i32(request.kind);
    let preference = IpPreference::parse(request.ip_preference.as_deref().unwrap_or(""));
    let spec = TopologySpec {
        entries: request.entries.clone(),
        hops: request.hops.clone(),
        exits: request.exits.clone(),
    };

    let txn = match state.db.begin().await {
        Ok(txn) => txn,
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    let mut topology = match build_topology(&txn, &spec, kind, preference, Some(request.id)).await {
        Ok(topology) => topology,
        Err(err) => return ApiResponse::err(err.to_string()),
    };
    topology.tunnel_id = request.id;

    let (bindings, release_refs) = match state
        .orchestrator
        .apply_federation_runtime(&mut topology)
        .await
    {
        Ok(result) => result,
        Err(err) => return ApiResponse::err(err.to_string()),
    };

    let entry_ip = entry_ip_summary(&topology);
    let update = tunnel::ActiveModel {
        id: Set(request.id),
        name: Set(request.name.trim().to_string()),
        kind: Set(kind.as_i32()),
        ip_preference: Set(preference.as_str().to_string()),
        status: Set(request.status.unwrap_or(1)),
        entry_ip: Set(Some(entry_ip).filter(|s| !s.is_empty())),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };
    if let Err(err) = update.update(&txn).await {
        state.orchestrator.release_refs(&release_refs).await;
        return ApiResponse::internal(err.to_string());
    }

    if let Err(err) = persist_topology(&txn, &topology).await {
        state.orchestrator.release_refs(&release_refs).await;
        return ApiResponse::internal(err.to_string());
    }
    if let Err(err) = persist_bindings(&txn, request.id, &bindings).await {
        state.orchestrator.release_refs(&release_refs).await;
        return ApiResponse::internal(err.to_string());
    }
    if let Err(err) = txn.commit().await {
        state.orchestrator.release_refs(&release_refs).await;
        return ApiResponse::internal(err.to_string());
    }

    if let Err(err) = apply_runtime_after_commit(&state, &topology, &release_refs, false).await {
        return err;
    }

    info!(tunnel_id = request.id, "tunnel updated");
    ApiResponse::ok_empty()
}

pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> Json<ApiResponse> {
    if request.id <= 0 {
        return ApiResponse::err("tunnel id is required");
    }

    state.orchestrator.cleanup_tunnel_runtime(request.id).await;
    state.orchestrator.cleanup_federation_runtime(request.id).await;

    match Tunnel::delete_by_id(request.id).exec(&state.db).await {
        Ok(_) => {
            info!(tunnel_id = request.id, "tunnel deleted");
            ApiResponse::ok_empty()
        }
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn diagnose_tunnel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TunnelDiagnoseRequest>,
) -> Json<ApiResponse> {
    if request.tunnel_id <= 0 {
        return ApiResponse::err("tunnel id is required");
    }
    match state.orchestrator.diagnose_tunnel(request.tunnel_id).await {
        Ok(report) => ApiResponse::ok(report),
        Err(err) => ApiResponse::err(err.to_string()),
    }
}

pub async fn redeploy_tunnel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> Json<ApiResponse> {
    if request.id <= 0 {
        return ApiResponse::err("tunnel id is required");
    }
    match redeploy_one(&state, request.id).await {
        Ok(()) => ApiResponse::ok_empty(),
        Err(msg) => ApiResponse::err(msg),
    }
}

pub async fn batch_redeploy_tunnels(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdsRequest>,
) -> Json<ApiResponse> {
    let mut outcome = BatchOutcome {
        success_count: 0,
        fail_count: 0,
    };
    for tunnel_id in request.ids {
        match redeploy_one(&state, tunnel_id).await {
            Ok(()) => outcome.success_count += 1,
            Err(msg) => {
                error!(tunnel_id, error = %msg, "tunnel redeploy failed");
                outcome.fail_count += 1;
            }
        }
    }
    ApiResponse::ok(outcome)
}

pub async fn set_limiter(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TunnelLimiterRequest>,
) -> Json<ApiResponse> {
    if request.tunnel_id <= 0 || request.limiter_id <= 0 {
        return ApiResponse::err("tunnel id and limiter id are required");
    }
    state
        .orchestrator
        .push_limiter(request.tunnel_id, request.limiter_id, request.speed.max(1))
        .await;
    ApiResponse::ok_empty()
}

pub async fn clear_limiter(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TunnelLimiterRequest>,
) -> Json<ApiResponse> {
    if request.tunnel_id <= 0 || request.limiter_id <= 0 {
        return ApiResponse::err("tunnel id and limiter id are required");
    }
    state
        .orchestrator
        .remove_limiter(request.tunnel_id, request.limiter_id)
        .await;
    ApiResponse::ok_empty()
}

/// Re-apply a tunnel's runtime purely from persisted rows, then re-sync its
/// forwards. Safe without the original request payload.
async fn redeploy_one(state: &Arc<AppState>, tunnel_id: i64) -> Result<(), String> {
    let tunnel_row = Tunnel::find_by_id(tunnel_id)
        .one(&state.db)
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "tunnel does not exist".to_string())?;

    if tunnel_row.kind == tunnel::KIND_CHAINED {
        state.orchestrator.cleanup_tunnel_runtime(tunnel_id).await;
        state.orchestrator.cleanup_federation_runtime(tunnel_id).await;

        let mut topology = reconstruct_topology(&state.db, tunnel_id)
            .await
            .map_err(|err| err.to_string())?;
        let (bindings, release_refs) = state
            .orchestrator
            .apply_federation_runtime(&mut topology)
            .await
            .map_err(|err| err.to_string())?;

        let persisted: Result<(), String> = async {
            let txn = state.db.begin().await.map_err(|err| err.to_string())?;
            persist_topology(&txn, &topology)
                .await
                .map_err(|err| err.to_string())?;
            persist_bindings(&txn, tunnel_id, &bindings)
                .await
                .map_err(|err| err.to_string())?;
            txn.commit().await.map_err(|err| err.to_string())
        }
        .await;
        if let Err(msg) = persisted {
            state.orchestrator.release_refs(&release_refs).await;
            return Err(msg);
        }

        if let Err(err) = state.orchestrator.apply_local_runtime(&topology).await {
            state.orchestrator.release_refs(&release_refs).await;
            delete_bindings(state, tunnel_id).await;
            return Err(err.to_string());
        }
    }

    state
        .orchestrator
        .resync_tunnel_forwards(tunnel_id)
        .await
        .map_err(|err| err.to_string())
}

/// Push the local runtime once rows are committed; on a genuine failure the
/// tunnel (optionally) and its leases are unwound. Deferred outcomes are
/// success.
async fn apply_runtime_after_commit(
    state: &Arc<AppState>,
    topology: &TunnelTopology,
    release_refs: &[portlink_control::ReleaseRef],
    delete_tunnel_on_failure: bool,
) -> Result<(), Json<ApiResponse>> {
    if topology.kind != TunnelKind::Chained {
        return Ok(());
    }
    match state.orchestrator.apply_local_runtime(topology).await {
        // Applied and Deferred both count as success
        Ok(_) => Ok(()),
        Err(err) => {
            state.orchestrator.release_refs(release_refs).await;
            delete_bindings(state, topology.tunnel_id).await;
            if delete_tunnel_on_failure {
                let _ = Tunnel::delete_by_id(topology.tunnel_id).exec(&state.db).await;
            }
            Err(ApiResponse::err(err.to_string()))
        }
    }
}

async fn delete_bindings(state: &Arc<AppState>, tunnel_id: i64) {
    use portlink_db::entities::federation_binding;
    let _ = federation_binding::Entity::delete_many()
        .filter(federation_binding::Column::TunnelId.eq(tunnel_id))
        .exec(&state.db)
        .await;
}
