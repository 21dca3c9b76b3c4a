//! Federation endpoints
//!
//! Two halves: the peer-facing serving side (share-token authenticated
//! connect/reserve/apply/release/diagnose) and the panel-side management of
//! shares we grant plus importing nodes shared *to* us by other panels.

use crate::models::*;
use crate::AppState;
use axum::extract::{ConnectInfo, State};
use axum::Extension;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{TimeZone, Utc};
use portlink_control::ports::pick_peer_share_port;
use portlink_control::{PortAllocError, Tolerance, COMMAND_TIMEOUT};
use portlink_db::entities::{chain_node, node, peer_share, peer_share_runtime, prelude::*, tunnel};
use portlink_federation::FederationClient;
use portlink_proto::federation::{
    ApplyRoleRequest, DiagnoseRequest, ReleaseRoleRequest, RemoteTunnelRequest,
    ReservePortRequest,
};
use portlink_proto::CommandKind;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, NotSet, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// peer authentication
// ---------------------------------------------------------------------------

fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string()
}

async fn authenticate_peer(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    peer_addr: Option<SocketAddr>,
) -> Result<peer_share::Model, Json<ApiResponse>> {
    let token = bearer_token(headers);
    if token.is_empty() {
        return Err(ApiResponse::with_code(
            CODE_UNAUTHORIZED,
            "missing authorization header",
        ));
    }

    let share = PeerShare::find()
        .filter(peer_share::Column::Token.eq(token))
        .one(&state.db)
        .await
        .map_err(|err| ApiResponse::internal(err.to_string()))?
        .ok_or_else(|| ApiResponse::with_code(CODE_UNAUTHORIZED, "invalid token"))?;

    if !share.is_active {
        return Err(ApiResponse::with_code(CODE_FORBIDDEN, "share is disabled"));
    }
    if let Some(expiry) = share.expiry_at {
        if expiry < Utc::now() {
            return Err(ApiResponse::with_code(CODE_FORBIDDEN, "share expired"));
        }
    }

    if let Some(whitelist) = share
        .allowed_ips
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let client_ip = resolve_peer_client_ip(headers, peer_addr);
        let Some(client_ip) = client_ip else {
            return Err(ApiResponse::with_code(
                CODE_FORBIDDEN,
                "unable to determine client ip",
            ));
        };
        if !is_peer_ip_allowed(client_ip, whitelist) {
            return Err(ApiResponse::with_code(CODE_FORBIDDEN, "ip not allowed"));
        }
    }

    if let Some(domains) = share
        .allowed_domains
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let client_domain = headers
            .get("X-Panel-Domain")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if client_domain.is_empty() {
            return Err(ApiResponse::with_code(
                CODE_FORBIDDEN,
                "domain verification required",
            ));
        }
        let allowed = domains
            .split(',')
            .map(str::trim)
            .any(|domain| domain == client_domain);
        if !allowed {
            return Err(ApiResponse::with_code(CODE_FORBIDDEN, "domain not allowed"));
        }
    }

    Ok(share)
}

fn resolve_peer_client_ip(headers: &HeaderMap, peer_addr: Option<SocketAddr>) -> Option<IpAddr> {
    let remote = peer_addr.map(|addr| addr.ip());
    if remote.map(is_trusted_proxy_ip).unwrap_or(true) {
        let forwarded = headers
            .get("X-Forwarded-For")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                value
                    .split(',')
                    .filter_map(|part| part.trim().parse::<IpAddr>().ok())
                    .next()
            });
        if let Some(ip) = forwarded {
            return Some(ip);
        }
        let real_ip = headers
            .get("X-Real-IP")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real_ip {
            return Some(ip);
        }
    }
    remote
}

fn is_trusted_proxy_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_peer_ip_allowed(client_ip: IpAddr, whitelist: &str) -> bool {
    for entry in whitelist.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some((network, prefix)) = entry.split_once('/') {
            let (Ok(network), Ok(prefix)) = (network.parse::<IpAddr>(), prefix.parse::<u8>())
            else {
                continue;
            };
            if cidr_contains(network, prefix, client_ip) {
                return true;
            }
            continue;
        }
        if entry.parse::<IpAddr>().map(|ip| ip == client_ip).unwrap_or(false) {
            return true;
        }
    }
    false
}

fn cidr_contains(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(network), IpAddr::V4(ip)) => {
            let prefix = prefix.min(32) as u32;
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix);
            (u32::from(network) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(network), IpAddr::V6(ip)) => {
            let prefix = prefix.min(128) as u32;
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix);
            (u128::from(network) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// serving side: the runtime lease protocol
// ---------------------------------------------------------------------------

pub async fn federation_connect(
    State(state): State<Arc<AppState>>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
) -> Json<ApiResponse> {
    let share = match authenticate_peer(&state, &headers, connect_info.map(|info| info.0 .0)).await {
        Ok(share) => share,
        Err(response) => return response,
    };

    let node_row = match Node::find_by_id(share.node_id).one(&state.db).await {
        Ok(Some(row)) => row,
        Ok(None) => return ApiResponse::internal("node not found"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    ApiResponse::ok(json!({
        "shareId": share.id,
        "shareName": share.name,
        "nodeId": share.node_id,
        "nodeName": node_row.name,
        "serverIp": node_row.server_addr,
        "status": node_row.status,
        "maxBandwidth": share.max_bandwidth,
        "currentFlow": share.current_flow,
        "expiryTime": share.expiry_at.map(|t| t.timestamp_millis()).unwrap_or(0),
        "portRangeStart": share.port_range_start,
        "portRangeEnd": share.port_range_end,
    }))
}

/// Stand up a direct-forward tunnel on the shared node for the peer: entry
/// chain row on the requested port, forwarding to the peer's target.
pub async fn federation_tunnel_create(
    State(state): State<Arc<AppState>>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    Json(request): Json<RemoteTunnelRequest>,
) -> Json<ApiResponse> {
    let share = match authenticate_peer(&state, &headers, connect_info.map(|info| info.0 .0)).await {
        Ok(share) => share,
        Err(response) => return response,
    };
    if share.flow_exceeded() {
        return ApiResponse::with_code(CODE_FORBIDDEN, "Share traffic limit exceeded");
    }
    let port = request.remote_port as i32;
    if port < share.port_range_start || port > share.port_range_end {
        return ApiResponse::with_code(CODE_FORBIDDEN, "Port out of range");
    }

    let created: Result<i64, sea_orm::DbErr> = async {
        let txn = state.db.begin().await?;
        let now = Utc::now();
        let tunnel_row = tunnel::ActiveModel {
            id: NotSet,
            name: Set(format!("Share-{}-Port-{}", share.id, request.remote_port)),
            kind: Set(tunnel::KIND_DIRECT),
            protocol: Set(request.protocol.clone()),
            ip_preference: Set(String::new()),
            status: Set(1),
            entry_ip: Set(None),
            sort_index: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        chain_node::ActiveModel {
            id: NotSet,
            tunnel_id: Set(tunnel_row.id),
            chain_role: Set(chain_node::ROLE_ENTRY),
            node_id: Set(share.node_id),
            hop_index: Set(0),
            port: Set(Some(port)),
            protocol: Set(request.protocol.clone()),
            strategy: Set("fifo".to_string()),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;
        Ok(tunnel_row.id)
    }
    .await;

    match created {
        Ok(tunnel_id) => ApiResponse::ok(json!({ "tunnelId": tunnel_id })),
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn runtime_reserve_port(
    State(state): State<Arc<AppState>>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    Json(request): Json<ReservePortRequest>,
) -> Json<ApiResponse> {
    let share = match authenticate_peer(&state, &headers, connect_info.map(|info| info.0 .0)).await {
        Ok(share) => share,
        Err(response) => return response,
    };

    let resource_key = request.resource_key.trim().to_string();
    if resource_key.is_empty() {
        return ApiResponse::err("resourceKey is required");
    }

    let existing = match find_runtime_by_key(&state, share.id, &resource_key).await {
        Ok(existing) => existing,
        Err(err) => return ApiResponse::internal(err.to_string()),
    };
    // an active reservation for the same key is returned as-is
    if let Some(ref runtime) = existing {
        if runtime.status == 1 {
            return ApiResponse::ok(json!({
                "reservationId": runtime.reservation_id,
                "allocatedPort": runtime.port,
                "bindingId": runtime.binding_id,
            }));
        }
    }

    if share.flow_exceeded() {
        return ApiResponse::with_code(CODE_FORBIDDEN, "Share traffic limit exceeded");
    }

    let allocated_port = match pick_peer_share_port(&state.db, &share, request.requested_port).await
    {
        Ok(port) => port,
        Err(PortAllocError::OutOfRange) => return ApiResponse::err("Port out of range"),
        Err(PortAllocError::Exhausted) => return ApiResponse::err("No available port"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    let now = Utc::now();
    let protocol = if request.protocol.trim().is_empty() {
        "tls".to_string()
    } else {
        request.protocol.clone()
    };

    // released rows for the key are revived instead of duplicated
    if let Some(runtime) = existing {
        let reservation_id = runtime.reservation_id.clone();
        let revived = peer_share_runtime::ActiveModel {
            id: Set(runtime.id),
            protocol: Set(protocol),
            port: Set(allocated_port as i32),
            binding_id: Set(String::new()),
            role: Set(String::new()),
            chain_name: Set(String::new()),
            service_name: Set(String::new()),
            strategy: Set("round".to_string()),
            target: Set(String::new()),
            applied: Set(false),
            status: Set(1),
            updated_at: Set(now),
            ..Default::default()
        };
        if let Err(err) = revived.update(&state.db).await {
            return ApiResponse::internal(err.to_string());
        }
        return ApiResponse::ok(json!({
            "reservationId": reservation_id,
            "allocatedPort": allocated_port,
            "bindingId": "",
        }));
    }

    let reservation_id = uuid::Uuid::new_v4().simple().to_string();
    let created = peer_share_runtime::ActiveModel {
        id: NotSet,
        share_id: Set(share.id),
        node_id: Set(share.node_id),
        reservation_id: Set(reservation_id.clone()),
        resource_key: Set(resource_key),
        binding_id: Set(String::new()),
        role: Set(String::new()),
        chain_name: Set(String::new()),
        service_name: Set(String::new()),
        protocol: Set(protocol),
        strategy: Set("round".to_string()),
        port: Set(allocated_port as i32),
        target: Set(String::new()),
        applied: Set(false),
        status: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&state.db)
    .await;
    if let Err(err) = created {
        return ApiResponse::internal(err.to_string());
    }

    ApiResponse::ok(json!({
        "reservationId": reservation_id,
        "allocatedPort": allocated_port,
        "bindingId": "",
    }))
}

pub async fn runtime_apply_role(
    State(state): State<Arc<AppState>>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    Json(request): Json<ApplyRoleRequest>,
) -> Json<ApiResponse> {
    let share = match authenticate_peer(&state, &headers, connect_info.map(|info| info.0 .0)).await {
        Ok(share) => share,
        Err(response) => return response,
    };

    let role = request.role.trim().to_lowercase();
    if role != "middle" && role != "exit" {
        return ApiResponse::err("invalid role");
    }

    let runtime = if !request.reservation_id.trim().is_empty() {
        find_runtime_by_reservation(&state, share.id, request.reservation_id.trim()).await
    } else {
        find_runtime_by_key(&state, share.id, request.resource_key.trim()).await
    };
    let runtime = match runtime {
        Ok(Some(runtime)) if runtime.status == 1 => runtime,
        Ok(_) => return ApiResponse::err("reservation not found"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    // re-applying an already-bound reservation is a success
    if runtime.applied && !runtime.binding_id.trim().is_empty() {
        return ApiResponse::ok(json!({
            "bindingId": runtime.binding_id,
            "reservationId": runtime.reservation_id,
            "allocatedPort": runtime.port,
        }));
    }
    if share.flow_exceeded() {
        return ApiResponse::with_code(CODE_FORBIDDEN, "Share traffic limit exceeded");
    }

    let node_row = match Node::find_by_id(share.node_id).one(&state.db).await {
        Ok(Some(row)) => row,
        Ok(None) => return ApiResponse::err("node does not exist"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    let protocol = if request.protocol.trim().is_empty() {
        runtime.protocol.clone()
    } else {
        request.protocol.clone()
    };
    let strategy = if request.strategy.trim().is_empty() {
        "round".to_string()
    } else {
        request.strategy.clone()
    };
    let chain = format!("fed_chain_{}", runtime.id);
    let service_name = format!("fed_svc_{}", runtime.id);

    if role == "middle" {
        if request.targets.is_empty() {
            return ApiResponse::err("targets are required for middle role");
        }
        let mut node_items = Vec::with_capacity(request.targets.len());
        for (idx, target) in request.targets.iter().enumerate() {
            let host = target.host.trim();
            if host.is_empty() || target.port == 0 {
                return ApiResponse::err("invalid target");
            }
            let dial_protocol = if target.protocol.trim().is_empty() {
                protocol.as_str()
            } else {
                target.protocol.as_str()
            };
            node_items.push(json!({
                "name": format!("node_{}", idx + 1),
                "addr": portlink_control::dual_stack::format_host_port(host, target.port),
                "connector": { "type": "relay" },
                "dialer": { "type": dial_protocol },
            }));
        }

        let mut hop = json!({
            "name": format!("hop_{}", runtime.id),
            "selector": {
                "strategy": strategy.clone(),
                "maxFails": 1,
                "failTimeout": 600_000_000_000i64,
            },
            "nodes": node_items,
        });
        if let Some(interface) = node_row
            .interface_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            hop["interface"] = json!(interface);
        }
        let chain_config = json!({ "name": chain.clone(), "hops": [hop] });

        if let Err(err) = state
            .channel
            .send_tolerant(
                share.node_id,
                CommandKind::AddChains,
                chain_config,
                COMMAND_TIMEOUT,
                Tolerance::EXISTS,
            )
            .await
        {
            return ApiResponse::err(err.to_string());
        }
    }

    let mut service = json!({
        "name": service_name.clone(),
        "addr": format!("{}:{}", node_row.tcp_listen_addr, runtime.port),
        "handler": { "type": "relay" },
        "listener": { "type": protocol.clone() },
    });
    if role == "middle" {
        service["handler"]["chain"] = json!(chain.clone());
    }
    if role == "exit" {
        if let Some(interface) = node_row
            .interface_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            service["metadata"] = json!({ "interface": interface });
        }
    }
    if let Err(err) = state
        .channel
        .send_tolerant(
            share.node_id,
            CommandKind::AddService,
            json!([service]),
            COMMAND_TIMEOUT,
            Tolerance::EXISTS,
        )
        .await
    {
        if role == "middle" {
            let _ = state
                .channel
                .send_tolerant(
                    share.node_id,
                    CommandKind::DeleteChains,
                    json!({ "chain": chain.clone() }),
                    COMMAND_TIMEOUT,
                    Tolerance::NOT_FOUND,
                )
                .await;
        }
        return ApiResponse::err(err.to_string());
    }

    let binding_id = runtime.id.to_string();
    let reservation_id = runtime.reservation_id.clone();
    let port = runtime.port;
    let update = peer_share_runtime::ActiveModel {
        id: Set(runtime.id),
        binding_id: Set(binding_id.clone()),
        role: Set(role.clone()),
        chain_name: Set(if role == "middle" { chain } else { String::new() }),
        service_name: Set(service_name),
        protocol: Set(protocol),
        strategy: Set(strategy),
        target: Set(serde_json::to_string(&request.targets).unwrap_or_default()),
        applied: Set(true),
        status: Set(1),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };
    if let Err(err) = update.update(&state.db).await {
        return ApiResponse::internal(err.to_string());
    }

    ApiResponse::ok(json!({
        "bindingId": binding_id,
        "reservationId": reservation_id,
        "allocatedPort": port,
    }))
}

pub async fn runtime_release_role(
    State(state): State<Arc<AppState>>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    Json(request): Json<ReleaseRoleRequest>,
) -> Json<ApiResponse> {
    let share = match authenticate_peer(&state, &headers, connect_info.map(|info| info.0 .0)).await {
        Ok(share) => share,
        Err(response) => return response,
    };

    let runtime = if !request.binding_id.trim().is_empty() {
        find_runtime_by_binding(&state, share.id, request.binding_id.trim()).await
    } else if !request.reservation_id.trim().is_empty() {
        find_runtime_by_reservation(&state, share.id, request.reservation_id.trim()).await
    } else if !request.resource_key.trim().is_empty() {
        find_runtime_by_key(&state, share.id, request.resource_key.trim()).await
    } else {
        return ApiResponse::err("bindingId or reservationId or resourceKey is required");
    };
    let runtime = match runtime {
        Ok(Some(runtime)) => runtime,
        // releasing something already gone is a success
        Ok(None) => return ApiResponse::ok_empty(),
        Err(err) => return ApiResponse::internal(err.to_string()),
    };

    release_runtime(&state, &runtime).await;
    ApiResponse::ok_empty()
}

pub async fn runtime_diagnose(
    State(state): State<Arc<AppState>>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    Json(request): Json<DiagnoseRequest>,
) -> Json<ApiResponse> {
    let share = match authenticate_peer(&state, &headers, connect_info.map(|info| info.0 .0)).await {
        Ok(share) => share,
        Err(response) => return response,
    };

    let ip = request.ip.trim().to_string();
    if ip.is_empty() || request.port == 0 {
        return ApiResponse::err("invalid target");
    }
    let count = if request.count == 0 { 4 } else { request.count };
    let timeout = if request.timeout == 0 { 5000 } else { request.timeout };

    match state
        .channel
        .send_command(
            share.node_id,
            CommandKind::TcpPing,
            json!({ "ip": ip, "port": request.port, "count": count, "timeout": timeout }),
            COMMAND_TIMEOUT,
        )
        .await
    {
        Ok(result) => match result.data {
            Some(data) => ApiResponse::ok(data),
            None => ApiResponse::err("node returned no diagnosis data"),
        },
        Err(err) => ApiResponse::err(err.message),
    }
}

// ---------------------------------------------------------------------------
// panel side: share management + importing remote nodes
// ---------------------------------------------------------------------------

pub async fn list_peer_shares(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    match PeerShare::find()
        .order_by_asc(peer_share::Column::Id)
        .all(&state.db)
        .await
    {
        Ok(rows) => ApiResponse::ok(rows),
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn create_peer_share(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PeerShareCreateRequest>,
) -> Json<ApiResponse> {
    if request.name.trim().is_empty() || request.node_id <= 0 {
        return ApiResponse::err("share name and node are required");
    }
    if let Err(msg) = validate_share_bounds(
        request.expiry_time,
        request.port_range_start,
        request.port_range_end,
    ) {
        return ApiResponse::err(msg);
    }
    match Node::find_by_id(request.node_id).one(&state.db).await {
        Ok(Some(_)) => {}
        Ok(None) => return ApiResponse::err("node does not exist"),
        Err(err) => return ApiResponse::internal(err.to_string()),
    }

    let now = Utc::now();
    let token = uuid::Uuid::new_v4().simple().to_string();
    let inserted = peer_share::ActiveModel {
        id: NotSet,
        name: Set(request.name.trim().to_string()),
        node_id: Set(request.node_id),
        token: Set(token.clone()),
        max_bandwidth: Set(request.max_bandwidth.max(0)),
        current_flow: Set(0),
        expiry_at: Set(expiry_from_millis(request.expiry_time)),
        port_range_start: Set(request.port_range_start),
        port_range_end: Set(request.port_range_end),
        is_active: Set(true),
        allowed_domains: Set(trimmed(request.allowed_domains)),
        allowed_ips: Set(trimmed(request.allowed_ips)),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&state.db)
    .await;

    match inserted {
        Ok(row) => {
            info!(share_id = row.id, "peer share created");
            ApiResponse::ok(json!({ "id": row.id, "token": token }))
        }
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn update_peer_share(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PeerShareUpdateRequest>,
) -> Json<ApiResponse> {
    if request.id <= 0 {
        return ApiResponse::err("share id is required");
    }
    if let Err(msg) = validate_share_bounds(
        request.expiry_time,
        request.port_range_start,
        request.port_range_end,
    ) {
        return ApiResponse::err(msg);
    }

    let update = peer_share::ActiveModel {
        id: Set(request.id),
        name: Set(request.name.trim().to_string()),
        max_bandwidth: Set(request.max_bandwidth.max(0)),
        expiry_at: Set(expiry_from_millis(request.expiry_time)),
        port_range_start: Set(request.port_range_start),
        port_range_end: Set(request.port_range_end),
        allowed_domains: Set(trimmed(request.allowed_domains)),
        allowed_ips: Set(trimmed(request.allowed_ips)),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };
    match update.update(&state.db).await {
        Ok(_) => ApiResponse::ok_empty(),
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

pub async fn delete_peer_share(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> Json<ApiResponse> {
    if request.id <= 0 {
        return ApiResponse::err("share id is required");
    }

    // tear down everything the peer had running before dropping the share
    let runtimes = peer_share_runtime::Entity::find()
        .filter(peer_share_runtime::Column::ShareId.eq(request.id))
        .filter(peer_share_runtime::Column::Status.eq(1))
        .all(&state.db)
        .await;
    if let Ok(runtimes) = runtimes {
        for runtime in &runtimes {
            release_runtime(&state, runtime).await;
        }
    }

    match PeerShare::delete_by_id(request.id).exec(&state.db).await {
        Ok(_) => {
            info!(share_id = request.id, "peer share deleted");
            ApiResponse::ok_empty()
        }
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

/// Import a node another panel shares with us: exchange the token for the
/// node descriptor and persist it as a remote node.
pub async fn import_remote_node(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NodeImportRequest>,
) -> Json<ApiResponse> {
    let remote_url = request.remote_url.trim().to_string();
    let token = request.token.trim().to_string();
    if remote_url.is_empty() || token.is_empty() {
        return ApiResponse::err("remote url and token are required");
    }

    let client = FederationClient::new();
    let info = match client
        .connect(&remote_url, &token, state.orchestrator.local_domain())
        .await
    {
        Ok(info) => info,
        Err(err) => return ApiResponse::internal(format!("failed to connect: {err}")),
    };

    let remote_config = json!({
        "shareId": info.share_id,
        "maxBandwidth": info.max_bandwidth,
        "currentFlow": info.current_flow,
        "expiryTime": info.expiry_time,
        "portRangeStart": info.port_range_start,
        "portRangeEnd": info.port_range_end,
    });
    let port_range = if info.port_range_start > 0 && info.port_range_end >= info.port_range_start {
        format!("{}-{}", info.port_range_start, info.port_range_end)
    } else {
        "0".to_string()
    };

    let now = Utc::now();
    let inserted = node::ActiveModel {
        id: NotSet,
        name: Set(format!("{} (Remote)", info.node_name)),
        secret: Set(uuid::Uuid::new_v4().simple().to_string()),
        server_addr: Set(info.server_ip),
        server_addr_v4: Set(None),
        server_addr_v6: Set(None),
        port_range: Set(port_range),
        tcp_listen_addr: Set("[::]".to_string()),
        udp_listen_addr: Set("[::]".to_string()),
        interface_name: Set(None),
        version: Set(None),
        http: Set(0),
        tls: Set(0),
        socks: Set(0),
        status: Set(info.status),
        is_remote: Set(true),
        remote_url: Set(Some(remote_url)),
        remote_token: Set(Some(token)),
        remote_config: Set(Some(remote_config.to_string())),
        sort_index: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&state.db)
    .await;

    match inserted {
        Ok(row) => {
            info!(node_id = row.id, "remote node imported");
            ApiResponse::ok(json!({ "id": row.id }))
        }
        Err(err) => ApiResponse::internal(err.to_string()),
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

async fn find_runtime_by_key(
    state: &Arc<AppState>,
    share_id: i64,
    resource_key: &str,
) -> Result<Option<peer_share_runtime::Model>, sea_orm::DbErr> {
    peer_share_runtime::Entity::find()
        .filter(peer_share_runtime::Column::ShareId.eq(share_id))
        .filter(peer_share_runtime::Column::ResourceKey.eq(resource_key))
        .order_by_asc(peer_share_runtime::Column::Id)
        .one(&state.db)
        .await
}

async fn find_runtime_by_reservation(
    state: &Arc<AppState>,
    share_id: i64,
    reservation_id: &str,
) -> Result<Option<peer_share_runtime::Model>, sea_orm::DbErr> {
    peer_share_runtime::Entity::find()
        .filter(peer_share_runtime::Column::ShareId.eq(share_id))
        .filter(peer_share_runtime::Column::ReservationId.eq(reservation_id))
        .one(&state.db)
        .await
}

async fn find_runtime_by_binding(
    state: &Arc<AppState>,
    share_id: i64,
    binding_id: &str,
) -> Result<Option<peer_share_runtime::Model>, sea_orm::DbErr> {
    peer_share_runtime::Entity::find()
        .filter(peer_share_runtime::Column::ShareId.eq(share_id))
        .filter(peer_share_runtime::Column::BindingId.eq(binding_id))
        .one(&state.db)
        .await
}

/// Tear down an applied runtime on the shared node and mark it released.
async fn release_runtime(state: &Arc<AppState>, runtime: &peer_share_runtime::Model) {
    if runtime.applied {
        if !runtime.service_name.trim().is_empty() {
            let _ = state
                .channel
                .send_tolerant(
                    runtime.node_id,
                    CommandKind::DeleteService,
                    json!({ "services": [runtime.service_name] }),
                    COMMAND_TIMEOUT,
                    Tolerance::NOT_FOUND,
                )
                .await;
        }
        if runtime.role == "middle" && !runtime.chain_name.trim().is_empty() {
            let _ = state
                .channel
                .send_tolerant(
                    runtime.node_id,
                    CommandKind::DeleteChains,
                    json!({ "chain": runtime.chain_name }),
                    COMMAND_TIMEOUT,
                    Tolerance::NOT_FOUND,
                )
                .await;
        }
    }

    let update = peer_share_runtime::ActiveModel {
        id: Set(runtime.id),
        status: Set(0),
        applied: Set(false),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };
    if let Err(err) = update.update(&state.db).await {
        warn!(runtime_id = runtime.id, error = %err, "failed to mark runtime released");
    }
}

fn validate_share_bounds(expiry_time: i64, start: i32, end: i32) -> Result<(), String> {
    if expiry_time < 0 {
        return Err("expiry time cannot be negative".to_string());
    }
    if !(0..=65535).contains(&start) || !(0..=65535).contains(&end) {
        return Err("invalid port range".to_string());
    }
    if start > end {
        return Err("port range start cannot be greater than end".to_string());
    }
    Ok(())
}

fn expiry_from_millis(millis: i64) -> Option<chrono::DateTime<Utc>> {
    if millis <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
