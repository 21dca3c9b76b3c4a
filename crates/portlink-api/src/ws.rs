//! WebSocket endpoint for agents and admin observers
//!
//! Agents connect with `type=1&secret=<node secret>` plus their version and
//! protocol toggles; admin observers connect with `type=0&secret=<jwt>`.
//! One reader task runs per connection; command writes flow through the
//! session's outbound queue owned by the same task.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use portlink_db::entities::node;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PING_PERIOD: Duration = Duration::from_secs(15);
const PONG_WAIT: Duration = Duration::from_secs(45);
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "type")]
    pub kind: String,
    pub secret: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub http: String,
    #[serde(default)]
    pub tls: String,
    #[serde(default)]
    pub socks: String,
}

fn parse_int_default(value: &str, fallback: i32) -> i32 {
    value.trim().parse().unwrap_or(fallback)
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    match query.kind.as_str() {
        "1" => {
            let found = node::Entity::find()
                .filter(node::Column::Secret.eq(query.secret.clone()))
                .one(&state.db)
                .await;
            let Ok(Some(model)) = found else {
                return StatusCode::FORBIDDEN.into_response();
            };
            upgrade.on_upgrade(move |socket| handle_node_socket(state, model, query, socket))
        }
        "0" => {
            if state.jwt.validate(&query.secret).is_err() {
                return StatusCode::FORBIDDEN.into_response();
            }
            upgrade.on_upgrade(move |socket| handle_admin_socket(state, socket))
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn handle_node_socket(
    state: Arc<AppState>,
    model: node::Model,
    query: ConnectQuery,
    socket: WebSocket,
) {
    let node_id = model.id;
    info!(node_id, name = %model.display_name(), "agent connected");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let conn_id = state
        .channel
        .register_node(node_id, model.secret.clone(), outbound_tx);

    let update = node::ActiveModel {
        id: Set(node_id),
        status: Set(1),
        version: Set(Some(query.version.clone()).filter(|v| !v.trim().is_empty())),
        http: Set(parse_int_default(&query.http, 0)),
        tls: Set(parse_int_default(&query.tls, 0)),
        socks: Set(parse_int_default(&query.socks, 0)),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };
    if let Err(err) = update.update(&state.db).await {
        warn!(node_id, error = %err, "failed to mark node online");
    }
    state.channel.broadcast_status(node_id, true);

    let (mut sink, mut stream) = socket.split();
    let mut ping_interval = tokio::time::interval(PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut read_deadline = tokio::time::Instant::now() + PONG_WAIT;

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // queue dropped: this session was superseded
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        read_deadline = tokio::time::Instant::now() + PONG_WAIT;
                        state.channel.handle_inbound(node_id, text.as_str());
                    }
                    Some(Ok(Message::Pong(_))) => {
                        read_deadline = tokio::time::Instant::now() + PONG_WAIT;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        read_deadline = tokio::time::Instant::now() + PONG_WAIT;
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(node_id, error = %err, "agent socket error");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if tokio::time::Instant::now() > read_deadline {
                    warn!(node_id, "agent missed keepalive window");
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // only the current session marks the node offline; a superseded one
    // must not clobber its replacement
    if state.channel.unregister_node(node_id, conn_id) {
        let update = node::ActiveModel {
            id: Set(node_id),
            status: Set(0),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        if let Err(err) = update.update(&state.db).await {
            warn!(node_id, error = %err, "failed to mark node offline");
        }
        state.channel.broadcast_status(node_id, false);
        info!(node_id, "agent disconnected");
    } else {
        debug!(node_id, "stale agent session closed");
    }
}

async fn handle_admin_socket(state: Arc<AppState>, socket: WebSocket) {
    let (broadcast_tx, mut broadcast_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let admin_id = state.channel.register_admin(broadcast_tx);
    debug!(admin_id, "admin observer connected");

    let (mut sink, mut stream) = socket.split();
    let mut ping_interval = tokio::time::interval(PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut read_deadline = tokio::time::Instant::now() + PONG_WAIT;

    loop {
        tokio::select! {
            broadcast = broadcast_rx.recv() => {
                match broadcast {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Text(_))) => {
                        read_deadline = tokio::time::Instant::now() + PONG_WAIT;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        read_deadline = tokio::time::Instant::now() + PONG_WAIT;
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = ping_interval.tick() => {
                if tokio::time::Instant::now() > read_deadline {
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.channel.unregister_admin(admin_id);
    debug!(admin_id, "admin observer disconnected");
}
