//! Tunnel topology construction
//!
//! Turns a create/update request into an in-memory topology (validate,
//! normalize, allocate local ports), reconstructs topologies from persisted
//! rows for redeploys, and persists chain rows transactionally.

use crate::dual_stack::IpPreference;
use crate::error::TopologyError;
use crate::ports::{pick_node_port, Reservations};
use portlink_db::entities::{chain_node, node, tunnel};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, NotSet, QueryFilter, QueryOrder,
    Set,
};
use serde::Deserialize;
use std::collections::HashMap;

pub const DEFAULT_PROTOCOL: &str = "tls";
pub const DEFAULT_STRATEGY: &str = "round";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Direct,
    Chained,
}

impl TunnelKind {
    pub fn from_i32(raw: i32) -> TunnelKind {
        if raw == tunnel::KIND_CHAINED {
            TunnelKind::Chained
        } else {
            TunnelKind::Direct
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            TunnelKind::Direct => tunnel::KIND_DIRECT,
            TunnelKind::Chained => tunnel::KIND_CHAINED,
        }
    }
}

/// One topology element as supplied by the caller. Port 0 means allocate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "nodeId")]
    pub node_id: i64,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
}

/// The topology part of a tunnel create/update request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologySpec {
    #[serde(default)]
    pub entries: Vec<NodeSpec>,
    #[serde(default)]
    pub hops: Vec<Vec<NodeSpec>>,
    #[serde(default)]
    pub exits: Vec<NodeSpec>,
}

/// One resolved topology participant.
#[derive(Debug, Clone)]
pub struct TopologyNode {
    pub node_id: i64,
    pub chain_role: i32,
    /// 1-based hop position; 0 for entries and exits
    pub hop_index: i32,
    /// 0 until allocated (remote nodes keep 0 for federation to assign)
    pub port: u16,
    pub protocol: String,
    pub strategy: String,
}

/// A validated in-memory tunnel topology.
#[derive(Debug, Clone)]
pub struct TunnelTopology {
    pub tunnel_id: i64,
    pub kind: TunnelKind,
    pub ip_preference: IpPreference,
    pub entries: Vec<TopologyNode>,
    pub hops: Vec<Vec<TopologyNode>>,
    pub exits: Vec<TopologyNode>,
    pub nodes: HashMap<i64, node::Model>,
}

impl TunnelTopology {
    pub fn node(&self, node_id: i64) -> Result<&node::Model, TopologyError> {
        self.nodes
            .get(&node_id)
            .ok_or(TopologyError::NodeNotFound(node_id))
    }

    /// The dial targets downstream of hop `hop_idx` (next hop group, or the
    /// exits after the last hop).
    pub fn targets_after_hop(&self, hop_idx: usize) -> &[TopologyNode] {
        if hop_idx + 1 < self.hops.len() {
            &self.hops[hop_idx + 1]
        } else {
            &self.exits
        }
    }

    /// Entry nodes dial the first hop group, or the exits when there are no
    /// hops.
    pub fn entry_targets(&self) -> &[TopologyNode] {
        if self.hops.is_empty() {
            &self.exits
        } else {
            &self.hops[0]
        }
    }
}

/// Share metadata carried in a remote node's `remote_config` blob.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteShareConfig {
    #[serde(default)]
    pub share_id: i64,
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

impl RemoteShareConfig {
    pub fn parse(raw: Option<&str>) -> RemoteShareConfig {
        raw.map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
}

/// Reject a port that falls outside a remote node's shared range. Local
/// nodes and unassigned ports pass.
pub fn validate_remote_node_port(node: &node::Model, port: u16) -> Result<(), TopologyError> {
    if port == 0 || !node.is_remote {
        return Ok(());
    }
    let config = RemoteShareConfig::parse(node.remote_config.as_deref());
    if config.port_range_start == 0 || config.port_range_end < config.port_range_start {
        return Ok(());
    }
    if port < config.port_range_start || port > config.port_range_end {
        return Err(TopologyError::PortOutOfRange {
            node: node.display_name(),
            port,
            start: config.port_range_start,
            end: config.port_range_end,
        });
    }
    Ok(())
}

/// Build a topology from a request: validate, load nodes, allocate local
/// ports. Remote hop/exit ports stay 0 for the federation phase.
pub async fn build_topology<C: ConnectionTrait>(
    conn: &C,
    spec: &TopologySpec,
    kind: TunnelKind,
    ip_preference: IpPreference,
    exclude_tunnel: Option<i64>,
) -> Result<TunnelTopology, TopologyError> {
    let entry_specs: Vec<&NodeSpec> = spec.entries.iter().filter(|s| s.node_id > 0).collect();
    if entry_specs.is_empty() {
        return Err(TopologyError::EmptyEntries);
    }

    let mut topology = TunnelTopology {
        tunnel_id: 0,
        kind,
        ip_preference,
        entries: Vec::new(),
        hops: Vec::new(),
        exits: Vec::new(),
        nodes: HashMap::new(),
    };

    let mut node_ids: Vec<i64> = Vec::new();
    let note_node = |node_ids: &mut Vec<i64>, node_id: i64| -> Result<(), TopologyError> {
        if node_ids.contains(&node_id) {
            return Err(TopologyError::DuplicateNode(node_id));
        }
        node_ids.push(node_id);
        Ok(())
    };

    for entry in &entry_specs {
        note_node(&mut node_ids, entry.node_id)?;
        topology.entries.push(TopologyNode {
            node_id: entry.node_id,
            chain_role: chain_node::ROLE_ENTRY,
            hop_index: 0,
            port: 0,
            protocol: default_protocol(&entry.protocol),
            strategy: default_strategy(&entry.strategy),
        });
    }

    if kind == TunnelKind::Chained {
        let exit_specs: Vec<&NodeSpec> = spec.exits.iter().filter(|s| s.node_id > 0).collect();
        if exit_specs.is_empty() {
            return Err(TopologyError::EmptyExits);
        }
        for exit in &exit_specs {
            note_node(&mut node_ids, exit.node_id)?;
            topology.exits.push(TopologyNode {
                node_id: exit.node_id,
                chain_role: chain_node::ROLE_EXIT,
                hop_index: 0,
                port: exit.port,
                protocol: default_protocol(&exit.protocol),
                strategy: default_strategy(&exit.strategy),
            });
        }

        for (group_idx, group) in spec.hops.iter().enumerate() {
            let mut hop = Vec::new();
            for item in group.iter().filter(|s| s.node_id > 0) {
                note_node(&mut node_ids, item.node_id)?;
                hop.push(TopologyNode {
                    node_id: item.node_id,
                    chain_role: chain_node::ROLE_HOP,
                    hop_index: group_idx as i32 + 1,
                    port: item.port,
                    protocol: default_protocol(&item.protocol),
                    strategy: default_strategy(&item.strategy),
                });
            }
            if !hop.is_empty() {
                topology.hops.push(hop);
            }
        }
    }

    // fetch the models and enforce the online precondition
    for node_id in node_ids {
        let model = node::Entity::find_by_id(node_id)
            .one(conn)
            .await?
            .ok_or(TopologyError::NodeNotFound(node_id))?;
        if !model.is_remote && model.status != 1 {
            return Err(TopologyError::NodeOffline(model.display_name()));
        }
        topology.nodes.insert(node_id, model);
    }

    // allocate ports for local hop/exit elements the caller left open
    let mut reserved = Reservations::new();
    for slot in topology
        .exits
        .iter_mut()
        .chain(topology.hops.iter_mut().flatten())
    {
        if slot.port > 0 {
            continue;
        }
        let model = topology
            .nodes
            .get(&slot.node_id)
            .ok_or(TopologyError::NodeNotFound(slot.node_id))?;
        if model.is_remote {
            continue;
        }
        slot.port = pick_node_port(conn, model, &mut reserved, exclude_tunnel)
            .await
            .map_err(|source| TopologyError::PortAlloc {
                node: model.display_name(),
                source,
            })?;
    }

    for slot in topology.exits.iter().chain(topology.hops.iter().flatten()) {
        let model = topology.node(slot.node_id)?;
        validate_remote_node_port(model, slot.port)?;
    }

    Ok(topology)
}

/// Rebuild a topology purely from persisted chain rows; safe to call without
/// the original request.
pub async fn reconstruct_topology<C: ConnectionTrait>(
    conn: &C,
    tunnel_id: i64,
) -> Result<TunnelTopology, TopologyError> {
    let tunnel = tunnel::Entity::find_by_id(tunnel_id)
        .one(conn)
        .await?
        .ok_or(TopologyError::TunnelNotFound(tunnel_id))?;

    let rows = chain_node::Entity::find()
        .filter(chain_node::Column::TunnelId.eq(tunnel_id))
        .order_by_asc(chain_node::Column::ChainRole)
        .order_by_asc(chain_node::Column::HopIndex)
        .order_by_asc(chain_node::Column::Id)
        .all(conn)
        .await?;

    let mut topology = TunnelTopology {
        tunnel_id,
        kind: TunnelKind::from_i32(tunnel.kind),
        ip_preference: IpPreference::parse(&tunnel.ip_preference),
        entries: Vec::new(),
        hops: Vec::new(),
        exits: Vec::new(),
        nodes: HashMap::new(),
    };

    let mut hops_by_index: Vec<(i32, Vec<TopologyNode>)> = Vec::new();
    for row in &rows {
        let element = TopologyNode {
            node_id: row.node_id,
            chain_role: row.chain_role,
            hop_index: row.hop_index,
            port: row.port.unwrap_or(0).max(0) as u16,
            protocol: row.protocol.clone(),
            strategy: row.strategy.clone(),
        };
        match row.chain_role {
            chain_node::ROLE_ENTRY => topology.entries.push(element),
            chain_node::ROLE_EXIT => topology.exits.push(element),
            _ => match hops_by_index.iter_mut().find(|(idx, _)| *idx == row.hop_index) {
                Some((_, group)) => group.push(element),
                None => hops_by_index.push((row.hop_index, vec![element])),
            },
        }
    }
    hops_by_index.sort_by_key(|(idx, _)| *idx);
    topology.hops = hops_by_index.into_iter().map(|(_, group)| group).collect();

    for row in &rows {
        if topology.nodes.contains_key(&row.node_id) {
            continue;
        }
        let model = node::Entity::find_by_id(row.node_id)
            .one(conn)
            .await?
            .ok_or(TopologyError::NodeNotFound(row.node_id))?;
        topology.nodes.insert(row.node_id, model);
    }

    Ok(topology)
}

/// Replace a tunnel's chain rows with the topology's elements. Runs inside
/// the caller's transaction; ports must be resolved by this point.
pub async fn persist_topology<C: ConnectionTrait>(
    conn: &C,
    topology: &TunnelTopology,
) -> Result<(), TopologyError> {
    chain_node::Entity::delete_many()
        .filter(chain_node::Column::TunnelId.eq(topology.tunnel_id))
        .exec(conn)
        .await?;

    for element in topology
        .entries
        .iter()
        .chain(topology.hops.iter().flatten())
        .chain(topology.exits.iter())
    {
        let port = match element.chain_role {
            chain_node::ROLE_ENTRY => None,
            _ => Some(element.port as i32),
        };
        chain_node::ActiveModel {
            id: NotSet,
            tunnel_id: Set(topology.tunnel_id),
            chain_role: Set(element.chain_role),
            node_id: Set(element.node_id),
            hop_index: Set(element.hop_index),
            port: Set(port),
            protocol: Set(element.protocol.clone()),
            strategy: Set(element.strategy.clone()),
        }
        .insert(conn)
        .await?;
    }
    Ok(())
}

/// Comma-joined entry addresses shown to users when creating forwards.
pub fn entry_ip_summary(topology: &TunnelTopology) -> String {
    let mut seen = Vec::new();
    for entry in &topology.entries {
        let Ok(model) = topology.node(entry.node_id) else {
            continue;
        };
        let mut push = |value: &str| {
            let value = value.trim();
            if !value.is_empty() && !seen.iter().any(|s| s == value) {
                seen.push(value.to_string());
            }
        };
        let v4 = model.server_addr_v4.as_deref().unwrap_or("").trim();
        let v6 = model.server_addr_v6.as_deref().unwrap_or("").trim();
        push(v4);
        push(v6);
        if v4.is_empty() && v6.is_empty() {
            push(&model.server_addr);
        }
    }
    seen.join(",")
}

/// Entry node ids of a tunnel in persisted order.
pub async fn tunnel_entry_node_ids<C: ConnectionTrait>(
    conn: &C,
    tunnel_id: i64,
) -> Result<Vec<i64>, sea_orm::DbErr> {
    let rows = chain_node::Entity::find()
        .filter(chain_node::Column::TunnelId.eq(tunnel_id))
        .filter(chain_node::Column::ChainRole.eq(chain_node::ROLE_ENTRY))
        .order_by_asc(chain_node::Column::Id)
        .all(conn)
        .await?;
    Ok(rows.into_iter().map(|row| row.node_id).collect())
}

fn default_protocol(value: &Option<String>) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_PROTOCOL)
        .to_string()
}

fn default_strategy(value: &Option<String>) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_STRATEGY)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_share_config_parses_known_fields() {
        let config = RemoteShareConfig::parse(Some(
            r#"{"shareId":7,"portRangeStart":30000,"portRangeEnd":30010,"maxBandwidth":1024}"#,
        ));
        assert_eq!(config.share_id, 7);
        assert_eq!(config.port_range_start, 30000);
        assert_eq!(config.port_range_end, 30010);

        assert_eq!(RemoteShareConfig::parse(None).share_id, 0);
        assert_eq!(RemoteShareConfig::parse(Some("not json")).share_id, 0);
    }

    #[test]
    fn remote_port_bounds_are_enforced() {
        let mut node = node::Model {
            is_remote: true,
            remote_config: Some(
                r#"{"shareId":1,"portRangeStart":30000,"portRangeEnd":30010}"#.to_string(),
            ),
            ..test_node()
        };
        assert!(validate_remote_node_port(&node, 30005).is_ok());
        assert!(validate_remote_node_port(&node, 0).is_ok());
        assert!(matches!(
            validate_remote_node_port(&node, 29999),
            Err(TopologyError::PortOutOfRange { .. })
        ));

        // local nodes and shares without bounds pass
        node.is_remote = false;
        assert!(validate_remote_node_port(&node, 29999).is_ok());
        node.is_remote = true;
        node.remote_config = None;
        assert!(validate_remote_node_port(&node, 29999).is_ok());
    }

    fn test_node() -> node::Model {
        let now = chrono::Utc::now();
        node::Model {
            id: 1,
            name: "n".into(),
            secret: String::new(),
            server_addr: "10.0.0.1".into(),
            server_addr_v4: None,
            server_addr_v6: None,
            port_range: "1000-65535".into(),
            tcp_listen_addr: "[::]".into(),
            udp_listen_addr: "[::]".into(),
            interface_name: None,
            version: None,
            http: 0,
            tls: 0,
            socks: 0,
            status: 1,
            is_remote: false,
            remote_url: None,
            remote_token: None,
            remote_config: None,
            sort_index: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
