//! Local runtime application
//!
//! Pushes a chained tunnel's topology to every locally-owned node over the
//! command channel and unwinds partial pushes with compensating deletes.
//! Remote nodes are driven through federation and never touched here.

use crate::error::{Tolerance, TopologyError};
use crate::orchestrator::{chain_name, tunnel_service_name, Orchestrator, COMMAND_TIMEOUT};
use crate::topology::{reconstruct_topology, TopologyNode, TunnelKind, TunnelTopology};
use crate::{dual_stack, topology};
use portlink_db::entities::{chain_node, node};
use portlink_proto::CommandKind;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Result of a local runtime apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every locally-owned element acknowledged its configuration
    Applied,
    /// One or more offline/timed-out nodes were skipped; they reconcile on
    /// reconnect
    Deferred,
}

impl Orchestrator {
    /// Push chain and service configuration for every locally-owned element
    /// of a chained topology. Offline/timeout failures defer; any other
    /// failure rolls back what was already pushed and aborts.
    pub async fn apply_local_runtime(
        &self,
        topology: &TunnelTopology,
    ) -> Result<ApplyOutcome, TopologyError> {
        if topology.kind != TunnelKind::Chained {
            return Ok(ApplyOutcome::Applied);
        }

        let mut created_chains: Vec<i64> = Vec::new();
        let mut created_services: Vec<i64> = Vec::new();
        let mut deferred = false;

        for entry in &topology.entries {
            let model = topology.node(entry.node_id)?;
            if model.is_remote {
                continue;
            }
            let chain = build_chain_config(topology, entry.node_id, topology.entry_targets())?;
            match self
                .channel
                .send_tolerant(
                    entry.node_id,
                    CommandKind::AddChains,
                    chain,
                    COMMAND_TIMEOUT,
                    Tolerance::EXISTS,
                )
                .await
            {
                Ok(_) => created_chains.push(entry.node_id),
                Err(err) if err.is_deferrable() => {
                    debug!(node = %model.display_name(), error = %err, "deferring entry chain push");
                    deferred = true;
                }
                Err(err) => {
                    self.rollback_local_runtime(&created_chains, &created_services, topology.tunnel_id)
                        .await;
                    return Err(TopologyError::Command {
                        node: model.display_name(),
                        source: err,
                    });
                }
            }
        }

        for (hop_idx, hop) in topology.hops.iter().enumerate() {
            let targets = topology.targets_after_hop(hop_idx);
            for element in hop {
                let model = topology.node(element.node_id)?;
                if model.is_remote {
                    continue;
                }

                let chain = build_chain_config(topology, element.node_id, targets)?;
                match self
                    .channel
                    .send_tolerant(
                        element.node_id,
                        CommandKind::AddChains,
                        chain,
                        COMMAND_TIMEOUT,
                        Tolerance::EXISTS,
                    )
                    .await
                {
                    Ok(_) => created_chains.push(element.node_id),
                    Err(err) if err.is_deferrable() => {
                        debug!(node = %model.display_name(), error = %err, "deferring hop chain push");
                        deferred = true;
                        continue;
                    }
                    Err(err) => {
                        self.rollback_local_runtime(
                            &created_chains,
                            &created_services,
                            topology.tunnel_id,
                        )
                        .await;
                        return Err(TopologyError::Command {
                            node: model.display_name(),
                            source: err,
                        });
                    }
                }

                let service = build_tunnel_service_config(topology.tunnel_id, element, model);
                match self
                    .channel
                    .send_tolerant(
                        element.node_id,
                        CommandKind::AddService,
                        service,
                        COMMAND_TIMEOUT,
                        Tolerance::EXISTS,
                    )
                    .await
                {
                    Ok(_) => created_services.push(element.node_id),
                    Err(err) if err.is_deferrable() => {
                        debug!(node = %model.display_name(), error = %err, "deferring hop service push");
                        deferred = true;
                    }
                    Err(err) => {
                        self.rollback_local_runtime(
                            &created_chains,
                            &created_services,
                            topology.tunnel_id,
                        )
                        .await;
                        return Err(TopologyError::Command {
                            node: model.display_name(),
                            source: err,
                        });
                    }
                }
            }
        }

        for exit in &topology.exits {
            let model = topology.node(exit.node_id)?;
            if model.is_remote {
                continue;
            }
            let service = build_tunnel_service_config(topology.tunnel_id, exit, model);
            match self
                .channel
                .send_tolerant(
                    exit.node_id,
                    CommandKind::AddService,
                    service,
                    COMMAND_TIMEOUT,
                    Tolerance::EXISTS,
                )
                .await
            {
                Ok(_) => created_services.push(exit.node_id),
                Err(err) if err.is_deferrable() => {
                    debug!(node = %model.display_name(), error = %err, "deferring exit service push");
                    deferred = true;
                }
                Err(err) => {
                    self.rollback_local_runtime(&created_chains, &created_services, topology.tunnel_id)
                        .await;
                    return Err(TopologyError::Command {
                        node: model.display_name(),
                        source: err,
                    });
                }
            }
        }

        if deferred {
            info!(tunnel_id = topology.tunnel_id, "runtime apply deferred for offline nodes");
            Ok(ApplyOutcome::Deferred)
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }

    /// Best-effort reverse-order compensation for a partial apply. Deletes
    /// are idempotent: re-issuing against an already-clean node succeeds.
    pub async fn rollback_local_runtime(
        &self,
        chain_node_ids: &[i64],
        service_node_ids: &[i64],
        tunnel_id: i64,
    ) {
        let service = tunnel_service_name(tunnel_id);
        let mut seen = Vec::new();
        for &node_id in service_node_ids.iter().rev() {
            if seen.contains(&node_id) {
                continue;
            }
            seen.push(node_id);
            if let Err(err) = self
                .channel
                .send_tolerant(
                    node_id,
                    CommandKind::DeleteService,
                    json!({ "services": [service] }),
                    COMMAND_TIMEOUT,
                    Tolerance::NOT_FOUND,
                )
                .await
            {
                warn!(node_id, error = %err, "compensating service delete failed");
            }
        }

        let chain = chain_name(tunnel_id);
        let mut seen = Vec::new();
        for &node_id in chain_node_ids.iter().rev() {
            if seen.contains(&node_id) {
                continue;
            }
            seen.push(node_id);
            if let Err(err) = self
                .channel
                .send_tolerant(
                    node_id,
                    CommandKind::DeleteChains,
                    json!({ "chain": chain }),
                    COMMAND_TIMEOUT,
                    Tolerance::NOT_FOUND,
                )
                .await
            {
                warn!(node_id, error = %err, "compensating chain delete failed");
            }
        }
    }

    /// Tear down whatever a chained tunnel has configured on its nodes,
    /// derived from persisted rows. Used before updates and deletes; errors
    /// are ignored (offline nodes have nothing to tear down).
    pub async fn cleanup_tunnel_runtime(&self, tunnel_id: i64) {
        let topology = match reconstruct_topology(&self.db, tunnel_id).await {
            Ok(topology) => topology,
            Err(_) => return,
        };
        if topology.kind != TunnelKind::Chained {
            return;
        }

        let chain = chain_name(tunnel_id);
        let service = tunnel_service_name(tunnel_id);
        for element in topology
            .entries
            .iter()
            .chain(topology.hops.iter().flatten())
            .chain(topology.exits.iter())
        {
            if topology
                .node(element.node_id)
                .map(|m| m.is_remote)
                .unwrap_or(true)
            {
                continue;
            }
            if element.chain_role != chain_node::ROLE_EXIT {
                let _ = self
                    .channel
                    .send_tolerant(
                        element.node_id,
                        CommandKind::DeleteChains,
                        json!({ "chain": chain }),
                        COMMAND_TIMEOUT,
                        Tolerance::NOT_FOUND,
                    )
                    .await;
            }
            if element.chain_role != chain_node::ROLE_ENTRY {
                let _ = self
                    .channel
                    .send_tolerant(
                        element.node_id,
                        CommandKind::DeleteService,
                        json!({ "services": [service] }),
                        COMMAND_TIMEOUT,
                        Tolerance::NOT_FOUND,
                    )
                    .await;
            }
        }
    }

    /// Push a rate limiter to every entry node of a tunnel.
    pub async fn push_limiter(&self, tunnel_id: i64, limiter_id: i64, speed_mbps: i64) {
        let rate = speed_mbps as f64 / 8.0;
        let payload = json!({
            "name": limiter_id.to_string(),
            "limits": [format!("$ {rate:.1}MB {rate:.1}MB")],
        });
        let Ok(entry_nodes) = topology::tunnel_entry_node_ids(&self.db, tunnel_id).await else {
            return;
        };
        for node_id in entry_nodes {
            let _ = self
                .channel
                .send_tolerant(
                    node_id,
                    CommandKind::AddLimiters,
                    payload.clone(),
                    COMMAND_TIMEOUT,
                    Tolerance::EXISTS,
                )
                .await;
        }
    }

    /// Remove a rate limiter from every entry node of a tunnel.
    pub async fn remove_limiter(&self, tunnel_id: i64, limiter_id: i64) {
        let payload = json!({ "limiter": limiter_id.to_string() });
        let Ok(entry_nodes) = topology::tunnel_entry_node_ids(&self.db, tunnel_id).await else {
            return;
        };
        for node_id in entry_nodes {
            let _ = self
                .channel
                .send_tolerant(
                    node_id,
                    CommandKind::DeleteLimiters,
                    payload.clone(),
                    COMMAND_TIMEOUT,
                    Tolerance::NOT_FOUND,
                )
                .await;
        }
    }

    /// Push protocol toggles to an online node.
    pub async fn apply_node_protocols(
        &self,
        node_id: i64,
        http: i32,
        tls: i32,
        socks: i32,
    ) -> Result<(), crate::error::CommandError> {
        self.channel
            .send_command(
                node_id,
                CommandKind::SetProtocol,
                json!({ "http": http, "tls": tls, "socks": socks }),
                COMMAND_TIMEOUT,
            )
            .await
            .map(|_| ())
    }
}

fn is_tls_protocol(protocol: &str) -> bool {
    let trimmed = protocol.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("tls")
}

/// Relay chain pointing `from_node` at the given downstream targets, each
/// host-resolved from the dialing node's perspective.
pub fn build_chain_config(
    topology: &TunnelTopology,
    from_node_id: i64,
    targets: &[TopologyNode],
) -> Result<Value, TopologyError> {
    let from = topology.node(from_node_id)?;
    if targets.is_empty() {
        return Err(TopologyError::EmptyTargets);
    }

    let mut node_items = Vec::with_capacity(targets.len());
    for (idx, target) in targets.iter().enumerate() {
        let to = topology.node(target.node_id)?;
        let host = dual_stack::select_dial_host(from, to, topology.ip_preference)?;
        if target.port == 0 {
            return Err(TopologyError::MissingPort(to.display_name()));
        }

        let mut connector = json!({ "type": "relay" });
        if is_tls_protocol(&target.protocol) {
            connector["metadata"] = json!({ "nodelay": true });
        }
        node_items.push(json!({
            "name": format!("node_{}", idx + 1),
            "addr": dual_stack::format_host_port(&host, target.port),
            "connector": connector,
            "dialer": { "type": target.protocol },
        }));
    }

    let strategy = targets[0].strategy.trim();
    let strategy = if strategy.is_empty() { "round" } else { strategy };
    let mut hop = json!({
        "name": format!("hop_{}", topology.tunnel_id),
        "selector": {
            "strategy": strategy,
            "maxFails": 1,
            "failTimeout": 600_000_000_000i64,
        },
        "nodes": node_items,
    });
    if let Some(interface) = from.interface_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        hop["interface"] = json!(interface);
    }

    Ok(json!({
        "name": chain_name(topology.tunnel_id),
        "hops": [hop],
    }))
}

/// Relay service bound on a hop or exit node's allocated port.
pub fn build_tunnel_service_config(
    tunnel_id: i64,
    element: &TopologyNode,
    node: &node::Model,
) -> Value {
    let mut handler = json!({ "type": "relay" });
    if is_tls_protocol(&element.protocol) {
        handler["metadata"] = json!({ "nodelay": true });
    }
    if element.chain_role == chain_node::ROLE_HOP {
        handler["chain"] = json!(chain_name(tunnel_id));
    }

    let mut service = json!({
        "name": tunnel_service_name(tunnel_id),
        "addr": format!("{}:{}", node.tcp_listen_addr, element.port),
        "handler": handler,
        "listener": { "type": element.protocol },
    });
    if element.chain_role == chain_node::ROLE_EXIT {
        if let Some(interface) = node.interface_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            service["metadata"] = json!({ "interface": interface });
        }
    }

    json!([service])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dual_stack::IpPreference;
    use std::collections::HashMap;

    fn test_node(id: i64, v4: &str) -> node::Model {
        let now = chrono::Utc::now();
        node::Model {
            id,
            name: format!("node-{id}"),
            secret: String::new(),
            server_addr: String::new(),
            server_addr_v4: Some(v4.to_string()),
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

    fn two_node_topology() -> TunnelTopology {
        let mut nodes = HashMap::new();
        nodes.insert(1, test_node(1, "10.0.0.1"));
        nodes.insert(2, test_node(2, "10.0.0.2"));
        TunnelTopology {
            tunnel_id: 9,
            kind: TunnelKind::Chained,
            ip_preference: IpPreference::Auto,
            entries: vec![TopologyNode {
                node_id: 1,
                chain_role: chain_node::ROLE_ENTRY,
                hop_index: 0,
                port: 0,
                protocol: "tls".into(),
                strategy: "round".into(),
            }],
            hops: Vec::new(),
            exits: vec![TopologyNode {
                node_id: 2,
                chain_role: chain_node::ROLE_EXIT,
                hop_index: 0,
                port: 41000,
                protocol: "tls".into(),
                strategy: "round".into(),
            }],
            nodes,
        }
    }

    #[test]
    fn chain_config_points_at_resolved_targets() {
        let topology = two_node_topology();
        let chain = build_chain_config(&topology, 1, topology.entry_targets()).unwrap();

        assert_eq!(chain["name"], "chains_9");
        let hop = &chain["hops"][0];
        assert_eq!(hop["name"], "hop_9");
        assert_eq!(hop["selector"]["strategy"], "round");
        assert_eq!(hop["nodes"][0]["addr"], "10.0.0.2:41000");
        assert_eq!(hop["nodes"][0]["connector"]["type"], "relay");
        assert_eq!(hop["nodes"][0]["connector"]["metadata"]["nodelay"], true);
    }

    #[test]
    fn chain_config_requires_target_ports() {
        let mut topology = two_node_topology();
        topology.exits[0].port = 0;
        let err = build_chain_config(&topology, 1, topology.entry_targets()).unwrap_err();
        assert!(matches!(err, TopologyError::MissingPort(_)));
    }

    #[test]
    fn hop_service_carries_the_chain_and_exit_does_not() {
        let topology = two_node_topology();
        let node = topology.node(2).unwrap();

        let hop_element = TopologyNode {
            node_id: 2,
            chain_role: chain_node::ROLE_HOP,
            hop_index: 1,
            port: 42000,
            protocol: "tls".into(),
            strategy: "round".into(),
        };
        let hop_service = build_tunnel_service_config(9, &hop_element, node);
        assert_eq!(hop_service[0]["handler"]["chain"], "chains_9");
        assert_eq!(hop_service[0]["addr"], "[::]:42000");

        let exit_service = build_tunnel_service_config(9, &topology.exits[0], node);
        assert!(exit_service[0]["handler"].get("chain").is_none());
        assert_eq!(exit_service[0]["name"], "9_tls");
    }

    #[test]
    fn non_tls_dialers_skip_the_nodelay_metadata() {
        let mut topology = two_node_topology();
        topology.exits[0].protocol = "wss".into();
        let chain = build_chain_config(&topology, 1, topology.entry_targets()).unwrap();
        assert!(chain["hops"][0]["nodes"][0]["connector"]
            .get("metadata")
            .is_none());
        assert_eq!(chain["hops"][0]["nodes"][0]["dialer"]["type"], "wss");
    }
}
