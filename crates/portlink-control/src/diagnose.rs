//! Diagnostic path tracer
//!
//! Walks a tunnel's persisted topology edge by edge and probes each one with
//! a live TCP reachability check: local nodes over the command channel,
//! remote nodes through the federation diagnose endpoint. A broken edge
//! produces a failed row with 100% loss instead of aborting the trace.

use crate::error::TopologyError;
use crate::forwards::split_remote_targets;
use crate::orchestrator::{Orchestrator, COMMAND_TIMEOUT};
use crate::ports::first_port_from_range;
use crate::dual_stack;
use crate::topology::{reconstruct_topology, TopologyNode, TunnelKind, TunnelTopology};
use portlink_db::entities::{forward, node, tunnel};
use portlink_proto::federation::DiagnoseRequest;
use portlink_proto::CommandKind;
use sea_orm::EntityTrait;
use serde::Serialize;
use serde_json::{json, Value};

/// Probes per edge and per-probe timeout handed to the agent.
const PROBE_COUNT: u32 = 4;
const PROBE_TIMEOUT_MS: u64 = 5000;
/// External reachability target for the trailing edge of a tunnel trace.
const EXTERNAL_PROBE_HOST: &str = "www.google.com";
const EXTERNAL_PROBE_PORT: u16 = 443;

/// One probed edge of the trace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisEntry {
    pub node_id: i64,
    pub node_name: String,
    pub target_ip: String,
    pub target_port: u16,
    pub description: String,
    pub average_time: f64,
    pub packet_loss: f64,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisReport {
    pub name: String,
    pub timestamp: i64,
    pub results: Vec<DiagnosisEntry>,
}

impl Orchestrator {
    /// Trace a tunnel end to end: entry → hops → exit → external target.
    pub async fn diagnose_tunnel(&self, tunnel_id: i64) -> Result<DiagnosisReport, TopologyError> {
        let tunnel = tunnel::Entity::find_by_id(tunnel_id)
            .one(&self.db)
            .await?
            .ok_or(TopologyError::TunnelNotFound(tunnel_id))?;
        let topology = reconstruct_topology(&self.db, tunnel_id).await?;

        let mut results = Vec::new();
        if topology.kind == TunnelKind::Chained {
            self.trace_chain_edges(&topology, &mut results).await;
            for exit in &topology.exits {
                let description = format!(
                    "exit({})->external",
                    self.node_label(&topology, exit.node_id)
                );
                self.probe_edge(
                    &topology,
                    exit.node_id,
                    EXTERNAL_PROBE_HOST,
                    EXTERNAL_PROBE_PORT,
                    description,
                    &mut results,
                )
                .await;
            }
        } else {
            for entry in &topology.entries {
                let description = format!(
                    "entry({})->external",
                    self.node_label(&topology, entry.node_id)
                );
                self.probe_edge(
                    &topology,
                    entry.node_id,
                    EXTERNAL_PROBE_HOST,
                    EXTERNAL_PROBE_PORT,
                    description,
                    &mut results,
                )
                .await;
            }
        }

        Ok(DiagnosisReport {
            name: tunnel.name,
            timestamp: chrono::Utc::now().timestamp_millis(),
            results,
        })
    }

    /// Trace a forward: the tunnel's edges plus each exit (or entry, for
    /// direct tunnels) against the forward's parsed remote targets.
    pub async fn diagnose_forward(
        &self,
        forward: &forward::Model,
    ) -> Result<DiagnosisReport, TopologyError> {
        let targets = resolve_forward_targets(&forward.remote_addr)?;
        let topology = reconstruct_topology(&self.db, forward.tunnel_id).await?;

        let mut results = Vec::new();
        if topology.kind == TunnelKind::Chained {
            self.trace_chain_edges(&topology, &mut results).await;
            for exit in &topology.exits {
                for target in &targets {
                    let description = format!(
                        "exit({})->target({})",
                        self.node_label(&topology, exit.node_id),
                        target.raw
                    );
                    self.probe_edge(
                        &topology,
                        exit.node_id,
                        &target.host,
                        target.port,
                        description,
                        &mut results,
                    )
                    .await;
                }
            }
        } else {
            for entry in &topology.entries {
                for target in &targets {
                    let description = format!(
                        "entry({})->target({})",
                        self.node_label(&topology, entry.node_id),
                        target.raw
                    );
                    self.probe_edge(
                        &topology,
                        entry.node_id,
                        &target.host,
                        target.port,
                        description,
                        &mut results,
                    )
                    .await;
                }
            }
        }

        Ok(DiagnosisReport {
            name: forward.name.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            results,
        })
    }

    /// The entry→hop1→…→lastHop edges shared by tunnel and forward traces.
    async fn trace_chain_edges(&self, topology: &TunnelTopology, results: &mut Vec<DiagnosisEntry>) {
        for entry in &topology.entries {
            for target in topology.entry_targets() {
                let position = if topology.hops.is_empty() { "exit" } else { "hop 1" };
                let description = format!(
                    "entry({})->{}({})",
                    self.node_label(topology, entry.node_id),
                    position,
                    self.node_label(topology, target.node_id)
                );
                self.probe_chain_edge(topology, entry.node_id, target, description, results)
                    .await;
            }
        }

        for (hop_idx, hop) in topology.hops.iter().enumerate() {
            let downstream = topology.targets_after_hop(hop_idx);
            let downstream_label = if hop_idx + 1 < topology.hops.len() {
                format!("hop {}", hop_idx + 2)
            } else {
                "exit".to_string()
            };
            for element in hop {
                for target in downstream {
                    let description = format!(
                        "hop {}({})->{}({})",
                        hop_idx + 1,
                        self.node_label(topology, element.node_id),
                        downstream_label,
                        self.node_label(topology, target.node_id)
                    );
                    self.probe_chain_edge(topology, element.node_id, target, description, results)
                        .await;
                }
            }
        }
    }

    /// Probe one edge whose target is another chain node.
    async fn probe_chain_edge(
        &self,
        topology: &TunnelTopology,
        from_node_id: i64,
        target: &TopologyNode,
        description: String,
        results: &mut Vec<DiagnosisEntry>,
    ) {
        let Ok(target_model) = topology.node(target.node_id) else {
            results.push(self.failed_entry(
                topology,
                from_node_id,
                "",
                0,
                description,
                "target node does not exist",
            ));
            return;
        };
        match resolve_chain_probe_target(target_model, target.port) {
            Ok((host, port)) => {
                self.probe_edge(topology, from_node_id, &host, port, description, results)
                    .await;
            }
            Err(message) => {
                results.push(self.failed_entry(
                    topology,
                    from_node_id,
                    dual_stack::strip_brackets(&target_model.server_addr),
                    target.port,
                    description,
                    &message,
                ));
            }
        }
    }

    /// Probe one edge and append its report row; failures never abort.
    async fn probe_edge(
        &self,
        topology: &TunnelTopology,
        from_node_id: i64,
        target_ip: &str,
        target_port: u16,
        description: String,
        results: &mut Vec<DiagnosisEntry>,
    ) {
        let Ok(from) = topology.node(from_node_id) else {
            results.push(DiagnosisEntry {
                node_id: from_node_id,
                node_name: format!("node_{from_node_id}"),
                target_ip: target_ip.to_string(),
                target_port,
                description,
                average_time: 0.0,
                packet_loss: 100.0,
                success: false,
                message: "node does not exist".to_string(),
            });
            return;
        };

        let ping = if from.is_remote {
            self.tcp_ping_via_remote(from, target_ip, target_port).await
        } else {
            self.tcp_ping_via_node(from.id, target_ip, target_port).await
        };

        let entry = match ping {
            Ok(data) => {
                let success = data
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let mut message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if message.is_empty() && !success {
                    message = data
                        .get("errorMessage")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim()
                        .to_string();
                }
                if message.is_empty() {
                    message = if success {
                        "tcp connect ok".to_string()
                    } else {
                        "tcp connect failed".to_string()
                    };
                }
                DiagnosisEntry {
                    node_id: from.id,
                    node_name: from.display_name(),
                    target_ip: target_ip.to_string(),
                    target_port,
                    description,
                    average_time: data
                        .get("averageTime")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                    packet_loss: data
                        .get("packetLoss")
                        .and_then(Value::as_f64)
                        .unwrap_or(100.0),
                    success,
                    message,
                }
            }
            Err(message) => self.failed_entry(
                topology,
                from_node_id,
                target_ip,
                target_port,
                description,
                &message,
            ),
        };
        results.push(entry);
    }

    async fn tcp_ping_via_node(
        &self,
        node_id: i64,
        ip: &str,
        port: u16,
    ) -> Result<Value, String> {
        let result = self
            .channel
            .send_command(
                node_id,
                CommandKind::TcpPing,
                json!({
                    "ip": ip,
                    "port": port,
                    "count": PROBE_COUNT,
                    "timeout": PROBE_TIMEOUT_MS,
                }),
                COMMAND_TIMEOUT,
            )
            .await
            .map_err(|err| err.message)?;
        result.data.ok_or_else(|| "node returned no diagnosis data".to_string())
    }

    async fn tcp_ping_via_remote(
        &self,
        node: &node::Model,
        ip: &str,
        port: u16,
    ) -> Result<Value, String> {
        let url = node.remote_url.as_deref().unwrap_or("").trim();
        let token = node.remote_token.as_deref().unwrap_or("").trim();
        if url.is_empty() || token.is_empty() {
            return Err("remote node is missing federation credentials".to_string());
        }
        self.federation
            .diagnose(
                url,
                token,
                &self.local_domain,
                &DiagnoseRequest {
                    ip: ip.to_string(),
                    port,
                    count: PROBE_COUNT,
                    timeout: PROBE_TIMEOUT_MS,
                },
            )
            .await
            .map_err(|err| err.to_string())
    }

    fn failed_entry(
        &self,
        topology: &TunnelTopology,
        node_id: i64,
        target_ip: &str,
        target_port: u16,
        description: String,
        message: &str,
    ) -> DiagnosisEntry {
        let node_name = topology
            .node(node_id)
            .map(node::Model::display_name)
            .unwrap_or_else(|_| format!("node_{node_id}"));
        let message = if message.trim().is_empty() {
            "tcp connect failed"
        } else {
            message.trim()
        };
        DiagnosisEntry {
            node_id,
            node_name,
            target_ip: target_ip.to_string(),
            target_port,
            description,
            average_time: 0.0,
            packet_loss: 100.0,
            success: false,
            message: message.to_string(),
        }
    }

    fn node_label(&self, topology: &TunnelTopology, node_id: i64) -> String {
        topology
            .node(node_id)
            .map(node::Model::display_name)
            .unwrap_or_else(|_| format!("node_{node_id}"))
    }
}

struct ForwardTarget {
    raw: String,
    host: String,
    port: u16,
}

fn resolve_forward_targets(remote_addr: &str) -> Result<Vec<ForwardTarget>, TopologyError> {
    let raw_targets = split_remote_targets(remote_addr);
    if raw_targets.is_empty() {
        return Err(TopologyError::EmptyTargets);
    }

    let mut targets = Vec::new();
    for raw in raw_targets {
        if let Some((host, port)) = parse_target_address(&raw) {
            targets.push(ForwardTarget { raw, host, port });
        }
    }
    if targets.is_empty() {
        return Err(TopologyError::EmptyTargets);
    }
    Ok(targets)
}

/// Parse `host:port` (bracketed IPv6 included); `None` for malformed input.
fn parse_target_address(addr: &str) -> Option<(String, u16)> {
    let addr = addr.trim();
    let idx = addr.rfind(':')?;
    let host = dual_stack::strip_brackets(addr[..idx].trim());
    let port = addr[idx + 1..].trim().parse::<u16>().ok().filter(|p| *p > 0)?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Where to probe a chain node: its address plus its allocated port, falling
/// back to the first port of its range and finally 443.
fn resolve_chain_probe_target(
    target: &node::Model,
    preferred_port: u16,
) -> Result<(String, u16), String> {
    let host = dual_stack::strip_brackets(&target.server_addr).to_string();
    let host = if host.is_empty() {
        target
            .server_addr_v4
            .as_deref()
            .or(target.server_addr_v6.as_deref())
            .map(dual_stack::strip_brackets)
            .unwrap_or("")
            .to_string()
    } else {
        host
    };
    if host.is_empty() {
        return Err("target node has no address".to_string());
    }

    let mut port = preferred_port;
    if port == 0 {
        port = first_port_from_range(&target.port_range).unwrap_or(0);
    }
    if port == 0 {
        port = 443;
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_addresses_parse_with_brackets_and_ports() {
        assert_eq!(
            parse_target_address("10.0.0.1:8080"),
            Some(("10.0.0.1".to_string(), 8080))
        );
        assert_eq!(
            parse_target_address("[2001:db8::1]:443"),
            Some(("2001:db8::1".to_string(), 443))
        );
        assert_eq!(parse_target_address("no-port"), None);
        assert_eq!(parse_target_address("host:0"), None);
        assert_eq!(parse_target_address(":8080"), None);
    }

    #[test]
    fn probe_target_falls_back_through_range_then_443() {
        let now = chrono::Utc::now();
        let mut target = node::Model {
            id: 3,
            name: "exit".into(),
            secret: String::new(),
            server_addr: "[2001:db8::7]".into(),
            server_addr_v4: None,
            server_addr_v6: None,
            port_range: "2000-2010".into(),
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
        };

        assert_eq!(
            resolve_chain_probe_target(&target, 41000).unwrap(),
            ("2001:db8::7".to_string(), 41000)
        );
        assert_eq!(
            resolve_chain_probe_target(&target, 0).unwrap(),
            ("2001:db8::7".to_string(), 2000)
        );

        target.port_range = String::new();
        assert_eq!(
            resolve_chain_probe_target(&target, 0).unwrap(),
            ("2001:db8::7".to_string(), 443)
        );

        target.server_addr = String::new();
        target.server_addr_v4 = Some("10.0.0.7".into());
        assert_eq!(
            resolve_chain_probe_target(&target, 0).unwrap(),
            ("10.0.0.7".to_string(), 443)
        );

        target.server_addr_v4 = None;
        assert!(resolve_chain_probe_target(&target, 0).is_err());
    }

    #[test]
    fn empty_forward_targets_are_rejected() {
        assert!(resolve_forward_targets(" , ").is_err());
        assert!(resolve_forward_targets("bad-target").is_err());
        let ok = resolve_forward_targets("10.0.0.1:80,bad").unwrap();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].host, "10.0.0.1");
    }
}
