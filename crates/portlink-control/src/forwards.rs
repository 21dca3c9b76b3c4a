//! Forward service runtime
//!
//! A forward gets one TCP and one UDP ingress service on every entry node of
//! its tunnel, forwarding to its remote targets (through the tunnel's chain
//! when the tunnel is chained). Reconciliation is tolerant so re-applying a
//! forward never fails a batch.

use crate::dual_stack;
use crate::error::{CommandErrorKind, Tolerance, TopologyError};
use crate::orchestrator::{chain_name, forward_service_base, Orchestrator, COMMAND_TIMEOUT};
use portlink_db::entities::{forward, forward_port, node, tunnel};
use portlink_proto::CommandKind;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde_json::{json, Value};
use tracing::debug;

impl Orchestrator {
    /// Push (or re-push) a forward's ingress services to every entry node.
    /// With `fallback_add` set, a node that does not know the service yet is
    /// reconciled via AddService when the update command fails.
    pub async fn sync_forward_services(
        &self,
        forward: &forward::Model,
        kind: CommandKind,
        fallback_add: bool,
    ) -> Result<(), TopologyError> {
        let tunnel = tunnel::Entity::find_by_id(forward.tunnel_id)
            .one(&self.db)
            .await?
            .ok_or(TopologyError::TunnelNotFound(forward.tunnel_id))?;
        let ports = self.list_forward_ports(forward.id).await?;
        if ports.is_empty() {
            return Err(TopologyError::MissingPort(forward.name.clone()));
        }

        for port_row in &ports {
            let node = node::Entity::find_by_id(port_row.node_id)
                .one(&self.db)
                .await?
                .ok_or(TopologyError::NodeNotFound(port_row.node_id))?;

            let services = build_forward_service_configs(forward, &tunnel, &node, port_row.port as u16);
            let mut result = self
                .channel
                .send_tolerant(
                    node.id,
                    kind,
                    services.clone(),
                    COMMAND_TIMEOUT,
                    Tolerance::EXISTS,
                )
                .await;
            if result.is_err() && fallback_add && kind == CommandKind::UpdateService {
                result = self
                    .channel
                    .send_tolerant(
                        node.id,
                        CommandKind::AddService,
                        services,
                        COMMAND_TIMEOUT,
                        Tolerance::EXISTS,
                    )
                    .await;
            }
            if let Err(source) = result {
                return Err(TopologyError::Command {
                    node: node.display_name(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Drive a lifecycle command (pause/resume/delete) against a forward's
    /// services on every entry node. Both service name variants are tried;
    /// a node counts as handled when any variant succeeds.
    pub async fn control_forward_services(
        &self,
        forward: &forward::Model,
        kind: CommandKind,
        tolerate_not_found: bool,
    ) -> Result<(), TopologyError> {
        let ports = self.list_forward_ports(forward.id).await?;
        if ports.is_empty() {
            return Ok(());
        }

        let base = forward_service_base(forward.id);
        let variants = [format!("{base}_tcp"), format!("{base}_udp")];

        let mut seen_nodes = Vec::new();
        for port_row in &ports {
            if seen_nodes.contains(&port_row.node_id) {
                continue;
            }
            seen_nodes.push(port_row.node_id);

            let mut handled = false;
            let mut last_missing: Option<TopologyError> = None;
            for name in &variants {
                match self
                    .channel
                    .send_command(
                        port_row.node_id,
                        kind,
                        json!({ "services": [name] }),
                        COMMAND_TIMEOUT,
                    )
                    .await
                {
                    Ok(_) => handled = true,
                    Err(err) if err.kind == CommandErrorKind::NotFound => {
                        last_missing = Some(TopologyError::Command {
                            node: format!("node_{}", port_row.node_id),
                            source: err,
                        });
                    }
                    Err(source) => {
                        return Err(TopologyError::Command {
                            node: format!("node_{}", port_row.node_id),
                            source,
                        });
                    }
                }
            }

            if handled || tolerate_not_found {
                continue;
            }
            if let Some(err) = last_missing {
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn list_forward_ports(
        &self,
        forward_id: i64,
    ) -> Result<Vec<forward_port::Model>, sea_orm::DbErr> {
        forward_port::Entity::find()
            .filter(forward_port::Column::ForwardId.eq(forward_id))
            .order_by_asc(forward_port::Column::Id)
            .all(&self.db)
            .await
    }

    /// Re-sync every forward of a tunnel, e.g. after a redeploy. Failures
    /// abort so batch callers can count the tunnel as failed.
    pub async fn resync_tunnel_forwards(&self, tunnel_id: i64) -> Result<(), TopologyError> {
        let forwards = forward::Entity::find()
            .filter(forward::Column::TunnelId.eq(tunnel_id))
            .order_by_asc(forward::Column::Id)
            .all(&self.db)
            .await?;
        for item in &forwards {
            debug!(forward_id = item.id, "re-syncing forward services");
            self.sync_forward_services(item, CommandKind::UpdateService, true)
                .await?;
        }
        Ok(())
    }
}

/// Split a forward's comma-separated remote targets, bracket-normalized.
pub fn split_remote_targets(remote_addr: &str) -> Vec<String> {
    remote_addr
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(dual_stack::normalize_host_port)
        .collect()
}

/// The TCP and UDP ingress service documents for one entry node.
pub fn build_forward_service_configs(
    forward: &forward::Model,
    tunnel: &tunnel::Model,
    node: &node::Model,
    port: u16,
) -> Value {
    let base = forward_service_base(forward.id);
    let targets = split_remote_targets(&forward.remote_addr);
    let strategy = forward.strategy.trim();
    let strategy = if strategy.is_empty() { "fifo" } else { strategy };

    let forwarder_nodes: Vec<Value> = targets
        .iter()
        .enumerate()
        .map(|(idx, addr)| json!({ "name": format!("node_{}", idx + 1), "addr": addr }))
        .collect();

    let mut services = Vec::with_capacity(2);
    for protocol in ["tcp", "udp"] {
        let listen_addr = if protocol == "udp" {
            &node.udp_listen_addr
        } else {
            &node.tcp_listen_addr
        };

        let mut handler = json!({ "type": protocol });
        if tunnel.kind == tunnel::KIND_CHAINED {
            handler["chain"] = json!(chain_name(tunnel.id));
        }
        let mut listener = json!({ "type": protocol });
        if protocol == "udp" {
            listener["metadata"] = json!({ "keepAlive": true });
        }

        let mut service = json!({
            "name": format!("{base}_{protocol}"),
            "addr": format!("{listen_addr}:{port}"),
            "handler": handler,
            "listener": listener,
            "forwarder": {
                "nodes": forwarder_nodes,
                "selector": {
                    "strategy": strategy,
                    "maxFails": 1,
                    "failTimeout": "600s",
                },
            },
        });
        if tunnel.kind == tunnel::KIND_DIRECT {
            if let Some(interface) = node
                .interface_name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                service["metadata"] = json!({ "interface": interface });
            }
        }
        services.push(service);
    }

    Value::Array(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_forward(remote_addr: &str, strategy: &str) -> forward::Model {
        let now = Utc::now();
        forward::Model {
            id: 4,
            name: "web".into(),
            tunnel_id: 2,
            remote_addr: remote_addr.into(),
            strategy: strategy.into(),
            status: 1,
            sort_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_tunnel(kind: i32) -> tunnel::Model {
        let now = Utc::now();
        tunnel::Model {
            id: 2,
            name: "t".into(),
            kind,
            protocol: "tls".into(),
            ip_preference: String::new(),
            status: 1,
            entry_ip: None,
            sort_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_node(interface: Option<&str>) -> node::Model {
        let now = Utc::now();
        node::Model {
            id: 1,
            name: "entry".into(),
            secret: String::new(),
            server_addr: "10.0.0.1".into(),
            server_addr_v4: None,
            server_addr_v6: None,
            port_range: "1000-65535".into(),
            tcp_listen_addr: "[::]".into(),
            udp_listen_addr: "0.0.0.0".into(),
            interface_name: interface.map(str::to_string),
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

    #[test]
    fn remote_targets_split_and_bracket_ipv6() {
        let targets = split_remote_targets("10.0.0.5:80, 2001:db8::9:443 ,,example.com:8443");
        assert_eq!(
            targets,
            vec!["10.0.0.5:80", "[2001:db8::9]:443", "example.com:8443"]
        );
    }

    #[test]
    fn chained_forward_services_reference_the_tunnel_chain() {
        let services = build_forward_service_configs(
            &test_forward("192.168.1.50:8080", ""),
            &test_tunnel(tunnel::KIND_CHAINED),
            &test_node(None),
            12000,
        );

        assert_eq!(services[0]["name"], "fwd_4_tcp");
        assert_eq!(services[0]["addr"], "[::]:12000");
        assert_eq!(services[0]["handler"]["chain"], "chains_2");
        assert_eq!(services[0]["forwarder"]["selector"]["strategy"], "fifo");
        assert_eq!(services[1]["name"], "fwd_4_udp");
        assert_eq!(services[1]["addr"], "0.0.0.0:12000");
        assert_eq!(services[1]["listener"]["metadata"]["keepAlive"], true);
    }

    #[test]
    fn direct_forward_pins_the_egress_interface() {
        let services = build_forward_service_configs(
            &test_forward("192.168.1.50:8080,192.168.1.51:8080", "hash"),
            &test_tunnel(tunnel::KIND_DIRECT),
            &test_node(Some("eth1")),
            12000,
        );

        assert!(services[0]["handler"].get("chain").is_none());
        assert_eq!(services[0]["metadata"]["interface"], "eth1");
        assert_eq!(services[0]["forwarder"]["nodes"][1]["addr"], "192.168.1.51:8080");
        assert_eq!(services[0]["forwarder"]["selector"]["strategy"], "hash");
    }
}
