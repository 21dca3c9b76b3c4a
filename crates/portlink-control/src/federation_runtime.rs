//! Federation runtime application
//!
//! Leases ports and roles on remote control planes for every remote hop and
//! exit of a topology. Exits go first (their ports feed the hops' targets),
//! then hop groups from last to first so every middle role knows its
//! downstream dial targets. Any failure releases everything acquired so far
//! in reverse order before surfacing.

use crate::error::TopologyError;
use crate::orchestrator::Orchestrator;
use crate::topology::TunnelTopology;
use crate::{dual_stack, topology::TopologyNode};
use chrono::Utc;
use portlink_db::entities::{chain_node, federation_binding, node};
use portlink_proto::federation::{
    ApplyRoleRequest, DialTarget, ReleaseRoleRequest, ReservePortRequest,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, NotSet, QueryFilter, Set,
};
use tracing::{debug, warn};

/// Deterministic key for one (tunnel, node, role, hop) slot.
pub fn resource_key(tunnel_id: i64, node_id: i64, chain_role: i32, hop_index: i32) -> String {
    format!("tunnel:{tunnel_id}:node:{node_id}:type:{chain_role}:hop:{hop_index}")
}

/// Everything needed to undo one acquired lease.
#[derive(Debug, Clone)]
pub struct ReleaseRef {
    pub remote_url: String,
    pub remote_token: String,
    pub binding_id: String,
    pub reservation_id: String,
    pub resource_key: String,
}

/// A binding to persist once the surrounding transaction commits.
#[derive(Debug, Clone)]
pub struct BindingDraft {
    pub node_id: i64,
    pub chain_role: i32,
    pub hop_index: i32,
    pub remote_url: String,
    pub resource_key: String,
    pub remote_binding_id: String,
    pub reservation_id: String,
    pub allocated_port: u16,
}

struct RemoteCredentials {
    url: String,
    token: String,
}

fn remote_credentials(model: &node::Model) -> Result<RemoteCredentials, TopologyError> {
    let url = model.remote_url.as_deref().unwrap_or("").trim().to_string();
    let token = model.remote_token.as_deref().unwrap_or("").trim().to_string();
    if url.is_empty() || token.is_empty() {
        return Err(TopologyError::MissingRemoteCredentials(model.display_name()));
    }
    Ok(RemoteCredentials { url, token })
}

impl Orchestrator {
    /// Reserve ports and apply roles for every remote hop/exit, writing the
    /// assigned ports back into the topology. Returns the bindings to
    /// persist and the refs to release on any later failure.
    pub async fn apply_federation_runtime(
        &self,
        topology: &mut TunnelTopology,
    ) -> Result<(Vec<BindingDraft>, Vec<ReleaseRef>), TopologyError> {
        let mut bindings: Vec<BindingDraft> = Vec::new();
        let mut release_refs: Vec<ReleaseRef> = Vec::new();

        for exit_idx in 0..topology.exits.len() {
            let element = topology.exits[exit_idx].clone();
            let model = topology.node(element.node_id)?.clone();
            if !model.is_remote {
                continue;
            }

            let outcome = self
                .lease_remote_slot(topology, &model, &element, Vec::new())
                .await;
            match outcome {
                Ok((draft, release, port)) => {
                    topology.exits[exit_idx].port = port;
                    bindings.push(draft);
                    release_refs.push(release);
                }
                Err(err) => {
                    self.release_refs(&release_refs).await;
                    return Err(err);
                }
            }
        }

        for hop_idx in (0..topology.hops.len()).rev() {
            for element_idx in 0..topology.hops[hop_idx].len() {
                let element = topology.hops[hop_idx][element_idx].clone();
                let model = topology.node(element.node_id)?.clone();
                if !model.is_remote {
                    continue;
                }

                let targets = match self.resolve_middle_targets(topology, &model, hop_idx) {
                    Ok(targets) => targets,
                    Err(err) => {
                        self.release_refs(&release_refs).await;
                        return Err(err);
                    }
                };

                let outcome = self
                    .lease_remote_slot(topology, &model, &element, targets)
                    .await;
                match outcome {
                    Ok((draft, release, port)) => {
                        topology.hops[hop_idx][element_idx].port = port;
                        bindings.push(draft);
                        release_refs.push(release);
                    }
                    Err(err) => {
                        self.release_refs(&release_refs).await;
                        return Err(err);
                    }
                }
            }
        }

        Ok((bindings, release_refs))
    }

    /// Release leases in reverse acquisition order, swallowing errors: the
    /// remote treats repeated releases as success, and a dead peer's leases
    /// expire on its side.
    pub async fn release_refs(&self, refs: &[ReleaseRef]) {
        for release in refs.iter().rev() {
            if release.remote_url.is_empty() || release.remote_token.is_empty() {
                continue;
            }
            let request = ReleaseRoleRequest {
                binding_id: release.binding_id.clone(),
                reservation_id: release.reservation_id.clone(),
                resource_key: release.resource_key.clone(),
            };
            if let Err(err) = self
                .federation
                .release_role(&release.remote_url, &release.remote_token, &self.local_domain, &request)
                .await
            {
                warn!(resource_key = %release.resource_key, error = %err, "federation release failed");
            }
        }
    }

    /// Release every persisted binding of a tunnel and delete the rows.
    pub async fn cleanup_federation_runtime(&self, tunnel_id: i64) {
        let bindings = match federation_binding::Entity::find()
            .filter(federation_binding::Column::TunnelId.eq(tunnel_id))
            .filter(federation_binding::Column::Status.eq(1))
            .all(&self.db)
            .await
        {
            Ok(bindings) => bindings,
            Err(err) => {
                warn!(tunnel_id, error = %err, "failed to load federation bindings");
                return;
            }
        };
        if bindings.is_empty() {
            return;
        }

        for binding in &bindings {
            let node = node::Entity::find_by_id(binding.node_id).one(&self.db).await;
            let Ok(Some(node)) = node else {
                continue;
            };
            let url = node
                .remote_url
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(binding.remote_url.trim())
                .to_string();
            let token = node
                .remote_token
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("")
                .to_string();
            if url.is_empty() || token.is_empty() {
                continue;
            }

            let request = ReleaseRoleRequest {
                binding_id: binding.remote_binding_id.trim().to_string(),
                reservation_id: binding.reservation_id.trim().to_string(),
                resource_key: binding.resource_key.trim().to_string(),
            };
            if let Err(err) = self
                .federation
                .release_role(&url, &token, &self.local_domain, &request)
                .await
            {
                debug!(resource_key = %binding.resource_key, error = %err, "federation cleanup release failed");
            }
        }

        if let Err(err) = federation_binding::Entity::delete_many()
            .filter(federation_binding::Column::TunnelId.eq(tunnel_id))
            .exec(&self.db)
            .await
        {
            warn!(tunnel_id, error = %err, "failed to delete federation bindings");
        }
    }

    async fn lease_remote_slot(
        &self,
        topology: &TunnelTopology,
        model: &node::Model,
        element: &TopologyNode,
        targets: Vec<DialTarget>,
    ) -> Result<(BindingDraft, ReleaseRef, u16), TopologyError> {
        let role = role_for_chain(element.chain_role);
        let credentials = remote_credentials(model)?;
        let key = resource_key(
            topology.tunnel_id,
            element.node_id,
            element.chain_role,
            element.hop_index,
        );

        let mut reserve = ReservePortRequest {
            resource_key: key.clone(),
            protocol: element.protocol.clone(),
            requested_port: element.port,
        };
        let reserved = match self
            .federation
            .reserve_port(&credentials.url, &credentials.token, &self.local_domain, &reserve)
            .await
        {
            Ok(reserved) => reserved,
            // a busy requested port gets one retry with auto-assign
            Err(err) if reserve.requested_port > 0 => {
                debug!(resource_key = %key, error = %err, "requested port busy, retrying with auto-assign");
                reserve.requested_port = 0;
                self.federation
                    .reserve_port(&credentials.url, &credentials.token, &self.local_domain, &reserve)
                    .await
                    .map_err(|source| TopologyError::Federation {
                        node: model.display_name(),
                        source,
                    })?
            }
            Err(source) => {
                return Err(TopologyError::Federation {
                    node: model.display_name(),
                    source,
                })
            }
        };

        let mut port = reserved.allocated_port;
        let apply = ApplyRoleRequest {
            reservation_id: reserved.reservation_id.clone(),
            resource_key: key.clone(),
            role: role.to_string(),
            protocol: element.protocol.clone(),
            strategy: element.strategy.clone(),
            targets,
        };
        let applied = self
            .federation
            .apply_role(&credentials.url, &credentials.token, &self.local_domain, &apply)
            .await
            .map_err(|source| TopologyError::Federation {
                node: model.display_name(),
                source,
            });
        let applied = match applied {
            Ok(applied) => applied,
            Err(err) => {
                // this slot's own reservation is released here; earlier
                // slots are the caller's responsibility
                let request = ReleaseRoleRequest {
                    binding_id: reserved.binding_id.clone(),
                    reservation_id: reserved.reservation_id.clone(),
                    resource_key: key.clone(),
                };
                if let Err(release_err) = self
                    .federation
                    .release_role(&credentials.url, &credentials.token, &self.local_domain, &request)
                    .await
                {
                    warn!(resource_key = %key, error = %release_err, "release after failed apply failed");
                }
                return Err(err);
            }
        };
        if applied.allocated_port > 0 {
            port = applied.allocated_port;
        }

        let binding_id = if applied.binding_id.trim().is_empty() {
            reserved.binding_id.clone()
        } else {
            applied.binding_id.clone()
        };

        let draft = BindingDraft {
            node_id: element.node_id,
            chain_role: element.chain_role,
            hop_index: element.hop_index,
            remote_url: credentials.url.clone(),
            resource_key: key.clone(),
            remote_binding_id: binding_id,
            reservation_id: reserved.reservation_id.clone(),
            allocated_port: port,
        };
        let release = ReleaseRef {
            remote_url: credentials.url,
            remote_token: credentials.token,
            binding_id: applied.binding_id,
            reservation_id: reserved.reservation_id,
            resource_key: key,
        };
        Ok((draft, release, port))
    }

    /// Dial targets of a remote middle hop, resolved from the remote node's
    /// own address perspective.
    fn resolve_middle_targets(
        &self,
        topology: &TunnelTopology,
        from: &node::Model,
        hop_idx: usize,
    ) -> Result<Vec<DialTarget>, TopologyError> {
        let downstream = topology.targets_after_hop(hop_idx);
        let mut targets = Vec::with_capacity(downstream.len());
        for target in downstream {
            let to = topology.node(target.node_id)?;
            let host = dual_stack::select_dial_host(from, to, topology.ip_preference)?;
            if target.port == 0 {
                return Err(TopologyError::MissingPort(to.display_name()));
            }
            targets.push(DialTarget {
                host,
                port: target.port,
                protocol: target.protocol.clone(),
            });
        }
        Ok(targets)
    }
}

/// Replace a tunnel's persisted bindings inside the caller's transaction.
pub async fn persist_bindings<C: ConnectionTrait>(
    conn: &C,
    tunnel_id: i64,
    drafts: &[BindingDraft],
) -> Result<(), TopologyError> {
    federation_binding::Entity::delete_many()
        .filter(federation_binding::Column::TunnelId.eq(tunnel_id))
        .exec(conn)
        .await?;

    let now = Utc::now();
    for draft in drafts {
        federation_binding::ActiveModel {
            id: NotSet,
            tunnel_id: Set(tunnel_id),
            node_id: Set(draft.node_id),
            chain_role: Set(draft.chain_role),
            hop_index: Set(draft.hop_index),
            remote_url: Set(draft.remote_url.clone()),
            resource_key: Set(draft.resource_key.clone()),
            remote_binding_id: Set(draft.remote_binding_id.clone()),
            reservation_id: Set(draft.reservation_id.clone()),
            allocated_port: Set(draft.allocated_port as i32),
            status: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;
    }
    Ok(())
}

/// The chain role encoded into a resource key for hops and exits.
pub fn role_for_chain(chain_role: i32) -> &'static str {
    if chain_role == chain_node::ROLE_HOP {
        "middle"
    } else {
        "exit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_keys_are_deterministic_per_slot() {
        assert_eq!(
            resource_key(12, 7, chain_node::ROLE_EXIT, 0),
            "tunnel:12:node:7:type:3:hop:0"
        );
        assert_eq!(
            resource_key(12, 8, chain_node::ROLE_HOP, 2),
            "tunnel:12:node:8:type:2:hop:2"
        );
        // idempotent re-application depends on the key being stable
        assert_eq!(
            resource_key(12, 7, chain_node::ROLE_EXIT, 0),
            resource_key(12, 7, chain_node::ROLE_EXIT, 0)
        );
    }

    #[test]
    fn roles_map_to_wire_names() {
        assert_eq!(role_for_chain(chain_node::ROLE_HOP), "middle");
        assert_eq!(role_for_chain(chain_node::ROLE_EXIT), "exit");
    }
}
