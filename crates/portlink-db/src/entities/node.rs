//! Node entity: one proxy/forwarding agent, local or federated

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "node")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub name: String,

    /// Shared secret the agent authenticates with; also keys the envelope cipher
    pub secret: String,

    /// Legacy single address, used when the split v4/v6 fields are empty
    pub server_addr: String,

    pub server_addr_v4: Option<String>,
    pub server_addr_v6: Option<String>,

    /// Comma-separated single ports and inclusive ranges, e.g. "1000-2000,3005"
    pub port_range: String,

    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,

    /// Egress interface pinned into chain/service configs when set
    pub interface_name: Option<String>,

    /// Agent version reported on connect
    pub version: Option<String>,

    pub http: i32,
    pub tls: i32,
    pub socks: i32,

    /// 1 = online (agent connected), 0 = offline
    pub status: i32,

    /// Node owned by another control plane, driven over federation
    pub is_remote: bool,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    /// JSON blob of share metadata from the remote panel (quota, port range)
    pub remote_config: Option<String>,

    pub sort_index: i32,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::chain_node::Entity")]
    ChainNode,
}

impl Related<super::chain_node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChainNode.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Display name with the same fallback the UI uses.
    pub fn display_name(&self) -> String {
        let trimmed = self.name.trim();
        if trimmed.is_empty() {
            format!("node_{}", self.id)
        } else {
            trimmed.to_string()
        }
    }
}
