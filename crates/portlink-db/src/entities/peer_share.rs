//! PeerShare entity: a node slice we lease out to another control plane

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "peer_share")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub name: String,

    pub node_id: i64,

    /// Bearer token the peer panel authenticates with
    #[sea_orm(unique)]
    pub token: String,

    /// Traffic quota in bytes; 0 = unlimited
    pub max_bandwidth: i64,
    pub current_flow: i64,

    /// None = never expires
    pub expiry_at: Option<ChronoDateTimeUtc>,

    pub port_range_start: i32,
    pub port_range_end: i32,

    pub is_active: bool,

    /// Comma-separated panel domains allowed to use this share
    pub allowed_domains: Option<String>,
    /// Comma-separated IPs/CIDRs allowed to call the federation endpoints
    pub allowed_ips: Option<String>,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::peer_share_runtime::Entity")]
    PeerShareRuntime,
}

impl Related<super::peer_share_runtime::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PeerShareRuntime.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Quota check used by every federation endpoint that grants resources.
    pub fn flow_exceeded(&self) -> bool {
        self.max_bandwidth > 0 && self.current_flow >= self.max_bandwidth
    }
}
