//! FederationBinding entity
//!
//! Durable record that one (tunnel, node, role, hop) slot is backed by a
//! lease on a remote control plane. Created when a remote hop's runtime is
//! applied; deleted (and the remote lease released) on edit, redeploy and
//! delete of the tunnel.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "federation_binding")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub tunnel_id: i64,
    pub node_id: i64,

    pub chain_role: i32,
    pub hop_index: i32,

    pub remote_url: String,

    /// Deterministic `tunnel:<id>:node:<id>:type:<role>:hop:<n>` key making
    /// re-application idempotent on the remote side
    pub resource_key: String,

    pub remote_binding_id: String,
    pub reservation_id: String,

    pub allocated_port: i32,

    pub status: i32,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tunnel::Entity",
        from = "Column::TunnelId",
        to = "super::tunnel::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
