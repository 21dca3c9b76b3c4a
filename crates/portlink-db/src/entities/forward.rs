//! Forward entity: a user-facing forwarding rule bound to a tunnel

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "forward")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub name: String,

    pub tunnel_id: i64,

    /// Comma-separated remote target addresses (host:port)
    pub remote_addr: String,

    pub strategy: String,

    /// 1 = running, 0 = paused
    pub status: i32,

    pub sort_index: i32,

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

    #[sea_orm(has_many = "super::forward_port::Entity")]
    ForwardPort,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl Related<super::forward_port::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ForwardPort.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
