//! Tunnel entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 1 = direct forward (entries dial targets themselves),
/// 2 = chained (entries relay through hops to exits)
pub const KIND_DIRECT: i32 = 1;
pub const KIND_CHAINED: i32 = 2;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnel")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(unique)]
    pub name: String,

    pub kind: i32,

    pub protocol: String,

    /// "" = auto, "v4" = prefer IPv4, "v6" = prefer IPv6
    pub ip_preference: String,

    /// 1 = enabled, 0 = disabled
    pub status: i32,

    /// Comma-joined entry node addresses, shown to users creating forwards
    pub entry_ip: Option<String>,

    pub sort_index: i32,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::chain_node::Entity")]
    ChainNode,
    #[sea_orm(has_many = "super::forward::Entity")]
    Forward,
}

impl Related<super::chain_node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChainNode.def()
    }
}

impl Related<super::forward::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Forward.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
