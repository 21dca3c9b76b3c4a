//! ChainNode entity: one topology participant of a tunnel

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const ROLE_ENTRY: i32 = 1;
pub const ROLE_HOP: i32 = 2;
pub const ROLE_EXIT: i32 = 3;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chain_node")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub tunnel_id: i64,

    /// 1 = entry, 2 = hop, 3 = exit
    pub chain_role: i32,

    pub node_id: i64,

    /// Hop position starting at 1; 0 for entries and exits
    pub hop_index: i32,

    /// Listen port on the node; NULL for entries (they are dialed into)
    pub port: Option<i32>,

    pub protocol: String,
    pub strategy: String,
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

    #[sea_orm(
        belongs_to = "super::node::Entity",
        from = "Column::NodeId",
        to = "super::node::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Node,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl Related<super::node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Node.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
