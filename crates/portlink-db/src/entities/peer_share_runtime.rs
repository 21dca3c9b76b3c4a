//! PeerShareRuntime entity: one reservation/binding granted on a share

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "peer_share_runtime")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub share_id: i64,
    pub node_id: i64,

    pub reservation_id: String,

    /// Peer-supplied resource key; reservation is idempotent per key
    pub resource_key: String,

    /// Empty until a role has been applied
    pub binding_id: String,

    /// "exit" or "middle" once applied
    pub role: String,

    pub chain_name: String,
    pub service_name: String,

    pub protocol: String,
    pub strategy: String,

    pub port: i32,

    /// JSON array of the targets a middle role forwards to
    pub target: String,

    pub applied: bool,

    /// 1 = active, 0 = released
    pub status: i32,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::peer_share::Entity",
        from = "Column::ShareId",
        to = "super::peer_share::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    PeerShare,
}

impl Related<super::peer_share::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PeerShare.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
