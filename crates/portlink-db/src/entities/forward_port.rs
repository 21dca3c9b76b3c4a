//! ForwardPort entity: one ingress port per entry node of a forward's tunnel

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "forward_port")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub forward_id: i64,
    pub node_id: i64,
    pub port: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::forward::Entity",
        from = "Column::ForwardId",
        to = "super::forward::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Forward,
}

impl Related<super::forward::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Forward.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
