use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregated pick progress for one product across all of a session's
/// member orders. `quantity_picked` is monotonically non-decreasing while
/// the session is picking, bounded above by `quantity_needed`; every
/// write goes through the concurrency layer.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "picking_progress")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub session_id: Uuid,
    pub product_id: Uuid,
    pub quantity_needed: i32,
    pub quantity_picked: i32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn remaining(&self) -> i32 {
        self.quantity_needed - self.quantity_picked
    }

    pub fn is_complete(&self) -> bool {
        self.quantity_picked >= self.quantity_needed
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::picking_session::Entity",
        from = "Column::SessionId",
        to = "super::picking_session::Column::Id"
    )]
    PickingSession,
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::picking_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PickingSession.def()
    }
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
