use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-order packing progress for one product within a session.
/// `quantity_packed` only moves through the concurrency layer and is
/// bounded above by `quantity_needed` and by the session basket.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "packing_progress")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub session_id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity_needed: i32,
    pub quantity_packed: i32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn remaining(&self) -> i32 {
        self.quantity_needed - self.quantity_packed
    }

    pub fn is_complete(&self) -> bool {
        self.quantity_packed >= self.quantity_needed
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
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
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

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
