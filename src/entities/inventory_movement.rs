use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One immutable, append-only stock movement. Rows are never updated or
/// deleted; reconciliation treats them as the source of truth.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_movements")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub delta: i32,
    /// Stock level immediately after this movement was applied.
    pub resulting_stock: i32,
    pub reference_type: String,
    pub reference_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Reference types used by the crate's own movement writers.
pub mod reference_types {
    pub const ORDER: &str = "order";
    pub const ORDER_CANCELLATION: &str = "order_cancellation";
    pub const RECEIPT: &str = "receipt";
    pub const ADJUSTMENT: &str = "adjustment";
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
