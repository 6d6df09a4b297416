use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Order lifecycle states. Stored as strings; `can_transition_to` is the
/// single transition table for the whole crate.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Confirmed,
    InPreparation,
    ReadyToShip,
    Shipped,
    Delivered,
    Returned,
    DeliveryFailed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::InPreparation => "in_preparation",
            Self::ReadyToShip => "ready_to_ship",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Returned => "returned",
            Self::DeliveryFailed => "delivery_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the order may still be cancelled (nothing has shipped).
    pub fn is_pre_shipment(&self) -> bool {
        matches!(self, Self::Confirmed | Self::InPreparation | Self::ReadyToShip)
    }

    /// Valid lifecycle edges. Transitioning to the current status is a
    /// no-op and allowed, tolerating retried requests.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        match (*self, to) {
            (Confirmed, InPreparation) => true,
            (InPreparation, ReadyToShip) => true,
            (ReadyToShip, Shipped) => true,
            (Shipped, Delivered) => true,
            (Shipped, Returned) => true,
            (Shipped, DeliveryFailed) => true,
            // An abandoned session releases its orders back to confirmed.
            (InPreparation, Confirmed) => true,
            (from, Cancelled) => from.is_pre_shipment(),
            (from, to) if from == to => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    pub tenant_id: Uuid,
    pub status: String,
    /// Set while the order is a member of a picking session.
    pub picking_session_id: Option<Uuid>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

impl Model {
    pub fn status(&self) -> Result<OrderStatus, strum::ParseError> {
        self.status.parse()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(
        belongs_to = "super::picking_session::Entity",
        from = "Column::PickingSessionId",
        to = "super::picking_session::Column::Id"
    )]
    PickingSession,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::picking_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PickingSession.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }

        if let ActiveValue::NotSet = active_model.updated_at {
            active_model.updated_at = Set(Some(now));
        }

        Ok(active_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_limited_to_pre_shipment_states() {
        assert!(OrderStatus::Confirmed.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::InPreparation.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::ReadyToShip.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn shipped_branches_into_terminal_outcomes() {
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Delivered));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Returned));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::DeliveryFailed));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Shipped));
    }

    #[test]
    fn status_round_trips_through_strings() {
        let parsed: OrderStatus = "ready_to_ship".parse().unwrap();
        assert_eq!(parsed, OrderStatus::ReadyToShip);
        assert_eq!(OrderStatus::ReadyToShip.as_str(), "ready_to_ship");
        assert_eq!(OrderStatus::ReadyToShip.to_string(), "ready_to_ship");
    }
}
