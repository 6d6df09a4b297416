use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    concurrency::{self, RetryPolicy},
    db::DbPool,
    entities::inventory_movement::{self, reference_types, Entity as InventoryMovementEntity},
    entities::order::{self, Entity as OrderEntity, OrderStatus},
    entities::order_item::{self, Entity as OrderItemEntity},
    entities::packing_progress::{self, Entity as PackingProgressEntity},
    entities::picking_progress::{self, Entity as PickingProgressEntity},
    entities::picking_session::{Entity as PickingSessionEntity, SessionStatus},
    errors::{flatten_transaction_error, ServiceError},
    events::{Event, EventSender},
    services::inventory::{append_movement, MovementReference},
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderLineInput {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderInput {
    pub tenant_id: Uuid,
    /// Generated when absent.
    pub order_number: Option<String>,
    #[validate(length(min = 1))]
    pub items: Vec<OrderLineInput>,
    pub notes: Option<String>,
}

/// What a committed transition did, for event emission by the caller.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub order: order::Model,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
    pub movements: Vec<inventory_movement::Model>,
}

impl TransitionRecord {
    pub fn changed(&self) -> bool {
        self.old_status != self.new_status
    }
}

/// Order lifecycle state machine. The `in_preparation → ready_to_ship`
/// edge is the single point where ledger movements are written for an
/// order's line items, all-or-nothing within one transaction.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    retry_policy: RetryPolicy,
}

impl OrderService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender, retry_policy: RetryPolicy) -> Self {
        Self {
            db,
            event_sender,
            retry_policy,
        }
    }

    /// Creates a `confirmed` order with fixed line items. Order intake is
    /// an external collaborator; this is its contract made callable for
    /// composition and tests.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id))]
    pub async fn create_order(
        &self,
        input: CreateOrderInput,
    ) -> Result<(order::Model, Vec<order_item::Model>), ServiceError> {
        input.validate()?;
        let mut seen = std::collections::HashSet::new();
        for line in &input.items {
            line.validate()?;
            if !seen.insert(line.product_id) {
                return Err(ServiceError::ValidationError(format!(
                    "duplicate line item for product {}",
                    line.product_id
                )));
            }
        }

        let order_id = Uuid::new_v4();
        let order_number = input
            .order_number
            .clone()
            .unwrap_or_else(generate_order_number);

        let db = &*self.db;
        let created = db
            .transaction::<_, (order::Model, Vec<order_item::Model>), ServiceError>(move |txn| {
                Box::pin(async move {
                    let order = order::ActiveModel {
                        id: Set(order_id),
                        order_number: Set(order_number),
                        tenant_id: Set(input.tenant_id),
                        status: Set(OrderStatus::Confirmed.as_str().to_string()),
                        picking_session_id: Set(None),
                        notes: Set(input.notes.clone()),
                        version: Set(0),
                        ..Default::default()
                    };
                    let order = order.insert(txn).await.map_err(ServiceError::db_error)?;

                    let mut items = Vec::with_capacity(input.items.len());
                    for line in &input.items {
                        let item = order_item::ActiveModel {
                            id: Set(Uuid::new_v4()),
                            order_id: Set(order_id),
                            product_id: Set(line.product_id),
                            quantity: Set(line.quantity),
                            ..Default::default()
                        };
                        items.push(item.insert(txn).await.map_err(ServiceError::db_error)?);
                    }

                    Ok((order, items))
                })
            })
            .await
            .map_err(flatten_transaction_error)?;

        info!(order_id = %created.0.id, order_number = %created.0.order_number, "Order created");
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    #[instrument(skip(self))]
    pub async fn get_order_with_items(
        &self,
        order_id: Uuid,
    ) -> Result<(order::Model, Vec<order_item::Model>), ServiceError> {
        let order = self.get_order(order_id).await?;
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok((order, items))
    }

    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let paginator = OrderEntity::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, limit.max(1));

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let items = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;
        Ok((items, total))
    }

    /// Moves an order along the lifecycle. Retries transparently on
    /// write conflicts; a retried transition re-validates against fresh
    /// state, so a concurrently-applied identical transition lands as a
    /// no-op success.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn transition(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let db = self.db.clone();
        let record = concurrency::with_retries(&self.retry_policy, "order_transition", || {
            let db = db.clone();
            async move {
                db.transaction::<_, TransitionRecord, ServiceError>(move |txn| {
                    Box::pin(async move { transition_order(txn, order_id, new_status).await })
                })
                .await
                .map_err(flatten_transaction_error)
            }
            .boxed()
        })
        .await?;

        self.emit_transition(&record).await?;
        Ok(record.order)
    }

    pub async fn mark_shipped(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.transition(order_id, OrderStatus::Shipped).await
    }

    pub async fn mark_delivered(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.transition(order_id, OrderStatus::Delivered).await
    }

    pub async fn mark_delivery_failed(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.transition(order_id, OrderStatus::DeliveryFailed).await
    }

    pub async fn mark_returned(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.transition(order_id, OrderStatus::Returned).await
    }

    /// Cancels a pre-shipment order. If the order already decremented
    /// stock, compensating positive movements restore it in the same
    /// transaction. A member of a live session is detached and the
    /// session's aggregated requirements shrink accordingly.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let db = self.db.clone();
        let (record, restored) =
            concurrency::with_retries(&self.retry_policy, "order_cancel", || {
                let db = db.clone();
                async move {
                    db.transaction::<_, (TransitionRecord, bool), ServiceError>(move |txn| {
                        Box::pin(async move { cancel_order_in_txn(txn, order_id).await })
                    })
                    .await
                    .map_err(flatten_transaction_error)
                }
                .boxed()
            })
            .await?;

        self.emit_transition(&record).await?;
        self.event_sender
            .send(Event::OrderCancelled {
                order_id,
                stock_restored: restored,
            })
            .await
            .map_err(ServiceError::EventError)?;

        info!(order_id = %order_id, stock_restored = restored, "Order cancelled");
        Ok(record.order)
    }

    /// Deletes an order that never affected stock. Orders whose line
    /// items produced a non-zero net ledger effect are protected: cancel
    /// first (restoring stock), then delete.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn delete_order(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;
        db.transaction::<_, (), ServiceError>(move |txn| {
            Box::pin(async move {
                let order = OrderEntity::find_by_id(order_id)
                    .one(txn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Order {} not found", order_id))
                    })?;

                let net = net_ledger_delta(txn, order_id).await?;
                if net.values().any(|delta| *delta != 0) {
                    return Err(ServiceError::StockAlreadyAffected(order_id));
                }

                if let Some(session_id) = order.picking_session_id {
                    let session = PickingSessionEntity::find_by_id(session_id)
                        .one(txn)
                        .await
                        .map_err(ServiceError::db_error)?;
                    if let Some(session) = session {
                        let status: SessionStatus = session
                            .status()
                            .map_err(|_| ServiceError::InvalidStatus(session.status.clone()))?;
                        if !status.is_terminal() {
                            return Err(ServiceError::InvalidOperation(format!(
                                "order {} belongs to active session {}; cancel it first",
                                order_id, session.code
                            )));
                        }
                    }
                }

                PackingProgressEntity::delete_many()
                    .filter(packing_progress::Column::OrderId.eq(order_id))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                OrderItemEntity::delete_many()
                    .filter(order_item::Column::OrderId.eq(order_id))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                OrderEntity::delete_by_id(order_id)
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                Ok(())
            })
        })
        .await
        .map_err(flatten_transaction_error)?;

        info!(order_id = %order_id, "Order deleted");
        Ok(())
    }

    pub(crate) async fn emit_transition(
        &self,
        record: &TransitionRecord,
    ) -> Result<(), ServiceError> {
        emit_transition_events(&self.event_sender, record).await
    }
}

/// Publishes the events a committed transition produced. Shared with the
/// packing engine, whose last-unit pack transitions orders itself.
pub(crate) async fn emit_transition_events(
    event_sender: &EventSender,
    record: &TransitionRecord,
) -> Result<(), ServiceError> {
    if !record.changed() {
        return Ok(());
    }

    event_sender
        .send(Event::OrderStatusChanged {
            order_id: record.order.id,
            old_status: record.old_status.to_string(),
            new_status: record.new_status.to_string(),
        })
        .await
        .map_err(ServiceError::EventError)?;

    if record.new_status == OrderStatus::ReadyToShip {
        event_sender
            .send(Event::OrderReadyToShip {
                order_id: record.order.id,
                session_id: record.order.picking_session_id,
            })
            .await
            .map_err(ServiceError::EventError)?;
    }

    for movement in &record.movements {
        event_sender
            .send(Event::StockMovementRecorded {
                product_id: movement.product_id,
                delta: movement.delta,
                resulting_stock: movement.resulting_stock,
                reference_type: movement.reference_type.clone(),
                reference_id: movement.reference_id,
            })
            .await
            .map_err(ServiceError::EventError)?;
    }

    Ok(())
}

fn generate_order_number() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("ORD-{}", &suffix[..12].to_uppercase())
}

/// Net ledger effect per product for one order, compensations included.
pub(crate) async fn net_ledger_delta<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<HashMap<Uuid, i32>, ServiceError> {
    let movements = InventoryMovementEntity::find()
        .filter(inventory_movement::Column::ReferenceId.eq(order_id))
        .filter(
            inventory_movement::Column::ReferenceType.is_in([
                reference_types::ORDER,
                reference_types::ORDER_CANCELLATION,
            ]),
        )
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut net: HashMap<Uuid, i32> = HashMap::new();
    for movement in movements {
        *net.entry(movement.product_id).or_insert(0) += movement.delta;
    }
    Ok(net)
}

/// Transaction-composable transition. The packing engine calls this from
/// inside its own transaction so a last-unit pack and the resulting
/// status change plus ledger writes commit or roll back together.
pub(crate) async fn transition_order<C: ConnectionTrait>(
    txn: &C,
    order_id: Uuid,
    new_status: OrderStatus,
) -> Result<TransitionRecord, ServiceError> {
    let order = OrderEntity::find_by_id(order_id)
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    let old_status: OrderStatus = order
        .status()
        .map_err(|_| ServiceError::InvalidStatus(order.status.clone()))?;

    if old_status == new_status {
        return Ok(TransitionRecord {
            order,
            old_status,
            new_status,
            movements: Vec::new(),
        });
    }

    if !old_status.can_transition_to(new_status) {
        return Err(ServiceError::InvalidTransition {
            from: old_status.to_string(),
            to: new_status.to_string(),
        });
    }

    // The one edge that touches the ledger: decrement every line item,
    // all-or-nothing, before the status write in the same transaction.
    let mut movements = Vec::new();
    if old_status == OrderStatus::InPreparation && new_status == OrderStatus::ReadyToShip {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(txn)
            .await
            .map_err(ServiceError::db_error)?;

        let reference = MovementReference::new(reference_types::ORDER, order_id);
        for item in &items {
            let movement =
                append_movement(txn, item.product_id, -item.quantity, &reference).await?;
            movements.push(movement);
        }
    }

    let result = OrderEntity::update_many()
        .col_expr(order::Column::Status, Expr::value(new_status.as_str()))
        .col_expr(
            order::Column::Version,
            Expr::col(order::Column::Version).add(1),
        )
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Status.eq(old_status.as_str()))
        .filter(order::Column::Version.eq(order.version))
        .exec(txn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrencyConflict(format!(
            "order {}",
            order_id
        )));
    }

    let order = OrderEntity::find_by_id(order_id)
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    Ok(TransitionRecord {
        order,
        old_status,
        new_status,
        movements,
    })
}

async fn cancel_order_in_txn<C: ConnectionTrait>(
    txn: &C,
    order_id: Uuid,
) -> Result<(TransitionRecord, bool), ServiceError> {
    let order = OrderEntity::find_by_id(order_id)
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    let old_status: OrderStatus = order
        .status()
        .map_err(|_| ServiceError::InvalidStatus(order.status.clone()))?;

    if old_status == OrderStatus::Cancelled {
        return Ok((
            TransitionRecord {
                order,
                old_status,
                new_status: OrderStatus::Cancelled,
                movements: Vec::new(),
            },
            false,
        ));
    }

    if !old_status.can_transition_to(OrderStatus::Cancelled) {
        return Err(ServiceError::InvalidTransition {
            from: old_status.to_string(),
            to: OrderStatus::Cancelled.to_string(),
        });
    }

    // Compensate any net ledger effect this order produced.
    let net = net_ledger_delta(txn, order_id).await?;
    let mut movements = Vec::new();
    let reference = MovementReference::new(reference_types::ORDER_CANCELLATION, order_id);
    for (product_id, delta) in net {
        if delta != 0 {
            movements.push(append_movement(txn, product_id, -delta, &reference).await?);
        }
    }
    let restored = !movements.is_empty();

    // Detach from a live session, shrinking its aggregated requirements.
    if let Some(session_id) = order.picking_session_id {
        let session = PickingSessionEntity::find_by_id(session_id)
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?;
        let active = session
            .as_ref()
            .and_then(|s| s.status().ok())
            .map(|s| !s.is_terminal())
            .unwrap_or(false);

        if active {
            let items = OrderItemEntity::find()
                .filter(order_item::Column::OrderId.eq(order_id))
                .all(txn)
                .await
                .map_err(ServiceError::db_error)?;

            for item in &items {
                PickingProgressEntity::update_many()
                    .col_expr(
                        picking_progress::Column::QuantityNeeded,
                        Expr::col(picking_progress::Column::QuantityNeeded).sub(item.quantity),
                    )
                    .filter(picking_progress::Column::SessionId.eq(session_id))
                    .filter(picking_progress::Column::ProductId.eq(item.product_id))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
            }

            PackingProgressEntity::delete_many()
                .filter(packing_progress::Column::OrderId.eq(order_id))
                .exec(txn)
                .await
                .map_err(ServiceError::db_error)?;
        }
    }

    let mut active: order::ActiveModel = order.clone().into();
    active.status = Set(OrderStatus::Cancelled.as_str().to_string());
    active.picking_session_id = Set(None);
    active.version = Set(order.version + 1);
    active.updated_at = Set(Some(Utc::now()));
    let updated = active.update(txn).await.map_err(ServiceError::db_error)?;

    Ok((
        TransitionRecord {
            order: updated,
            old_status,
            new_status: OrderStatus::Cancelled,
            movements,
        },
        restored,
    ))
}
