use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    concurrency::{self, CounterTarget, IncrementOutcome, RetryPolicy},
    db::DbPool,
    entities::order::{self, Entity as OrderEntity, OrderStatus},
    entities::packing_progress::{self, Entity as PackingProgressEntity},
    entities::picking_progress::{self, Entity as PickingProgressRows},
    entities::picking_session::{self, SessionStatus},
    errors::{flatten_transaction_error, ServiceError, ShortLine},
    events::{Event, EventSender},
    services::orders::{emit_transition_events, transition_order, TransitionRecord},
    services::picking::{load_session, set_session_status, PickingSessionService},
};

/// One line of an order's packing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackingLine {
    pub product_id: Uuid,
    pub quantity_needed: i32,
    pub quantity_packed: i32,
}

/// Packing state of one member order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPackingStatus {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: String,
    pub complete: bool,
    pub lines: Vec<PackingLine>,
}

/// Session-wide basket accounting for one product: picked units minus
/// everything packed across all member orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketRemaining {
    pub product_id: Uuid,
    pub quantity_picked: i32,
    pub quantity_packed: i32,
    pub remaining: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackingList {
    pub session_id: Uuid,
    pub orders: Vec<OrderPackingStatus>,
    pub basket: Vec<BasketRemaining>,
}

/// Result of packing one unit.
#[derive(Debug, Clone)]
pub struct PackOutcome {
    /// New cumulative packed quantity for the (order, product) line.
    pub quantity_packed: i32,
    /// Whether this unit completed the order's last outstanding line.
    pub order_completed: bool,
    pub order: order::Model,
}

/// Drains a session's basket of picked units into member orders, one
/// unit at a time, never allocating the same physical unit twice.
#[derive(Clone)]
pub struct PackingService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    retry_policy: RetryPolicy,
}

impl PackingService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender, retry_policy: RetryPolicy) -> Self {
        Self {
            db,
            event_sender,
            retry_policy,
        }
    }

    fn packed_target(
        session_id: Uuid,
        order_id: Uuid,
        product_id: Uuid,
    ) -> CounterTarget<PackingProgressEntity> {
        CounterTarget {
            label: "packing_progress",
            key: Condition::all()
                .add(packing_progress::Column::SessionId.eq(session_id))
                .add(packing_progress::Column::OrderId.eq(order_id))
                .add(packing_progress::Column::ProductId.eq(product_id)),
            value_col: packing_progress::Column::QuantityPacked,
            upper_bound_col: Some(packing_progress::Column::QuantityNeeded),
        }
    }

    /// Per-order requirements and packed counts, plus the session-wide
    /// remaining units per product.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn get_packing_list(&self, session_id: Uuid) -> Result<PackingList, ServiceError> {
        let db = &*self.db;
        let (_, status) = load_session(db, session_id).await?;
        if status == SessionStatus::Picking {
            return Err(ServiceError::InvalidOperation(
                "session is still picking; finish picking first".into(),
            ));
        }

        let orders = OrderEntity::find()
            .filter(order::Column::PickingSessionId.eq(session_id))
            .order_by_asc(order::Column::OrderNumber)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let rows = PackingProgressEntity::find()
            .filter(packing_progress::Column::SessionId.eq(session_id))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut per_order: HashMap<Uuid, Vec<PackingLine>> = HashMap::new();
        let mut packed_by_product: HashMap<Uuid, i32> = HashMap::new();
        for row in &rows {
            per_order.entry(row.order_id).or_default().push(PackingLine {
                product_id: row.product_id,
                quantity_needed: row.quantity_needed,
                quantity_packed: row.quantity_packed,
            });
            *packed_by_product.entry(row.product_id).or_insert(0) += row.quantity_packed;
        }

        let mut order_statuses = Vec::with_capacity(orders.len());
        for o in &orders {
            let mut lines = per_order.remove(&o.id).unwrap_or_default();
            lines.sort_by_key(|l| l.product_id);
            order_statuses.push(OrderPackingStatus {
                order_id: o.id,
                order_number: o.order_number.clone(),
                status: o.status.clone(),
                complete: lines.iter().all(|l| l.quantity_packed >= l.quantity_needed),
                lines,
            });
        }

        let picking = PickingProgressRows::find()
            .filter(picking_progress::Column::SessionId.eq(session_id))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut basket: Vec<BasketRemaining> = picking
            .iter()
            .map(|p| {
                let packed = packed_by_product.get(&p.product_id).copied().unwrap_or(0);
                BasketRemaining {
                    product_id: p.product_id,
                    quantity_picked: p.quantity_picked,
                    quantity_packed: packed,
                    remaining: p.quantity_picked - packed,
                }
            })
            .collect();
        basket.sort_by_key(|b| b.product_id);

        Ok(PackingList {
            session_id,
            orders: order_statuses,
            basket,
        })
    }

    /// Allocates one physically picked unit to an order's line item. The
    /// increment is bounded by the order's own requirement and by the
    /// session basket; completing the order's last outstanding line
    /// transitions it to `ready_to_ship` (writing its ledger decrements)
    /// inside the same transaction.
    #[instrument(skip(self), fields(session_id = %session_id, order_id = %order_id, product_id = %product_id))]
    pub async fn pack_unit(
        &self,
        session_id: Uuid,
        order_id: Uuid,
        product_id: Uuid,
    ) -> Result<PackOutcome, ServiceError> {
        let db = self.db.clone();
        let (outcome, record) =
            concurrency::with_retries(&self.retry_policy, "pack_unit", || {
                let db = db.clone();
                async move {
                    db.transaction::<_, (PackOutcome, Option<TransitionRecord>), ServiceError>(
                        move |txn| {
                            Box::pin(async move {
                                pack_unit_in_txn(txn, session_id, order_id, product_id).await
                            })
                        },
                    )
                    .await
                    .map_err(flatten_transaction_error)
                }
                .boxed()
            })
            .await?;

        if let Some(record) = &record {
            emit_transition_events(&self.event_sender, record).await?;
        }

        Ok(outcome)
    }

    /// Completes a session whose member orders are all fully packed;
    /// otherwise fails with `IncompleteOrders` naming the short lines.
    /// A session already completed is a no-op success.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn complete_session(
        &self,
        session_id: Uuid,
    ) -> Result<picking_session::Model, ServiceError> {
        let db = self.db.clone();
        let (session, completed_now) =
            concurrency::with_retries(&self.retry_policy, "complete_session", || {
                let db = db.clone();
                async move {
                    db.transaction::<_, (picking_session::Model, bool), ServiceError>(move |txn| {
                        Box::pin(async move { complete_session_in_txn(txn, session_id).await })
                    })
                    .await
                    .map_err(flatten_transaction_error)
                }
                .boxed()
            })
            .await?;

        if completed_now {
            self.event_sender
                .send(Event::SessionCompleted {
                    session_id,
                    completed_at: Utc::now(),
                })
                .await
                .map_err(ServiceError::EventError)?;
            info!(session_id = %session_id, "Session completed");
        }

        Ok(session)
    }
}

async fn pack_unit_in_txn<C: ConnectionTrait>(
    txn: &C,
    session_id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
) -> Result<(PackOutcome, Option<TransitionRecord>), ServiceError> {
    let (session, status) = load_session(txn, session_id).await?;
    if status != SessionStatus::Packing {
        return Err(ServiceError::InvalidOperation(format!(
            "session {} is {}, expected packing",
            session.code, status
        )));
    }

    // Lock the session's picking row for this product. All basket
    // accounting for (session, product) serializes on this lock, so two
    // workers can never allocate the same picked unit.
    let picking_target = PickingSessionService::picked_target(session_id, product_id);
    let (picked, _) = concurrency::read_for_update(txn, &picking_target).await?;

    let packed_rows = PackingProgressEntity::find()
        .filter(packing_progress::Column::SessionId.eq(session_id))
        .filter(packing_progress::Column::ProductId.eq(product_id))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?;

    let total_packed: i32 = packed_rows.iter().map(|r| r.quantity_packed).sum();
    if packed_rows.iter().all(|r| r.order_id != order_id) {
        return Err(ServiceError::NotFound(format!(
            "order {} has no line item for product {}",
            order_id, product_id
        )));
    }

    if picked - total_packed <= 0 {
        return Err(ServiceError::NoUnitsAvailable {
            session_id,
            product_id,
        });
    }

    let target = PackingService::packed_target(session_id, order_id, product_id);
    let outcome = concurrency::bounded_increment(txn, &target, 1).await?;
    let quantity_packed = outcome.applied_or(|o| match o {
        IncrementOutcome::UpperBoundReached { bound, .. } => ServiceError::AlreadyFullyPacked {
            order_id,
            product_id,
            quantity_needed: bound,
        },
        _ => ServiceError::InternalError("unexpected bound outcome for packing".into()),
    })?;

    // Re-check basket accounting after the write; a racing allocation on
    // a backend without row locks rolls the whole attempt back as a
    // retryable conflict rather than over-draining the basket.
    let total_after: i32 = PackingProgressEntity::find()
        .filter(packing_progress::Column::SessionId.eq(session_id))
        .filter(packing_progress::Column::ProductId.eq(product_id))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?
        .iter()
        .map(|r| r.quantity_packed)
        .sum();
    if total_after > picked {
        return Err(ServiceError::ConcurrencyConflict(format!(
            "session {} basket for product {}",
            session_id, product_id
        )));
    }

    // Did this unit close out the order?
    let open_lines = PackingProgressEntity::find()
        .filter(packing_progress::Column::SessionId.eq(session_id))
        .filter(packing_progress::Column::OrderId.eq(order_id))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .filter(|r| !r.is_complete())
        .count();

    let (order, record) = if open_lines == 0 {
        // The order's status change and its ledger decrements commit
        // with this increment; a crash cannot separate them.
        let record = transition_order(txn, order_id, OrderStatus::ReadyToShip).await?;
        (record.order.clone(), Some(record))
    } else {
        let order = OrderEntity::find_by_id(order_id)
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        (order, None)
    };

    Ok((
        PackOutcome {
            quantity_packed,
            order_completed: record.is_some(),
            order,
        },
        record,
    ))
}

async fn complete_session_in_txn<C: ConnectionTrait>(
    txn: &C,
    session_id: Uuid,
) -> Result<(picking_session::Model, bool), ServiceError> {
    let (session, status) = load_session(txn, session_id).await?;

    match status {
        SessionStatus::Completed => return Ok((session, false)),
        SessionStatus::Packing => {}
        SessionStatus::Picking | SessionStatus::Cancelled => {
            return Err(ServiceError::InvalidOperation(format!(
                "session {} is {}, expected packing",
                session.code, status
            )))
        }
    }

    let short: Vec<ShortLine> = PackingProgressEntity::find()
        .filter(packing_progress::Column::SessionId.eq(session_id))
        .order_by_asc(packing_progress::Column::OrderId)
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .filter(|row| !row.is_complete())
        .map(|row| ShortLine {
            order_id: row.order_id,
            product_id: row.product_id,
            quantity_needed: row.quantity_needed,
            quantity_packed: row.quantity_packed,
        })
        .collect();

    if !short.is_empty() {
        return Err(ServiceError::IncompleteOrders(short));
    }

    let updated =
        set_session_status(txn, session_id, SessionStatus::Packing, SessionStatus::Completed)
            .await?;
    Ok((updated, true))
}
