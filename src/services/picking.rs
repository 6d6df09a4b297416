use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    concurrency::{self, CounterTarget, IncrementOutcome, RetryPolicy},
    config::PartialFulfillmentPolicy,
    db::DbPool,
    entities::order::{self, Entity as OrderEntity, OrderStatus},
    entities::order_item::{self, Entity as OrderItemEntity},
    entities::packing_progress,
    entities::picking_progress::{self, Entity as PickingProgressEntity},
    entities::picking_session::{self, Entity as PickingSessionEntity, SessionStatus},
    errors::{flatten_transaction_error, ServiceError},
    events::{Event, EventSender, Shortfall},
};

/// Explicit caller acknowledgement that a session proceeds to packing
/// with unpicked units. Who may supply one is the authorization layer's
/// decision; this core only records it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortfallAck {
    pub acknowledged_by: Uuid,
    pub note: Option<String>,
}

/// A session with its members and aggregated pick state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: picking_session::Model,
    pub orders: Vec<order::Model>,
    pub progress: Vec<picking_progress::Model>,
}

/// Groups confirmed orders into a combined picking batch and tracks the
/// aggregated pick progress per product across all members.
#[derive(Clone)]
pub struct PickingSessionService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    retry_policy: RetryPolicy,
    partial_fulfillment: PartialFulfillmentPolicy,
}

impl PickingSessionService {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        retry_policy: RetryPolicy,
        partial_fulfillment: PartialFulfillmentPolicy,
    ) -> Self {
        Self {
            db,
            event_sender,
            retry_policy,
            partial_fulfillment,
        }
    }

    /// Counter target for a session's aggregated pick row; exposed so
    /// embedders can compose their own bounded operations on it.
    pub fn picked_target(
        session_id: Uuid,
        product_id: Uuid,
    ) -> CounterTarget<PickingProgressEntity> {
        CounterTarget {
            label: "picking_progress",
            key: Condition::all()
                .add(picking_progress::Column::SessionId.eq(session_id))
                .add(picking_progress::Column::ProductId.eq(product_id)),
            value_col: picking_progress::Column::QuantityPicked,
            upper_bound_col: Some(picking_progress::Column::QuantityNeeded),
        }
    }

    /// Batches orders into a new session. Every member must be
    /// fulfillment-eligible (`confirmed`, not already in a session, same
    /// tenant); an empty or fully-ineligible input fails with
    /// `NoEligibleOrders`, a partially-ineligible one with a
    /// `ValidationError` naming the offenders.
    #[instrument(skip(self), fields(order_count = order_ids.len()))]
    pub async fn create_session(
        &self,
        order_ids: Vec<Uuid>,
    ) -> Result<SessionDetail, ServiceError> {
        let mut ids = order_ids;
        ids.sort();
        ids.dedup();

        if ids.is_empty() {
            return Err(ServiceError::NoEligibleOrders);
        }

        let db = self.db.clone();
        let detail = concurrency::with_retries(&self.retry_policy, "create_session", || {
            let db = db.clone();
            let ids = ids.clone();
            async move {
                db.transaction::<_, SessionDetail, ServiceError>(move |txn| {
                    Box::pin(async move { create_session_in_txn(txn, &ids).await })
                })
                .await
                .map_err(flatten_transaction_error)
            }
            .boxed()
        })
        .await?;

        self.event_sender
            .send(Event::SessionCreated {
                session_id: detail.session.id,
                code: detail.session.code.clone(),
                order_ids: detail.orders.iter().map(|o| o.id).collect(),
            })
            .await
            .map_err(ServiceError::EventError)?;

        info!(
            session_id = %detail.session.id,
            code = %detail.session.code,
            orders = detail.orders.len(),
            "Picking session created"
        );
        Ok(detail)
    }

    /// Records picked units against the session's aggregated requirement
    /// for a product. The increment is bounded by `quantity_needed`;
    /// hitting the bound fails with `AlreadyFullyPicked`. Returns the new
    /// cumulative quantity so callers need no second read.
    #[instrument(skip(self), fields(session_id = %session_id, product_id = %product_id, delta))]
    pub async fn record_picked(
        &self,
        session_id: Uuid,
        product_id: Uuid,
        delta: i32,
    ) -> Result<i32, ServiceError> {
        if delta < 1 {
            return Err(ServiceError::ValidationError(
                "picked delta must be at least 1".into(),
            ));
        }

        let db = self.db.clone();
        let (picked, needed) =
            concurrency::with_retries(&self.retry_policy, "record_picked", || {
                let db = db.clone();
                async move {
                    db.transaction::<_, (i32, i32), ServiceError>(move |txn| {
                        Box::pin(async move {
                            require_session_status(txn, session_id, SessionStatus::Picking).await?;

                            let target = Self::picked_target(session_id, product_id);
                            let outcome = concurrency::bounded_increment(txn, &target, delta).await?;
                            let picked = outcome.applied_or(|o| match o {
                                IncrementOutcome::UpperBoundReached { bound, .. } => {
                                    ServiceError::AlreadyFullyPicked {
                                        session_id,
                                        product_id,
                                        quantity_needed: bound,
                                    }
                                }
                                _ => ServiceError::InternalError(
                                    "unexpected bound outcome for picking".into(),
                                ),
                            })?;

                            let needed = PickingProgressEntity::find()
                                .filter(picking_progress::Column::SessionId.eq(session_id))
                                .filter(picking_progress::Column::ProductId.eq(product_id))
                                .one(txn)
                                .await
                                .map_err(ServiceError::db_error)?
                                .map(|row| row.quantity_needed)
                                .unwrap_or(picked);

                            touch_progress(txn, session_id, product_id).await?;
                            Ok((picked, needed))
                        })
                    })
                    .await
                    .map_err(flatten_transaction_error)
                }
                .boxed()
            })
            .await?;

        self.event_sender
            .send(Event::PickRecorded {
                session_id,
                product_id,
                quantity_picked: picked,
                quantity_needed: needed,
            })
            .await
            .map_err(ServiceError::EventError)?;

        Ok(picked)
    }

    /// Moves the session from picking to packing. Requires every product
    /// fully picked unless the configured policy accepts an explicit
    /// shortfall acknowledgement. Idempotent: a session already in
    /// packing is a no-op success, tolerating retried requests.
    #[instrument(skip(self, ack), fields(session_id = %session_id))]
    pub async fn finish_picking(
        &self,
        session_id: Uuid,
        ack: Option<ShortfallAck>,
    ) -> Result<picking_session::Model, ServiceError> {
        let db = self.db.clone();
        let policy = self.partial_fulfillment;
        let ack_ref = ack.clone();
        let (session, shortfalls, transitioned) =
            concurrency::with_retries(&self.retry_policy, "finish_picking", || {
                let db = db.clone();
                let ack = ack_ref.clone();
                async move {
                    db.transaction::<_, (picking_session::Model, Vec<Shortfall>, bool), ServiceError>(
                        move |txn| {
                            Box::pin(async move {
                                finish_picking_in_txn(txn, session_id, policy, ack.as_ref()).await
                            })
                        },
                    )
                    .await
                    .map_err(flatten_transaction_error)
                }
                .boxed()
            })
            .await?;

        if transitioned {
            if !shortfalls.is_empty() {
                warn!(
                    session_id = %session_id,
                    shortfall_count = shortfalls.len(),
                    "Session advanced to packing with unpicked units"
                );
            }
            self.event_sender
                .send(Event::PickingCompleted {
                    session_id,
                    shortfalls,
                })
                .await
                .map_err(ServiceError::EventError)?;
        }

        Ok(session)
    }

    /// Abandons a session from picking or packing. Members still in
    /// preparation revert to `confirmed` and detach; no stock is
    /// restored because none was decremented at this stage.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn cancel_session(
        &self,
        session_id: Uuid,
    ) -> Result<picking_session::Model, ServiceError> {
        let db = self.db.clone();
        let (session, cancelled_now) =
            concurrency::with_retries(&self.retry_policy, "cancel_session", || {
                let db = db.clone();
                async move {
                    db.transaction::<_, (picking_session::Model, bool), ServiceError>(move |txn| {
                        Box::pin(async move { cancel_session_in_txn(txn, session_id).await })
                    })
                    .await
                    .map_err(flatten_transaction_error)
                }
                .boxed()
            })
            .await?;

        if cancelled_now {
            self.event_sender
                .send(Event::SessionCancelled { session_id })
                .await
                .map_err(ServiceError::EventError)?;
            info!(session_id = %session_id, "Picking session cancelled");
        }

        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn get_session(&self, session_id: Uuid) -> Result<SessionDetail, ServiceError> {
        let session = PickingSessionEntity::find_by_id(session_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Session {} not found", session_id)))?;

        let orders = OrderEntity::find()
            .filter(order::Column::PickingSessionId.eq(session_id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let progress = PickingProgressEntity::find()
            .filter(picking_progress::Column::SessionId.eq(session_id))
            .order_by_asc(picking_progress::Column::ProductId)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(SessionDetail {
            session,
            orders,
            progress,
        })
    }

    #[instrument(skip(self))]
    pub async fn list_sessions(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<picking_session::Model>, u64), ServiceError> {
        let paginator = PickingSessionEntity::find()
            .order_by_desc(picking_session::Column::CreatedAt)
            .paginate(&*self.db, limit.max(1));

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let items = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;
        Ok((items, total))
    }
}

fn generate_session_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("PCK-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

pub(crate) async fn load_session<C: ConnectionTrait>(
    conn: &C,
    session_id: Uuid,
) -> Result<(picking_session::Model, SessionStatus), ServiceError> {
    let session = PickingSessionEntity::find_by_id(session_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Session {} not found", session_id)))?;
    let status = session
        .status()
        .map_err(|_| ServiceError::InvalidStatus(session.status.clone()))?;
    Ok((session, status))
}

async fn require_session_status<C: ConnectionTrait>(
    conn: &C,
    session_id: Uuid,
    expected: SessionStatus,
) -> Result<picking_session::Model, ServiceError> {
    let (session, status) = load_session(conn, session_id).await?;
    if status != expected {
        return Err(ServiceError::InvalidOperation(format!(
            "session {} is {}, expected {}",
            session.code, status, expected
        )));
    }
    Ok(session)
}

async fn touch_progress<C: ConnectionTrait>(
    conn: &C,
    session_id: Uuid,
    product_id: Uuid,
) -> Result<(), ServiceError> {
    PickingProgressEntity::update_many()
        .col_expr(picking_progress::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(picking_progress::Column::SessionId.eq(session_id))
        .filter(picking_progress::Column::ProductId.eq(product_id))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(())
}

async fn create_session_in_txn<C: ConnectionTrait>(
    txn: &C,
    order_ids: &[Uuid],
) -> Result<SessionDetail, ServiceError> {
    let orders = OrderEntity::find()
        .filter(order::Column::Id.is_in(order_ids.to_vec()))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?;

    let found: HashMap<Uuid, &order::Model> = orders.iter().map(|o| (o.id, o)).collect();

    let mut eligible = Vec::new();
    let mut ineligible = Vec::new();
    for id in order_ids {
        match found.get(id) {
            Some(order)
                if order.status == OrderStatus::Confirmed.as_str()
                    && order.picking_session_id.is_none() =>
            {
                eligible.push((*order).clone())
            }
            _ => ineligible.push(*id),
        }
    }

    if eligible.is_empty() {
        return Err(ServiceError::NoEligibleOrders);
    }
    if !ineligible.is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "orders not eligible for fulfillment: {:?}",
            ineligible
        )));
    }

    let tenant_id = eligible[0].tenant_id;
    if eligible.iter().any(|o| o.tenant_id != tenant_id) {
        return Err(ServiceError::ValidationError(
            "orders in a session must belong to one tenant".into(),
        ));
    }

    let session_id = Uuid::new_v4();
    let session = picking_session::ActiveModel {
        id: Set(session_id),
        code: Set(generate_session_code()),
        tenant_id: Set(tenant_id),
        status: Set(SessionStatus::Picking.as_str().to_string()),
        ..Default::default()
    };
    let session = session.insert(txn).await.map_err(ServiceError::db_error)?;

    // Claim each member with a guarded write; losing the race on any
    // member aborts the whole batch and the caller retries.
    for order in &eligible {
        let result = OrderEntity::update_many()
            .col_expr(
                order::Column::Status,
                Expr::value(OrderStatus::InPreparation.as_str()),
            )
            .col_expr(order::Column::PickingSessionId, Expr::value(session_id))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(OrderStatus::Confirmed.as_str()))
            .filter(order::Column::PickingSessionId.is_null())
            .exec(txn)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrencyConflict(format!(
                "order {}",
                order.id
            )));
        }
    }

    // One aggregated requirement row per distinct product.
    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.is_in(eligible.iter().map(|o| o.id).collect::<Vec<_>>()))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut needed: HashMap<Uuid, i32> = HashMap::new();
    for item in &items {
        *needed.entry(item.product_id).or_insert(0) += item.quantity;
    }

    let mut progress = Vec::with_capacity(needed.len());
    for (product_id, quantity_needed) in needed {
        let row = picking_progress::ActiveModel {
            id: Set(Uuid::new_v4()),
            session_id: Set(session_id),
            product_id: Set(product_id),
            quantity_needed: Set(quantity_needed),
            quantity_picked: Set(0),
            updated_at: Set(Some(Utc::now())),
        };
        progress.push(row.insert(txn).await.map_err(ServiceError::db_error)?);
    }
    progress.sort_by_key(|p| p.product_id);

    let orders = OrderEntity::find()
        .filter(order::Column::PickingSessionId.eq(session_id))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(SessionDetail {
        session,
        orders,
        progress,
    })
}

async fn finish_picking_in_txn<C: ConnectionTrait>(
    txn: &C,
    session_id: Uuid,
    policy: PartialFulfillmentPolicy,
    ack: Option<&ShortfallAck>,
) -> Result<(picking_session::Model, Vec<Shortfall>, bool), ServiceError> {
    let (session, status) = load_session(txn, session_id).await?;

    match status {
        // Retried request; the earlier call already did the work.
        SessionStatus::Packing => return Ok((session, Vec::new(), false)),
        SessionStatus::Picking => {}
        SessionStatus::Completed | SessionStatus::Cancelled => {
            return Err(ServiceError::InvalidOperation(format!(
                "session {} is {}",
                session.code, status
            )))
        }
    }

    let progress = PickingProgressEntity::find()
        .filter(picking_progress::Column::SessionId.eq(session_id))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?;

    let shortfalls: Vec<Shortfall> = progress
        .iter()
        .filter(|row| !row.is_complete())
        .map(|row| Shortfall {
            product_id: row.product_id,
            quantity_needed: row.quantity_needed,
            quantity_picked: row.quantity_picked,
        })
        .collect();

    if !shortfalls.is_empty() {
        match policy {
            PartialFulfillmentPolicy::Disallowed => {
                return Err(ServiceError::ValidationError(format!(
                    "{} product(s) not fully picked and partial fulfillment is disallowed",
                    shortfalls.len()
                )));
            }
            PartialFulfillmentPolicy::WithAcknowledgement if ack.is_none() => {
                return Err(ServiceError::ValidationError(format!(
                    "{} product(s) not fully picked; an explicit acknowledgement is required",
                    shortfalls.len()
                )));
            }
            PartialFulfillmentPolicy::WithAcknowledgement => {}
        }
    }

    let updated =
        set_session_status(txn, session_id, SessionStatus::Picking, SessionStatus::Packing).await?;

    // Materialize one packing row per member line item; the packing
    // engine's bounded increments need their target rows in place.
    let members = OrderEntity::find()
        .filter(order::Column::PickingSessionId.eq(session_id))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?;

    let items = OrderItemEntity::find()
        .filter(
            order_item::Column::OrderId.is_in(members.iter().map(|o| o.id).collect::<Vec<_>>()),
        )
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?;

    for item in &items {
        let row = packing_progress::ActiveModel {
            id: Set(Uuid::new_v4()),
            session_id: Set(session_id),
            order_id: Set(item.order_id),
            product_id: Set(item.product_id),
            quantity_needed: Set(item.quantity),
            quantity_packed: Set(0),
            updated_at: Set(Some(Utc::now())),
        };
        row.insert(txn).await.map_err(ServiceError::db_error)?;
    }

    Ok((updated, shortfalls, true))
}

async fn cancel_session_in_txn<C: ConnectionTrait>(
    txn: &C,
    session_id: Uuid,
) -> Result<(picking_session::Model, bool), ServiceError> {
    let (session, status) = load_session(txn, session_id).await?;

    match status {
        SessionStatus::Cancelled => return Ok((session, false)),
        SessionStatus::Completed => {
            return Err(ServiceError::InvalidOperation(format!(
                "session {} is already completed",
                session.code
            )))
        }
        SessionStatus::Picking | SessionStatus::Packing => {}
    }

    let updated = set_session_status(txn, session_id, status, SessionStatus::Cancelled).await?;

    // Members still in preparation go back to the eligible pool. Orders
    // that already reached ready_to_ship keep their state and stock.
    OrderEntity::update_many()
        .col_expr(
            order::Column::Status,
            Expr::value(OrderStatus::Confirmed.as_str()),
        )
        .col_expr(order::Column::PickingSessionId, Expr::value(Option::<Uuid>::None))
        .col_expr(
            order::Column::Version,
            Expr::col(order::Column::Version).add(1),
        )
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(order::Column::PickingSessionId.eq(session_id))
        .filter(order::Column::Status.eq(OrderStatus::InPreparation.as_str()))
        .exec(txn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok((updated, true))
}

/// Guarded session status write; zero rows affected re-reads to tell an
/// idempotent duplicate from a real conflict.
pub(crate) async fn set_session_status<C: ConnectionTrait>(
    txn: &C,
    session_id: Uuid,
    from: SessionStatus,
    to: SessionStatus,
) -> Result<picking_session::Model, ServiceError> {
    let result = PickingSessionEntity::update_many()
        .col_expr(picking_session::Column::Status, Expr::value(to.as_str()))
        .col_expr(picking_session::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(picking_session::Column::Id.eq(session_id))
        .filter(picking_session::Column::Status.eq(from.as_str()))
        .exec(txn)
        .await
        .map_err(ServiceError::db_error)?;

    let (session, status) = load_session(txn, session_id).await?;

    if result.rows_affected == 0 && status != to {
        return Err(ServiceError::ConcurrencyConflict(format!(
            "session {}",
            session_id
        )));
    }

    Ok(session)
}
