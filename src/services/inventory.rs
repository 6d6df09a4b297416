use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    concurrency::{self, CounterTarget, RetryPolicy},
    db::DbPool,
    entities::inventory_movement::{self, Entity as InventoryMovementEntity},
    entities::product::{self, Entity as ProductEntity},
    errors::{flatten_transaction_error, ServiceError},
    events::{Event, EventSender},
};

/// What a movement refers back to; every ledger row carries one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementReference {
    pub reference_type: String,
    pub reference_id: Uuid,
}

impl MovementReference {
    pub fn new(reference_type: impl Into<String>, reference_id: Uuid) -> Self {
        Self {
            reference_type: reference_type.into(),
            reference_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateProductInput {
    #[validate(length(min = 1, max = 64))]
    pub sku: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub unit_cost: Decimal,
    /// Opening stock; recorded as an initial receipt movement when > 0.
    #[validate(range(min = 0))]
    pub initial_stock: i32,
}

/// Outcome of comparing a product's counter against its movement log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    pub product_id: Uuid,
    pub current_stock: i32,
    pub movement_sum: i32,
    pub consistent: bool,
}

/// The inventory ledger: an append-only movement log plus a current-stock
/// counter per product, updated together in one transaction. The counter
/// is the advisory read; the atomic decrement at order transition is the
/// enforcement point.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    retry_policy: RetryPolicy,
}

impl InventoryService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender, retry_policy: RetryPolicy) -> Self {
        Self {
            db,
            event_sender,
            retry_policy,
        }
    }

    fn stock_target(product_id: Uuid) -> CounterTarget<ProductEntity> {
        CounterTarget {
            label: "product_stock",
            key: Condition::all().add(product::Column::Id.eq(product_id)),
            value_col: product::Column::CurrentStock,
            upper_bound_col: None,
        }
    }

    /// Registers a product, writing the opening-stock movement in the
    /// same transaction when `initial_stock > 0`.
    #[instrument(skip(self, input), fields(sku = %input.sku))]
    pub async fn create_product(
        &self,
        input: CreateProductInput,
    ) -> Result<product::Model, ServiceError> {
        input.validate()?;

        let db = &*self.db;
        let product_id = Uuid::new_v4();
        let created = db
            .transaction::<_, product::Model, ServiceError>(move |txn| {
                Box::pin(async move {
                    let now = Utc::now();
                    let model = product::ActiveModel {
                        id: Set(product_id),
                        sku: Set(input.sku.clone()),
                        name: Set(input.name.clone()),
                        current_stock: Set(0),
                        unit_cost: Set(input.unit_cost),
                        created_at: Set(now),
                        updated_at: Set(Some(now)),
                    };
                    model.insert(txn).await.map_err(ServiceError::db_error)?;

                    if input.initial_stock > 0 {
                        append_movement(
                            txn,
                            product_id,
                            input.initial_stock,
                            &MovementReference::new(
                                inventory_movement::reference_types::RECEIPT,
                                product_id,
                            ),
                        )
                        .await?;
                    }

                    ProductEntity::find_by_id(product_id)
                        .one(txn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| {
                            ServiceError::InternalError("product vanished after insert".into())
                        })
                })
            })
            .await
            .map_err(flatten_transaction_error)?;

        info!(product_id = %created.id, sku = %created.sku, "Product created");
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_product(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        ProductEntity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    /// Lists products with pagination.
    #[instrument(skip(self))]
    pub async fn list_products(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<product::Model>, u64), ServiceError> {
        let paginator = ProductEntity::find()
            .order_by_asc(product::Column::Sku)
            .paginate(&*self.db, limit.max(1));

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let items = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;

        Ok((items, total))
    }

    /// Advisory stock read used by order intake for pre-flight checks.
    /// Not a commitment; enforcement happens inside the atomic decrement.
    #[instrument(skip(self))]
    pub async fn available_stock(&self, product_id: Uuid) -> Result<i32, ServiceError> {
        Ok(self.get_product(product_id).await?.current_stock)
    }

    /// Appends one immutable movement and updates `current_stock`
    /// atomically. Fails with `InsufficientStock`, writing nothing, if
    /// the delta would take stock negative.
    #[instrument(skip(self), fields(product_id = %product_id, delta))]
    pub async fn record_movement(
        &self,
        product_id: Uuid,
        delta: i32,
        reference: MovementReference,
    ) -> Result<inventory_movement::Model, ServiceError> {
        if delta == 0 {
            return Err(ServiceError::ValidationError(
                "movement delta must be non-zero".into(),
            ));
        }

        let db = self.db.clone();
        let movement = concurrency::with_retries(&self.retry_policy, "record_movement", || {
            let db = db.clone();
            let reference = reference.clone();
            async move {
                db.transaction::<_, inventory_movement::Model, ServiceError>(move |txn| {
                    Box::pin(
                        async move { append_movement(txn, product_id, delta, &reference).await },
                    )
                })
                .await
                .map_err(flatten_transaction_error)
            }
            .boxed()
        })
        .await?;

        self.emit_movement(&movement).await?;
        Ok(movement)
    }

    /// Goods receipt; a positive movement with receipt semantics.
    #[instrument(skip(self), fields(product_id = %product_id, quantity))]
    pub async fn receive_stock(
        &self,
        product_id: Uuid,
        quantity: i32,
        reference_id: Uuid,
    ) -> Result<inventory_movement::Model, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "received quantity must be at least 1".into(),
            ));
        }
        self.record_movement(
            product_id,
            quantity,
            MovementReference::new(inventory_movement::reference_types::RECEIPT, reference_id),
        )
        .await
    }

    /// The audit trail for a product, newest first.
    #[instrument(skip(self))]
    pub async fn movement_history(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<inventory_movement::Model>, ServiceError> {
        InventoryMovementEntity::find()
            .filter(inventory_movement::Column::ProductId.eq(product_id))
            .order_by_desc(inventory_movement::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Recomputes the movement sum and compares it with the counter.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, product_id: Uuid) -> Result<Reconciliation, ServiceError> {
        let product = self.get_product(product_id).await?;

        let movement_sum: i32 = InventoryMovementEntity::find()
            .filter(inventory_movement::Column::ProductId.eq(product_id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .iter()
            .map(|m| m.delta)
            .sum();

        Ok(Reconciliation {
            product_id,
            current_stock: product.current_stock,
            movement_sum,
            consistent: product.current_stock == movement_sum,
        })
    }

    pub(crate) async fn emit_movement(
        &self,
        movement: &inventory_movement::Model,
    ) -> Result<(), ServiceError> {
        self.event_sender
            .send(Event::StockMovementRecorded {
                product_id: movement.product_id,
                delta: movement.delta,
                resulting_stock: movement.resulting_stock,
                reference_type: movement.reference_type.clone(),
                reference_id: movement.reference_id,
            })
            .await
            .map_err(ServiceError::EventError)
    }
}

/// Transaction-composable core of the ledger write: bounded stock update
/// plus the movement row, in the caller's transaction. The order
/// transition path composes this so "status write and ledger write
/// succeed or fail together".
pub(crate) async fn append_movement<C: ConnectionTrait>(
    txn: &C,
    product_id: Uuid,
    delta: i32,
    reference: &MovementReference,
) -> Result<inventory_movement::Model, ServiceError> {
    let target = InventoryService::stock_target(product_id);
    let outcome = concurrency::bounded_increment(txn, &target, delta).await?;

    let resulting_stock = outcome.applied_or(|o| match o {
        crate::concurrency::IncrementOutcome::WouldGoNegative { current } => {
            ServiceError::InsufficientStock(format!(
                "product {} has {} unit(s), movement of {} refused",
                product_id, current, delta
            ))
        }
        _ => ServiceError::InternalError("unexpected bound outcome for stock".into()),
    })?;

    let movement = inventory_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product_id),
        delta: Set(delta),
        resulting_stock: Set(resulting_stock),
        reference_type: Set(reference.reference_type.clone()),
        reference_id: Set(reference.reference_id),
        created_at: Set(Utc::now()),
    };

    movement.insert(txn).await.map_err(ServiceError::db_error)
}
