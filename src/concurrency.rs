//! Concurrency control for shared counters.
//!
//! Every mutation of `products.current_stock`,
//! `picking_progress.quantity_picked` and `packing_progress.quantity_packed`
//! goes through [`bounded_increment`]. A naive read-modify-write on these
//! rows loses updates under interleaving; the strategies here close that
//! gap in order of preference:
//!
//! 1. `RowLock` — `SELECT ... FOR UPDATE`, then check and write inside the
//!    caller's transaction. Concurrent callers serialize on the lock.
//! 2. `AtomicUpdate` — a single `UPDATE ... SET v = v + d WHERE <bound>`
//!    statement, leaving no read/write gap.
//! 3. `Cas` — re-read, then a conditional write that only succeeds if the
//!    stored value is unchanged; zero rows affected surfaces a retryable
//!    [`ServiceError::ConcurrencyConflict`].

use futures::future::BoxFuture;
use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{Condition, ConnectionTrait, DbBackend, EntityTrait, QueryFilter, QuerySelect};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::errors::ServiceError;

lazy_static! {
    static ref COUNTER_INCREMENT_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        prometheus::opts!(
            "fulfillment_counter_increment_attempts_total",
            "Total bounded-increment attempts per counter"
        ),
        &["counter"]
    )
    .expect("metric can be created");
    static ref COUNTER_CONFLICTS: IntCounterVec = IntCounterVec::new(
        prometheus::opts!(
            "fulfillment_counter_conflicts_total",
            "Conditional writes that lost a race and must retry"
        ),
        &["counter"]
    )
    .expect("metric can be created");
    static ref RETRIES_EXHAUSTED: IntCounterVec = IntCounterVec::new(
        prometheus::opts!(
            "fulfillment_retries_exhausted_total",
            "Operations that surfaced a conflict after exhausting retries"
        ),
        &["operation"]
    )
    .expect("metric can be created");
}

/// How a bounded increment is executed against the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Exclusive row lock, then check-and-write inside the transaction.
    RowLock,
    /// Single conditional `UPDATE` combining read, check, and write.
    AtomicUpdate,
    /// Optimistic compare-and-swap; conflicts surface as retryable errors.
    Cas,
}

/// Preferred strategy for a backend. Postgres takes the transactional row
/// lock; SQLite rejects `FOR UPDATE` syntax, so it gets the atomic
/// single-statement form (its writers serialize on the database lock).
pub fn strategy_for(backend: DbBackend) -> Strategy {
    match backend {
        DbBackend::Postgres => Strategy::RowLock,
        DbBackend::MySql => Strategy::AtomicUpdate,
        DbBackend::Sqlite => Strategy::AtomicUpdate,
    }
}

/// Identifies one counter row: which entity, which row, which column
/// holds the value, and (optionally) which column bounds it from above.
/// The key must address exactly one row.
pub struct CounterTarget<E: EntityTrait> {
    /// Stable label for errors and metrics, e.g. `"picking_progress"`.
    pub label: &'static str,
    pub key: Condition,
    pub value_col: E::Column,
    pub upper_bound_col: Option<E::Column>,
}

/// Result of a bounded increment. `Applied` carries the new cumulative
/// value so callers do not need a second, racy read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    Applied { new_value: i32 },
    /// The upper bound would be exceeded; nothing was written.
    UpperBoundReached { current: i32, bound: i32 },
    /// A negative delta would take the value below zero; nothing was written.
    WouldGoNegative { current: i32 },
}

impl IncrementOutcome {
    /// Unwraps `Applied`, mapping bound outcomes through `on_bound`.
    pub fn applied_or<F>(self, on_bound: F) -> Result<i32, ServiceError>
    where
        F: FnOnce(IncrementOutcome) -> ServiceError,
    {
        match self {
            IncrementOutcome::Applied { new_value } => Ok(new_value),
            other => Err(on_bound(other)),
        }
    }
}

/// Applies `delta` to the target counter using the backend's preferred
/// strategy. Must run inside the caller's transaction when the row-lock
/// strategy is in play, so the lock spans the caller's whole operation.
pub async fn bounded_increment<E, C>(
    conn: &C,
    target: &CounterTarget<E>,
    delta: i32,
) -> Result<IncrementOutcome, ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let strategy = strategy_for(conn.get_database_backend());
    bounded_increment_with(conn, strategy, target, delta).await
}

/// Applies `delta` with an explicit strategy. Exposed so the optimistic
/// fallback stays reachable (and testable) on any backend.
pub async fn bounded_increment_with<E, C>(
    conn: &C,
    strategy: Strategy,
    target: &CounterTarget<E>,
    delta: i32,
) -> Result<IncrementOutcome, ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    COUNTER_INCREMENT_ATTEMPTS
        .with_label_values(&[target.label])
        .inc();

    match strategy {
        Strategy::RowLock => locked_increment(conn, target, delta).await,
        Strategy::AtomicUpdate => atomic_increment(conn, target, delta).await,
        Strategy::Cas => cas_increment(conn, target, delta).await,
    }
}

/// Reads the counter (and bound) for update: takes the exclusive row
/// lock where the backend supports it, a plain read elsewhere (SQLite
/// writers already serialize on the database write lock). Call inside a
/// transaction so the lock spans the caller's whole operation.
pub async fn read_for_update<E, C>(
    conn: &C,
    target: &CounterTarget<E>,
) -> Result<(i32, Option<i32>), ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let lock = matches!(conn.get_database_backend(), DbBackend::Postgres);
    read_locked(conn, target, lock).await
}

/// Reads the counter (and bound) under an exclusive row lock.
async fn read_locked<E, C>(
    conn: &C,
    target: &CounterTarget<E>,
    lock: bool,
) -> Result<(i32, Option<i32>), ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let row = match target.upper_bound_col {
        Some(bound_col) => {
            let mut query = E::find()
                .select_only()
                .column(target.value_col)
                .column(bound_col)
                .filter(target.key.clone());
            if lock {
                query = query.lock_exclusive();
            }
            query
                .into_tuple::<(i32, i32)>()
                .one(conn)
                .await
                .map_err(ServiceError::DatabaseError)?
                .map(|(value, bound)| (value, Some(bound)))
        }
        None => {
            let mut query = E::find()
                .select_only()
                .column(target.value_col)
                .filter(target.key.clone());
            if lock {
                query = query.lock_exclusive();
            }
            query
                .into_tuple::<i32>()
                .one(conn)
                .await
                .map_err(ServiceError::DatabaseError)?
                .map(|value| (value, None))
        }
    };

    row.ok_or_else(|| ServiceError::NotFound(format!("{} row not found", target.label)))
}

fn check_bounds(current: i32, bound: Option<i32>, delta: i32) -> Option<IncrementOutcome> {
    if delta < 0 && current + delta < 0 {
        return Some(IncrementOutcome::WouldGoNegative { current });
    }
    if let Some(bound) = bound {
        if delta > 0 && current + delta > bound {
            return Some(IncrementOutcome::UpperBoundReached { current, bound });
        }
    }
    None
}

async fn locked_increment<E, C>(
    conn: &C,
    target: &CounterTarget<E>,
    delta: i32,
) -> Result<IncrementOutcome, ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let (current, bound) = read_locked(conn, target, true).await?;

    if let Some(outcome) = check_bounds(current, bound, delta) {
        return Ok(outcome);
    }

    let new_value = current + delta;
    let result = E::update_many()
        .col_expr(target.value_col, Expr::value(new_value))
        .filter(target.key.clone())
        .exec(conn)
        .await
        .map_err(ServiceError::DatabaseError)?;

    // The row is locked; an unchanged row here means it vanished mid-flight.
    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrencyConflict(target.label.to_string()));
    }

    Ok(IncrementOutcome::Applied { new_value })
}

async fn atomic_increment<E, C>(
    conn: &C,
    target: &CounterTarget<E>,
    delta: i32,
) -> Result<IncrementOutcome, ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let mut update = E::update_many()
        .col_expr(
            target.value_col,
            Expr::col(target.value_col).add(delta),
        )
        .filter(target.key.clone());

    if delta < 0 {
        update = update.filter(Expr::col(target.value_col).gte(-delta));
    }
    if let Some(bound_col) = target.upper_bound_col {
        if delta > 0 {
            update = update.filter(Expr::col(target.value_col).lte(Expr::col(bound_col).sub(delta)));
        }
    }

    let result = update.exec(conn).await.map_err(ServiceError::DatabaseError)?;

    if result.rows_affected == 0 {
        // Distinguish a bound hit from a racing writer via a fresh read.
        let (current, bound) = read_locked(conn, target, false).await?;
        if let Some(outcome) = check_bounds(current, bound, delta) {
            return Ok(outcome);
        }
        COUNTER_CONFLICTS.with_label_values(&[target.label]).inc();
        return Err(ServiceError::ConcurrencyConflict(target.label.to_string()));
    }

    // Same-transaction read; the statement above already holds the write.
    let (new_value, _) = read_locked(conn, target, false).await?;
    Ok(IncrementOutcome::Applied { new_value })
}

async fn cas_increment<E, C>(
    conn: &C,
    target: &CounterTarget<E>,
    delta: i32,
) -> Result<IncrementOutcome, ServiceError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let (current, bound) = read_locked(conn, target, false).await?;

    if let Some(outcome) = check_bounds(current, bound, delta) {
        return Ok(outcome);
    }

    let new_value = current + delta;
    let result = E::update_many()
        .col_expr(target.value_col, Expr::value(new_value))
        .filter(target.key.clone())
        .filter(Expr::col(target.value_col).eq(current))
        .exec(conn)
        .await
        .map_err(ServiceError::DatabaseError)?;

    if result.rows_affected == 0 {
        // The stored value moved between our read and write.
        COUNTER_CONFLICTS.with_label_values(&[target.label]).inc();
        debug!(counter = target.label, "CAS lost the race");
        return Err(ServiceError::ConcurrencyConflict(target.label.to_string()));
    }

    Ok(IncrementOutcome::Applied { new_value })
}

/// Retry policy for transient conflicts, derived from configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_backoff: cfg.base_backoff(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        cfg.clone().into()
    }
}

fn backoff_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_backoff.as_millis() as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(8));
    let jitter = if base > 0 {
        rand::thread_rng().gen_range(0..=base / 2 + 1)
    } else {
        0
    };
    Duration::from_millis(exp + jitter)
}

/// Runs `op`, retrying only [`ServiceError::ConcurrencyConflict`] with
/// jittered exponential backoff, up to `policy.max_attempts` attempts.
/// Each retry re-executes the whole logical operation against fresh
/// state; no partial effect survives a failed attempt. All other errors
/// propagate immediately.
pub async fn with_retries<'a, T, F>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> BoxFuture<'a, Result<T, ServiceError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(err) if err.is_retryable() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    RETRIES_EXHAUSTED.with_label_values(&[operation]).inc();
                    warn!(
                        operation,
                        attempts = attempt,
                        "Retries exhausted, surfacing conflict"
                    );
                    return Err(err);
                }
                let delay = backoff_for_attempt(policy, attempt - 1);
                debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "Retrying after conflict");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn bounds_are_checked_before_writing() {
        assert_eq!(check_bounds(5, Some(5), 1), Some(IncrementOutcome::UpperBoundReached { current: 5, bound: 5 }));
        assert_eq!(check_bounds(4, Some(5), 1), None);
        assert_eq!(check_bounds(0, None, -1), Some(IncrementOutcome::WouldGoNegative { current: 0 }));
        assert_eq!(check_bounds(3, None, -3), None);
    }

    #[test]
    fn postgres_prefers_the_row_lock() {
        assert_eq!(strategy_for(DbBackend::Postgres), Strategy::RowLock);
        assert_eq!(strategy_for(DbBackend::Sqlite), Strategy::AtomicUpdate);
    }

    #[tokio::test]
    async fn with_retries_retries_only_conflicts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
        };

        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retries(&policy, "test_op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ServiceError::ConcurrencyConflict("row".into()))
                } else {
                    Ok(n)
                }
            }
            .boxed()
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Capacity errors are not retried.
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&policy, "test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::InsufficientStock("p".into())) }.boxed()
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retries_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
        };

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&policy, "test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::ConcurrencyConflict("row".into())) }.boxed()
        })
        .await;
        assert!(matches!(result, Err(ServiceError::ConcurrencyConflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
