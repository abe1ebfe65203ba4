//! Inventory ledger: the single mutator of per-(product, size) stock counts.
//!
//! Every mutation is a conditional `UPDATE ... RETURNING` so the invariant
//! `0 <= reserved <= stock` is enforced inside the database, not by a
//! read-modify-write cycle. Two concurrent reserves of the last unit cannot
//! both match the `stock - reserved >= quantity` guard.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::DEFAULT_LOW_STOCK_THRESHOLD;

const MAX_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient stock for product {product_id} size {size} (requested {requested}, available {available})")]
    InsufficientStock {
        product_id: Uuid,
        size: String,
        requested: i32,
        available: i32,
    },
    #[error("no size entry for product {product_id} size {size}")]
    NotFound { product_id: Uuid, size: String },
    #[error("{0}")]
    Validation(&'static str),
    #[error("concurrent stock update conflict, retries exhausted")]
    Conflict,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Counter state of one size entry right after a ledger mutation. Fed to the
/// alert engine so it never has to re-read (and possibly race) the ledger.
#[derive(Debug, Clone, Copy)]
pub struct SizeSnapshot {
    pub stock: i32,
    pub reserved: i32,
    pub threshold: i32,
}

impl SizeSnapshot {
    pub fn available(&self) -> i32 {
        self.stock - self.reserved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Sale,
    Return,
    Restock,
    Adjustment,
    Loss,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Sale => "sale",
            MovementType::Return => "return",
            MovementType::Restock => "restock",
            MovementType::Adjustment => "adjustment",
            MovementType::Loss => "loss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReserveLine {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct ReservedLine {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
    pub snapshot: SizeSnapshot,
}

#[derive(Debug, Clone)]
pub struct ReleasedItem {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
    pub snapshot: Option<SizeSnapshot>,
}

fn snapshot(row: &PgRow) -> SizeSnapshot {
    SizeSnapshot {
        stock: row.get("stock"),
        reserved: row.get("reserved"),
        threshold: row.get("low_stock_threshold"),
    }
}

fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        // serialization_failure / deadlock_detected
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
        _ => false,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Reserve a whole checkout's lines in one transaction: either every line is
/// held or none is. Fails with `InsufficientStock` naming the first line
/// that cannot be covered.
pub async fn reserve_many(
    db: &PgPool,
    correlation_id: &str,
    lines: &[ReserveLine],
) -> Result<Vec<ReservedLine>, LedgerError> {
    if lines.is_empty() {
        return Err(LedgerError::Validation("reservation must include at least one line"));
    }
    for line in lines {
        if line.quantity <= 0 {
            return Err(LedgerError::Validation("reservation quantity must be positive"));
        }
    }

    let mut attempts = 0;
    loop {
        match try_reserve_many(db, correlation_id, lines).await {
            Err(LedgerError::Db(err)) if is_retryable(&err) => {
                if attempts >= MAX_CONFLICT_RETRIES {
                    return Err(LedgerError::Conflict);
                }
                attempts += 1;
                tracing::warn!(correlation_id, attempts, "retrying stock reservation after conflict");
            }
            other => return other,
        }
    }
}

async fn try_reserve_many(
    db: &PgPool,
    correlation_id: &str,
    lines: &[ReserveLine],
) -> Result<Vec<ReservedLine>, LedgerError> {
    let mut tx = db.begin().await?;
    let mut reserved = Vec::with_capacity(lines.len());

    for line in lines {
        let row = sqlx::query(
            "UPDATE product_sizes SET reserved = reserved + $3, updated_at = NOW() \
             WHERE product_id = $1 AND size = $2 AND stock - reserved >= $3 \
             RETURNING stock, reserved, low_stock_threshold",
        )
        .bind(line.product_id)
        .bind(&line.size)
        .bind(line.quantity)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // Guard did not match: distinguish a missing row from a real shortage.
            let current = sqlx::query("SELECT stock, reserved FROM product_sizes WHERE product_id = $1 AND size = $2")
                .bind(line.product_id)
                .bind(&line.size)
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match current {
                Some(r) => LedgerError::InsufficientStock {
                    product_id: line.product_id,
                    size: line.size.clone(),
                    requested: line.quantity,
                    available: r.get::<i32, _>("stock") - r.get::<i32, _>("reserved"),
                },
                None => LedgerError::NotFound {
                    product_id: line.product_id,
                    size: line.size.clone(),
                },
            });
        };

        let insert = sqlx::query(
            "INSERT INTO stock_reservations (correlation_id, product_id, size, quantity) VALUES ($1, $2, $3, $4)",
        )
        .bind(correlation_id)
        .bind(line.product_id)
        .bind(&line.size)
        .bind(line.quantity)
        .execute(&mut *tx)
        .await;
        if let Err(err) = insert {
            if is_unique_violation(&err) {
                return Err(LedgerError::Validation("reservation already exists for this correlation id"));
            }
            return Err(err.into());
        }

        reserved.push(ReservedLine {
            product_id: line.product_id,
            size: line.size.clone(),
            quantity: line.quantity,
            snapshot: snapshot(&row),
        });
    }

    tx.commit().await?;
    Ok(reserved)
}

/// Release the hold a correlation id has on one (product, size). Idempotent:
/// a reservation that is already gone (consumed, expired or double-released)
/// is a logged no-op returning `Ok(None)`.
pub async fn release(
    db: &PgPool,
    product_id: Uuid,
    size: &str,
    correlation_id: &str,
) -> Result<Option<SizeSnapshot>, LedgerError> {
    let mut tx = db.begin().await?;

    let held = sqlx::query(
        "DELETE FROM stock_reservations WHERE correlation_id = $1 AND product_id = $2 AND size = $3 \
         RETURNING quantity",
    )
    .bind(correlation_id)
    .bind(product_id)
    .bind(size)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(held) = held else {
        tracing::debug!(%product_id, size, correlation_id, "no reservation to release; treating as no-op");
        return Ok(None);
    };
    let quantity: i32 = held.get("quantity");

    let row = sqlx::query(
        "UPDATE product_sizes SET reserved = GREATEST(reserved - $3, 0), updated_at = NOW() \
         WHERE product_id = $1 AND size = $2 \
         RETURNING stock, reserved, low_stock_threshold",
    )
    .bind(product_id)
    .bind(size)
    .bind(quantity)
    .fetch_optional(&mut *tx)
    .await?;

    if row.is_none() {
        tracing::warn!(%product_id, size, correlation_id, "size entry missing while releasing reservation");
    }
    tx.commit().await?;
    Ok(row.map(|r| snapshot(&r)))
}

/// Release every reservation held under a correlation id (checkout abandoned
/// or cancelled as a whole). Idempotent; returns the released lines.
pub async fn release_all(db: &PgPool, correlation_id: &str) -> Result<Vec<ReleasedItem>, LedgerError> {
    let mut tx = db.begin().await?;

    let rows = sqlx::query(
        "DELETE FROM stock_reservations WHERE correlation_id = $1 RETURNING product_id, size, quantity",
    )
    .bind(correlation_id)
    .fetch_all(&mut *tx)
    .await?;

    let mut released = Vec::with_capacity(rows.len());
    for r in rows {
        let product_id: Uuid = r.get("product_id");
        let size: String = r.get("size");
        let quantity: i32 = r.get("quantity");

        let updated = sqlx::query(
            "UPDATE product_sizes SET reserved = GREATEST(reserved - $3, 0), updated_at = NOW() \
             WHERE product_id = $1 AND size = $2 \
             RETURNING stock, reserved, low_stock_threshold",
        )
        .bind(product_id)
        .bind(&size)
        .bind(quantity)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            tracing::warn!(%product_id, size, correlation_id, "size entry missing while releasing reservation");
        }
        released.push(ReleasedItem {
            product_id,
            size,
            quantity,
            snapshot: updated.map(|r| snapshot(&r)),
        });
    }

    tx.commit().await?;
    Ok(released)
}

/// Permanently remove sold units. Consumes the matching reservation row (if
/// any) in the same transaction, so the expiry sweeper can never release a
/// hold that settlement already spent, and writes the `sale` movement.
pub async fn decrement(
    db: &PgPool,
    product_id: Uuid,
    size: &str,
    quantity: i32,
    correlation_id: Option<&str>,
    reference: &str,
) -> Result<SizeSnapshot, LedgerError> {
    if quantity <= 0 {
        return Err(LedgerError::Validation("decrement quantity must be positive"));
    }
    let mut attempts = 0;
    loop {
        match try_decrement(db, product_id, size, quantity, correlation_id, reference).await {
            Err(LedgerError::Db(err)) if is_retryable(&err) => {
                if attempts >= MAX_CONFLICT_RETRIES {
                    return Err(LedgerError::Conflict);
                }
                attempts += 1;
                tracing::warn!(%product_id, size, attempts, "retrying stock decrement after conflict");
            }
            other => return other,
        }
    }
}

async fn try_decrement(
    db: &PgPool,
    product_id: Uuid,
    size: &str,
    quantity: i32,
    correlation_id: Option<&str>,
    reference: &str,
) -> Result<SizeSnapshot, LedgerError> {
    let mut tx = db.begin().await?;

    // Only drop `reserved` by what this correlation actually still holds;
    // an expired reservation was already given back by the sweeper and must
    // not be taken out of someone else's hold.
    let mut held = 0i32;
    if let Some(correlation_id) = correlation_id {
        let consumed = sqlx::query(
            "DELETE FROM stock_reservations WHERE correlation_id = $1 AND product_id = $2 AND size = $3 \
             RETURNING quantity",
        )
        .bind(correlation_id)
        .bind(product_id)
        .bind(size)
        .fetch_optional(&mut *tx)
        .await?;
        held = consumed.map(|r| r.get::<i32, _>("quantity")).unwrap_or(0).min(quantity);
    }

    // LEAST keeps reserved <= stock when the sold units were no longer held.
    let row = sqlx::query(
        "UPDATE product_sizes \
         SET stock = stock - $3, reserved = LEAST(GREATEST(reserved - $4, 0), stock - $3), updated_at = NOW() \
         WHERE product_id = $1 AND size = $2 AND stock >= $3 \
         RETURNING stock, reserved, low_stock_threshold",
    )
    .bind(product_id)
    .bind(size)
    .bind(quantity)
    .bind(held)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        let current = sqlx::query("SELECT stock FROM product_sizes WHERE product_id = $1 AND size = $2")
            .bind(product_id)
            .bind(size)
            .fetch_optional(&mut *tx)
            .await?;
        return Err(match current {
            Some(r) => LedgerError::InsufficientStock {
                product_id,
                size: size.to_string(),
                requested: quantity,
                available: r.get("stock"),
            },
            None => LedgerError::NotFound {
                product_id,
                size: size.to_string(),
            },
        });
    };

    let snap = snapshot(&row);
    record_movement(
        &mut tx,
        product_id,
        size,
        MovementType::Sale,
        -quantity,
        snap.stock + quantity,
        snap.stock,
        reference,
        &format!("Sale - order {reference}"),
    )
    .await?;

    tx.commit().await?;
    Ok(snap)
}

/// Manual correction (restock, loss, adjustment). Never touches reservation
/// bookkeeping; the guard keeps `stock + delta` at or above `reserved`. A
/// positive delta against a missing size entry backfills the row first.
pub async fn adjust(
    db: &PgPool,
    product_id: Uuid,
    size: &str,
    delta: i32,
    movement_type: MovementType,
    reason: &str,
) -> Result<SizeSnapshot, LedgerError> {
    if delta == 0 {
        return Err(LedgerError::Validation("adjustment delta must be non-zero"));
    }
    if movement_type == MovementType::Sale {
        return Err(LedgerError::Validation("sale movements are recorded by settlement, not adjustments"));
    }
    let mut attempts = 0;
    loop {
        match try_adjust(db, product_id, size, delta, movement_type, reason).await {
            Err(LedgerError::Db(err)) if is_retryable(&err) => {
                if attempts >= MAX_CONFLICT_RETRIES {
                    return Err(LedgerError::Conflict);
                }
                attempts += 1;
                tracing::warn!(%product_id, size, attempts, "retrying stock adjustment after conflict");
            }
            other => return other,
        }
    }
}

async fn try_adjust(
    db: &PgPool,
    product_id: Uuid,
    size: &str,
    delta: i32,
    movement_type: MovementType,
    reason: &str,
) -> Result<SizeSnapshot, LedgerError> {
    let mut tx = db.begin().await?;

    let mut backfilled = false;
    let row = loop {
        let updated = sqlx::query(
            "UPDATE product_sizes SET stock = stock + $3, updated_at = NOW() \
             WHERE product_id = $1 AND size = $2 AND stock + $3 >= reserved \
             RETURNING stock, reserved, low_stock_threshold",
        )
        .bind(product_id)
        .bind(size)
        .bind(delta)
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(row) => break row,
            None if !backfilled && delta > 0 => {
                backfilled = true;
                sqlx::query(
                    "INSERT INTO product_sizes (product_id, size, stock, reserved, low_stock_threshold) \
                     VALUES ($1, $2, 0, 0, $3) ON CONFLICT (product_id, size) DO NOTHING",
                )
                .bind(product_id)
                .bind(size)
                .bind(DEFAULT_LOW_STOCK_THRESHOLD)
                .execute(&mut *tx)
                .await?;
                continue;
            }
            None => {
                let current = sqlx::query("SELECT stock, reserved FROM product_sizes WHERE product_id = $1 AND size = $2")
                    .bind(product_id)
                    .bind(size)
                    .fetch_optional(&mut *tx)
                    .await?;
                return Err(match current {
                    Some(r) => LedgerError::InsufficientStock {
                        product_id,
                        size: size.to_string(),
                        requested: -delta,
                        available: r.get::<i32, _>("stock") - r.get::<i32, _>("reserved"),
                    },
                    None => LedgerError::NotFound {
                        product_id,
                        size: size.to_string(),
                    },
                });
            }
        }
    };

    let snap = snapshot(&row);
    record_movement(
        &mut tx,
        product_id,
        size,
        movement_type,
        delta,
        snap.stock - delta,
        snap.stock,
        reason,
        reason,
    )
    .await?;

    tx.commit().await?;
    Ok(snap)
}

#[allow(clippy::too_many_arguments)]
async fn record_movement(
    tx: &mut Transaction<'_, Postgres>,
    product_id: Uuid,
    size: &str,
    movement_type: MovementType,
    quantity: i32,
    stock_before: i32,
    stock_after: i32,
    reference: &str,
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO stock_movements (product_id, size, movement_type, quantity, stock_before, stock_after, reference, reason) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(product_id)
    .bind(size)
    .bind(movement_type.as_str())
    .bind(quantity)
    .bind(stock_before)
    .bind(stock_after)
    .bind(reference)
    .bind(reason)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
