//! Alert engine: keeps `stock_alerts` rows consistent with ledger state.
//!
//! Callers hand over the `SizeSnapshot` a ledger mutation returned, so
//! evaluation never re-reads (and races) the counters it is judging.

use sqlx::PgPool;
use uuid::Uuid;

use crate::ledger::SizeSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertType {
    LowStock,
    OutOfStock,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::LowStock => "low_stock",
            AlertType::OutOfStock => "out_of_stock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPriority::Critical => "critical",
            AlertPriority::High => "high",
            AlertPriority::Medium => "medium",
            AlertPriority::Low => "low",
        }
    }
}

/// Pure threshold classification. `None` means the size needs no alert.
pub fn classify(available: i32, threshold: i32) -> Option<(AlertType, AlertPriority)> {
    if available <= 0 {
        Some((AlertType::OutOfStock, AlertPriority::Critical))
    } else if available <= threshold {
        // high once availability drops to ceil(threshold / 2)
        let high_cutoff = (threshold + 1) / 2;
        let priority = if available <= high_cutoff {
            AlertPriority::High
        } else {
            AlertPriority::Medium
        };
        Some((AlertType::LowStock, priority))
    } else {
        None
    }
}

/// Re-derive alert state for one (product, size) after a ledger mutation.
/// Idempotent: an unresolved alert of the same type is never duplicated
/// (lookup guard plus the partial unique index), and recovery resolves
/// rather than deletes.
pub async fn evaluate(
    db: &PgPool,
    product_id: Uuid,
    size: &str,
    snapshot: SizeSnapshot,
) -> Result<(), sqlx::Error> {
    let available = snapshot.available();
    match classify(available, snapshot.threshold) {
        Some((alert_type, priority)) => {
            let existing = sqlx::query_scalar::<_, i32>(
                "SELECT 1 FROM stock_alerts \
                 WHERE product_id = $1 AND size = $2 AND alert_type = $3 AND is_resolved = FALSE",
            )
            .bind(product_id)
            .bind(size)
            .bind(alert_type.as_str())
            .fetch_optional(db)
            .await?;
            if existing.is_some() {
                return Ok(());
            }

            let message = match alert_type {
                AlertType::OutOfStock => format!("Out of stock for product {product_id} size {size}"),
                AlertType::LowStock => {
                    format!("Low stock for product {product_id} size {size} ({available} left)")
                }
            };
            sqlx::query(
                "INSERT INTO stock_alerts \
                 (product_id, size, alert_type, priority, current_stock, threshold, message, suggested_quantity) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (product_id, size, alert_type) WHERE is_resolved = FALSE DO NOTHING",
            )
            .bind(product_id)
            .bind(size)
            .bind(alert_type.as_str())
            .bind(priority.as_str())
            .bind(available)
            .bind(snapshot.threshold)
            .bind(&message)
            .bind(snapshot.threshold * 3)
            .execute(db)
            .await?;
            tracing::info!(
                %product_id,
                size,
                alert_type = alert_type.as_str(),
                priority = priority.as_str(),
                available,
                "stock alert raised"
            );
        }
        None => {
            let resolved = sqlx::query(
                "UPDATE stock_alerts \
                 SET is_resolved = TRUE, resolved_at = NOW(), resolution_notes = 'stock back above threshold' \
                 WHERE product_id = $1 AND size = $2 AND is_resolved = FALSE \
                 AND alert_type IN ('low_stock', 'out_of_stock')",
            )
            .bind(product_id)
            .bind(size)
            .execute(db)
            .await?
            .rows_affected();
            if resolved > 0 {
                tracing::info!(%product_id, size, resolved, available, "stock alerts resolved");
            }
        }
    }
    Ok(())
}
