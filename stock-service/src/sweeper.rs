//! Reservation expiry sweeper: reclaims holds whose checkout never settled.

use std::time::Duration;

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::ledger::SizeSnapshot;
use crate::{alerts, AppState};

/// One reservation released by a sweep, with the counter state after the
/// release so the caller can re-evaluate alerts.
#[derive(Debug)]
pub struct ExpiredReservation {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
    pub correlation_id: String,
    pub snapshot: Option<SizeSnapshot>,
}

pub fn spawn_reservation_sweeper(state: AppState) {
    tokio::spawn(async move {
        let sweep_interval = state.reservation_expiry_sweep;
        loop {
            tokio::time::sleep(sweep_interval).await;
            let start = std::time::Instant::now();
            match sweep_expired(&state.db, state.reservation_ttl).await {
                Ok(expired) => {
                    if !expired.is_empty() {
                        state.metrics.reservations_expired.inc_by(expired.len() as u64);
                    }
                    for entry in &expired {
                        if let Some(snapshot) = entry.snapshot {
                            if let Err(err) =
                                alerts::evaluate(&state.db, entry.product_id, &entry.size, snapshot).await
                            {
                                tracing::error!(?err, product_id = %entry.product_id, size = %entry.size, "alert evaluation failed after expiry");
                            }
                        }
                    }
                }
                Err(err) => tracing::error!(?err, "reservation sweep failed"),
            }
            state.metrics.sweeper_duration_seconds.observe(start.elapsed().as_secs_f64());
        }
    });
}

/// Delete every reservation older than `ttl` and give its quantity back to
/// `reserved`, all in one transaction. Safe to run concurrently with itself
/// and with settlement: a hold consumed by a decrement is deleted in that
/// same transaction and can no longer match here.
pub async fn sweep_expired(db: &PgPool, ttl: Duration) -> Result<Vec<ExpiredReservation>, sqlx::Error> {
    let mut tx = db.begin().await?;

    let rows = sqlx::query(
        "DELETE FROM stock_reservations \
         WHERE created_at < NOW() - ($1 * INTERVAL '1 second') \
         RETURNING product_id, size, quantity, correlation_id",
    )
    .bind(ttl.as_secs() as i64)
    .fetch_all(&mut *tx)
    .await?;

    let mut expired = Vec::with_capacity(rows.len());
    for r in rows {
        let product_id: Uuid = r.get("product_id");
        let size: String = r.get("size");
        let quantity: i32 = r.get("quantity");
        let correlation_id: String = r.get("correlation_id");

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
            tracing::warn!(%product_id, size, correlation_id, "size entry missing while expiring reservation");
        }
        tracing::info!(%product_id, size, quantity, correlation_id, "released expired reservation");

        expired.push(ExpiredReservation {
            product_id,
            size,
            quantity,
            correlation_id,
            snapshot: updated.map(|row| SizeSnapshot {
                stock: row.get("stock"),
                reserved: row.get("reserved"),
                threshold: row.get("low_stock_threshold"),
            }),
        });
    }

    tx.commit().await?;
    Ok(expired)
}
