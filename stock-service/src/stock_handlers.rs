use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use common_http_errors::ApiError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{query_as, query_scalar, Row};
use std::collections::HashMap;
use uuid::Uuid;

use crate::ledger::{self, LedgerError, MovementType, ReserveLine};
use crate::{alerts, sweeper, AppState};

pub(crate) const LIST_SIZES_SQL: &str =
    "SELECT product_id, size, stock, reserved, stock - reserved AS available, low_stock_threshold \
     FROM product_sizes ORDER BY product_id, size";

pub(crate) const LIST_SIZES_BY_PRODUCT_SQL: &str =
    "SELECT product_id, size, stock, reserved, stock - reserved AS available, low_stock_threshold \
     FROM product_sizes WHERE product_id = $1 ORDER BY size";

fn ledger_api_error(err: LedgerError) -> ApiError {
    match err {
        e @ LedgerError::InsufficientStock { .. } => ApiError::BadRequest {
            code: "insufficient_stock",
            trace_id: None,
            message: Some(e.to_string()),
        },
        e @ LedgerError::NotFound { .. } => ApiError::NotFound {
            code: "size_not_found",
            trace_id: None,
            message: Some(e.to_string()),
        },
        LedgerError::Validation(msg) => ApiError::BadRequest {
            code: "invalid_request",
            trace_id: None,
            message: Some(msg.to_string()),
        },
        e @ LedgerError::Conflict => ApiError::Conflict {
            code: "conflict",
            trace_id: None,
            message: Some(e.to_string()),
        },
        LedgerError::Db(err) => ApiError::internal(err, None),
    }
}

async fn evaluate_logged(state: &AppState, product_id: Uuid, size: &str, snapshot: ledger::SizeSnapshot) {
    if let Err(err) = alerts::evaluate(&state.db, product_id, size, snapshot).await {
        tracing::error!(?err, %product_id, size, "alert evaluation failed");
    }
}

#[derive(Debug, Deserialize)]
pub struct StockQuery {
    pub product_id: Option<Uuid>,
}

#[derive(Debug, sqlx::FromRow, Serialize)]
pub struct SizeEntry {
    pub product_id: Uuid,
    pub size: String,
    pub stock: i32,
    pub reserved: i32,
    pub available: i32,
    pub low_stock_threshold: i32,
}

pub async fn list_stock(
    State(state): State<AppState>,
    Query(q): Query<StockQuery>,
) -> Result<Json<Vec<SizeEntry>>, ApiError> {
    let rows = match q.product_id {
        Some(product_id) => {
            query_as::<_, SizeEntry>(LIST_SIZES_BY_PRODUCT_SQL)
                .bind(product_id)
                .fetch_all(&state.db)
                .await
        }
        None => query_as::<_, SizeEntry>(LIST_SIZES_SQL).fetch_all(&state.db).await,
    }
    .map_err(|err| ApiError::internal(err, None))?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct ReservationItemPayload {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    /// Payment intent / checkout session id this hold belongs to.
    pub correlation_id: String,
    pub items: Vec<ReservationItemPayload>,
}

#[derive(Debug, Serialize)]
pub struct ReservedItemBody {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
    pub available: i32,
}

#[derive(Debug, Serialize)]
pub struct ReservationResponse {
    pub correlation_id: String,
    pub items: Vec<ReservedItemBody>,
}

/// Merge duplicate (product, size) pairs so one checkout line holds the sum.
pub(crate) fn condense(items: &[ReservationItemPayload]) -> Vec<ReserveLine> {
    let mut condensed: HashMap<(Uuid, String), i32> = HashMap::new();
    for item in items {
        *condensed.entry((item.product_id, item.size.clone())).or_insert(0) += item.quantity;
    }
    condensed
        .into_iter()
        .map(|((product_id, size), quantity)| ReserveLine { product_id, size, quantity })
        .collect()
}

pub async fn create_reservation(
    State(state): State<AppState>,
    Json(payload): Json<CreateReservationRequest>,
) -> Result<Json<ReservationResponse>, ApiError> {
    if payload.correlation_id.trim().is_empty() {
        return Err(ApiError::BadRequest {
            code: "missing_correlation_id",
            trace_id: None,
            message: Some("Reservation requires a correlation id".into()),
        });
    }
    if payload.items.is_empty() {
        return Err(ApiError::BadRequest {
            code: "empty_reservation",
            trace_id: None,
            message: Some("Reservation must include at least one item".into()),
        });
    }
    for item in &payload.items {
        if item.quantity <= 0 {
            return Err(ApiError::BadRequest {
                code: "invalid_quantity",
                trace_id: None,
                message: Some(format!("Quantity for product {} must be positive", item.product_id)),
            });
        }
        if item.size.trim().is_empty() {
            return Err(ApiError::BadRequest {
                code: "invalid_size",
                trace_id: None,
                message: Some(format!("Size label for product {} must not be empty", item.product_id)),
            });
        }
    }

    // Early duplicate check for a friendly error; the unique index in the
    // ledger still backstops the race.
    let existing = query_scalar::<_, i32>(
        "SELECT 1 FROM stock_reservations WHERE correlation_id = $1 LIMIT 1",
    )
    .bind(&payload.correlation_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|err| ApiError::internal(err, None))?;
    if existing.is_some() {
        return Err(ApiError::BadRequest {
            code: "reservation_exists",
            trace_id: None,
            message: Some("Reservation already exists for this correlation id".into()),
        });
    }

    let lines = condense(&payload.items);
    let reserved = ledger::reserve_many(&state.db, &payload.correlation_id, &lines)
        .await
        .map_err(ledger_api_error)?;

    for line in &reserved {
        evaluate_logged(&state, line.product_id, &line.size, line.snapshot).await;
    }

    Ok(Json(ReservationResponse {
        correlation_id: payload.correlation_id,
        items: reserved
            .into_iter()
            .map(|line| ReservedItemBody {
                product_id: line.product_id,
                size: line.size,
                quantity: line.quantity,
                available: line.snapshot.available(),
            })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ReleasedItemBody {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub correlation_id: String,
    pub released: Vec<ReleasedItemBody>,
}

pub async fn release_reservation(
    State(state): State<AppState>,
    Path(correlation_id): Path<String>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let released = ledger::release_all(&state.db, &correlation_id)
        .await
        .map_err(ledger_api_error)?;

    for item in &released {
        if let Some(snapshot) = item.snapshot {
            evaluate_logged(&state, item.product_id, &item.size, snapshot).await;
        }
    }

    Ok(Json(ReleaseResponse {
        correlation_id,
        released: released
            .into_iter()
            .map(|item| ReleasedItemBody {
                product_id: item.product_id,
                size: item.size,
                quantity: item.quantity,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub product_id: Uuid,
    pub size: String,
    pub delta: i32,
    pub movement_type: MovementType,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn create_adjustment(
    State(state): State<AppState>,
    Json(payload): Json<AdjustmentRequest>,
) -> Result<Json<SizeEntry>, ApiError> {
    if payload.size.trim().is_empty() {
        return Err(ApiError::BadRequest {
            code: "invalid_size",
            trace_id: None,
            message: Some("Size label must not be empty".into()),
        });
    }
    let reason = payload
        .reason
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .unwrap_or("Manual stock adjustment");

    let snapshot = ledger::adjust(
        &state.db,
        payload.product_id,
        &payload.size,
        payload.delta,
        payload.movement_type,
        reason,
    )
    .await
    .map_err(ledger_api_error)?;

    evaluate_logged(&state, payload.product_id, &payload.size, snapshot).await;

    Ok(Json(SizeEntry {
        product_id: payload.product_id,
        size: payload.size,
        stock: snapshot.stock,
        reserved: snapshot.reserved,
        available: snapshot.available(),
        low_stock_threshold: snapshot.threshold,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BulkRestockItem {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkRestockRequest {
    pub items: Vec<BulkRestockItem>,
    /// Fallback reason for items that do not carry their own.
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RestockOutcome {
    pub product_id: Uuid,
    pub size: String,
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_before: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_after: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct RestockSummary {
    pub total: usize,
    pub success: usize,
    pub errors: usize,
}

#[derive(Debug, Serialize)]
pub struct BulkRestockResponse {
    pub summary: RestockSummary,
    pub results: Vec<RestockOutcome>,
}

/// POST /stock/adjustments/bulk: a supplier delivery applied item by item.
/// One bad line never fails the rest; every item reports its own outcome.
pub async fn bulk_restock(
    State(state): State<AppState>,
    Json(payload): Json<BulkRestockRequest>,
) -> Result<Json<BulkRestockResponse>, ApiError> {
    if payload.items.is_empty() {
        return Err(ApiError::BadRequest {
            code: "empty_restock",
            trace_id: None,
            message: Some("Restock must include at least one item".into()),
        });
    }
    let default_reason = payload
        .reason
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .unwrap_or("Bulk restock");

    let mut results = Vec::with_capacity(payload.items.len());
    let mut success = 0usize;
    let mut errors = 0usize;
    for item in &payload.items {
        if item.quantity <= 0 {
            errors += 1;
            results.push(RestockOutcome {
                product_id: item.product_id,
                size: item.size.clone(),
                status: "error",
                message: "Restock quantity must be positive".into(),
                stock_before: None,
                stock_after: None,
            });
            continue;
        }
        if item.size.trim().is_empty() {
            errors += 1;
            results.push(RestockOutcome {
                product_id: item.product_id,
                size: item.size.clone(),
                status: "error",
                message: "Size label must not be empty".into(),
                stock_before: None,
                stock_after: None,
            });
            continue;
        }

        let reason = item
            .reason
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(default_reason);
        match ledger::adjust(
            &state.db,
            item.product_id,
            &item.size,
            item.quantity,
            MovementType::Restock,
            reason,
        )
        .await
        {
            Ok(snapshot) => {
                success += 1;
                evaluate_logged(&state, item.product_id, &item.size, snapshot).await;
                results.push(RestockOutcome {
                    product_id: item.product_id,
                    size: item.size.clone(),
                    status: "success",
                    message: format!(
                        "Stock updated: {} -> {}",
                        snapshot.stock - item.quantity,
                        snapshot.stock
                    ),
                    stock_before: Some(snapshot.stock - item.quantity),
                    stock_after: Some(snapshot.stock),
                });
            }
            Err(err) => {
                errors += 1;
                tracing::error!(%err, product_id = %item.product_id, size = %item.size, "bulk restock item failed");
                results.push(RestockOutcome {
                    product_id: item.product_id,
                    size: item.size.clone(),
                    status: "error",
                    message: err.to_string(),
                    stock_before: None,
                    stock_after: None,
                });
            }
        }
    }

    Ok(Json(BulkRestockResponse {
        summary: RestockSummary { total: payload.items.len(), success, errors },
        results,
    }))
}

fn default_limit() -> i64 { 10 }
fn default_page() -> i64 { 1 }

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub resolved: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_page")]
    pub page: i64,
}

#[derive(Debug, sqlx::FromRow, Serialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub size: String,
    pub alert_type: String,
    pub priority: String,
    pub current_stock: i32,
    pub threshold: i32,
    pub message: String,
    pub suggested_quantity: i32,
    pub is_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn page_bounds(limit: i64, page: i64) -> (i64, i64) {
    let limit = limit.clamp(1, 100);
    let offset = (page.max(1) - 1) * limit;
    (limit, offset)
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(q): Query<AlertQuery>,
) -> Result<Json<Vec<AlertRecord>>, ApiError> {
    let (limit, offset) = page_bounds(q.limit, q.page);
    const COLUMNS: &str = "id, product_id, size, alert_type, priority, current_stock, threshold, \
                           message, suggested_quantity, is_resolved, resolved_at, resolution_notes, created_at";
    let rows = match q.resolved {
        Some(resolved) => {
            query_as::<_, AlertRecord>(&format!(
                "SELECT {COLUMNS} FROM stock_alerts WHERE is_resolved = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
            ))
            .bind(resolved)
            .bind(limit)
            .bind(offset)
            .fetch_all(&state.db)
            .await
        }
        None => {
            query_as::<_, AlertRecord>(&format!(
                "SELECT {COLUMNS} FROM stock_alerts ORDER BY created_at DESC LIMIT $1 OFFSET $2"
            ))
            .bind(limit)
            .bind(offset)
            .fetch_all(&state.db)
            .await
        }
    }
    .map_err(|err| ApiError::internal(err, None))?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct MovementQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_page")]
    pub page: i64,
}

#[derive(Debug, sqlx::FromRow, Serialize)]
pub struct MovementRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub size: String,
    pub movement_type: String,
    pub quantity: i32,
    pub stock_before: i32,
    pub stock_after: i32,
    pub reference: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

pub async fn list_movements(
    State(state): State<AppState>,
    Query(q): Query<MovementQuery>,
) -> Result<Json<Vec<MovementRecord>>, ApiError> {
    let (limit, offset) = page_bounds(q.limit, q.page);
    let rows = query_as::<_, MovementRecord>(
        "SELECT id, product_id, size, movement_type, quantity, stock_before, stock_after, reference, reason, created_at \
         FROM stock_movements ORDER BY created_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db)
    .await
    .map_err(|err| ApiError::internal(err, None))?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
pub struct StockStats {
    pub total_products: i64,
    pub total_stock: i64,
    pub low_stock_sizes: i64,
    pub out_of_stock_sizes: i64,
    pub pending_alerts: i64,
    pub recent_movements: i64,
    pub last_updated: DateTime<Utc>,
}

/// Dashboard aggregation. Degrades to partial data: a failing aggregate is
/// logged and reported as zero instead of failing the whole response.
pub async fn stock_stats(State(state): State<AppState>) -> Json<StockStats> {
    let mut stats = StockStats {
        total_products: 0,
        total_stock: 0,
        low_stock_sizes: 0,
        out_of_stock_sizes: 0,
        pending_alerts: 0,
        recent_movements: 0,
        last_updated: Utc::now(),
    };

    match sqlx::query(
        "SELECT COUNT(DISTINCT product_id) AS total_products, \
                COALESCE(SUM(stock), 0) AS total_stock, \
                COUNT(*) FILTER (WHERE stock - reserved <= 0) AS out_of_stock_sizes, \
                COUNT(*) FILTER (WHERE stock - reserved > 0 AND stock - reserved <= low_stock_threshold) AS low_stock_sizes \
         FROM product_sizes",
    )
    .fetch_one(&state.db)
    .await
    {
        Ok(row) => {
            stats.total_products = row.get("total_products");
            stats.total_stock = row.get("total_stock");
            stats.out_of_stock_sizes = row.get("out_of_stock_sizes");
            stats.low_stock_sizes = row.get("low_stock_sizes");
        }
        Err(err) => tracing::warn!(?err, "stock totals unavailable; returning partial stats"),
    }

    match query_scalar::<_, i64>("SELECT COUNT(*) FROM stock_alerts WHERE is_resolved = FALSE")
        .fetch_one(&state.db)
        .await
    {
        Ok(count) => stats.pending_alerts = count,
        Err(err) => tracing::warn!(?err, "pending alert count unavailable"),
    }

    match query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM stock_movements WHERE created_at > NOW() - INTERVAL '7 days'",
    )
    .fetch_one(&state.db)
    .await
    {
        Ok(count) => stats.recent_movements = count,
        Err(err) => tracing::warn!(?err, "recent movement count unavailable"),
    }

    Json(stats)
}

/// POST /admin/sweep: cron-style external trigger for the expiry sweep.
pub async fn sweep_now(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let expired = sweeper::sweep_expired(&state.db, state.reservation_ttl)
        .await
        .map_err(|err| ApiError::internal(err, None))?;
    if !expired.is_empty() {
        state.metrics.reservations_expired.inc_by(expired.len() as u64);
    }
    for entry in &expired {
        if let Some(snapshot) = entry.snapshot {
            evaluate_logged(&state, entry.product_id, &entry.size, snapshot).await;
        }
    }
    Ok(Json(json!({ "released": expired.len(), "timestamp": Utc::now() })))
}
