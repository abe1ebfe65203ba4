pub mod alerts;
pub mod ledger;
pub mod settlement;
pub mod stock_handlers;
pub mod sweeper;
pub mod webhook;

pub use crate::stock_handlers::*;

pub const DEFAULT_LOW_STOCK_THRESHOLD: i32 = 5;
pub const DEFAULT_RESERVATION_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

use common_observability::StockMetrics;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub reservation_ttl: Duration,
    pub reservation_expiry_sweep: Duration,
    pub metrics: Arc<StockMetrics>,
}
