use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};

#[derive(Clone)]
pub struct StockMetrics {
    pub registry: Registry,
    pub reservations_expired: IntCounter,
    pub duplicate_events: IntCounter,
    pub sweeper_duration_seconds: Histogram,
    pub http_errors_total: IntCounterVec,
}

impl StockMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let reservations_expired = IntCounter::new(
            "stock_reservations_expired_total",
            "Reservations released by the expiry sweeper",
        ).unwrap();
        let duplicate_events = IntCounter::new(
            "stock_duplicate_settlement_events_total",
            "Settlement webhook deliveries skipped by the idempotency guard",
        ).unwrap();
        let sweeper_duration_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "stock_reservation_sweeper_duration_seconds",
                "Duration of a reservation expiration sweep"
            ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0])
        ).unwrap();
        let http_errors_total = IntCounterVec::new(
            prometheus::Opts::new(
                "http_errors_total",
                "Count of HTTP error responses emitted (status >= 400)"
            ),
            &["service", "code", "status"]
        ).unwrap();
        let _ = registry.register(Box::new(reservations_expired.clone()));
        let _ = registry.register(Box::new(duplicate_events.clone()));
        let _ = registry.register(Box::new(sweeper_duration_seconds.clone()));
        let _ = registry.register(Box::new(http_errors_total.clone()));
        StockMetrics { registry, reservations_expired, duplicate_events, sweeper_duration_seconds, http_errors_total }
    }
}

impl Default for StockMetrics {
    fn default() -> Self { Self::new() }
}
