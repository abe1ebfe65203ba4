use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderName, HeaderValue, Method,
    },
    middleware,
    routing::{delete, get, post},
    Router,
};
use common_observability::StockMetrics;
use prometheus::{Encoder, TextEncoder};
use sqlx::PgPool;
use std::{env, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;

use stock_service::stock_handlers::{
    bulk_restock, create_adjustment, create_reservation, list_alerts, list_movements, list_stock,
    release_reservation, stock_stats, sweep_now,
};
use stock_service::sweeper::spawn_reservation_sweeper;
use stock_service::{
    settlement, webhook, AppState, DEFAULT_RESERVATION_TTL_SECS, DEFAULT_SWEEP_INTERVAL_SECS,
};

async fn metrics_endpoint(State(state): State<AppState>) -> (axum::http::StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encode error: {e}"),
        );
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8_lossy(&buf).to_string(),
    )
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db_pool = PgPool::connect(&database_url).await?;
    sqlx::migrate!().run(&db_pool).await?;

    let reservation_ttl = env::var("RESERVATION_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_RESERVATION_TTL_SECS));
    let reservation_expiry_sweep = env::var("RESERVATION_EXPIRY_SWEEP_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS));

    let metrics = Arc::new(StockMetrics::new());
    let state = AppState {
        db: db_pool.clone(),
        reservation_ttl,
        reservation_expiry_sweep,
        metrics: metrics.clone(),
    };

    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:3001",
        "http://localhost:5173",
    ];

    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("authorization"),
        ]);

    // Error metrics middleware using dedicated state (Arc<StockMetrics>) passed via from_fn_with_state.
    async fn error_metrics_mw(
        State(metrics): State<Arc<StockMetrics>>,
        req: axum::http::Request<Body>,
        next: middleware::Next,
    ) -> axum::response::Response {
        let resp = next.run(req).await;
        let status = resp.status();
        if status.as_u16() >= 400 {
            let code = resp
                .headers()
                .get("x-error-code")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            metrics
                .http_errors_total
                .with_label_values(&["stock-service", code, status.as_str()])
                .inc();
        }
        resp
    }

    let admin = Router::new()
        .route("/stock/adjustments", post(create_adjustment))
        .route("/stock/adjustments/bulk", post(bulk_restock))
        .route("/admin/sweep", post(sweep_now))
        .route_layer(middleware::from_fn(webhook::require_admin_token))
        .with_state(state.clone());

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/stock", get(list_stock))
        .route("/stock/reservations", post(create_reservation))
        .route(
            "/stock/reservations/:correlation_id",
            delete(release_reservation),
        )
        .route("/stock/alerts", get(list_alerts))
        .route("/stock/movements", get(list_movements))
        .route("/stock/stats", get(stock_stats))
        .route("/webhooks/payments", post(settlement::handle_payment_event))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state.clone())
        .merge(admin)
        .layer(middleware::from_fn_with_state(metrics.clone(), error_metrics_mw))
        .layer(middleware::from_fn(webhook::verify_webhook))
        .layer(cors);

    spawn_reservation_sweeper(state.clone());

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8090);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    println!("starting stock-service on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
