//! Webhook signature verification and the admin bearer-token guard.

use axum::body::Body;
use axum::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

fn reject(status: StatusCode, code: &'static str, body: &'static str) -> Response {
    let mut resp = axum::http::Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap();
    resp.headers_mut()
        .insert("X-Error-Code", HeaderValue::from_static(code));
    resp
}

/// Canonical string covered by the webhook signature.
pub fn canonical_payload(ts: &str, nonce: &str, body: &[u8]) -> String {
    let body_hash = format!("{:x}", Sha256::digest(body));
    format!("ts:{ts}\nnonce:{nonce}\nbody_sha256:{body_hash}")
}

/// Hex HMAC-SHA256 over the canonical payload. Public so tests and tooling
/// can produce valid signatures.
pub fn signature_for(secret: &str, ts: &str, nonce: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(canonical_payload(ts, nonce, body).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Webhook signature verification middleware with HMAC, timestamp skew
/// checks and a body size cap. Replay protection by event id lives in the
/// settlement adapter, which records each id before mutating anything.
pub async fn verify_webhook(req: axum::http::Request<Body>, next: Next) -> Response {
    // Only guard webhook paths
    let is_webhook = req.uri().path().starts_with("/webhooks/");
    if !is_webhook {
        return next.run(req).await;
    }

    let sig: String = req
        .headers()
        .get("X-Signature")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_default();
    let ts: String = req
        .headers()
        .get("X-Timestamp")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_default();
    let nonce: String = req
        .headers()
        .get("X-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_default();
    if sig.is_empty() || ts.is_empty() || nonce.is_empty() {
        return reject(StatusCode::UNAUTHORIZED, "sig_missing", "missing signature");
    }

    let secret = std::env::var("PAYMENT_WEBHOOK_SECRET").unwrap_or_default();
    if secret.is_empty() {
        warn!("PAYMENT_WEBHOOK_SECRET not set; rejecting webhook delivery");
        return reject(StatusCode::UNAUTHORIZED, "sig_unconfigured", "webhook secret not configured");
    }

    // Buffer body (consume and rebuild request), 1MB cap
    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => {
            return reject(StatusCode::BAD_REQUEST, "malformed", "malformed");
        }
    };

    let expected = signature_for(&secret, &ts, &nonce, &bytes);
    let provided = sig.strip_prefix("sha256=").unwrap_or(sig.as_str());
    let eq = ConstantTimeEq::ct_eq(expected.as_bytes(), provided.as_bytes()).unwrap_u8();
    if eq != 1 {
        return reject(StatusCode::UNAUTHORIZED, "sig_mismatch", "signature mismatch");
    }

    // Timestamp skew validation (unix epoch seconds)
    let ts_num: i64 = match ts.parse() {
        Ok(v) => v,
        Err(_) => {
            return reject(StatusCode::UNAUTHORIZED, "sig_ts_invalid", "invalid timestamp");
        }
    };
    let now = chrono::Utc::now().timestamp();
    let max_skew = std::env::var("WEBHOOK_MAX_SKEW_SECS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(300);
    if (now - ts_num).abs() > max_skew {
        return reject(StatusCode::UNAUTHORIZED, "sig_skew", "timestamp skew");
    }

    if let Ok(cl) = HeaderValue::from_str(&bytes.len().to_string()) {
        parts.headers.insert(axum::http::header::CONTENT_LENGTH, cl);
    }
    let req = axum::http::Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}

/// Bearer-token guard for admin endpoints. When `ADMIN_API_TOKEN` is unset
/// the guard is disabled with a warning, mirroring the storefront's
/// optional protection for its cron endpoints.
pub async fn require_admin_token(req: axum::http::Request<Body>, next: Next) -> Response {
    let configured = std::env::var("ADMIN_API_TOKEN").unwrap_or_default();
    if configured.is_empty() {
        warn!("ADMIN_API_TOKEN not set; admin endpoints are unprotected");
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    let eq = ConstantTimeEq::ct_eq(configured.as_bytes(), provided.as_bytes()).unwrap_u8();
    if eq != 1 {
        return reject(StatusCode::UNAUTHORIZED, "admin_token_invalid", "unauthorized");
    }
    next.run(req).await
}
