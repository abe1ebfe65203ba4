use axum::http::StatusCode;
use axum::response::IntoResponse;
use common_http_errors::ApiError;
use uuid::Uuid;

#[test]
fn unauthorized_variant() {
    let err = ApiError::Unauthorized { code: "sig_mismatch", trace_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "sig_mismatch");
}

#[test]
fn bad_request_variant() {
    let err = ApiError::BadRequest { code: "invalid_quantity", trace_id: None, message: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_quantity");
}

#[test]
fn not_found_variant() {
    let err = ApiError::NotFound { code: "size_not_found", trace_id: None, message: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "size_not_found");
}

#[test]
fn conflict_variant() {
    let err = ApiError::Conflict { code: "conflict", trace_id: None, message: Some("retries exhausted".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "conflict");
}

#[test]
fn internal_variant() {
    let trace = Some(Uuid::new_v4());
    let err = ApiError::Internal { trace_id: trace, message: Some("boom".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "internal_error");
}
