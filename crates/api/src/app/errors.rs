use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use velopay_infra::engine::EngineError;

/// Map an engine outcome to `(status, body)`.
///
/// The body shape is the service's stable error contract:
/// `{"success": false, "error": <code>, "message": <text>}`, with limit
/// denials additionally carrying their machine-readable `reason`.
pub fn engine_error_parts(err: &EngineError) -> (StatusCode, serde_json::Value) {
    match err {
        EngineError::Validation(msg) => (
            StatusCode::BAD_REQUEST,
            error_body("validation_error", msg.clone()),
        ),
        EngineError::InvariantViolation(msg) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            error_body("invariant_violation", msg.clone()),
        ),
        EngineError::UnsupportedRole | EngineError::AccountNotFound => (
            StatusCode::NOT_FOUND,
            error_body("account_not_found", err.to_string()),
        ),
        EngineError::InsufficientBalance { available } => (
            StatusCode::BAD_REQUEST,
            json!({
                "success": false,
                "error": "insufficient_balance",
                "message": format!("Insufficient agent balance (available: {available})."),
            }),
        ),
        EngineError::LimitExceeded(denial) => (
            StatusCode::BAD_REQUEST,
            json!({
                "success": false,
                "error": "limit_exceeded",
                "reason": denial.reason.code(),
                "message": denial.message,
            }),
        ),
        EngineError::Unauthorized => (
            StatusCode::FORBIDDEN,
            error_body("unauthorized", "unauthorized".to_string()),
        ),
        EngineError::Conflict(msg) => (StatusCode::CONFLICT, error_body("conflict", msg.clone())),
        EngineError::Store(e) => {
            tracing::error!(error = %e, "store failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal_error", "Internal transaction error".to_string()),
            )
        }
    }
}

/// Engine error as an idempotency-layer outcome:
/// `(status_code, body, stable)`.
pub fn engine_error_outcome(err: &EngineError) -> (u16, serde_json::Value, bool) {
    let (status, body) = engine_error_parts(err);
    (status.as_u16(), body, err.is_stable())
}

pub fn engine_error_to_response(err: &EngineError) -> axum::response::Response {
    let (status, body) = engine_error_parts(err);
    (status, Json(body)).into_response()
}

fn error_body(code: &'static str, message: String) -> serde_json::Value {
    json!({
        "success": false,
        "error": code,
        "message": message,
    })
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (status, Json(error_body(code, message.into()))).into_response()
}
