use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use uuid::Uuid;

use velopay_infra::idempotency::{StoredResponse, validate_key};
use velopay_infra::store::StoreError;

use crate::app::errors;

/// Extract and validate the `Idempotency-Key` header.
///
/// Required on every mutating route, checked before any ledger work.
pub fn require_idempotency_key(headers: &HeaderMap) -> Result<Uuid, axum::response::Response> {
    let raw = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let Some(raw) = raw else {
        return Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Idempotency-Key header is required",
        ));
    };

    validate_key(raw).map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Idempotency-Key must be a UUID v4",
        )
    })
}

/// Render an idempotency-layer outcome (fresh or replayed) as a response.
pub fn stored_response(stored: StoredResponse) -> axum::response::Response {
    let status =
        StatusCode::from_u16(stored.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(stored.body)).into_response()
}

/// The idempotency store itself failed; nothing was cached.
pub fn idempotency_failure(e: StoreError) -> axum::response::Response {
    tracing::error!(error = %e, "idempotency layer failure");
    errors::json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "Internal transaction error",
    )
}
