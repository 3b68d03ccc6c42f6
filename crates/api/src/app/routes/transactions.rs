use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use chrono::{TimeZone, Utc};

use velopay_infra::store::Pagination;
use velopay_ledger::TransactionKind;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/api/v1/transactions", get(list_transactions))
        .route("/api/v1/stats", get(stats))
}

/// Transactions the caller initiated, newest first.
pub async fn list_transactions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<PrincipalContext>,
    Query(query): Query<dto::HistoryQuery>,
) -> axum::response::Response {
    let kind = match &query.kind {
        Some(raw) => match TransactionKind::parse(raw) {
            Ok(kind) => Some(kind),
            Err(e) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string());
            }
        },
        None => None,
    };

    let since = match query.from.map(unix_seconds) {
        Some(Ok(ts)) => Some(ts),
        Some(Err(resp)) => return resp,
        None => None,
    };
    let before = match query.to.map(unix_seconds) {
        Some(Ok(ts)) => Some(ts),
        Some(Err(resp)) => return resp,
        None => None,
    };

    let page = Pagination::new(
        query.page.unwrap_or(1),
        query.limit.unwrap_or(Pagination::DEFAULT_PER_PAGE),
    );

    match services
        .engine
        .history(ctx.principal_id(), kind, since, before, page)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(dto::page_to_json(&result))).into_response(),
        Err(e) => errors::engine_error_to_response(&e),
    }
}

/// Activity aggregates for the calling agent.
pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<PrincipalContext>,
) -> axum::response::Response {
    match services.engine.agent_stats(ctx.principal_id()).await {
        Ok(stats) => (StatusCode::OK, Json(dto::stats_to_json(&stats))).into_response(),
        Err(e) => errors::engine_error_to_response(&e),
    }
}

fn unix_seconds(v: i64) -> Result<chrono::DateTime<Utc>, axum::response::Response> {
    Utc.timestamp_opt(v, 0).single().ok_or_else(|| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "from/to must be unix timestamps in seconds",
        )
    })
}
