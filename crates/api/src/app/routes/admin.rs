//! Back-office float operations on agent accounts.
//!
//! The upstream gateway scopes these routes to back-office staff and
//! asserts that `:principal_id` identifies an agent; this layer only
//! executes the ledger operation.

use core::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    routing::post,
};

use velopay_auth::{Principal, PrincipalId, Role};

use crate::app::routes::common;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/api/v1/agents/:principal_id/collect", post(collect))
        .route("/api/v1/agents/:principal_id/load", post(load))
        .route("/api/v1/agents/:principal_id/settle", post(settle))
        .route("/api/v1/agents/:principal_id/adjust", post(adjust))
}

fn target_agent(raw: &str) -> Result<Principal, axum::response::Response> {
    let id = PrincipalId::from_str(raw).map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "agent principal id must be a UUID",
        )
    })?;
    Ok(Principal::new(id, vec![Role::new("agent")]))
}

/// Agent remits physical cash; drops balance and unsettled cash together.
pub async fn collect(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<PrincipalContext>,
    Path(principal_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<dto::AmountRequest>,
) -> axum::response::Response {
    let key = match common::require_idempotency_key(&headers) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let agent = match target_agent(&principal_id) {
        Ok(agent) => agent,
        Err(resp) => return resp,
    };

    let initiator = ctx.principal_id();
    let engine_services = services.clone();

    let outcome = services
        .idempotency
        .run(key, initiator, "/api/v1/agents/collect", move || async move {
            match engine_services.engine.collect(initiator, &agent, body.amount).await {
                Ok(receipt) => (200, dto::transfer_receipt_to_json(&receipt), true),
                Err(e) => errors::engine_error_outcome(&e),
            }
        })
        .await;

    match outcome {
        Ok(stored) => common::stored_response(stored),
        Err(e) => common::idempotency_failure(e),
    }
}

/// System extends float to the agent.
pub async fn load(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<PrincipalContext>,
    Path(principal_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<dto::AmountRequest>,
) -> axum::response::Response {
    let key = match common::require_idempotency_key(&headers) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let agent = match target_agent(&principal_id) {
        Ok(agent) => agent,
        Err(resp) => return resp,
    };

    let initiator = ctx.principal_id();
    let engine_services = services.clone();

    let outcome = services
        .idempotency
        .run(key, initiator, "/api/v1/agents/load", move || async move {
            match engine_services.engine.load_float(initiator, &agent, body.amount).await {
                Ok(receipt) => (200, dto::transfer_receipt_to_json(&receipt), true),
                Err(e) => errors::engine_error_outcome(&e),
            }
        })
        .await;

    match outcome {
        Ok(stored) => common::stored_response(stored),
        Err(e) => common::idempotency_failure(e),
    }
}

/// Clear the agent's cash debt without touching their virtual balance.
pub async fn settle(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<PrincipalContext>,
    Path(principal_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<dto::AmountRequest>,
) -> axum::response::Response {
    let key = match common::require_idempotency_key(&headers) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let agent = match target_agent(&principal_id) {
        Ok(agent) => agent,
        Err(resp) => return resp,
    };

    let initiator = ctx.principal_id();
    let engine_services = services.clone();

    let outcome = services
        .idempotency
        .run(key, initiator, "/api/v1/agents/settle", move || async move {
            match engine_services.engine.settle(initiator, &agent, body.amount).await {
                Ok(receipt) => (200, dto::settlement_receipt_to_json(&receipt), true),
                Err(e) => errors::engine_error_outcome(&e),
            }
        })
        .await;

    match outcome {
        Ok(stored) => common::stored_response(stored),
        Err(e) => common::idempotency_failure(e),
    }
}

/// Force the agent's balance to a target value.
pub async fn adjust(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<PrincipalContext>,
    Path(principal_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<dto::AdjustRequest>,
) -> axum::response::Response {
    let key = match common::require_idempotency_key(&headers) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let agent = match target_agent(&principal_id) {
        Ok(agent) => agent,
        Err(resp) => return resp,
    };

    let initiator = ctx.principal_id();
    let engine_services = services.clone();

    let outcome = services
        .idempotency
        .run(key, initiator, "/api/v1/agents/adjust", move || async move {
            use velopay_infra::engine::AdjustOutcome;

            match engine_services
                .engine
                .adjust(initiator, &agent, body.target_balance)
                .await
            {
                Ok(AdjustOutcome::Adjusted { transaction, new_balance }) => (
                    200,
                    serde_json::json!({
                        "success": true,
                        "data": {
                            "outcome": "adjusted",
                            "transaction_id": transaction.id.to_string(),
                            "amount": transaction.amount,
                            "new_balance": new_balance,
                        }
                    }),
                    true,
                ),
                Ok(AdjustOutcome::AlreadyOnTarget { balance }) => (
                    200,
                    serde_json::json!({
                        "success": true,
                        "data": {
                            "outcome": "already_on_target",
                            "balance": balance,
                        }
                    }),
                    true,
                ),
                Err(e) => errors::engine_error_outcome(&e),
            }
        })
        .await;

    match outcome {
        Ok(stored) => common::stored_response(stored),
        Err(e) => common::idempotency_failure(e),
    }
}
