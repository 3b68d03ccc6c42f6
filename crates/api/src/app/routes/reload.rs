use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::HeaderMap,
    routing::post,
};

use crate::app::routes::common;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new().route("/api/v1/reload", post(reload))
}

/// Agent reloads a client's balance.
///
/// The `Idempotency-Key` contract makes client retries safe: a duplicate
/// submission replays the stored response instead of moving money twice.
pub async fn reload(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<PrincipalContext>,
    headers: HeaderMap,
    Json(body): Json<dto::ReloadRequest>,
) -> axum::response::Response {
    let key = match common::require_idempotency_key(&headers) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    let agent = ctx.principal().clone();
    let engine_services = services.clone();

    let outcome = services
        .idempotency
        .run(key, agent.id, "/api/v1/reload", move || async move {
            let client_account = match engine_services
                .engine
                .find_account_by_code(&body.client_account_code)
                .await
            {
                Ok(Some(account)) => account,
                Ok(None) => {
                    // A stable miss: the code will not start existing on
                    // retry of the same submission.
                    return (
                        404,
                        serde_json::json!({
                            "success": false,
                            "error": "client_not_found",
                            "message": "Client not found",
                        }),
                        true,
                    );
                }
                Err(e) => return errors::engine_error_outcome(&e),
            };

            match engine_services
                .engine
                .reload(&agent, &client_account, body.amount)
                .await
            {
                Ok(receipt) => (
                    200,
                    dto::reload_receipt_to_json(&receipt, &client_account.external_code),
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
