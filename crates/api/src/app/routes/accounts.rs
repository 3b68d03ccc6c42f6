use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use velopay_ledger::AccountType;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/api/v1/balance", get(balance))
        .route("/api/v1/clients/:code", get(find_client))
}

/// The caller's own account, live balance, and (for agents) unsettled cash.
pub async fn balance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<PrincipalContext>,
) -> axum::response::Response {
    let account = match services.engine.account_for(ctx.principal()).await {
        Ok(account) => account,
        Err(e) => return errors::engine_error_to_response(&e),
    };

    let balance = match services.engine.balance(account.id).await {
        Ok(balance) => balance,
        Err(e) => return errors::engine_error_to_response(&e),
    };

    let unsettled_cash = if account.account_type == AccountType::Agent {
        match services.engine.unsettled_cash(account.id).await {
            Ok(cash) => Some(cash),
            Err(e) => return errors::engine_error_to_response(&e),
        }
    } else {
        None
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "data": {
                "account": dto::account_to_json(&account),
                "balance": balance,
                "unsettled_cash": unsettled_cash,
            }
        })),
    )
        .into_response()
}

/// Pre-reload client lookup by public account code.
pub async fn find_client(
    Extension(services): Extension<Arc<AppServices>>,
    Path(code): Path<String>,
) -> axum::response::Response {
    let account = match services.engine.find_account_by_code(&code).await {
        Ok(Some(account)) if account.account_type == AccountType::Client => account,
        Ok(_) => {
            return errors::json_error(StatusCode::NOT_FOUND, "client_not_found", "Client not found");
        }
        Err(e) => return errors::engine_error_to_response(&e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "data": {
                "account_code": account.external_code,
                "account_type": account.account_type.to_string(),
            }
        })),
    )
        .into_response()
}
