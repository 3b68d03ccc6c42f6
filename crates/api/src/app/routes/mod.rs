use axum::Router;

pub mod accounts;
pub mod admin;
pub mod common;
pub mod reload;
pub mod system;
pub mod transactions;

/// All principal-scoped routes.
pub fn router() -> Router {
    Router::new()
        .merge(reload::router())
        .merge(admin::router())
        .merge(accounts::router())
        .merge(transactions::router())
}
