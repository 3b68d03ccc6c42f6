use std::sync::Arc;

use velopay_infra::engine::LedgerEngine;
use velopay_infra::idempotency::{IdempotencyConfig, IdempotencyGuard, spawn_purge_task};
use velopay_infra::limits::{LimitConfig, LimitPolicy};
use velopay_infra::store::{
    AccountStore, IdempotencyStore, InMemoryAccountStore, InMemoryIdempotencyStore,
    InMemoryTransactionStore, PostgresStore, TransactionStore,
};

pub type AppEngine = LedgerEngine<Arc<dyn AccountStore>, Arc<dyn TransactionStore>>;
pub type AppGuard = IdempotencyGuard<Arc<dyn IdempotencyStore>>;

/// Shared services behind every handler.
pub struct AppServices {
    pub engine: AppEngine,
    pub idempotency: Arc<AppGuard>,
}

/// Wire stores, engine, guard, and the background purge task.
///
/// `VELOPAY_USE_POSTGRES=true` selects the Postgres backend (requires
/// `DATABASE_URL`); anything else wires the in-memory stores for dev/test.
pub async fn build_services() -> AppServices {
    let use_postgres = std::env::var("VELOPAY_USE_POSTGRES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    let (accounts, transactions, idempotency_store): (
        Arc<dyn AccountStore>,
        Arc<dyn TransactionStore>,
        Arc<dyn IdempotencyStore>,
    ) = if use_postgres {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set when VELOPAY_USE_POSTGRES=true");
        let store = PostgresStore::connect(&database_url)
            .await
            .expect("failed to connect to Postgres");
        store.ensure_schema().await.expect("failed to apply schema");

        tracing::info!("using Postgres stores");
        (
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store),
        )
    } else {
        tracing::info!("using in-memory stores");
        (
            Arc::new(InMemoryAccountStore::new()),
            Arc::new(InMemoryTransactionStore::new()),
            Arc::new(InMemoryIdempotencyStore::new()),
        )
    };

    let engine = LedgerEngine::new(
        accounts,
        transactions,
        LimitPolicy::new(LimitConfig::from_env()),
    );

    let idempotency = Arc::new(IdempotencyGuard::new(
        idempotency_store,
        IdempotencyConfig::from_env(),
    ));

    // Background expiry sweep; independent of the request path.
    spawn_purge_task(idempotency.clone());

    AppServices { engine, idempotency }
}
