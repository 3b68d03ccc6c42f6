//! `velopay-infra` — storage and orchestration for the ledger engine.
//!
//! Layering:
//! - `store`: append-only persistence traits + in-memory and Postgres
//!   implementations
//! - `engine`: the ledger engine proper (account directory, derived
//!   balances, transaction recording, operation patterns)
//! - `limits`: reload ceiling policy
//! - `idempotency`: at-most-once execution guard for mutating operations

pub mod engine;
pub mod idempotency;
pub mod limits;
pub mod store;

pub use engine::{EngineError, LedgerEngine};
pub use idempotency::{IdempotencyConfig, IdempotencyGuard, StoredResponse};
pub use limits::{LimitConfig, LimitDecision, LimitDenial, LimitPolicy, LimitReason};
