//! Append-only ledger persistence.
//!
//! Three logical tables back the engine: accounts, transactions, and
//! idempotency records. The traits here make **no storage assumptions**;
//! the in-memory implementations serve dev/test and the Postgres ones
//! production.
//!
//! Two primitives deserve a note because the engine's correctness leans on
//! them:
//!
//! - [`AccountStore::create_if_absent`] is an atomic insert-or-get keyed on
//!   the owning principal. Concurrent first-time callers for the same
//!   principal all receive the single winning record: never two accounts,
//!   never an error for the losers.
//! - [`IdempotencyStore::put_if_absent`] is an atomic insert-if-absent on
//!   `(key, principal)`. Exactly one of two racing writers succeeds; the
//!   other observes `false` and discards its duplicate.
//!
//! Both replace check-then-act sequences, which are racy by construction.

pub mod in_memory;
pub mod postgres;
pub mod query;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use velopay_auth::PrincipalId;
use velopay_core::{AccountId, Amount};
use velopay_ledger::{Account, AccountType, Transaction, TransactionDraft};

pub use in_memory::{InMemoryAccountStore, InMemoryIdempotencyStore, InMemoryTransactionStore};
pub use postgres::PostgresStore;
pub use query::{Pagination, TransactionFilter, TransactionPage};

/// Storage operation error.
///
/// Infrastructure failures only; deterministic domain failures are rejected
/// before a draft ever reaches a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint conflict that the store could not resolve
    /// internally.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid append request (empty batch, malformed row state).
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Payload (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend failure (connection, pool, SQL error).
    #[error("backend error: {0}")]
    Backend(String),
}

/// How a new account's external code is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSource {
    /// Use this exact code (principal-provided public codes, and the
    /// singleton `ACC-SYS-MAIN`).
    Fixed(String),
    /// Derive from the account type and the store-assigned short number.
    Synthesized,
}

/// Directory of ledger accounts (one per principal, created lazily).
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Atomic insert-or-get keyed on `owner_ref`.
    ///
    /// If an account already exists for the owner it is returned unchanged;
    /// the losing side of a concurrent creation race receives the winner's
    /// record.
    async fn create_if_absent(
        &self,
        owner_ref: PrincipalId,
        account_type: AccountType,
        code: CodeSource,
    ) -> Result<Account, StoreError>;

    async fn get(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    async fn find_by_owner(&self, owner_ref: PrincipalId) -> Result<Option<Account>, StoreError>;

    async fn find_by_code(&self, external_code: &str) -> Result<Option<Account>, StoreError>;
}

/// Append-only transaction log with filtered aggregation.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Append a batch of drafts as one atomic unit (all rows or none).
    ///
    /// Settlement relies on this with its two legs. Ids and timestamps are
    /// assigned here; rows are immutable afterwards.
    async fn append(&self, drafts: Vec<TransactionDraft>) -> Result<Vec<Transaction>, StoreError>;

    /// Sum of `amount` over matching rows; exactly zero when none match.
    async fn sum_amounts(&self, filter: &TransactionFilter) -> Result<Amount, StoreError>;

    /// Sum of `commission` over matching rows.
    async fn sum_commissions(&self, filter: &TransactionFilter) -> Result<Amount, StoreError>;

    async fn count(&self, filter: &TransactionFilter) -> Result<u64, StoreError>;

    /// Most recent `created_at` among matching rows.
    async fn latest_created_at(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Matching rows, newest first, paginated.
    async fn list(
        &self,
        filter: &TransactionFilter,
        page: Pagination,
    ) -> Result<TransactionPage, StoreError>;
}

/// Stored response for a processed `(key, principal)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: Uuid,
    pub principal: PrincipalId,
    pub endpoint: String,
    pub response_code: u16,
    pub response_body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Deduplication records for client-submitted operations.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn find(
        &self,
        key: Uuid,
        principal: PrincipalId,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Atomic insert-if-absent on `(key, principal)`.
    ///
    /// Returns `false` when another writer already stored this pair; the
    /// expected outcome for the loser of a duplicate-request race, not an
    /// error.
    async fn put_if_absent(&self, record: IdempotencyRecord) -> Result<bool, StoreError>;

    /// Delete records created before `cutoff`; returns how many.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> AccountStore for Arc<S>
where
    S: AccountStore + ?Sized,
{
    async fn create_if_absent(
        &self,
        owner_ref: PrincipalId,
        account_type: AccountType,
        code: CodeSource,
    ) -> Result<Account, StoreError> {
        (**self).create_if_absent(owner_ref, account_type, code).await
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        (**self).get(id).await
    }

    async fn find_by_owner(&self, owner_ref: PrincipalId) -> Result<Option<Account>, StoreError> {
        (**self).find_by_owner(owner_ref).await
    }

    async fn find_by_code(&self, external_code: &str) -> Result<Option<Account>, StoreError> {
        (**self).find_by_code(external_code).await
    }
}

#[async_trait]
impl<S> TransactionStore for Arc<S>
where
    S: TransactionStore + ?Sized,
{
    async fn append(&self, drafts: Vec<TransactionDraft>) -> Result<Vec<Transaction>, StoreError> {
        (**self).append(drafts).await
    }

    async fn sum_amounts(&self, filter: &TransactionFilter) -> Result<Amount, StoreError> {
        (**self).sum_amounts(filter).await
    }

    async fn sum_commissions(&self, filter: &TransactionFilter) -> Result<Amount, StoreError> {
        (**self).sum_commissions(filter).await
    }

    async fn count(&self, filter: &TransactionFilter) -> Result<u64, StoreError> {
        (**self).count(filter).await
    }

    async fn latest_created_at(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        (**self).latest_created_at(filter).await
    }

    async fn list(
        &self,
        filter: &TransactionFilter,
        page: Pagination,
    ) -> Result<TransactionPage, StoreError> {
        (**self).list(filter, page).await
    }
}

#[async_trait]
impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    async fn find(
        &self,
        key: Uuid,
        principal: PrincipalId,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        (**self).find(key, principal).await
    }

    async fn put_if_absent(&self, record: IdempotencyRecord) -> Result<bool, StoreError> {
        (**self).put_if_absent(record).await
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).purge_expired(cutoff).await
    }
}
