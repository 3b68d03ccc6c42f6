//! Postgres-backed store implementations.
//!
//! Uniqueness and atomicity guarantees the engine depends on are enforced by
//! the database itself:
//!
//! - `accounts.owner_ref` unique → one account per principal, races resolved
//!   by `ON CONFLICT DO NOTHING` + re-select of the winner.
//! - `(idempotency_key, principal_id)` primary key → at most one stored
//!   response per key, the losing writer simply observes zero rows inserted.
//! - settlement's two legs are inserted inside one SQL transaction.
//!
//! ## Error Mapping
//!
//! | SQLSTATE | StoreError | Scenario |
//! |----------|------------|----------|
//! | `23505`  | `Conflict` | Unique violation not absorbed by ON CONFLICT (e.g. fixed external code taken) |
//! | `23514`  | `InvalidAppend` | Check constraint (non-positive amount, self-transfer) |
//! | other    | `Backend`  | Connection/pool/SQL failures |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;
use uuid::Uuid;

use velopay_auth::PrincipalId;
use velopay_core::{AccountId, Amount, TransactionId};
use velopay_ledger::account::synthesized_external_code;
use velopay_ledger::{Account, AccountType, Transaction, TransactionDraft, TransactionKind};

use super::query::{Pagination, TransactionFilter, TransactionPage};
use super::{AccountStore, CodeSource, IdempotencyRecord, IdempotencyStore, StoreError, TransactionStore};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Postgres-backed implementation of all three store traits.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Apply the schema (idempotent DDL).
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("ensure_schema: {e}")))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> StoreError {
    if let Some(db) = e.as_database_error() {
        match db.code().as_deref() {
            Some("23505") => return StoreError::Conflict(format!("{operation}: {db}")),
            Some("23514") | Some("23503") => {
                return StoreError::InvalidAppend(format!("{operation}: {db}"));
            }
            _ => {}
        }
    }
    StoreError::Backend(format!("{operation}: {e}"))
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let account_type: String = row
        .try_get("account_type")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let account_type =
        AccountType::parse(&account_type).map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Account {
        id: AccountId::from_uuid(
            row.try_get("id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        owner_ref: PrincipalId::from_uuid(
            row.try_get("owner_ref")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        account_type,
        external_code: row
            .try_get("external_code")
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let kind =
        TransactionKind::parse(&kind).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let amount: i64 = row
        .try_get("amount")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let commission: i64 = row
        .try_get("commission")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let counterparty_hint: Option<Uuid> = row
        .try_get("counterparty_hint")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Transaction {
        id: TransactionId::from_uuid(
            row.try_get("id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        from_account: AccountId::from_uuid(
            row.try_get("from_account")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        to_account: AccountId::from_uuid(
            row.try_get("to_account")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        amount: Amount::from_scaled(amount),
        kind,
        commission: Amount::from_scaled(commission),
        created_at: row
            .try_get("created_at")
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        initiator: PrincipalId::from_uuid(
            row.try_get("initiator")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        counterparty_hint: counterparty_hint.map(PrincipalId::from_uuid),
    })
}

/// Append the filter's criteria as `AND` clauses.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &TransactionFilter) {
    if let Some(from) = filter.from_account {
        qb.push(" AND from_account = ").push_bind(Uuid::from(from));
    }
    if let Some(to) = filter.to_account {
        qb.push(" AND to_account = ").push_bind(Uuid::from(to));
    }
    if let Some(kind) = filter.kind {
        qb.push(" AND kind = ").push_bind(kind.as_str());
    }
    if let Some(initiator) = filter.initiator {
        qb.push(" AND initiator = ").push_bind(Uuid::from(initiator));
    }
    if let Some(since) = filter.created_since {
        qb.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND created_at < ").push_bind(before);
    }
}

#[async_trait]
impl AccountStore for PostgresStore {
    #[instrument(skip(self), fields(owner = %owner_ref))]
    async fn create_if_absent(
        &self,
        owner_ref: PrincipalId,
        account_type: AccountType,
        code: CodeSource,
    ) -> Result<Account, StoreError> {
        let external_code = match code {
            CodeSource::Fixed(code) => code,
            CodeSource::Synthesized => {
                // A conflicting insert wastes a sequence number; harmless.
                let short_no: i64 =
                    sqlx::query_scalar("SELECT nextval('account_short_no_seq')")
                        .fetch_one(&*self.pool)
                        .await
                        .map_err(|e| map_sqlx_error("account short_no", e))?;
                synthesized_external_code(account_type, short_no as u64)
            }
        };

        let account = Account {
            id: AccountId::new(),
            owner_ref,
            account_type,
            external_code,
            created_at: Utc::now(),
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (id, owner_ref, account_type, external_code, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (owner_ref) DO NOTHING
            "#,
        )
        .bind(Uuid::from(account.id))
        .bind(Uuid::from(account.owner_ref))
        .bind(account.account_type.to_string())
        .bind(&account.external_code)
        .bind(account.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("account insert", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(account);
        }

        // Lost the creation race (or the account predates this call):
        // hand back the winner's record.
        self.find_by_owner(owner_ref)
            .await?
            .ok_or_else(|| StoreError::Backend("account vanished after conflicting insert".to_string()))
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_ref, account_type, external_code, created_at FROM accounts WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("account get", e))?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_by_owner(&self, owner_ref: PrincipalId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_ref, account_type, external_code, created_at FROM accounts WHERE owner_ref = $1",
        )
        .bind(Uuid::from(owner_ref))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("account find_by_owner", e))?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_by_code(&self, external_code: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_ref, account_type, external_code, created_at FROM accounts WHERE external_code = $1",
        )
        .bind(external_code)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("account find_by_code", e))?;

        row.as_ref().map(account_from_row).transpose()
    }
}

#[async_trait]
impl TransactionStore for PostgresStore {
    #[instrument(skip(self, drafts), fields(batch = drafts.len()))]
    async fn append(&self, drafts: Vec<TransactionDraft>) -> Result<Vec<Transaction>, StoreError> {
        if drafts.is_empty() {
            return Err(StoreError::InvalidAppend("empty batch".to_string()));
        }

        let mut db_tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("append begin", e))?;

        let now = Utc::now();
        let mut committed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let tx = Transaction {
                id: TransactionId::new(),
                from_account: draft.from_account,
                to_account: draft.to_account,
                amount: draft.amount,
                kind: draft.kind,
                commission: draft.commission,
                created_at: now,
                initiator: draft.initiator,
                counterparty_hint: draft.counterparty_hint,
            };

            sqlx::query(
                r#"
                INSERT INTO transactions
                    (id, from_account, to_account, amount, kind, commission,
                     created_at, initiator, counterparty_hint)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::from(tx.id))
            .bind(Uuid::from(tx.from_account))
            .bind(Uuid::from(tx.to_account))
            .bind(tx.amount.as_scaled())
            .bind(tx.kind.as_str())
            .bind(tx.commission.as_scaled())
            .bind(tx.created_at)
            .bind(Uuid::from(tx.initiator))
            .bind(tx.counterparty_hint.map(Uuid::from))
            .execute(&mut *db_tx)
            .await
            .map_err(|e| map_sqlx_error("transaction insert", e))?;

            committed.push(tx);
        }

        db_tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("append commit", e))?;

        Ok(committed)
    }

    async fn sum_amounts(&self, filter: &TransactionFilter) -> Result<Amount, StoreError> {
        let mut qb = QueryBuilder::new(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM transactions WHERE TRUE",
        );
        push_filter(&mut qb, filter);

        let total: i64 = qb
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("sum_amounts", e))?;

        Ok(Amount::from_scaled(total))
    }

    async fn sum_commissions(&self, filter: &TransactionFilter) -> Result<Amount, StoreError> {
        let mut qb = QueryBuilder::new(
            "SELECT COALESCE(SUM(commission), 0)::BIGINT FROM transactions WHERE TRUE",
        );
        push_filter(&mut qb, filter);

        let total: i64 = qb
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("sum_commissions", e))?;

        Ok(Amount::from_scaled(total))
    }

    async fn count(&self, filter: &TransactionFilter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM transactions WHERE TRUE");
        push_filter(&mut qb, filter);

        let total: i64 = qb
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;

        Ok(total as u64)
    }

    async fn latest_created_at(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT MAX(created_at) FROM transactions WHERE TRUE");
        push_filter(&mut qb, filter);

        qb.build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_created_at", e))
    }

    async fn list(
        &self,
        filter: &TransactionFilter,
        page: Pagination,
    ) -> Result<TransactionPage, StoreError> {
        let total_items = self.count(filter).await?;

        let mut qb = QueryBuilder::new(
            r#"
            SELECT id, from_account, to_account, amount, kind, commission,
                   created_at, initiator, counterparty_hint
            FROM transactions WHERE TRUE
            "#,
        );
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC");
        qb.push(" LIMIT ").push_bind(i64::from(page.per_page));
        qb.push(" OFFSET ").push_bind(page.offset() as i64);

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        let items = rows
            .iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TransactionPage::new(items, page, total_items))
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn find(
        &self,
        key: Uuid,
        principal: PrincipalId,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, principal_id, endpoint, response_code, response_body, created_at
            FROM idempotency_keys
            WHERE idempotency_key = $1 AND principal_id = $2
            "#,
        )
        .bind(key)
        .bind(Uuid::from(principal))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("idempotency find", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let response_code: i32 = row
            .try_get("response_code")
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Some(IdempotencyRecord {
            key: row
                .try_get("idempotency_key")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            principal: PrincipalId::from_uuid(
                row.try_get("principal_id")
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
            endpoint: row
                .try_get("endpoint")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            response_code: u16::try_from(response_code)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            response_body: row
                .try_get("response_body")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        }))
    }

    #[instrument(skip(self, record), fields(key = %record.key, principal = %record.principal))]
    async fn put_if_absent(&self, record: IdempotencyRecord) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys
                (idempotency_key, principal_id, endpoint, response_code, response_body, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key, principal_id) DO NOTHING
            "#,
        )
        .bind(record.key)
        .bind(Uuid::from(record.principal))
        .bind(&record.endpoint)
        .bind(i32::from(record.response_code))
        .bind(&record.response_body)
        .bind(record.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("idempotency insert", e))?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("idempotency purge", e))?;

        Ok(deleted.rows_affected())
    }
}
