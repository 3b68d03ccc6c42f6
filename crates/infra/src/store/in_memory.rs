//! In-memory store implementations.
//!
//! Intended for tests/dev. Not optimized for performance: aggregation is a
//! full scan, which is exactly what keeps the derived-balance semantics
//! obvious.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use velopay_auth::PrincipalId;
use velopay_core::{AccountId, Amount, TransactionId};
use velopay_ledger::account::synthesized_external_code;
use velopay_ledger::{Account, AccountType, Transaction, TransactionDraft};

use super::query::{Pagination, TransactionFilter, TransactionPage};
use super::{AccountStore, CodeSource, IdempotencyRecord, IdempotencyStore, StoreError, TransactionStore};

fn lock_poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

/// In-memory account directory.
///
/// Owner uniqueness is enforced inside the write lock, so concurrent
/// `create_if_absent` calls for the same principal converge on one record.
#[derive(Debug)]
pub struct InMemoryAccountStore {
    by_owner: RwLock<HashMap<PrincipalId, Account>>,
    next_short_no: AtomicU64,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self {
            by_owner: RwLock::new(HashMap::new()),
            next_short_no: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn create_if_absent(
        &self,
        owner_ref: PrincipalId,
        account_type: AccountType,
        code: CodeSource,
    ) -> Result<Account, StoreError> {
        let mut map = self.by_owner.write().map_err(|_| lock_poisoned())?;

        if let Some(existing) = map.get(&owner_ref) {
            return Ok(existing.clone());
        }

        let external_code = match code {
            CodeSource::Fixed(code) => code,
            CodeSource::Synthesized => {
                let short_no = self.next_short_no.fetch_add(1, Ordering::Relaxed);
                synthesized_external_code(account_type, short_no)
            }
        };

        if map.values().any(|a| a.external_code == external_code) {
            return Err(StoreError::Conflict(format!(
                "external code '{external_code}' already taken"
            )));
        }

        let account = Account {
            id: AccountId::new(),
            owner_ref,
            account_type,
            external_code,
            created_at: Utc::now(),
        };
        map.insert(owner_ref, account.clone());

        Ok(account)
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let map = self.by_owner.read().map_err(|_| lock_poisoned())?;
        Ok(map.values().find(|a| a.id == id).cloned())
    }

    async fn find_by_owner(&self, owner_ref: PrincipalId) -> Result<Option<Account>, StoreError> {
        let map = self.by_owner.read().map_err(|_| lock_poisoned())?;
        Ok(map.get(&owner_ref).cloned())
    }

    async fn find_by_code(&self, external_code: &str) -> Result<Option<Account>, StoreError> {
        let map = self.by_owner.read().map_err(|_| lock_poisoned())?;
        Ok(map.values().find(|a| a.external_code == external_code).cloned())
    }
}

/// In-memory append-only transaction log.
#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    log: RwLock<Vec<Transaction>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn filtered<R>(
        &self,
        filter: &TransactionFilter,
        fold: impl FnMut(R, &Transaction) -> R,
        init: R,
    ) -> Result<R, StoreError> {
        let log = self.log.read().map_err(|_| lock_poisoned())?;
        Ok(log.iter().filter(|tx| filter.matches(tx)).fold(init, fold))
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn append(&self, drafts: Vec<TransactionDraft>) -> Result<Vec<Transaction>, StoreError> {
        if drafts.is_empty() {
            return Err(StoreError::InvalidAppend("empty batch".to_string()));
        }

        let mut log = self.log.write().map_err(|_| lock_poisoned())?;

        // Rows materialize only under the write lock, so a batch is
        // observed either fully or not at all.
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
            log.push(tx.clone());
            committed.push(tx);
        }

        Ok(committed)
    }

    async fn sum_amounts(&self, filter: &TransactionFilter) -> Result<Amount, StoreError> {
        let total = self.filtered(
            filter,
            |acc: i128, tx| acc + i128::from(tx.amount.as_scaled()),
            0,
        )?;
        Amount::from_scaled_total(total).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn sum_commissions(&self, filter: &TransactionFilter) -> Result<Amount, StoreError> {
        let total = self.filtered(
            filter,
            |acc: i128, tx| acc + i128::from(tx.commission.as_scaled()),
            0,
        )?;
        Amount::from_scaled_total(total).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn count(&self, filter: &TransactionFilter) -> Result<u64, StoreError> {
        self.filtered(filter, |acc: u64, _| acc + 1, 0)
    }

    async fn latest_created_at(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.filtered(
            filter,
            |acc: Option<DateTime<Utc>>, tx| match acc {
                Some(latest) if latest >= tx.created_at => Some(latest),
                _ => Some(tx.created_at),
            },
            None,
        )
    }

    async fn list(
        &self,
        filter: &TransactionFilter,
        page: Pagination,
    ) -> Result<TransactionPage, StoreError> {
        let log = self.log.read().map_err(|_| lock_poisoned())?;

        let mut matching: Vec<Transaction> =
            log.iter().filter(|tx| filter.matches(tx)).cloned().collect();
        // Newest first; transaction ids break created-at ties in creation order.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total_items = matching.len() as u64;
        let items: Vec<Transaction> = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page as usize)
            .collect();

        Ok(TransactionPage::new(items, page, total_items))
    }
}

/// In-memory idempotency record table.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<(Uuid, PrincipalId), IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn find(
        &self,
        key: Uuid,
        principal: PrincipalId,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let map = self.records.read().map_err(|_| lock_poisoned())?;
        Ok(map.get(&(key, principal)).cloned())
    }

    async fn put_if_absent(&self, record: IdempotencyRecord) -> Result<bool, StoreError> {
        let mut map = self.records.write().map_err(|_| lock_poisoned())?;
        match map.entry((record.key, record.principal)) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(false),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut map = self.records.write().map_err(|_| lock_poisoned())?;
        let before = map.len();
        map.retain(|_, r| r.created_at >= cutoff);
        Ok((before - map.len()) as u64)
    }
}
