//! Transaction filtering and pagination.

use chrono::{DateTime, Utc};
use serde::Serialize;

use velopay_auth::PrincipalId;
use velopay_core::AccountId;
use velopay_ledger::{Transaction, TransactionKind};

/// Filter over the transaction log.
///
/// All criteria are conjunctive; `None` means "any". Time bounds are
/// half-open: `created_since` inclusive, `created_before` exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub from_account: Option<AccountId>,
    pub to_account: Option<AccountId>,
    pub kind: Option<TransactionKind>,
    pub initiator: Option<PrincipalId>,
    pub created_since: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_account(mut self, account: AccountId) -> Self {
        self.from_account = Some(account);
        self
    }

    pub fn to_account(mut self, account: AccountId) -> Self {
        self.to_account = Some(account);
        self
    }

    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn initiator(mut self, initiator: PrincipalId) -> Self {
        self.initiator = Some(initiator);
        self
    }

    pub fn created_since(mut self, since: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self
    }

    pub fn created_before(mut self, before: DateTime<Utc>) -> Self {
        self.created_before = Some(before);
        self
    }

    /// Whether a transaction satisfies every set criterion.
    pub fn matches(&self, tx: &Transaction) -> bool {
        if self.from_account.is_some_and(|from| tx.from_account != from) {
            return false;
        }
        if self.to_account.is_some_and(|to| tx.to_account != to) {
            return false;
        }
        if self.kind.is_some_and(|kind| tx.kind != kind) {
            return false;
        }
        if self.initiator.is_some_and(|initiator| tx.initiator != initiator) {
            return false;
        }
        if self.created_since.is_some_and(|since| tx.created_at < since) {
            return false;
        }
        if self.created_before.is_some_and(|before| tx.created_at >= before) {
            return false;
        }
        true
    }
}

/// 1-based page request. `per_page` is clamped to `[1, 50]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Pagination {
    pub const MAX_PER_PAGE: u32 = 50;
    pub const DEFAULT_PER_PAGE: u32 = 20;

    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_PER_PAGE)
    }
}

/// One page of transactions, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub items: Vec<Transaction>,
    pub page: u32,
    pub total_items: u64,
    pub total_pages: u32,
    pub has_more: bool,
}

impl TransactionPage {
    pub fn new(items: Vec<Transaction>, page: Pagination, total_items: u64) -> Self {
        let total_pages = total_items.div_ceil(u64::from(page.per_page)) as u32;
        Self {
            items,
            page: page.page,
            total_items,
            total_pages,
            has_more: page.page < total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_inputs() {
        let p = Pagination::new(0, 500);
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, Pagination::MAX_PER_PAGE);
        assert_eq!(p.offset(), 0);

        let p = Pagination::new(3, 20);
        assert_eq!(p.offset(), 40);
    }

    #[test]
    fn page_math() {
        let page = TransactionPage::new(vec![], Pagination::new(2, 20), 45);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_more);

        let page = TransactionPage::new(vec![], Pagination::new(3, 20), 45);
        assert!(!page.has_more);

        let page = TransactionPage::new(vec![], Pagination::new(1, 20), 0);
        assert_eq!(page.total_pages, 0);
        assert!(!page.has_more);
    }
}
