//! `velopay-ledger` — pure ledger domain model.
//!
//! Accounts, transactions, and their validation rules. No IO: persistence
//! and orchestration live in `velopay-infra`.

pub mod account;
pub mod transaction;

pub use account::{Account, AccountType, SYSTEM_ACCOUNT_CODE};
pub use transaction::{Transaction, TransactionDraft, TransactionKind};
