//! The ledger engine.
//!
//! Orchestrates the account directory, derived balances, transaction
//! recording, and the money-moving operation patterns on top of the store
//! traits. Decision logic that needs no IO lives in `velopay-ledger`; this
//! module wires it to persistence.
//!
//! Balances are **never stored**: every read aggregates the append-only
//! transaction log. That is the engine's load-bearing property: a crashed
//! or raced request can at worst leave an extra idempotency record, never a
//! drifted balance.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use velopay_auth::{Principal, PrincipalId};
use velopay_core::{AccountId, Amount, DomainError};
use velopay_ledger::account::carried_external_code;
use velopay_ledger::{
    Account, AccountType, SYSTEM_ACCOUNT_CODE, Transaction, TransactionDraft, TransactionKind,
};

use crate::limits::{LimitDecision, LimitDenial, LimitPolicy};
use crate::store::{
    AccountStore, CodeSource, Pagination, StoreError, TransactionFilter, TransactionPage,
    TransactionStore,
};

#[cfg(test)]
mod tests;

/// Engine operation failure, classified per the error taxonomy the HTTP
/// shell exposes.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input (non-positive amount, malformed id). Deterministic.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A ledger invariant would be violated (e.g. self-transfer).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The principal's roles map to no ledger account type.
    #[error("no ledger account type for this principal's roles")]
    UnsupportedRole,

    /// Referenced account does not exist. Stable.
    #[error("account not found")]
    AccountNotFound,

    /// Agent float does not cover the requested reload. Transient; the
    /// same request may succeed after a system load.
    #[error("insufficient balance (available: {available})")]
    InsufficientBalance { available: Amount },

    /// A reload ceiling was hit. Transient; windows roll over.
    #[error("reload denied: {}", .0.reason.code())]
    LimitExceeded(LimitDenial),

    #[error("unauthorized")]
    Unauthorized,

    /// Conflict the engine could not resolve internally.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl EngineError {
    /// Whether this outcome is safe to cache under an idempotency key.
    ///
    /// Stable outcomes will not change on retry (malformed input, missing
    /// account); transient ones (insufficient float, limit windows,
    /// conflicts, backend failures) must stay uncached so retrying with
    /// the same key can succeed.
    pub fn is_stable(&self) -> bool {
        match self {
            EngineError::Validation(_)
            | EngineError::InvariantViolation(_)
            | EngineError::UnsupportedRole
            | EngineError::AccountNotFound => true,
            EngineError::InsufficientBalance { .. }
            | EngineError::LimitExceeded(_)
            | EngineError::Unauthorized
            | EngineError::Conflict(_)
            | EngineError::Store(_) => false,
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => EngineError::Validation(msg),
            DomainError::InvariantViolation(msg) => EngineError::InvariantViolation(msg),
            DomainError::InvalidId(msg) => EngineError::Validation(msg),
            DomainError::NotFound => EngineError::AccountNotFound,
            DomainError::Conflict(msg) => EngineError::Conflict(msg),
            DomainError::Unauthorized => EngineError::Unauthorized,
            DomainError::UnsupportedRole => EngineError::UnsupportedRole,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => EngineError::Conflict(msg),
            other => EngineError::Store(other),
        }
    }
}

/// Result of a single-transaction money movement.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub transaction: Transaction,
    /// Balance of the operation's subject account after the movement
    /// (client for reloads, agent for float operations).
    pub new_balance: Amount,
}

/// Result of a settlement (two linked transactions).
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReceipt {
    pub collection: Transaction,
    pub replenishment: Transaction,
    pub unsettled_cash: Amount,
    pub balance: Amount,
}

/// Result of an administrative balance adjustment.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdjustOutcome {
    Adjusted {
        transaction: Transaction,
        new_balance: Amount,
    },
    /// Offset below the 0.001 epsilon; nothing was posted.
    AlreadyOnTarget { balance: Amount },
}

/// Per-initiator activity aggregates for agent dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub reload_count: u64,
    pub reload_total: Amount,
    pub commission_total: Amount,
    pub collection_count: u64,
    pub collection_total: Amount,
    pub last_collection_at: Option<DateTime<Utc>>,
}

/// The ledger engine.
///
/// Generic over its stores so tests wire the in-memory implementations and
/// production wires Postgres without touching this code.
#[derive(Debug)]
pub struct LedgerEngine<A, T> {
    accounts: A,
    transactions: T,
    limits: LimitPolicy,
}

impl<A, T> LedgerEngine<A, T>
where
    A: AccountStore,
    T: TransactionStore,
{
    pub fn new(accounts: A, transactions: T, limits: LimitPolicy) -> Self {
        Self {
            accounts,
            transactions,
            limits,
        }
    }

    // ------------------------------------------------------------------
    // Account directory
    // ------------------------------------------------------------------

    /// Resolve the principal's ledger account, creating it on first use.
    ///
    /// Concurrent first-time calls converge on one account: creation is an
    /// atomic insert-or-get on the owner, so the loser of the race receives
    /// the winner's record instead of an error.
    #[instrument(skip(self, principal), fields(principal = %principal.id))]
    pub async fn account_for(&self, principal: &Principal) -> Result<Account, EngineError> {
        if let Some(existing) = self.accounts.find_by_owner(principal.id).await? {
            return Ok(existing);
        }

        let account_type = AccountType::from_roles(&principal.roles)?;
        let code = match carried_external_code(principal) {
            Some(code) => CodeSource::Fixed(code),
            None => CodeSource::Synthesized,
        };

        let account = self
            .accounts
            .create_if_absent(principal.id, account_type, code)
            .await?;
        tracing::info!(account = %account.external_code, kind = %account.account_type, "ledger account ready");
        Ok(account)
    }

    /// The singleton system account (counterparty for float issuance and
    /// cash collection), bootstrapped on first use.
    pub async fn system_account(&self) -> Result<Account, EngineError> {
        let account = self
            .accounts
            .create_if_absent(
                PrincipalId::SYSTEM,
                AccountType::System,
                CodeSource::Fixed(SYSTEM_ACCOUNT_CODE.to_string()),
            )
            .await?;
        Ok(account)
    }

    /// Look up an account by its human-facing code.
    ///
    /// Accepts both the full ledger code (`ACC-...`) and the bare public
    /// code clients print on receipts.
    pub async fn find_account_by_code(&self, code: &str) -> Result<Option<Account>, EngineError> {
        if let Some(account) = self.accounts.find_by_code(code).await? {
            return Ok(Some(account));
        }
        if !code.starts_with("ACC-") {
            return Ok(self.accounts.find_by_code(&format!("ACC-{code}")).await?);
        }
        Ok(None)
    }

    pub async fn account(&self, id: AccountId) -> Result<Option<Account>, EngineError> {
        Ok(self.accounts.get(id).await?)
    }

    // ------------------------------------------------------------------
    // Derived metrics
    // ------------------------------------------------------------------

    /// Live balance: incoming minus outgoing over the full history.
    pub async fn balance(&self, account: AccountId) -> Result<Amount, EngineError> {
        let incoming = self
            .transactions
            .sum_amounts(&TransactionFilter::new().to_account(account))
            .await?;
        let outgoing = self
            .transactions
            .sum_amounts(&TransactionFilter::new().from_account(account))
            .await?;
        Ok(incoming - outgoing)
    }

    /// Cash an agent collected from clients (reloads sent) minus cash
    /// already remitted (collections sent).
    ///
    /// Independent of [`balance`](Self::balance): this tracks physical cash
    /// custody, not virtual float.
    pub async fn unsettled_cash(&self, account: AccountId) -> Result<Amount, EngineError> {
        let collected = self
            .transactions
            .sum_amounts(
                &TransactionFilter::new()
                    .from_account(account)
                    .kind(TransactionKind::Reload),
            )
            .await?;
        let remitted = self
            .transactions
            .sum_amounts(
                &TransactionFilter::new()
                    .from_account(account)
                    .kind(TransactionKind::Collection),
            )
            .await?;
        Ok(collected - remitted)
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Append one validated transaction.
    ///
    /// The only write this method performs is the new row; no balance field
    /// is touched anywhere because none exists.
    pub async fn record(&self, draft: TransactionDraft) -> Result<Transaction, EngineError> {
        let mut committed = self.transactions.append(vec![draft]).await?;
        committed
            .pop()
            .ok_or_else(|| EngineError::Store(StoreError::Backend("append returned no rows".to_string())))
    }

    // ------------------------------------------------------------------
    // Operation patterns
    // ------------------------------------------------------------------

    /// Agent hands virtual float to a client.
    ///
    /// Checks the reload ceilings, then the agent's own float, then posts
    /// one RELOAD transaction with a 1% commission recorded for reporting.
    #[instrument(skip(self, agent, client_account), fields(agent = %agent.id, client = %client_account.external_code))]
    pub async fn reload(
        &self,
        agent: &Principal,
        client_account: &Account,
        amount: Amount,
    ) -> Result<TransferReceipt, EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::Validation(
                "reload amount must be strictly positive".to_string(),
            ));
        }

        let agent_account = self.account_for(agent).await?;
        if agent_account.account_type != AccountType::Agent {
            return Err(EngineError::Validation(
                "reload requires an agent account".to_string(),
            ));
        }

        match self
            .limits
            .check(
                &self.transactions,
                agent_account.id,
                client_account.id,
                amount,
                agent.id,
                Local::now(),
            )
            .await?
        {
            LimitDecision::Allowed => {}
            LimitDecision::Denied(denial) => return Err(EngineError::LimitExceeded(denial)),
        }

        let available = self.balance(agent_account.id).await?;
        if available < amount {
            return Err(EngineError::InsufficientBalance { available });
        }

        let draft = TransactionDraft::new(
            agent_account.id,
            client_account.id,
            amount,
            TransactionKind::Reload,
            agent.id,
        )?
        .with_commission(amount.one_percent())?
        .with_counterparty_hint(client_account.owner_ref);

        let transaction = self.record(draft).await?;
        let new_balance = self.balance(client_account.id).await?;

        tracing::info!(
            transaction = %transaction.id,
            amount = %amount,
            "reload posted"
        );

        Ok(TransferReceipt {
            transaction,
            new_balance,
        })
    }

    /// Agent remits physical cash to the system.
    ///
    /// Drops both the agent's unsettled cash and their virtual balance.
    #[instrument(skip(self, agent), fields(agent = %agent.id))]
    pub async fn collect(
        &self,
        initiator: PrincipalId,
        agent: &Principal,
        amount: Amount,
    ) -> Result<TransferReceipt, EngineError> {
        let agent_account = self.account_for(agent).await?;
        let system = self.system_account().await?;

        let draft = TransactionDraft::new(
            agent_account.id,
            system.id,
            amount,
            TransactionKind::Collection,
            initiator,
        )?;

        let transaction = self.record(draft).await?;
        let new_balance = self.balance(agent_account.id).await?;

        tracing::info!(transaction = %transaction.id, amount = %amount, "collection posted");

        Ok(TransferReceipt {
            transaction,
            new_balance,
        })
    }

    /// System extends float to an agent.
    #[instrument(skip(self, agent), fields(agent = %agent.id))]
    pub async fn load_float(
        &self,
        initiator: PrincipalId,
        agent: &Principal,
        amount: Amount,
    ) -> Result<TransferReceipt, EngineError> {
        let agent_account = self.account_for(agent).await?;
        let system = self.system_account().await?;

        let draft = TransactionDraft::new(
            system.id,
            agent_account.id,
            amount,
            TransactionKind::SystemLoad,
            initiator,
        )?;

        let transaction = self.record(draft).await?;
        let new_balance = self.balance(agent_account.id).await?;

        tracing::info!(transaction = %transaction.id, amount = %amount, "float loaded");

        Ok(TransferReceipt {
            transaction,
            new_balance,
        })
    }

    /// Agent hands over cash without losing virtual float.
    ///
    /// Two linked transactions in one atomic append: a COLLECTION clears
    /// the cash debt (and drops the balance), an immediate SYSTEM_LOAD for
    /// the same amount replenishes it. Net effect: unsettled cash −amount,
    /// balance unchanged. Partial application is impossible; the batch
    /// commits together or not at all.
    #[instrument(skip(self, agent), fields(agent = %agent.id))]
    pub async fn settle(
        &self,
        initiator: PrincipalId,
        agent: &Principal,
        amount: Amount,
    ) -> Result<SettlementReceipt, EngineError> {
        let agent_account = self.account_for(agent).await?;
        let system = self.system_account().await?;

        let collection = TransactionDraft::new(
            agent_account.id,
            system.id,
            amount,
            TransactionKind::Collection,
            initiator,
        )?;
        let replenishment = TransactionDraft::new(
            system.id,
            agent_account.id,
            amount,
            TransactionKind::SystemLoad,
            initiator,
        )?;

        let mut committed = self
            .transactions
            .append(vec![collection, replenishment])
            .await?;
        let (collection, replenishment) = match (committed.pop(), committed.pop(), committed.pop()) {
            (Some(replenishment), Some(collection), None) => (collection, replenishment),
            _ => {
                return Err(EngineError::Store(StoreError::Backend(
                    "settlement append returned a partial batch".to_string(),
                )));
            }
        };

        let unsettled_cash = self.unsettled_cash(agent_account.id).await?;
        let balance = self.balance(agent_account.id).await?;

        tracing::info!(
            collection = %collection.id,
            replenishment = %replenishment.id,
            amount = %amount,
            "settlement posted"
        );

        Ok(SettlementReceipt {
            collection,
            replenishment,
            unsettled_cash,
            balance,
        })
    }

    /// Force an agent's balance to a target value.
    ///
    /// Posts one SYSTEM_ADJUSTMENT covering the difference; offsets below
    /// the 0.001 epsilon are a no-op, so re-running an adjustment is safe.
    #[instrument(skip(self, agent), fields(agent = %agent.id, target = %target))]
    pub async fn adjust(
        &self,
        initiator: PrincipalId,
        agent: &Principal,
        target: Amount,
    ) -> Result<AdjustOutcome, EngineError> {
        let agent_account = self.account_for(agent).await?;
        let system = self.system_account().await?;

        let current = self.balance(agent_account.id).await?;
        let offset = target - current;

        if offset.abs() < Amount::EPSILON {
            return Ok(AdjustOutcome::AlreadyOnTarget { balance: current });
        }

        let draft = if offset.is_positive() {
            TransactionDraft::new(
                system.id,
                agent_account.id,
                offset,
                TransactionKind::SystemAdjustment,
                initiator,
            )?
        } else {
            TransactionDraft::new(
                agent_account.id,
                system.id,
                offset.abs(),
                TransactionKind::SystemAdjustment,
                initiator,
            )?
        };

        let transaction = self.record(draft).await?;
        let new_balance = self.balance(agent_account.id).await?;

        tracing::info!(transaction = %transaction.id, offset = %offset, "adjustment posted");

        Ok(AdjustOutcome::Adjusted {
            transaction,
            new_balance,
        })
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Transactions a principal initiated, newest first.
    pub async fn history(
        &self,
        initiator: PrincipalId,
        kind: Option<TransactionKind>,
        created_since: Option<DateTime<Utc>>,
        created_before: Option<DateTime<Utc>>,
        page: Pagination,
    ) -> Result<TransactionPage, EngineError> {
        let mut filter = TransactionFilter::new().initiator(initiator);
        if let Some(kind) = kind {
            filter = filter.kind(kind);
        }
        if let Some(since) = created_since {
            filter = filter.created_since(since);
        }
        if let Some(before) = created_before {
            filter = filter.created_before(before);
        }
        Ok(self.transactions.list(&filter, page).await?)
    }

    /// Activity aggregates for an agent dashboard.
    pub async fn agent_stats(&self, initiator: PrincipalId) -> Result<AgentStats, EngineError> {
        let reloads = TransactionFilter::new()
            .initiator(initiator)
            .kind(TransactionKind::Reload);
        let collections = TransactionFilter::new()
            .initiator(initiator)
            .kind(TransactionKind::Collection);

        Ok(AgentStats {
            reload_count: self.transactions.count(&reloads).await?,
            reload_total: self.transactions.sum_amounts(&reloads).await?,
            commission_total: self.transactions.sum_commissions(&reloads).await?,
            collection_count: self.transactions.count(&collections).await?,
            collection_total: self.transactions.sum_amounts(&collections).await?,
            last_collection_at: self.transactions.latest_created_at(&collections).await?,
        })
    }
}
