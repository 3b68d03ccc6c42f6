use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use velopay_auth::PrincipalId;
use velopay_core::{AccountId, Amount, DomainError, TransactionId};

/// Kind of value movement.
///
/// Settlement is deliberately **not** a kind: it is a compound of a
/// `Collection` leg followed by a `SystemLoad` leg for the same amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Agent hands virtual float to a client.
    #[serde(rename = "RELOAD")]
    Reload,
    /// Agent remits physical cash to the system.
    #[serde(rename = "COLLECTION")]
    Collection,
    /// System extends float to an agent.
    #[serde(rename = "SYSTEM_LOAD")]
    SystemLoad,
    /// Administrative correction toward a target balance.
    #[serde(rename = "SYSTEM_ADJUSTMENT")]
    SystemAdjustment,
}

impl TransactionKind {
    /// Stable wire name, as stored and exposed in APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Reload => "RELOAD",
            TransactionKind::Collection => "COLLECTION",
            TransactionKind::SystemLoad => "SYSTEM_LOAD",
            TransactionKind::SystemAdjustment => "SYSTEM_ADJUSTMENT",
        }
    }

    pub fn parse(s: &str) -> Result<TransactionKind, DomainError> {
        match s {
            "RELOAD" => Ok(TransactionKind::Reload),
            "COLLECTION" => Ok(TransactionKind::Collection),
            "SYSTEM_LOAD" => Ok(TransactionKind::SystemLoad),
            "SYSTEM_ADJUSTMENT" => Ok(TransactionKind::SystemAdjustment),
            other => Err(DomainError::validation(format!(
                "unknown transaction kind '{other}'"
            ))),
        }
    }
}

impl core::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, not-yet-persisted transaction.
///
/// The store turns drafts into [`Transaction`]s by assigning id and
/// timestamp at append time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: Amount,
    pub kind: TransactionKind,
    /// Informational; never part of balance derivation.
    pub commission: Amount,
    pub initiator: PrincipalId,
    /// Denormalized client reference, kept for backward-compatible reporting.
    pub counterparty_hint: Option<PrincipalId>,
}

impl TransactionDraft {
    /// Validate and build a draft.
    ///
    /// The amount must be strictly positive and the two legs distinct; a
    /// negative commission is rejected as well. Account existence is the
    /// caller's responsibility; both ids must already be resolved.
    pub fn new(
        from_account: AccountId,
        to_account: AccountId,
        amount: Amount,
        kind: TransactionKind,
        initiator: PrincipalId,
    ) -> Result<TransactionDraft, DomainError> {
        if !amount.is_positive() {
            return Err(DomainError::validation(
                "transaction amount must be strictly positive",
            ));
        }
        if from_account == to_account {
            return Err(DomainError::invariant(
                "transaction legs must reference distinct accounts",
            ));
        }

        Ok(TransactionDraft {
            from_account,
            to_account,
            amount,
            kind,
            commission: Amount::ZERO,
            initiator,
            counterparty_hint: None,
        })
    }

    pub fn with_commission(mut self, commission: Amount) -> Result<TransactionDraft, DomainError> {
        if commission.is_negative() {
            return Err(DomainError::validation("commission must be non-negative"));
        }
        self.commission = commission;
        Ok(self)
    }

    pub fn with_counterparty_hint(mut self, hint: PrincipalId) -> TransactionDraft {
        self.counterparty_hint = Some(hint);
        self
    }
}

/// A persisted ledger transaction.
///
/// Append-only: once created a transaction is never mutated or deleted.
/// Corrections are additional offsetting transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: Amount,
    pub kind: TransactionKind,
    pub commission: Amount,
    pub created_at: DateTime<Utc>,
    /// Principal who caused the transaction; may differ from either
    /// account's owner (e.g. an admin adjusting an agent).
    pub initiator: PrincipalId,
    pub counterparty_hint: Option<PrincipalId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(amount: Amount) -> Result<TransactionDraft, DomainError> {
        TransactionDraft::new(
            AccountId::new(),
            AccountId::new(),
            amount,
            TransactionKind::Reload,
            PrincipalId::new(),
        )
    }

    #[test]
    fn zero_and_negative_amounts_are_rejected() {
        assert!(matches!(
            draft(Amount::ZERO).unwrap_err(),
            DomainError::Validation(_)
        ));
        assert!(matches!(
            draft(Amount::from_units(-5)).unwrap_err(),
            DomainError::Validation(_)
        ));
    }

    #[test]
    fn self_transfer_is_rejected() {
        let account = AccountId::new();
        let err = TransactionDraft::new(
            account,
            account,
            Amount::from_units(10),
            TransactionKind::Reload,
            PrincipalId::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn negative_commission_is_rejected() {
        let err = draft(Amount::from_units(10))
            .unwrap()
            .with_commission(Amount::from_scaled(-1))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn kind_wire_names_are_stable() {
        for (kind, name) in [
            (TransactionKind::Reload, "RELOAD"),
            (TransactionKind::Collection, "COLLECTION"),
            (TransactionKind::SystemLoad, "SYSTEM_LOAD"),
            (TransactionKind::SystemAdjustment, "SYSTEM_ADJUSTMENT"),
        ] {
            assert_eq!(kind.as_str(), name);
            assert_eq!(TransactionKind::parse(name).unwrap(), kind);
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{name}\""));
        }
        assert!(TransactionKind::parse("SETTLEMENT").is_err());
    }
}
