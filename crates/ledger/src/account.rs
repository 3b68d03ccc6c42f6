use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use velopay_auth::{Principal, PrincipalId, Role};
use velopay_core::{AccountId, DomainError};

/// Ledger code of the singleton system account, the counterparty for float
/// issuance and cash collection.
pub const SYSTEM_ACCOUNT_CODE: &str = "ACC-SYS-MAIN";

/// Kind of ledger account, derived from the owning principal's roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Client,
    Agent,
    Captain,
    /// Exactly one system account exists.
    System,
}

impl AccountType {
    /// Map a principal's role set to an account type.
    ///
    /// Precedence is client > agent > captain (first matching role wins).
    /// Principals with none of these roles (e.g. administrators) have no
    /// ledger account; that is a valid terminal answer, not a failure of
    /// the directory.
    pub fn from_roles(roles: &[Role]) -> Result<AccountType, DomainError> {
        let has = |name: &str| roles.iter().any(|r| r.as_str() == name);

        if has("client") {
            Ok(AccountType::Client)
        } else if has("agent") {
            Ok(AccountType::Agent)
        } else if has("captain") {
            Ok(AccountType::Captain)
        } else {
            Err(DomainError::UnsupportedRole)
        }
    }

    /// Stable storage name (`client`, `agent`, `captain`, `system`).
    pub fn parse(s: &str) -> Result<AccountType, DomainError> {
        match s {
            "client" => Ok(AccountType::Client),
            "agent" => Ok(AccountType::Agent),
            "captain" => Ok(AccountType::Captain),
            "system" => Ok(AccountType::System),
            other => Err(DomainError::validation(format!(
                "unknown account type '{other}'"
            ))),
        }
    }

    /// Short tag used when synthesizing external account codes.
    pub fn code_tag(&self) -> &'static str {
        match self {
            AccountType::Client => "CLT",
            AccountType::Agent => "AGT",
            AccountType::Captain => "CPT",
            AccountType::System => "SYS",
        }
    }
}

impl core::fmt::Display for AccountType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            AccountType::Client => "client",
            AccountType::Agent => "agent",
            AccountType::Captain => "captain",
            AccountType::System => "system",
        };
        f.write_str(s)
    }
}

/// A ledger account.
///
/// Accounts hold **no balance field**. Balances are derived on demand from
/// transaction history; the identity fields here are immutable after
/// creation and accounts are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Owning principal; unique across all accounts (one account each).
    pub owner_ref: PrincipalId,
    pub account_type: AccountType,
    /// Human-facing ledger code, e.g. `ACC-CLT-00001`.
    pub external_code: String,
    pub created_at: DateTime<Utc>,
}

/// External code for a principal that already carries a public account code.
///
/// Returns `None` when the principal has no usable code; the store then
/// synthesizes one from the account type and its own short number.
pub fn carried_external_code(principal: &Principal) -> Option<String> {
    match &principal.account_code {
        Some(code) if !code.is_empty() => Some(format!("ACC-{code}")),
        _ => None,
    }
}

/// External code synthesized from the account type and a store-assigned
/// short number, e.g. `ACC-CLT-00001`.
pub fn synthesized_external_code(account_type: AccountType, short_no: u64) -> String {
    format!("ACC-{}-{:05}", account_type.code_tag(), short_no)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal_with_roles(names: &[&'static str]) -> Principal {
        Principal::new(
            PrincipalId::new(),
            names.iter().map(|n| Role::new(*n)).collect(),
        )
    }

    #[test]
    fn role_mapping_precedence_is_client_first() {
        let p = principal_with_roles(&["agent", "client"]);
        assert_eq!(AccountType::from_roles(&p.roles).unwrap(), AccountType::Client);

        let p = principal_with_roles(&["captain", "agent"]);
        assert_eq!(AccountType::from_roles(&p.roles).unwrap(), AccountType::Agent);

        let p = principal_with_roles(&["captain"]);
        assert_eq!(AccountType::from_roles(&p.roles).unwrap(), AccountType::Captain);
    }

    #[test]
    fn unsupported_roles_are_a_terminal_answer() {
        let p = principal_with_roles(&["administrator"]);
        assert_eq!(
            AccountType::from_roles(&p.roles).unwrap_err(),
            DomainError::UnsupportedRole
        );

        let p = principal_with_roles(&[]);
        assert_eq!(
            AccountType::from_roles(&p.roles).unwrap_err(),
            DomainError::UnsupportedRole
        );
    }

    #[test]
    fn external_code_prefers_public_account_code() {
        let p = principal_with_roles(&["client"]).with_account_code("9731");
        assert_eq!(carried_external_code(&p).as_deref(), Some("ACC-9731"));

        let p = principal_with_roles(&["client"]);
        assert_eq!(carried_external_code(&p), None);
    }

    #[test]
    fn external_code_is_synthesized_when_absent() {
        assert_eq!(
            synthesized_external_code(AccountType::Agent, 7),
            "ACC-AGT-00007"
        );
        assert_eq!(
            synthesized_external_code(AccountType::Client, 12345),
            "ACC-CLT-12345"
        );
    }
}
