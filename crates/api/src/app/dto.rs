use serde::Deserialize;

use velopay_core::Amount;
use velopay_infra::engine::{AgentStats, SettlementReceipt, TransferReceipt};
use velopay_infra::store::TransactionPage;
use velopay_ledger::{Account, Transaction};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct ReloadRequest {
    pub client_account_code: String,
    pub amount: Amount,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub amount: Amount,
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub target_balance: Amount,
}

/// Query string for `GET /api/v1/transactions`.
///
/// `from`/`to` are unix-second bounds on `created_at`; `type` filters by
/// transaction kind wire name.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn transaction_to_json(tx: &Transaction) -> serde_json::Value {
    serde_json::json!({
        "id": tx.id.to_string(),
        "from_account": tx.from_account.to_string(),
        "to_account": tx.to_account.to_string(),
        "amount": tx.amount,
        "commission": tx.commission,
        "type": tx.kind.as_str(),
        "counterparty": tx.counterparty_hint.map(|p| p.to_string()),
        "timestamp": tx.created_at.timestamp(),
        "created_at": tx.created_at.to_rfc3339(),
    })
}

pub fn account_to_json(account: &Account) -> serde_json::Value {
    serde_json::json!({
        "id": account.id.to_string(),
        "account_code": account.external_code,
        "account_type": account.account_type.to_string(),
        "created_at": account.created_at.to_rfc3339(),
    })
}

pub fn reload_receipt_to_json(receipt: &TransferReceipt, client_account_code: &str) -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "message": "Reload successful",
        "data": {
            "transaction_id": receipt.transaction.id.to_string(),
            "new_balance": receipt.new_balance,
            "amount": receipt.transaction.amount,
            "commission": receipt.transaction.commission,
            "client_account_code": client_account_code,
            "timestamp": receipt.transaction.created_at.timestamp(),
        }
    })
}

pub fn transfer_receipt_to_json(receipt: &TransferReceipt) -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "data": {
            "transaction_id": receipt.transaction.id.to_string(),
            "amount": receipt.transaction.amount,
            "type": receipt.transaction.kind.as_str(),
            "new_balance": receipt.new_balance,
        }
    })
}

pub fn settlement_receipt_to_json(receipt: &SettlementReceipt) -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "data": {
            "collection_id": receipt.collection.id.to_string(),
            "replenishment_id": receipt.replenishment.id.to_string(),
            "amount": receipt.collection.amount,
            "unsettled_cash": receipt.unsettled_cash,
            "balance": receipt.balance,
        }
    })
}

pub fn stats_to_json(stats: &AgentStats) -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "data": {
            "recharge_count": stats.reload_count,
            "total_recharge_amount": stats.reload_total,
            "total_commission": stats.commission_total,
            "collection_count": stats.collection_count,
            "total_collection_amount": stats.collection_total,
            "last_collection_date": stats.last_collection_at.map(|d| d.to_rfc3339()),
        }
    })
}

pub fn page_to_json(page: &TransactionPage) -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "data": {
            "transactions": page.items.iter().map(transaction_to_json).collect::<Vec<_>>(),
            "current_page": page.page,
            "total_pages": page.total_pages,
            "total_items": page.total_items,
            "has_more": page.has_more,
        }
    })
}
