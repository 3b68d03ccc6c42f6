use std::sync::Arc;

use proptest::prelude::*;
use uuid::Uuid;

use velopay_auth::{Principal, PrincipalId, Role};
use velopay_core::Amount;
use velopay_ledger::{AccountType, TransactionDraft, TransactionKind};

use crate::idempotency::{IdempotencyConfig, IdempotencyGuard};
use crate::limits::{LimitConfig, LimitPolicy};
use crate::store::{
    InMemoryAccountStore, InMemoryIdempotencyStore, InMemoryTransactionStore, TransactionFilter,
    TransactionStore,
};

use super::*;

type TestEngine = LedgerEngine<Arc<InMemoryAccountStore>, Arc<InMemoryTransactionStore>>;

fn engine_with(config: LimitConfig) -> (TestEngine, Arc<InMemoryTransactionStore>) {
    let accounts = Arc::new(InMemoryAccountStore::new());
    let transactions = Arc::new(InMemoryTransactionStore::new());
    let engine = LedgerEngine::new(accounts, transactions.clone(), LimitPolicy::new(config));
    (engine, transactions)
}

fn engine() -> (TestEngine, Arc<InMemoryTransactionStore>) {
    engine_with(LimitConfig::default())
}

fn agent_principal() -> Principal {
    Principal::new(PrincipalId::new(), vec![Role::new("agent")])
}

fn client_principal() -> Principal {
    Principal::new(PrincipalId::new(), vec![Role::new("client")])
}

fn admin_id() -> PrincipalId {
    PrincipalId::new()
}

async fn reload_count(store: &InMemoryTransactionStore) -> u64 {
    store
        .count(&TransactionFilter::new().kind(TransactionKind::Reload))
        .await
        .unwrap()
}

// ----------------------------------------------------------------------
// Account directory
// ----------------------------------------------------------------------

#[tokio::test]
async fn account_for_is_idempotent_and_lazy() {
    let (engine, _) = engine();
    let agent = agent_principal();

    let first = engine.account_for(&agent).await.unwrap();
    let second = engine.account_for(&agent).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.account_type, AccountType::Agent);
    assert_eq!(first.owner_ref, agent.id);
    assert!(first.external_code.starts_with("ACC-AGT-"));
}

#[tokio::test]
async fn account_for_uses_carried_public_code() {
    let (engine, _) = engine();
    let client = client_principal().with_account_code("9731");

    let account = engine.account_for(&client).await.unwrap();
    assert_eq!(account.external_code, "ACC-9731");

    let by_code = engine.find_account_by_code("9731").await.unwrap().unwrap();
    assert_eq!(by_code, account);
    let by_full_code = engine.find_account_by_code("ACC-9731").await.unwrap().unwrap();
    assert_eq!(by_full_code, account);
}

#[tokio::test]
async fn unsupported_roles_get_no_account() {
    let (engine, _) = engine();
    let admin = Principal::new(PrincipalId::new(), vec![Role::new("administrator")]);

    let err = engine.account_for(&admin).await.unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedRole));
    assert!(err.is_stable());
}

#[tokio::test]
async fn system_account_is_a_singleton() {
    let (engine, _) = engine();

    let a = engine.system_account().await.unwrap();
    let b = engine.system_account().await.unwrap();

    assert_eq!(a, b);
    assert_eq!(a.account_type, AccountType::System);
    assert_eq!(a.external_code, "ACC-SYS-MAIN");
}

// ----------------------------------------------------------------------
// Recorder + balance derivation
// ----------------------------------------------------------------------

/// Scenario A: a reload posts one RELOAD row; balances derive as +amount
/// for the client and -amount for the agent, with no stored field anywhere.
#[tokio::test]
async fn scenario_a_fresh_accounts_reload_derives_balances() {
    let (engine, store) = engine();
    let agent = engine.account_for(&agent_principal()).await.unwrap();
    let client = engine.account_for(&client_principal()).await.unwrap();

    let draft = TransactionDraft::new(
        agent.id,
        client.id,
        Amount::from_units(10),
        TransactionKind::Reload,
        agent.owner_ref,
    )
    .unwrap();
    let tx = engine.record(draft).await.unwrap();

    assert_eq!(tx.kind, TransactionKind::Reload);
    assert_eq!(engine.balance(client.id).await.unwrap(), Amount::from_units(10));
    assert_eq!(engine.balance(agent.id).await.unwrap(), Amount::from_units(-10));
    assert_eq!(reload_count(&store).await, 1);
}

#[tokio::test]
async fn zero_and_negative_amounts_leave_no_row() {
    let (engine, store) = engine();
    let agent = engine.account_for(&agent_principal()).await.unwrap();
    let client = engine.account_for(&client_principal()).await.unwrap();

    for amount in [Amount::ZERO, Amount::from_units(-5)] {
        let err = TransactionDraft::new(
            agent.id,
            client.id,
            amount,
            TransactionKind::Reload,
            agent.owner_ref,
        )
        .unwrap_err();
        assert!(matches!(err, velopay_core::DomainError::Validation(_)));
    }

    assert_eq!(
        store.count(&TransactionFilter::new()).await.unwrap(),
        0,
        "no row may exist after rejected drafts"
    );
}

#[tokio::test]
async fn empty_history_balances_are_exactly_zero() {
    let (engine, _) = engine();
    let client = engine.account_for(&client_principal()).await.unwrap();

    assert_eq!(engine.balance(client.id).await.unwrap(), Amount::ZERO);
    assert_eq!(engine.unsettled_cash(client.id).await.unwrap(), Amount::ZERO);
}

// ----------------------------------------------------------------------
// Reload operation
// ----------------------------------------------------------------------

#[tokio::test]
async fn reload_moves_float_and_records_commission() {
    let (engine, _) = engine();
    let agent = agent_principal();
    let client = client_principal();
    let client_account = engine.account_for(&client).await.unwrap();

    engine
        .load_float(admin_id(), &agent, Amount::from_units(100))
        .await
        .unwrap();

    let receipt = engine
        .reload(&agent, &client_account, Amount::from_units(20))
        .await
        .unwrap();

    assert_eq!(receipt.new_balance, Amount::from_units(20));
    assert_eq!(receipt.transaction.commission, Amount::from_scaled(200));
    assert_eq!(receipt.transaction.counterparty_hint, Some(client.id));

    // Commission is informational: the agent lost exactly the amount.
    let agent_account = engine.account_for(&agent).await.unwrap();
    assert_eq!(
        engine.balance(agent_account.id).await.unwrap(),
        Amount::from_units(80)
    );
    assert_eq!(
        engine.unsettled_cash(agent_account.id).await.unwrap(),
        Amount::from_units(20)
    );
}

#[tokio::test]
async fn reload_without_float_is_a_transient_denial() {
    let (engine, store) = engine();
    let agent = agent_principal();
    let client_account = engine.account_for(&client_principal()).await.unwrap();

    let err = engine
        .reload(&agent, &client_account, Amount::from_units(10))
        .await
        .unwrap_err();

    match err {
        EngineError::InsufficientBalance { available } => {
            assert_eq!(available, Amount::ZERO);
        }
        other => panic!("expected InsufficientBalance, got {other:?}"),
    }
    assert!(!EngineError::InsufficientBalance { available: Amount::ZERO }.is_stable());
    assert_eq!(reload_count(&store).await, 0);
}

#[tokio::test]
async fn reload_requires_an_agent_account() {
    let (engine, _) = engine();
    let not_an_agent = client_principal();
    let client_account = engine.account_for(&client_principal()).await.unwrap();

    let err = engine
        .reload(&not_an_agent, &client_account, Amount::from_units(10))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

/// Scenario D: an agent at 4,990 for the day is denied a 20.000 reload
/// under the default 5,000 ceiling, and no transaction is created.
#[tokio::test]
async fn scenario_d_daily_ceiling_denies_and_posts_nothing() {
    let (engine, store) = engine();
    let agent = agent_principal();

    engine
        .load_float(admin_id(), &agent, Amount::from_units(10_000))
        .await
        .unwrap();

    // 20 reloads of 249.500 put the agent at exactly 4,990 for the day.
    for _ in 0..20 {
        let client_account = engine.account_for(&client_principal()).await.unwrap();
        engine
            .reload(&agent, &client_account, Amount::from_scaled(249_500))
            .await
            .unwrap();
    }

    let fresh_client = engine.account_for(&client_principal()).await.unwrap();
    let err = engine
        .reload(&agent, &fresh_client, Amount::from_units(20))
        .await
        .unwrap_err();

    match &err {
        EngineError::LimitExceeded(denial) => {
            assert_eq!(denial.reason.code(), "AGENT_DAILY_LIMIT_EXCEEDED");
        }
        other => panic!("expected limit denial, got {other:?}"),
    }
    assert!(!err.is_stable(), "limit denials must stay uncached");
    assert_eq!(reload_count(&store).await, 20);
}

// ----------------------------------------------------------------------
// Collection / settlement / adjustment
// ----------------------------------------------------------------------

#[tokio::test]
async fn collection_drops_balance_and_unsettled_cash_together() {
    let (engine, _) = engine();
    let agent = agent_principal();
    let client_account = engine.account_for(&client_principal()).await.unwrap();
    let agent_account = engine.account_for(&agent).await.unwrap();

    engine
        .load_float(admin_id(), &agent, Amount::from_units(100))
        .await
        .unwrap();
    engine
        .reload(&agent, &client_account, Amount::from_units(60))
        .await
        .unwrap();

    engine
        .collect(admin_id(), &agent, Amount::from_units(25))
        .await
        .unwrap();

    assert_eq!(
        engine.balance(agent_account.id).await.unwrap(),
        Amount::from_units(15)
    );
    assert_eq!(
        engine.unsettled_cash(agent_account.id).await.unwrap(),
        Amount::from_units(35)
    );
}

/// Scenario B: settling 50.000 clears the debt, leaves the balance
/// unchanged, and posts exactly two linked transactions.
#[tokio::test]
async fn scenario_b_settlement_clears_debt_without_touching_balance() {
    let (engine, store) = engine();
    let agent = agent_principal();
    let agent_account = engine.account_for(&agent).await.unwrap();

    engine
        .load_float(admin_id(), &agent, Amount::from_units(100))
        .await
        .unwrap();
    let client_account = engine.account_for(&client_principal()).await.unwrap();
    engine
        .reload(&agent, &client_account, Amount::from_units(50))
        .await
        .unwrap();

    assert_eq!(
        engine.unsettled_cash(agent_account.id).await.unwrap(),
        Amount::from_units(50)
    );
    let balance_before = engine.balance(agent_account.id).await.unwrap();

    let receipt = engine
        .settle(admin_id(), &agent, Amount::from_units(50))
        .await
        .unwrap();

    assert_eq!(receipt.unsettled_cash, Amount::ZERO);
    assert_eq!(receipt.balance, balance_before);
    assert_eq!(receipt.collection.kind, TransactionKind::Collection);
    assert_eq!(receipt.replenishment.kind, TransactionKind::SystemLoad);
    assert_eq!(receipt.collection.amount, Amount::from_units(50));
    assert_eq!(receipt.replenishment.amount, Amount::from_units(50));

    let settlement_rows = store
        .count(&TransactionFilter::new().kind(TransactionKind::Collection))
        .await
        .unwrap()
        + store
            .count(&TransactionFilter::new().kind(TransactionKind::SystemLoad))
            .await
            .unwrap();
    // 1 initial load + collection leg + replenishment leg.
    assert_eq!(settlement_rows, 3);
}

/// Scenario E: adjusting 37.500 → 100.000 posts one SYSTEM_ADJUSTMENT of
/// 62.500; an immediate re-run posts nothing.
#[tokio::test]
async fn scenario_e_adjustment_is_offset_based_and_idempotent() {
    let (engine, store) = engine();
    let agent = agent_principal();

    engine
        .load_float(admin_id(), &agent, Amount::from_scaled(37_500))
        .await
        .unwrap();

    let outcome = engine
        .adjust(admin_id(), &agent, Amount::from_units(100))
        .await
        .unwrap();
    match outcome {
        AdjustOutcome::Adjusted { transaction, new_balance } => {
            assert_eq!(transaction.kind, TransactionKind::SystemAdjustment);
            assert_eq!(transaction.amount, Amount::from_scaled(62_500));
            assert_eq!(new_balance, Amount::from_units(100));
        }
        AdjustOutcome::AlreadyOnTarget { .. } => panic!("expected an adjustment"),
    }

    let rerun = engine
        .adjust(admin_id(), &agent, Amount::from_units(100))
        .await
        .unwrap();
    match rerun {
        AdjustOutcome::AlreadyOnTarget { balance } => {
            assert_eq!(balance, Amount::from_units(100));
        }
        AdjustOutcome::Adjusted { .. } => panic!("re-run must be a no-op"),
    }

    assert_eq!(
        store
            .count(&TransactionFilter::new().kind(TransactionKind::SystemAdjustment))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn adjustment_below_target_posts_agent_to_system() {
    let (engine, _) = engine();
    let agent = agent_principal();
    let agent_account = engine.account_for(&agent).await.unwrap();

    engine
        .load_float(admin_id(), &agent, Amount::from_units(150))
        .await
        .unwrap();

    let outcome = engine
        .adjust(admin_id(), &agent, Amount::from_units(100))
        .await
        .unwrap();
    match outcome {
        AdjustOutcome::Adjusted { transaction, new_balance } => {
            assert_eq!(transaction.from_account, agent_account.id);
            assert_eq!(transaction.amount, Amount::from_units(50));
            assert_eq!(new_balance, Amount::from_units(100));
        }
        AdjustOutcome::AlreadyOnTarget { .. } => panic!("expected an adjustment"),
    }
}

// ----------------------------------------------------------------------
// Idempotent reload end to end (scenario C at the engine level)
// ----------------------------------------------------------------------

/// Scenario C: two concurrent requests with the same key yield one RELOAD
/// row and identical responses.
#[tokio::test(flavor = "multi_thread")]
async fn scenario_c_duplicate_submissions_move_money_once() {
    let (engine, store) = engine();
    let engine = Arc::new(engine);
    let guard = Arc::new(IdempotencyGuard::new(
        InMemoryIdempotencyStore::new(),
        IdempotencyConfig::default(),
    ));

    let agent = agent_principal();
    let client_account = engine.account_for(&client_principal()).await.unwrap();
    engine
        .load_float(admin_id(), &agent, Amount::from_units(100))
        .await
        .unwrap();

    let key: Uuid = "11111111-1111-4111-8111-111111111111".parse().unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        let guard = guard.clone();
        let agent = agent.clone();
        let client_account = client_account.clone();
        handles.push(tokio::spawn(async move {
            guard
                .run(key, agent.id, "/api/v1/reload", move || async move {
                    match engine.reload(&agent, &client_account, Amount::from_units(20)).await {
                        Ok(receipt) => (
                            200,
                            serde_json::json!({
                                "success": true,
                                "transaction_id": receipt.transaction.id,
                                "new_balance": receipt.new_balance,
                            }),
                            true,
                        ),
                        Err(e) => (500, serde_json::json!({"error": e.to_string()}), e.is_stable()),
                    }
                })
                .await
                .unwrap()
        }));
    }

    let mut replies = Vec::new();
    for h in handles {
        replies.push(h.await.unwrap());
    }

    assert_eq!(replies[0], replies[1], "both callers see the same body");
    assert_eq!(replies[0].code, 200);
    assert_eq!(reload_count(&store).await, 1);
    assert_eq!(
        engine.balance(client_account.id).await.unwrap(),
        Amount::from_units(20)
    );
}

// ----------------------------------------------------------------------
// Reporting
// ----------------------------------------------------------------------

#[tokio::test]
async fn history_is_scoped_to_the_initiator() {
    let (engine, _) = engine();
    let agent = agent_principal();
    let other_agent = agent_principal();

    engine
        .load_float(admin_id(), &agent, Amount::from_units(100))
        .await
        .unwrap();
    engine
        .load_float(admin_id(), &other_agent, Amount::from_units(100))
        .await
        .unwrap();

    let client_account = engine.account_for(&client_principal()).await.unwrap();
    engine
        .reload(&agent, &client_account, Amount::from_units(10))
        .await
        .unwrap();
    engine
        .reload(&other_agent, &client_account, Amount::from_units(15))
        .await
        .unwrap();

    let page = engine
        .history(agent.id, None, None, None, Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.total_items, 1);
    assert_eq!(page.items[0].amount, Amount::from_units(10));

    let reloads_only = engine
        .history(agent.id, Some(TransactionKind::Reload), None, None, Pagination::default())
        .await
        .unwrap();
    assert_eq!(reloads_only.total_items, 1);
}

#[tokio::test]
async fn agent_stats_aggregate_per_initiator() {
    let (engine, _) = engine();
    let agent = agent_principal();

    engine
        .load_float(admin_id(), &agent, Amount::from_units(1_000))
        .await
        .unwrap();

    for units in [100, 200] {
        let client_account = engine.account_for(&client_principal()).await.unwrap();
        engine
            .reload(&agent, &client_account, Amount::from_units(units))
            .await
            .unwrap();
    }

    // Collections are initiated by the agent principal here, as when an
    // agent deposits at a branch.
    engine
        .collect(agent.id, &agent, Amount::from_units(120))
        .await
        .unwrap();

    let stats = engine.agent_stats(agent.id).await.unwrap();
    assert_eq!(stats.reload_count, 2);
    assert_eq!(stats.reload_total, Amount::from_units(300));
    assert_eq!(stats.commission_total, Amount::from_units(3));
    assert_eq!(stats.collection_count, 1);
    assert_eq!(stats.collection_total, Amount::from_units(120));
    assert!(stats.last_collection_at.is_some());
}

// ----------------------------------------------------------------------
// Conservation
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    LoadFloat { agent: usize, amount: Amount },
    Reload { agent: usize, client: usize, amount: Amount },
    Collect { agent: usize, amount: Amount },
    Settle { agent: usize, amount: Amount },
    Adjust { agent: usize, target: Amount },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    (0u8..5, 0usize..2, 0usize..2, 1i64..400).prop_map(|(op, agent, client, units)| {
        let amount = Amount::from_units(units);
        match op {
            0 => Op::LoadFloat { agent, amount },
            1 => Op::Reload { agent, client, amount },
            2 => Op::Collect { agent, amount },
            3 => Op::Settle { agent, amount },
            _ => Op::Adjust { agent, target: amount },
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Property: the ledger is a closed system. Whatever sequence of
    /// operations runs (including denied ones), the balances of every
    /// account (system included) sum to zero.
    #[test]
    fn ledger_balances_always_sum_to_zero(ops in prop::collection::vec(op_strategy(), 1..30)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");

        rt.block_on(async move {
            let (engine, _) = engine();
            let admin = admin_id();
            let agents = [agent_principal(), agent_principal()];
            let clients = [client_principal(), client_principal()];

            let mut account_ids = vec![engine.system_account().await.unwrap().id];
            for p in agents.iter().chain(clients.iter()) {
                account_ids.push(engine.account_for(p).await.unwrap().id);
            }

            for op in ops {
                // Denials (limits, insufficient float) are part of the
                // property: they must leave the ledger untouched.
                let _ = match op {
                    Op::LoadFloat { agent, amount } => {
                        engine.load_float(admin, &agents[agent], amount).await.map(|_| ())
                    }
                    Op::Reload { agent, client, amount } => {
                        let client_account = engine.account_for(&clients[client]).await.unwrap();
                        engine.reload(&agents[agent], &client_account, amount).await.map(|_| ())
                    }
                    Op::Collect { agent, amount } => {
                        engine.collect(admin, &agents[agent], amount).await.map(|_| ())
                    }
                    Op::Settle { agent, amount } => {
                        engine.settle(admin, &agents[agent], amount).await.map(|_| ())
                    }
                    Op::Adjust { agent, target } => {
                        engine.adjust(admin, &agents[agent], target).await.map(|_| ())
                    }
                };
            }

            let mut total = Amount::ZERO;
            for id in account_ids {
                total += engine.balance(id).await.unwrap();
            }
            assert_eq!(total, Amount::ZERO, "ledger must stay a closed system");
        });
    }
}
