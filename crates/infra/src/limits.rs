//! Reload ceiling policy.
//!
//! Limits are fraud-prevention heuristics, not accounting invariants: the
//! checks read aggregate history and are not serialized per account, so two
//! concurrent reloads can jointly overshoot a ceiling by one request's
//! margin. The derived balance cannot be corrupted by that race; it is
//! recomputed from immutable history.

use chrono::{DateTime, Datelike, Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use velopay_auth::PrincipalId;
use velopay_core::{AccountId, Amount};
use velopay_ledger::TransactionKind;

use crate::store::{StoreError, TransactionFilter, TransactionStore};

fn env_amount(name: &str, default: Amount) -> Amount {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reload ceilings, loaded from the environment with documented defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitConfig {
    /// Minimum amount per reload. `VELOPAY_RELOAD_MIN_AMOUNT`, default 5.
    pub min_amount: Amount,
    /// Maximum amount per reload. `VELOPAY_RELOAD_MAX_AMOUNT`, default 300.
    pub max_amount: Amount,
    /// Agent daily reload total. `VELOPAY_AGENT_DAILY_LIMIT`, default 5000.
    pub agent_daily_limit: Amount,
    /// Agent monthly reload total. `VELOPAY_AGENT_MONTHLY_LIMIT`, default 150000.
    pub agent_monthly_limit: Amount,
    /// Client daily received total. `VELOPAY_CLIENT_DAILY_LIMIT`, default 1000.
    pub client_daily_limit: Amount,
    /// Agent daily reload count. `VELOPAY_AGENT_DAILY_COUNT_LIMIT`, default 200.
    pub agent_daily_count_limit: u32,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            min_amount: Amount::from_units(5),
            max_amount: Amount::from_units(300),
            agent_daily_limit: Amount::from_units(5_000),
            agent_monthly_limit: Amount::from_units(150_000),
            client_daily_limit: Amount::from_units(1_000),
            agent_daily_count_limit: 200,
        }
    }
}

impl LimitConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_amount: env_amount("VELOPAY_RELOAD_MIN_AMOUNT", d.min_amount),
            max_amount: env_amount("VELOPAY_RELOAD_MAX_AMOUNT", d.max_amount),
            agent_daily_limit: env_amount("VELOPAY_AGENT_DAILY_LIMIT", d.agent_daily_limit),
            agent_monthly_limit: env_amount("VELOPAY_AGENT_MONTHLY_LIMIT", d.agent_monthly_limit),
            client_daily_limit: env_amount("VELOPAY_CLIENT_DAILY_LIMIT", d.client_daily_limit),
            agent_daily_count_limit: env_u32(
                "VELOPAY_AGENT_DAILY_COUNT_LIMIT",
                d.agent_daily_count_limit,
            ),
        }
    }
}

/// Machine-readable denial reason: the stable contract with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitReason {
    AmountTooLow,
    AmountTooHigh,
    AgentDailyCountExceeded,
    AgentDailyLimitExceeded,
    AgentMonthlyLimitExceeded,
    ClientDailyLimitExceeded,
}

impl LimitReason {
    pub fn code(&self) -> &'static str {
        match self {
            LimitReason::AmountTooLow => "AMOUNT_TOO_LOW",
            LimitReason::AmountTooHigh => "AMOUNT_TOO_HIGH",
            LimitReason::AgentDailyCountExceeded => "AGENT_DAILY_COUNT_EXCEEDED",
            LimitReason::AgentDailyLimitExceeded => "AGENT_DAILY_LIMIT_EXCEEDED",
            LimitReason::AgentMonthlyLimitExceeded => "AGENT_MONTHLY_LIMIT_EXCEEDED",
            LimitReason::ClientDailyLimitExceeded => "CLIENT_DAILY_LIMIT_EXCEEDED",
        }
    }
}

/// A denied reload: stable reason code plus human-readable copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitDenial {
    pub reason: LimitReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Denied(LimitDenial),
}

impl LimitDecision {
    fn denied(reason: LimitReason, message: String) -> Self {
        LimitDecision::Denied(LimitDenial { reason, message })
    }
}

/// Start of the calendar day containing `now`, as a UTC bound.
pub fn day_start(now: DateTime<Local>) -> DateTime<Utc> {
    local_window_start(now, now.date_naive().and_hms_opt(0, 0, 0))
}

/// Start of the calendar month containing `now`, as a UTC bound.
pub fn month_start(now: DateTime<Local>) -> DateTime<Utc> {
    let first = chrono::NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .unwrap_or_else(|| now.date_naive());
    local_window_start(now, first.and_hms_opt(0, 0, 0))
}

fn local_window_start(now: DateTime<Local>, naive: Option<NaiveDateTime>) -> DateTime<Utc> {
    let Some(naive) = naive else {
        return now.with_timezone(&Utc);
    };
    match now.timezone().from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        // DST fold: take the earlier reading so the window never shrinks.
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // DST gap skipped local midnight; read the naive time as UTC.
        LocalResult::None => Utc.from_utc_datetime(&naive),
    }
}

/// Ordered reload checks, cheapest first, short-circuiting on the first
/// failure.
#[derive(Debug, Clone, Default)]
pub struct LimitPolicy {
    config: LimitConfig,
}

impl LimitPolicy {
    pub fn new(config: LimitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    /// Evaluate every ceiling for a prospective reload.
    ///
    /// `now` is sampled once per call; both windows derive from it.
    pub async fn check<T: TransactionStore>(
        &self,
        store: &T,
        agent_account: AccountId,
        client_account: AccountId,
        amount: Amount,
        agent_principal: PrincipalId,
        now: DateTime<Local>,
    ) -> Result<LimitDecision, StoreError> {
        let cfg = &self.config;

        // 1. Per-reload minimum (no store query).
        if amount < cfg.min_amount {
            return Ok(LimitDecision::denied(
                LimitReason::AmountTooLow,
                format!("Minimum amount per reload is {}.", cfg.min_amount),
            ));
        }

        // 2. Per-reload maximum (no store query).
        if amount > cfg.max_amount {
            return Ok(LimitDecision::denied(
                LimitReason::AmountTooHigh,
                format!("Maximum amount per reload is {}.", cfg.max_amount),
            ));
        }

        let today = day_start(now);

        // 3. Agent daily reload count, keyed by initiating principal.
        let daily_count = store
            .count(
                &TransactionFilter::new()
                    .initiator(agent_principal)
                    .kind(TransactionKind::Reload)
                    .created_since(today),
            )
            .await?;
        if daily_count >= u64::from(cfg.agent_daily_count_limit) {
            return Ok(LimitDecision::denied(
                LimitReason::AgentDailyCountExceeded,
                format!(
                    "Daily reload count limit reached ({}).",
                    cfg.agent_daily_count_limit
                ),
            ));
        }

        // 4. Agent daily reload total.
        let agent_daily = store
            .sum_amounts(
                &TransactionFilter::new()
                    .from_account(agent_account)
                    .kind(TransactionKind::Reload)
                    .created_since(today),
            )
            .await?;
        if agent_daily + amount > cfg.agent_daily_limit {
            let remaining = (cfg.agent_daily_limit - agent_daily).max(Amount::ZERO);
            return Ok(LimitDecision::denied(
                LimitReason::AgentDailyLimitExceeded,
                format!(
                    "Agent daily ceiling reached ({}). Remaining: {}.",
                    cfg.agent_daily_limit, remaining
                ),
            ));
        }

        // 5. Agent monthly reload total.
        let agent_monthly = store
            .sum_amounts(
                &TransactionFilter::new()
                    .from_account(agent_account)
                    .kind(TransactionKind::Reload)
                    .created_since(month_start(now)),
            )
            .await?;
        if agent_monthly + amount > cfg.agent_monthly_limit {
            let remaining = (cfg.agent_monthly_limit - agent_monthly).max(Amount::ZERO);
            return Ok(LimitDecision::denied(
                LimitReason::AgentMonthlyLimitExceeded,
                format!(
                    "Agent monthly ceiling reached ({}). Remaining: {}.",
                    cfg.agent_monthly_limit, remaining
                ),
            ));
        }

        // 6. Client daily received total.
        let client_daily = store
            .sum_amounts(
                &TransactionFilter::new()
                    .to_account(client_account)
                    .kind(TransactionKind::Reload)
                    .created_since(today),
            )
            .await?;
        if client_daily + amount > cfg.client_daily_limit {
            let remaining = (cfg.client_daily_limit - client_daily).max(Amount::ZERO);
            return Ok(LimitDecision::denied(
                LimitReason::ClientDailyLimitExceeded,
                format!(
                    "Client daily ceiling reached ({}). Remaining: {}.",
                    cfg.client_daily_limit, remaining
                ),
            ));
        }

        Ok(LimitDecision::Allowed)
    }
}
