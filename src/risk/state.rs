use super::challenge::ChallengeConfig;
use crate::execution::AccountInfo;
use crate::models::{Symbol, Trade, TradeOutcome};
use crate::reporting::{ComplianceStatus, DailySummary};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Share of equity a day's realized P&L must reach to count as a profitable day
const PROFITABLE_DAY_PCT: f64 = 0.001;

/// Set once total drawdown reaches the limit; only `RiskLedger::clear_halt` removes it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub at: DateTime<Utc>,
    pub drawdown_pct: f64,
}

/// Account risk state
///
/// Every change goes through [`RiskLedger`]; code elsewhere only ever sees
/// copies taken with [`RiskLedger::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub initial_balance: f64,
    pub account_balance: f64,
    pub equity: f64,
    pub peak_equity: f64,
    pub daily_start_equity: f64,
    /// Highest equity seen since the trading day started
    #[serde(default)]
    pub daily_high_equity: f64,
    pub daily_realized_pnl: f64,
    pub daily_trade_count: u32,
    pub trading_day: NaiveDate,
    pub consecutive_losses: u32,
    pub total_trades: u32,
    pub open_trade_count: usize,
    pub per_symbol_trade_count: BTreeMap<Symbol, usize>,
    /// Loss at the stop of every open trade, summed per symbol
    pub open_risk: BTreeMap<Symbol, f64>,
    /// Unrealized P&L of each open trade as last marked, already contained in `equity`
    #[serde(default)]
    pub open_marks: BTreeMap<Uuid, f64>,
    pub trading_days: BTreeSet<NaiveDate>,
    pub profitable_days: u32,
    pub halt: Option<HaltRecord>,
}

impl RiskState {
    pub fn new(initial_balance: f64, trading_day: NaiveDate) -> Self {
        Self {
            initial_balance,
            account_balance: initial_balance,
            equity: initial_balance,
            peak_equity: initial_balance,
            daily_start_equity: initial_balance,
            daily_high_equity: initial_balance,
            daily_realized_pnl: 0.0,
            daily_trade_count: 0,
            trading_day,
            consecutive_losses: 0,
            total_trades: 0,
            open_trade_count: 0,
            per_symbol_trade_count: BTreeMap::new(),
            open_risk: BTreeMap::new(),
            open_marks: BTreeMap::new(),
            trading_days: BTreeSet::new(),
            profitable_days: 0,
            halt: None,
        }
    }

    /// Equity lost since the start of the trading day (never negative)
    pub fn daily_loss(&self) -> f64 {
        (self.daily_start_equity - self.equity).max(0.0)
    }

    pub fn daily_loss_pct(&self) -> f64 {
        if self.daily_start_equity <= 0.0 {
            return 0.0;
        }
        self.daily_loss() / self.daily_start_equity
    }

    /// (daily high - equity) / daily high
    pub fn daily_trailing_drawdown_pct(&self) -> f64 {
        if self.daily_high_equity <= 0.0 {
            return 0.0;
        }
        ((self.daily_high_equity - self.equity) / self.daily_high_equity).max(0.0)
    }

    /// Loss against the initial balance, zero while in profit
    pub fn loss_from_initial_pct(&self) -> f64 {
        (-self.profit_pct()).max(0.0)
    }

    /// (peak - equity) / peak
    pub fn total_drawdown_pct(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity) / self.peak_equity).max(0.0)
    }

    pub fn profit_pct(&self) -> f64 {
        if self.initial_balance <= 0.0 {
            return 0.0;
        }
        (self.equity - self.initial_balance) / self.initial_balance
    }

    pub fn trades_for(&self, symbol: Symbol) -> usize {
        self.per_symbol_trade_count.get(&symbol).copied().unwrap_or(0)
    }

    /// Summed stop-loss exposure across `symbols`
    pub fn open_risk_for(&self, symbols: &[Symbol]) -> f64 {
        symbols
            .iter()
            .filter_map(|s| self.open_risk.get(s))
            .sum()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }
}

/// Single writer for [`RiskState`]
///
/// Updates are transactional: the closure works on a copy, drawdown
/// invariants are re-established on the copy, then the copy replaces the
/// shared state under the lock. Readers never observe a half-applied update.
#[derive(Debug, Clone)]
pub struct RiskLedger {
    inner: Arc<Mutex<RiskState>>,
    config: Arc<ChallengeConfig>,
}

impl RiskLedger {
    pub fn new(state: RiskState, config: Arc<ChallengeConfig>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            config,
        }
    }

    pub fn config(&self) -> &ChallengeConfig {
        &self.config
    }

    pub fn snapshot(&self) -> RiskState {
        self.lock().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halt.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, RiskState> {
        // State is only swapped whole, so a poisoned lock still holds a consistent value
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit<F>(&self, at: DateTime<Utc>, update: F) -> RiskState
    where
        F: FnOnce(&mut RiskState),
    {
        let mut guard = self.lock();
        let mut next = guard.clone();
        update(&mut next);

        next.peak_equity = next.peak_equity.max(guard.peak_equity).max(next.equity);
        next.daily_high_equity = next.daily_high_equity.max(next.equity);

        let drawdown = next.total_drawdown_pct();
        if next.halt.is_none() && drawdown >= self.config.max_total_drawdown_pct {
            tracing::error!(
                "🛑 Drawdown halt: {:.2}% from peak {:.2} (limit {:.2}%)",
                drawdown * 100.0,
                next.peak_equity,
                self.config.max_total_drawdown_pct * 100.0
            );
            next.halt = Some(HaltRecord {
                at,
                drawdown_pct: drawdown,
            });
        }

        *guard = next.clone();
        next
    }

    /// Balance poll result from the broker
    pub fn apply_account(&self, balance: f64, equity: f64, at: DateTime<Utc>) -> RiskState {
        let account = AccountInfo {
            balance,
            equity,
            timestamp: at,
        };
        self.settle(&[], Some(&account), at)
    }

    /// Record the latest unrealized P&L of an open trade
    pub fn mark_open(&self, trade_id: Uuid, unrealized_pnl: f64, at: DateTime<Utc>) -> RiskState {
        self.commit(at, |state| {
            if let Some(mark) = state.open_marks.get_mut(&trade_id) {
                *mark = unrealized_pnl;
            }
        })
    }

    pub fn record_open(&self, trade: &Trade) -> RiskState {
        self.commit(trade.opened_at, |state| {
            state.open_trade_count += 1;
            *state.per_symbol_trade_count.entry(trade.symbol).or_insert(0) += 1;
            *state.open_risk.entry(trade.symbol).or_insert(0.0) += trade.risk_amount;
            state.open_marks.insert(trade.id, 0.0);
            state.total_trades += 1;
            state.daily_trade_count += 1;
            state.trading_days.insert(trade.opened_at.date_naive());
        })
    }

    /// Realized P&L feeds balance and equity; the trade's last mark is backed
    /// out of equity so an earlier balance poll is not counted twice.
    pub fn record_close(&self, outcome: &TradeOutcome) -> RiskState {
        self.commit(outcome.closed_at, |state| apply_close(state, outcome))
    }

    /// Book trades the broker closed on its own together with the balance poll
    ///
    /// The poll already contains their realized P&L, so it overrides balance
    /// and equity in the same transaction. Without a poll the closes are
    /// applied as in `record_close`.
    pub fn settle(
        &self,
        closed: &[TradeOutcome],
        account: Option<&AccountInfo>,
        at: DateTime<Utc>,
    ) -> RiskState {
        self.commit(at, |state| {
            for outcome in closed {
                apply_close(state, outcome);
            }
            if let Some(account) = account {
                state.account_balance = account.balance;
                state.equity = account.equity;
            }
        })
    }

    /// Close out the previous trading day if `today` is a new one
    pub fn roll_day(&self, today: NaiveDate, at: DateTime<Utc>) -> Option<DailySummary> {
        let previous = self.snapshot();
        if today <= previous.trading_day {
            return None;
        }

        let profitable = previous.daily_realized_pnl >= previous.equity * PROFITABLE_DAY_PCT;
        let next = self.commit(at, |state| {
            if profitable {
                state.profitable_days += 1;
            }
            state.trading_day = today;
            state.daily_start_equity = state.equity;
            state.daily_high_equity = state.equity;
            state.daily_realized_pnl = 0.0;
            state.daily_trade_count = 0;
        });

        let summary = DailySummary {
            date: previous.trading_day,
            realized_pnl: previous.daily_realized_pnl,
            equity: previous.equity,
            drawdown_pct: previous.total_drawdown_pct(),
            daily_loss_pct: previous.daily_loss_pct(),
            trade_count: previous.daily_trade_count,
            compliance_status: ComplianceStatus::evaluate(&previous, &self.config),
            profitable,
            trading_days: next.trading_days.len() as u32,
            profitable_days: next.profitable_days,
        };
        tracing::info!(
            "📅 Day {} closed: P&L {:.2}, {} trades, status {:?}",
            summary.date,
            summary.realized_pnl,
            summary.trade_count,
            summary.compliance_status
        );
        Some(summary)
    }

    /// Explicit operator reset of a drawdown halt. Returns whether a halt was cleared.
    pub fn clear_halt(&self) -> bool {
        let mut guard = self.lock();
        let was_halted = guard.halt.take().is_some();
        if was_halted {
            tracing::warn!("Drawdown halt cleared by operator");
        }
        was_halted
    }

    /// Replace the whole state, e.g. from a persisted snapshot
    pub fn restore(&self, state: RiskState) {
        *self.lock() = state;
    }

    /// Rebuild open-trade counters from the trades actually open
    pub fn reconcile_open(&self, open_trades: &[Trade], at: DateTime<Utc>) -> RiskState {
        self.commit(at, |state| {
            let mut per_symbol = BTreeMap::new();
            let mut open_risk = BTreeMap::new();
            let mut marks = BTreeMap::new();
            for trade in open_trades.iter().filter(|t| t.is_open()) {
                *per_symbol.entry(trade.symbol).or_insert(0) += 1;
                *open_risk.entry(trade.symbol).or_insert(0.0) += trade.risk_amount;
                marks.insert(
                    trade.id,
                    state.open_marks.get(&trade.id).copied().unwrap_or(0.0),
                );
            }
            state.open_trade_count = per_symbol.values().sum();
            state.per_symbol_trade_count = per_symbol;
            state.open_risk = open_risk;
            state.open_marks = marks;
        })
    }
}

fn apply_close(state: &mut RiskState, outcome: &TradeOutcome) {
    state.open_trade_count = state.open_trade_count.saturating_sub(1);
    if let Some(count) = state.per_symbol_trade_count.get_mut(&outcome.symbol) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.per_symbol_trade_count.remove(&outcome.symbol);
        }
    }
    if let Some(risk) = state.open_risk.get_mut(&outcome.symbol) {
        *risk -= outcome.risk_amount;
        if *risk <= 1e-9 {
            state.open_risk.remove(&outcome.symbol);
        }
    }
    let mark = state.open_marks.remove(&outcome.trade_id).unwrap_or(0.0);

    state.account_balance += outcome.realized_pnl;
    state.equity += outcome.realized_pnl - mark;
    state.daily_realized_pnl += outcome.realized_pnl;

    if outcome.realized_pnl < 0.0 {
        state.consecutive_losses += 1;
    } else {
        state.consecutive_losses = 0;
    }
}
