use super::challenge::ChallengeConfig;
use super::state::RiskState;
use crate::models::{CloseReason, Symbol, Trade};
use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Why the gate refused a new trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RejectReason {
    #[error("trading halted after drawdown breach")]
    Halted,
    #[error("total drawdown limit reached")]
    MaxDrawdown,
    #[error("loss from initial balance limit reached")]
    MaxLossFromInitial,
    #[error("daily loss limit reached")]
    DailyLoss,
    #[error("trailing daily drawdown limit reached")]
    DailyTrailingDrawdown,
    #[error("market closed for the weekend")]
    Weekend,
    #[error("inside the Friday pre-close cutoff")]
    FridayCutoff,
    #[error("outside trading hours")]
    OutsideTradingHours,
    #[error("profit target reached")]
    ProfitTargetReached,
    #[error("max concurrent trades open")]
    MaxConcurrentTrades,
    #[error("max trades for symbol open")]
    MaxTradesPerSymbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceVerdict {
    Approve,
    Reject(RejectReason),
}

impl ComplianceVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, ComplianceVerdict::Approve)
    }
}

/// Instruction to close an open trade regardless of its own stop/target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForcedClose {
    pub trade_id: Uuid,
    pub symbol: Symbol,
    pub reason: CloseReason,
}

/// Gate evaluated before any sizing
///
/// Pure over `(RiskState, now)`: the same inputs always give the same verdict.
#[derive(Debug, Clone)]
pub struct ComplianceMonitor {
    config: Arc<ChallengeConfig>,
}

impl ComplianceMonitor {
    pub fn new(config: Arc<ChallengeConfig>) -> Self {
        Self { config }
    }

    /// Account-level gate
    pub fn check(&self, state: &RiskState, now: DateTime<Utc>) -> ComplianceVerdict {
        match self.account_rejection(state, now) {
            Some(reason) => ComplianceVerdict::Reject(reason),
            None => ComplianceVerdict::Approve,
        }
    }

    /// Account-level gate plus concurrency limits for `symbol`
    pub fn check_symbol(
        &self,
        state: &RiskState,
        symbol: Symbol,
        now: DateTime<Utc>,
    ) -> ComplianceVerdict {
        if let Some(reason) = self.account_rejection(state, now) {
            return ComplianceVerdict::Reject(reason);
        }
        if state.open_trade_count >= self.config.max_concurrent_trades {
            return ComplianceVerdict::Reject(RejectReason::MaxConcurrentTrades);
        }
        if state.trades_for(symbol) >= self.config.max_trades_per_symbol {
            return ComplianceVerdict::Reject(RejectReason::MaxTradesPerSymbol);
        }
        ComplianceVerdict::Approve
    }

    fn account_rejection(&self, state: &RiskState, now: DateTime<Utc>) -> Option<RejectReason> {
        if state.is_halted() {
            return Some(RejectReason::Halted);
        }
        if state.total_drawdown_pct() >= self.config.max_total_drawdown_pct {
            return Some(RejectReason::MaxDrawdown);
        }
        if state.loss_from_initial_pct() >= self.config.max_loss_from_initial_pct {
            return Some(RejectReason::MaxLossFromInitial);
        }
        if state.daily_loss_pct() >= self.config.max_daily_loss_pct {
            return Some(RejectReason::DailyLoss);
        }
        if state.daily_trailing_drawdown_pct() >= self.config.max_daily_trailing_drawdown_pct {
            return Some(RejectReason::DailyTrailingDrawdown);
        }

        match now.weekday() {
            Weekday::Sat | Weekday::Sun => return Some(RejectReason::Weekend),
            Weekday::Fri if self.in_friday_cutoff(now) => {
                return Some(RejectReason::FridayCutoff)
            }
            _ => {}
        }

        if !self.config.trading_hours.contains(now.time()) {
            return Some(RejectReason::OutsideTradingHours);
        }
        if state.profit_pct() >= self.config.profit_target_pct {
            return Some(RejectReason::ProfitTargetReached);
        }
        None
    }

    fn in_friday_cutoff(&self, now: DateTime<Utc>) -> bool {
        let cutoff =
            self.config.friday_close - Duration::minutes(self.config.friday_entry_cutoff_minutes);
        now.time() >= cutoff
    }

    /// True from `friday_close` on Friday until the end of the week
    pub fn friday_close_due(&self, now: DateTime<Utc>) -> bool {
        match now.weekday() {
            Weekday::Fri => now.time() >= self.config.friday_close,
            Weekday::Sat | Weekday::Sun => true,
            _ => false,
        }
    }

    /// Every open trade, for every symbol, once the Friday close is due
    pub fn forced_closures(&self, open_trades: &[Trade], now: DateTime<Utc>) -> Vec<ForcedClose> {
        if !self.friday_close_due(now) {
            return Vec::new();
        }
        open_trades
            .iter()
            .filter(|t| t.is_open())
            .map(|t| ForcedClose {
                trade_id: t.id,
                symbol: t.symbol,
                reason: CloseReason::FridayClose,
            })
            .collect()
    }
}
