use super::broker::{CloseRequest, OrderRequest, OrderResult};
use crate::models::{CloseReason, Direction, Quote, Trade, TradeExit, TradeOutcome, TradeState};
use crate::risk::SizedOrder;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use thiserror::Error;
use uuid::Uuid;

/// Closed trades kept in memory for status output
const CLOSED_HISTORY: usize = 500;

/// Size slack when comparing a fill against the request
const FULL_FILL_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error("order rejected by broker: {0}")]
    Rejected(String),

    #[error("partial fill: requested {requested}, filled {filled}")]
    PartialFill { requested: f64, filled: f64 },

    #[error("fill reported without a price")]
    MissingFillPrice,

    #[error("trading halted before confirmation")]
    Halted,

    #[error("trade {0} not found")]
    UnknownTrade(Uuid),

    #[error("trade {0} is not open")]
    NotOpen(Uuid),
}

/// PROPOSED trade: sized and approved, not yet confirmed by the broker
///
/// Owned by the caller; dropping it is the "revert to nothing" transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedTrade {
    trade: Trade,
}

impl ProposedTrade {
    pub fn trade(&self) -> &Trade {
        &self.trade
    }

    pub fn order_request(&self) -> OrderRequest {
        OrderRequest {
            client_id: self.trade.id,
            symbol: self.trade.symbol,
            direction: self.trade.direction,
            size: self.trade.size,
            stop_loss: self.trade.stop_loss,
            take_profit: self.trade.take_profit,
        }
    }
}

/// Owns every trade from OPEN until CLOSED
///
/// Trades move PROPOSED -> OPEN -> CLOSED and never back. Closed trades are
/// immutable history.
#[derive(Debug, Clone)]
pub struct TradeBook {
    open: Vec<Trade>,
    closed: VecDeque<Trade>,
    max_hold: Duration,
    /// Share of equity an open profit must exceed to be taken early; 0 disables
    profit_lock_pct: f64,
}

impl TradeBook {
    pub fn new(max_hold: Duration) -> Self {
        Self {
            open: Vec::new(),
            closed: VecDeque::new(),
            max_hold,
            profit_lock_pct: 0.0,
        }
    }

    pub fn with_profit_lock(mut self, profit_lock_pct: f64) -> Self {
        self.profit_lock_pct = profit_lock_pct;
        self
    }

    /// Restore open trades, e.g. from a persisted snapshot
    pub fn with_open_trades(max_hold: Duration, trades: Vec<Trade>) -> Self {
        let open: Vec<Trade> = trades.into_iter().filter(Trade::is_open).collect();
        tracing::info!("Restored {} open trades", open.len());
        Self {
            open,
            closed: VecDeque::new(),
            max_hold,
            profit_lock_pct: 0.0,
        }
    }

    pub fn open_trades(&self) -> &[Trade] {
        &self.open
    }

    pub fn closed_trades(&self) -> impl Iterator<Item = &Trade> {
        self.closed.iter()
    }

    pub fn get_open(&self, id: Uuid) -> Option<&Trade> {
        self.open.iter().find(|t| t.id == id)
    }

    /// PROPOSED trade from a sized order
    pub fn propose(&self, order: &SizedOrder, value_per_point: f64, at: DateTime<Utc>) -> ProposedTrade {
        ProposedTrade {
            trade: Trade {
                id: Uuid::new_v4(),
                symbol: order.symbol,
                direction: order.direction,
                entry_price: order.entry_price,
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
                size: order.size,
                opened_at: at,
                state: TradeState::Proposed,
                risk_amount: order.risk_amount,
                value_per_point,
                broker_ticket: None,
                exit: None,
            },
        }
    }

    /// PROPOSED -> OPEN
    ///
    /// `halted` is read at the moment of confirmation: a halt that latched
    /// while the order was in flight still blocks the transition. Only a
    /// complete fill opens the trade.
    pub fn confirm(
        &mut self,
        proposed: ProposedTrade,
        result: &OrderResult,
        halted: bool,
        at: DateTime<Utc>,
    ) -> Result<Trade, LifecycleError> {
        if halted {
            return Err(LifecycleError::Halted);
        }
        if !result.accepted {
            return Err(LifecycleError::Rejected(
                result.message.clone().unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        let mut trade = proposed.trade;
        if result.filled_size + FULL_FILL_TOLERANCE < trade.size {
            return Err(LifecycleError::PartialFill {
                requested: trade.size,
                filled: result.filled_size,
            });
        }
        let fill_price = result.fill_price.ok_or(LifecycleError::MissingFillPrice)?;

        // Keep the stop distance and risk as sized, anchored on the actual fill
        let shift = fill_price - trade.entry_price;
        trade.entry_price = fill_price;
        trade.stop_loss += shift;
        trade.take_profit += shift;
        trade.opened_at = at;
        trade.broker_ticket = result.ticket.clone();
        trade.state = TradeState::Open;

        tracing::info!(
            trade_id = %trade.id,
            "🟢 Opened {} {} x{} @ {:.4} (SL {:.4}, TP {:.4})",
            trade.direction,
            trade.symbol,
            trade.size,
            trade.entry_price,
            trade.stop_loss,
            trade.take_profit
        );

        self.open.push(trade.clone());
        Ok(trade)
    }

    /// Exit condition for an open trade at `quote`, if any
    ///
    /// Stop-loss is checked before take-profit; a quote through both counts as a stop.
    /// The profit lock compares the trade's open P&L with `equity`.
    pub fn exit_reason(
        &self,
        trade: &Trade,
        quote: &Quote,
        equity: f64,
        now: DateTime<Utc>,
    ) -> Option<CloseReason> {
        let price = quote.exit_price(trade.direction);
        if let Some(reason) = level_hit(trade, price) {
            return Some(reason);
        }

        if self.profit_lock_pct > 0.0 && trade.pnl_at(price) > equity * self.profit_lock_pct {
            return Some(CloseReason::ProfitLock);
        }
        if now - trade.opened_at >= self.max_hold {
            return Some(CloseReason::MaxDuration);
        }
        None
    }

    /// Reason to record for a trade the broker closed on its own at `exit_price`
    pub fn broker_close_reason(&self, trade: &Trade, exit_price: f64) -> CloseReason {
        level_hit(trade, exit_price).unwrap_or(CloseReason::ClosedAtBroker)
    }

    pub fn close_request(&self, id: Uuid) -> Result<CloseRequest, LifecycleError> {
        let trade = self.get_open(id).ok_or(LifecycleError::UnknownTrade(id))?;
        Ok(CloseRequest {
            trade_id: trade.id,
            ticket: trade.broker_ticket.clone(),
            symbol: trade.symbol,
            direction: trade.direction,
            size: trade.size,
        })
    }

    /// OPEN -> CLOSED, emitting the outcome for the risk ledger
    pub fn close(
        &mut self,
        id: Uuid,
        exit_price: f64,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> Result<TradeOutcome, LifecycleError> {
        if self.closed.iter().any(|t| t.id == id) {
            return Err(LifecycleError::NotOpen(id));
        }
        let index = self
            .open
            .iter()
            .position(|t| t.id == id)
            .ok_or(LifecycleError::UnknownTrade(id))?;

        let mut trade = self.open.remove(index);
        let realized_pnl = trade.pnl_at(exit_price);
        trade.state = TradeState::Closed;
        trade.exit = Some(TradeExit {
            exit_price,
            closed_at: at,
            reason,
            realized_pnl,
        });

        tracing::info!(
            trade_id = %trade.id,
            "🔴 Closed {} {} @ {:.4} ({}): P&L {:.2}",
            trade.direction,
            trade.symbol,
            exit_price,
            reason,
            realized_pnl
        );

        let outcome = TradeOutcome {
            trade_id: trade.id,
            symbol: trade.symbol,
            direction: trade.direction,
            realized_pnl,
            risk_amount: trade.risk_amount,
            reason,
            closed_at: at,
        };

        self.closed.push_back(trade);
        while self.closed.len() > CLOSED_HISTORY {
            self.closed.pop_front();
        }

        Ok(outcome)
    }

    /// Most recently closed trade with `id`
    pub fn closed_trade(&self, id: Uuid) -> Option<&Trade> {
        self.closed.iter().rev().find(|t| t.id == id)
    }
}

/// Stop or target reached at `price`; the stop wins when both are
fn level_hit(trade: &Trade, price: f64) -> Option<CloseReason> {
    match trade.direction {
        Direction::Long if price <= trade.stop_loss => Some(CloseReason::StopLoss),
        Direction::Long if price >= trade.take_profit => Some(CloseReason::TakeProfit),
        Direction::Short if price >= trade.stop_loss => Some(CloseReason::StopLoss),
        Direction::Short if price <= trade.take_profit => Some(CloseReason::TakeProfit),
        _ => None,
    }
}
