use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Instruments the engine trades
///
/// Gold and silver move together, so exposure is always evaluated across both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Symbol {
    #[serde(rename = "XAUUSD")]
    XauUsd,
    #[serde(rename = "XAGUSD")]
    XagUsd,
}

impl Symbol {
    pub const ALL: [Symbol; 2] = [Symbol::XauUsd, Symbol::XagUsd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Symbol::XauUsd => "XAUUSD",
            Symbol::XagUsd => "XAGUSD",
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Symbol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "XAUUSD" => Ok(Symbol::XauUsd),
            "XAGUSD" => Ok(Symbol::XagUsd),
            other => Err(format!("Unsupported symbol: {}", other)),
        }
    }
}

/// Bar aggregation period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M15,
    H1,
    H4,
}

impl Timeframe {
    /// Evaluation order: trend first, then trigger, then timing
    pub const ALL: [Timeframe; 3] = [Timeframe::H4, Timeframe::H1, Timeframe::M15];

    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M15 => "M15",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV bar for one symbol at one timeframe
///
/// `timestamp` is the bar open time. A bar is immutable once its close time has passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn close_time(&self) -> DateTime<Utc> {
        self.timestamp + self.timeframe.duration()
    }

    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.close_time() <= now
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Trade direction. `Flat` means no trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
    #[serde(rename = "NONE")]
    Flat,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Flat => 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        *self == Direction::Flat
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Flat => "NONE",
        };
        f.write_str(s)
    }
}

/// Which layer contributed what to a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeAlignment {
    pub h4_bias: Direction,
    pub h1_trigger: Direction,
    pub m15_confirmed: bool,
}

impl TimeframeAlignment {
    pub fn empty() -> Self {
        Self {
            h4_bias: Direction::Flat,
            h1_trigger: Direction::Flat,
            m15_confirmed: false,
        }
    }
}

/// Directional decision for one symbol, produced fresh every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: Symbol,
    pub direction: Direction,
    /// 0.0 - 1.0
    pub strength: f64,
    pub alignment: TimeframeAlignment,
    pub timestamp: DateTime<Utc>,
    /// ATR on the triggering timeframe (H1), used for stop distance
    pub atr: Option<f64>,
    /// Latest close on the timing timeframe
    pub reference_price: Option<f64>,
    pub rationale: String,
}

impl Signal {
    pub fn none(
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        alignment: TimeframeAlignment,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            symbol,
            direction: Direction::Flat,
            strength: 0.0,
            alignment,
            timestamp,
            atr: None,
            reference_price: None,
            rationale: rationale.into(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        !self.direction.is_flat() && self.atr.is_some()
    }
}

/// Best bid/ask for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Price paid to enter in `direction`
    pub fn entry_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Short => self.bid,
            _ => self.ask,
        }
    }

    /// Price received when leaving a trade opened in `direction`
    pub fn exit_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Short => self.ask,
            _ => self.bid,
        }
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// Broker contract details needed for sizing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: Symbol,
    pub min_size: f64,
    pub size_step: f64,
    pub max_size: f64,
    /// Account currency P&L for a 1.0 price move on 1.0 unit of size
    pub value_per_point: f64,
}

impl SymbolSpec {
    /// Standard metal CFD contracts: gold 100 oz/lot, silver 5000 oz/lot
    pub fn standard(symbol: Symbol) -> Self {
        match symbol {
            Symbol::XauUsd => Self {
                symbol,
                min_size: 0.01,
                size_step: 0.01,
                max_size: 5.0,
                value_per_point: 100.0,
            },
            Symbol::XagUsd => Self {
                symbol,
                min_size: 0.01,
                size_step: 0.01,
                max_size: 10.0,
                value_per_point: 5000.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeState {
    Proposed,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    MaxDuration,
    FridayClose,
    ProfitLock,
    /// Position was already gone at the broker, e.g. a server-side stop fill
    ClosedAtBroker,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::StopLoss => "stop-loss",
            CloseReason::TakeProfit => "take-profit",
            CloseReason::MaxDuration => "max holding duration",
            CloseReason::FridayClose => "friday close",
            CloseReason::ProfitLock => "profit lock",
            CloseReason::ClosedAtBroker => "closed at broker",
        };
        f.write_str(s)
    }
}

/// Recorded when a trade leaves the OPEN state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeExit {
    pub exit_price: f64,
    pub closed_at: DateTime<Utc>,
    pub reason: CloseReason,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: Symbol,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size: f64,
    pub opened_at: DateTime<Utc>,
    pub state: TradeState,
    /// Loss at the stop in account currency
    pub risk_amount: f64,
    pub value_per_point: f64,
    pub broker_ticket: Option<String>,
    pub exit: Option<TradeExit>,
}

/// Emitted when a trade reaches CLOSED; consumed by the risk ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub trade_id: Uuid,
    pub symbol: Symbol,
    pub direction: Direction,
    pub realized_pnl: f64,
    pub risk_amount: f64,
    pub reason: CloseReason,
    pub closed_at: DateTime<Utc>,
}

impl Trade {
    /// P&L if the trade were closed at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.direction.sign() * self.size * self.value_per_point
    }

    pub fn is_open(&self) -> bool {
        self.state == TradeState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade(direction: Direction) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            symbol: Symbol::XauUsd,
            direction,
            entry_price: 2000.0,
            stop_loss: 1990.0,
            take_profit: 2015.0,
            size: 0.5,
            opened_at: Utc::now(),
            state: TradeState::Open,
            risk_amount: 500.0,
            value_per_point: 100.0,
            broker_ticket: None,
            exit: None,
        }
    }

    #[test]
    fn test_symbol_parsing() {
        assert_eq!("xauusd".parse::<Symbol>(), Ok(Symbol::XauUsd));
        assert_eq!("XAGUSD".parse::<Symbol>(), Ok(Symbol::XagUsd));
        assert!("EURUSD".parse::<Symbol>().is_err());
    }

    #[test]
    fn test_bar_close_time() {
        let bar = Bar {
            symbol: Symbol::XauUsd,
            timeframe: Timeframe::H4,
            timestamp: Utc::now() - Duration::hours(5),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        assert!(bar.is_closed(Utc::now()));
        assert_eq!(bar.range(), 1.5);
    }

    #[test]
    fn test_pnl_long_and_short() {
        let long = sample_trade(Direction::Long);
        assert_eq!(long.pnl_at(2010.0), 500.0); // 10 * 0.5 * 100

        let short = sample_trade(Direction::Short);
        assert_eq!(short.pnl_at(2010.0), -500.0);
    }

    #[test]
    fn test_quote_sides() {
        let quote = Quote {
            symbol: Symbol::XauUsd,
            bid: 1999.5,
            ask: 2000.0,
            timestamp: Utc::now(),
        };
        assert_eq!(quote.entry_price(Direction::Long), 2000.0);
        assert_eq!(quote.exit_price(Direction::Long), 1999.5);
        assert_eq!(quote.entry_price(Direction::Short), 1999.5);
        assert_eq!(quote.spread(), 0.5);
    }

    #[test]
    fn test_direction_serializes_none() {
        let json = serde_json::to_string(&Direction::Flat).unwrap();
        assert_eq!(json, "\"NONE\"");
    }
}
