use super::broker::{
    AccountInfo, BrokerPosition, CloseRequest, Fill, MarketData, OrderExecutor, OrderRequest,
    OrderResult,
};
use crate::models::{Bar, Direction, Quote, Symbol, SymbolSpec, Timeframe};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct PaperPosition {
    ticket: String,
    symbol: Symbol,
    direction: Direction,
    size: f64,
    entry_price: f64,
    stop_loss: f64,
    take_profit: f64,
    result: OrderResult,
}

impl PaperPosition {
    /// Protective level the quote has crossed, if any
    fn triggered_level(&self, quote: &Quote) -> Option<f64> {
        let price = quote.exit_price(self.direction);
        match self.direction {
            Direction::Long if price <= self.stop_loss => Some(self.stop_loss),
            Direction::Long if price >= self.take_profit => Some(self.take_profit),
            Direction::Short if price >= self.stop_loss => Some(self.stop_loss),
            Direction::Short if price <= self.take_profit => Some(self.take_profit),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct PaperState {
    clock: DateTime<Utc>,
    bars: HashMap<(Symbol, Timeframe), Vec<Bar>>,
    price_overrides: HashMap<Symbol, f64>,
    balance: f64,
    positions: HashMap<Uuid, PaperPosition>,
    /// Exit fills of closed positions, keyed like `positions`
    closed: HashMap<Uuid, (String, Fill)>,
    next_ticket: u64,
    fail_next: u32,
    reject_next: Option<String>,
    fill_ratio: f64,
}

/// In-memory broker over preloaded bars
///
/// Time only moves when the owner calls [`PaperBroker::set_time`], so a whole
/// session can be replayed deterministically. Quotes come from the last
/// closed M15 bar unless a price override is set.
#[derive(Clone)]
pub struct PaperBroker {
    state: Arc<Mutex<PaperState>>,
    spread_pct: f64,
}

impl PaperBroker {
    pub fn new(initial_balance: f64, spread_pct: f64, start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PaperState {
                clock: start,
                bars: HashMap::new(),
                price_overrides: HashMap::new(),
                balance: initial_balance,
                positions: HashMap::new(),
                closed: HashMap::new(),
                next_ticket: 1,
                fail_next: 0,
                reject_next: None,
                fill_ratio: 1.0,
            })),
            spread_pct,
        }
    }

    /// Add bars of any symbol/timeframe; each series is kept sorted by time
    pub async fn load_bars(&self, bars: Vec<Bar>) {
        let mut state = self.state.lock().await;
        for bar in bars {
            state
                .bars
                .entry((bar.symbol, bar.timeframe))
                .or_default()
                .push(bar);
        }
        for series in state.bars.values_mut() {
            series.sort_by_key(|b| b.timestamp);
            series.dedup_by_key(|b| b.timestamp);
        }
    }

    pub async fn set_time(&self, now: DateTime<Utc>) {
        self.state.lock().await.clock = now;
    }

    pub async fn now(&self) -> DateTime<Utc> {
        self.state.lock().await.clock
    }

    /// Pin the mid price of `symbol`, ignoring bars
    pub async fn set_price(&self, symbol: Symbol, mid: f64) {
        self.state.lock().await.price_overrides.insert(symbol, mid);
    }

    pub async fn clear_price(&self, symbol: Symbol) {
        self.state.lock().await.price_overrides.remove(&symbol);
    }

    /// Fail the next `count` calls of any kind
    pub async fn fail_next_calls(&self, count: u32) {
        self.state.lock().await.fail_next = count;
    }

    /// Reject the next order with `message`
    pub async fn reject_next_order(&self, message: impl Into<String>) {
        self.state.lock().await.reject_next = Some(message.into());
    }

    /// Fraction of requested size that gets filled; 1.0 is a full fill
    pub async fn set_fill_ratio(&self, ratio: f64) {
        self.state.lock().await.fill_ratio = ratio.clamp(0.0, 1.0);
    }

    pub async fn open_position_count(&self) -> usize {
        self.state.lock().await.positions.len()
    }

    pub async fn balance(&self) -> f64 {
        self.state.lock().await.balance
    }

    /// Close, at the level itself, every position whose stop or target the
    /// current quote has crossed, the way a server-side order would.
    /// Returns how many were closed.
    pub async fn fill_protective_levels(&self) -> usize {
        let mut state = self.state.lock().await;
        let triggered: Vec<(Uuid, f64)> = state
            .positions
            .iter()
            .filter_map(|(id, position)| {
                let quote = self.quote_at(&state, position.symbol).ok()?;
                position.triggered_level(&quote).map(|level| (*id, level))
            })
            .collect();

        for (id, level) in &triggered {
            if let Some(fill) = Self::settle(&mut state, *id, *level) {
                tracing::debug!("📄 Paper protective fill for {} @ {:.4}", id, fill.price);
            }
        }
        triggered.len()
    }

    fn find_position(state: &PaperState, request: &CloseRequest) -> Option<Uuid> {
        state
            .positions
            .iter()
            .find(|(id, p)| **id == request.trade_id || Some(&p.ticket) == request.ticket.as_ref())
            .map(|(id, _)| *id)
    }

    /// Realize the position at `price` into the balance
    fn settle(state: &mut PaperState, key: Uuid, price: f64) -> Option<Fill> {
        let position = state.positions.remove(&key)?;
        let pnl = (price - position.entry_price)
            * position.direction.sign()
            * position.size
            * SymbolSpec::standard(position.symbol).value_per_point;
        state.balance += pnl;

        let fill = Fill {
            price,
            size: position.size,
            timestamp: state.clock,
        };
        state.closed.insert(key, (position.ticket, fill));
        Some(fill)
    }

    fn take_failure(state: &mut PaperState, call: &str) -> Result<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(format!("paper broker: injected failure on {}", call).into());
        }
        Ok(())
    }

    fn quote_at(&self, state: &PaperState, symbol: Symbol) -> Result<Quote> {
        let mid = match state.price_overrides.get(&symbol) {
            Some(price) => *price,
            None => state
                .bars
                .get(&(symbol, Timeframe::M15))
                .and_then(|series| series.iter().rev().find(|b| b.is_closed(state.clock)))
                .map(|b| b.close)
                .ok_or_else(|| format!("no price for {} at {}", symbol, state.clock))?,
        };
        let half_spread = mid * self.spread_pct / 2.0;
        Ok(Quote {
            symbol,
            bid: mid - half_spread,
            ask: mid + half_spread,
            timestamp: state.clock,
        })
    }

    fn unrealized(&self, state: &PaperState) -> Result<f64> {
        let mut total = 0.0;
        for position in state.positions.values() {
            let quote = self.quote_at(state, position.symbol)?;
            let exit = quote.exit_price(position.direction);
            total += (exit - position.entry_price)
                * position.direction.sign()
                * position.size
                * SymbolSpec::standard(position.symbol).value_per_point;
        }
        Ok(total)
    }
}

#[async_trait]
impl MarketData for PaperBroker {
    async fn fetch_bars(&self, symbol: Symbol, timeframe: Timeframe, count: usize) -> Result<Vec<Bar>> {
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state, "fetch_bars")?;

        let clock = state.clock;
        let series = state
            .bars
            .get(&(symbol, timeframe))
            .ok_or_else(|| format!("no {} bars loaded for {}", timeframe, symbol))?;
        let closed: Vec<Bar> = series.iter().filter(|b| b.is_closed(clock)).cloned().collect();
        let skip = closed.len().saturating_sub(count);
        Ok(closed.into_iter().skip(skip).collect())
    }

    async fn quote(&self, symbol: Symbol) -> Result<Quote> {
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state, "quote")?;
        self.quote_at(&state, symbol)
    }
}

#[async_trait]
impl OrderExecutor for PaperBroker {
    async fn account(&self) -> Result<AccountInfo> {
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state, "account")?;
        let unrealized = self.unrealized(&state)?;
        Ok(AccountInfo {
            balance: state.balance,
            equity: state.balance + unrealized,
            timestamp: state.clock,
        })
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state, "place_order")?;

        // A retried request must not open a second position
        if let Some(existing) = state.positions.get(&order.client_id) {
            return Ok(existing.result.clone());
        }

        if let Some(message) = state.reject_next.take() {
            return Ok(OrderResult {
                accepted: false,
                ticket: None,
                fill_price: None,
                filled_size: 0.0,
                message: Some(message),
            });
        }

        let quote = self.quote_at(&state, order.symbol)?;
        let fill_price = quote.entry_price(order.direction);
        let spec = SymbolSpec::standard(order.symbol);
        let filled_size = crate::risk::floor_to_step(order.size * state.fill_ratio, spec.size_step);

        let ticket = format!("PAPER-{}", state.next_ticket);
        state.next_ticket += 1;

        let result = OrderResult {
            accepted: true,
            ticket: Some(ticket.clone()),
            fill_price: Some(fill_price),
            filled_size,
            message: None,
        };

        if filled_size > 0.0 {
            state.positions.insert(
                order.client_id,
                PaperPosition {
                    ticket,
                    symbol: order.symbol,
                    direction: order.direction,
                    size: filled_size,
                    entry_price: fill_price,
                    stop_loss: order.stop_loss,
                    take_profit: order.take_profit,
                    result: result.clone(),
                },
            );
        }

        tracing::debug!(
            "📄 Paper fill {} {} x{} @ {:.4}",
            order.direction,
            order.symbol,
            filled_size,
            fill_price
        );
        Ok(result)
    }

    async fn close_trade(&self, request: &CloseRequest) -> Result<Fill> {
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state, "close_trade")?;

        let key = Self::find_position(&state, request)
            .ok_or_else(|| format!("no paper position for trade {}", request.trade_id))?;
        let quote = self.quote_at(&state, request.symbol)?;
        let price = quote.exit_price(request.direction);
        Self::settle(&mut state, key, price)
            .ok_or_else(|| format!("no paper position for trade {}", request.trade_id).into())
    }

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>> {
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state, "open_positions")?;

        let mut positions: Vec<BrokerPosition> = state
            .positions
            .iter()
            .map(|(id, p)| BrokerPosition {
                ticket: p.ticket.clone(),
                client_id: Some(*id),
                symbol: p.symbol,
                direction: p.direction,
                size: p.size,
                entry_price: p.entry_price,
            })
            .collect();
        positions.sort_by(|a, b| a.ticket.cmp(&b.ticket));
        Ok(positions)
    }

    async fn closed_fill(&self, request: &CloseRequest) -> Result<Option<Fill>> {
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state, "closed_fill")?;

        Ok(state
            .closed
            .iter()
            .find(|(id, (ticket, _))| {
                **id == request.trade_id || Some(ticket) == request.ticket.as_ref()
            })
            .map(|(_, (_, fill))| *fill))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    fn bar(minutes_before: i64, close: f64) -> Bar {
        Bar {
            symbol: Symbol::XauUsd,
            timeframe: Timeframe::M15,
            timestamp: t0() - Duration::minutes(minutes_before),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        }
    }

    fn order(client_id: Uuid) -> OrderRequest {
        OrderRequest {
            client_id,
            symbol: Symbol::XauUsd,
            direction: Direction::Long,
            size: 0.5,
            stop_loss: 1990.0,
            take_profit: 2015.0,
        }
    }

    async fn broker() -> PaperBroker {
        let broker = PaperBroker::new(10_000.0, 0.0, t0());
        // The bar opened at t0 is still forming
        broker
            .load_bars(vec![bar(30, 1998.0), bar(15, 2000.0), bar(0, 2050.0)])
            .await;
        broker
    }

    #[tokio::test]
    async fn test_only_closed_bars_are_served() {
        let broker = broker().await;
        let bars = broker.fetch_bars(Symbol::XauUsd, Timeframe::M15, 10).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 2000.0);

        let quote = broker.quote(Symbol::XauUsd).await.unwrap();
        assert_eq!(quote.bid, 2000.0);
    }

    #[tokio::test]
    async fn test_order_round_trip_updates_balance() {
        let broker = broker().await;
        let id = Uuid::new_v4();
        let result = broker.place_order(&order(id)).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.fill_price, Some(2000.0));

        broker.set_price(Symbol::XauUsd, 2010.0).await;
        let account = broker.account().await.unwrap();
        assert_eq!(account.balance, 10_000.0);
        assert!((account.equity - 10_500.0).abs() < 1e-6);

        let fill = broker
            .close_trade(&CloseRequest {
                trade_id: id,
                ticket: result.ticket,
                symbol: Symbol::XauUsd,
                direction: Direction::Long,
                size: 0.5,
            })
            .await
            .unwrap();
        assert_eq!(fill.price, 2010.0);
        assert!((broker.balance().await - 10_500.0).abs() < 1e-6);
        assert_eq!(broker.open_position_count().await, 0);
    }

    #[tokio::test]
    async fn test_protective_levels_close_server_side() {
        let broker = broker().await;
        let id = Uuid::new_v4();
        let result = broker.place_order(&order(id)).await.unwrap();
        let request = CloseRequest {
            trade_id: id,
            ticket: result.ticket.clone(),
            symbol: Symbol::XauUsd,
            direction: Direction::Long,
            size: 0.5,
        };

        broker.set_price(Symbol::XauUsd, 1995.0).await;
        assert_eq!(broker.fill_protective_levels().await, 0);
        assert_eq!(broker.open_positions().await.unwrap().len(), 1);
        assert_eq!(broker.closed_fill(&request).await.unwrap(), None);

        // Gapped through the stop; the fill is at the stop level
        broker.set_price(Symbol::XauUsd, 1985.0).await;
        assert_eq!(broker.fill_protective_levels().await, 1);
        assert!(broker.open_positions().await.unwrap().is_empty());
        assert!((broker.balance().await - 9_500.0).abs() < 1e-6);

        let fill = broker.closed_fill(&request).await.unwrap().unwrap();
        assert_eq!(fill.price, 1990.0);
        assert_eq!(fill.size, 0.5);

        // Closing again is an error, not a second fill
        assert!(broker.close_trade(&request).await.is_err());
        assert!((broker.balance().await - 9_500.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_open_positions_carry_client_id() {
        let broker = broker().await;
        let id = Uuid::new_v4();
        broker.place_order(&order(id)).await.unwrap();

        let positions = broker.open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].client_id, Some(id));
        assert_eq!(positions[0].ticket, "PAPER-1");
        assert_eq!(positions[0].entry_price, 2000.0);
    }

    #[tokio::test]
    async fn test_retried_order_is_not_duplicated() {
        let broker = broker().await;
        let id = Uuid::new_v4();
        let first = broker.place_order(&order(id)).await.unwrap();
        let second = broker.place_order(&order(id)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.open_position_count().await, 1);
    }

    #[tokio::test]
    async fn test_injected_failures_and_rejections() {
        let broker = broker().await;
        broker.fail_next_calls(1).await;
        assert!(broker.account().await.is_err());
        assert!(broker.account().await.is_ok());

        broker.reject_next_order("market closed").await;
        let result = broker.place_order(&order(Uuid::new_v4())).await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.message.as_deref(), Some("market closed"));
        assert_eq!(broker.open_position_count().await, 0);
    }

    #[tokio::test]
    async fn test_partial_fill_reports_filled_size() {
        let broker = broker().await;
        broker.set_fill_ratio(0.5).await;
        let result = broker.place_order(&order(Uuid::new_v4())).await.unwrap();
        assert!(result.accepted);
        assert!((result.filled_size - 0.25).abs() < 1e-9);
    }
}
