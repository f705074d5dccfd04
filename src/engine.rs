use crate::config::{AppConfig, EngineConfig};
use crate::error::EngineError;
use crate::execution::{
    AccountInfo, BrokerGateway, CloseRequest, OrderResult, ProposedTrade, TradeBook,
};
use crate::indicators::IndicatorConfig;
use crate::models::{CloseReason, Quote, Symbol, SymbolSpec, Timeframe, Trade, TradeOutcome};
use crate::persistence::{EngineSnapshot, StateStore};
use crate::reporting::{DailySummary, ReportSink};
use crate::risk::{
    ChallengeConfig, ComplianceMonitor, ComplianceVerdict, PositionSizer, RiskLedger, RiskState,
};
use crate::strategy::{build_snapshot, MultiTimeframeStrategy, SignalConfig, Strategy, TimeframeSnapshots};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What one evaluation tick did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub opened: Vec<Trade>,
    pub closed: Vec<(Uuid, CloseReason)>,
    /// Per-symbol reasons no trade was opened, for symbols that got that far
    pub skipped: Vec<(Symbol, String)>,
    pub daily_summary: Option<DailySummary>,
    pub broker_failures: u32,
    pub degraded: bool,
    pub halted: bool,
}

impl TickReport {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            opened: Vec::new(),
            closed: Vec::new(),
            skipped: Vec::new(),
            daily_summary: None,
            broker_failures: 0,
            degraded: false,
            halted: false,
        }
    }

    fn skip(&mut self, symbol: Symbol, reason: impl ToString) {
        self.skipped.push((symbol, reason.to_string()));
    }
}

/// Single evaluation loop body
///
/// One tick runs, in order: reconciliation against the broker's positions,
/// balance poll, day rollover, exits and forced closures for open trades,
/// then new entries per symbol, sequentially, and finally a state snapshot.
/// The ledger is the only place risk state changes.
pub struct TradingEngine {
    settings: EngineConfig,
    indicators: IndicatorConfig,
    signals: SignalConfig,
    broker: BrokerGateway,
    strategy: Arc<dyn Strategy>,
    ledger: RiskLedger,
    compliance: ComplianceMonitor,
    sizer: PositionSizer,
    book: TradeBook,
    store: Arc<dyn StateStore>,
    reports: Arc<dyn ReportSink>,
    consecutive_failures: u32,
    degraded: bool,
    last_tick: Option<DateTime<Utc>>,
}

impl TradingEngine {
    pub fn new(
        config: &AppConfig,
        broker: BrokerGateway,
        store: Arc<dyn StateStore>,
        reports: Arc<dyn ReportSink>,
        today: NaiveDate,
    ) -> Self {
        let challenge = Arc::new(config.challenge_config());
        let state = RiskState::new(challenge.initial_balance, today);
        let strategy = MultiTimeframeStrategy::new(config.signal.clone(), config.indicators.clone());

        Self {
            settings: config.engine.clone(),
            indicators: config.indicators.clone(),
            signals: config.signal.clone(),
            broker,
            strategy: Arc::new(strategy),
            ledger: RiskLedger::new(state, challenge.clone()),
            compliance: ComplianceMonitor::new(challenge.clone()),
            sizer: PositionSizer::new(challenge, config.sizing.clone()),
            book: TradeBook::new(Duration::hours(config.engine.max_hold_hours))
                .with_profit_lock(config.engine.profit_lock_pct),
            store,
            reports,
            consecutive_failures: 0,
            degraded: false,
            last_tick: None,
        }
    }

    /// Swap the signal generator, e.g. for a scripted one in tests
    pub fn with_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn ledger(&self) -> &RiskLedger {
        &self.ledger
    }

    pub fn open_trades(&self) -> &[Trade] {
        self.book.open_trades()
    }

    pub fn book(&self) -> &TradeBook {
        &self.book
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        self.last_tick
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn snapshot(&self, at: DateTime<Utc>) -> EngineSnapshot {
        EngineSnapshot {
            risk: self.ledger.snapshot(),
            open_trades: self.book.open_trades().to_vec(),
            last_tick: self.last_tick,
            saved_at: at,
        }
    }

    /// Resume from the state store. Returns whether a snapshot was found.
    ///
    /// Open trades come back as OPEN and the ledger's open counters are
    /// rebuilt from them, so nothing is re-entered or double-counted.
    pub async fn restore(&mut self) -> Result<bool, EngineError> {
        let snapshot = self
            .store
            .load()
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        let Some(snapshot) = snapshot else {
            tracing::info!("No saved state, starting fresh");
            return Ok(false);
        };

        self.ledger.restore(snapshot.risk);
        self.book = TradeBook::with_open_trades(
            Duration::hours(self.settings.max_hold_hours),
            snapshot.open_trades,
        )
        .with_profit_lock(self.settings.profit_lock_pct);
        self.ledger
            .reconcile_open(self.book.open_trades(), snapshot.saved_at);
        self.last_tick = snapshot.last_tick;

        let state = self.ledger.snapshot();
        tracing::info!(
            "♻️  Resumed: equity {:.2}, peak {:.2}, {} open trades{}",
            state.equity,
            state.peak_equity,
            state.open_trade_count,
            if state.is_halted() { ", HALTED" } else { "" }
        );
        Ok(true)
    }

    /// Run one evaluation tick
    ///
    /// Only persistent loss of broker connectivity comes back as `Err`;
    /// everything else is logged and reflected in the report.
    pub async fn on_tick(&mut self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let mut report = TickReport::new(now);

        let vanished = self.reconcile_positions(now, &mut report).await;
        let account = self.poll_account(&mut report).await;
        let state = self.ledger.settle(&vanished, account.as_ref(), now);
        if account.is_some() {
            tracing::debug!(
                "Balance {:.2}, equity {:.2}, drawdown {:.2}%",
                state.account_balance,
                state.equity,
                state.total_drawdown_pct() * 100.0
            );
        }
        for outcome in &vanished {
            self.report_closed(outcome.trade_id).await;
        }

        if let Some(summary) = self.ledger.roll_day(now.date_naive(), now) {
            if let Err(e) = self.reports.daily_summary(&summary).await {
                tracing::warn!("Failed to report daily summary: {}", e);
            }
            report.daily_summary = Some(summary);
        }

        let quotes = self.mark_open_trades(now, &mut report).await;
        self.manage_exits(now, &quotes, &mut report).await;

        if self.ledger.is_halted() {
            report.halted = true;
            tracing::warn!("🛑 Trading halted, managing open trades only");
        } else if self.degraded {
            tracing::warn!(
                "⚠️  Degraded mode ({} failed ticks), managing open trades only",
                self.consecutive_failures
            );
        } else if account.is_none() {
            tracing::warn!("Skipping entries: account state is stale");
        } else {
            self.evaluate_entries(now, &mut report).await;
        }

        self.last_tick = Some(now);
        self.persist(now).await;

        self.track_connectivity(&mut report)?;
        report.halted = self.ledger.is_halted();
        Ok(report)
    }

    /// Close, in the book, open trades whose broker position is gone
    ///
    /// Stops and targets travel with every order, so the broker may fill them
    /// between ticks. The outcomes are booked by the caller together with the
    /// balance poll that already contains their P&L.
    async fn reconcile_positions(
        &mut self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Vec<TradeOutcome> {
        if self.book.open_trades().is_empty() {
            return Vec::new();
        }

        let positions = match self.broker.open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                report.broker_failures += 1;
                tracing::warn!("Position query failed: {}", e);
                return Vec::new();
            }
        };

        let vanished: Vec<Trade> = self
            .book
            .open_trades()
            .iter()
            .filter(|trade| !positions.iter().any(|p| p.belongs_to(trade)))
            .cloned()
            .collect();

        let mut outcomes = Vec::new();
        for trade in vanished {
            let request = match self.book.close_request(trade.id) {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!("Cannot reconcile {}: {}", trade.id, e);
                    continue;
                }
            };

            let (price, closed_at) = match self.broker.closed_fill(&request).await {
                Ok(Some(fill)) => (fill.price, fill.timestamp),
                Ok(None) => match self.broker.quote(trade.symbol).await {
                    Ok(quote) => {
                        tracing::warn!(
                            trade_id = %trade.id,
                            "Broker reports no exit fill, booking at the current quote"
                        );
                        (quote.exit_price(trade.direction), now)
                    }
                    Err(e) => {
                        report.broker_failures += 1;
                        tracing::warn!(trade_id = %trade.id, "Quote for reconciliation failed: {}", e);
                        continue;
                    }
                },
                Err(e) => {
                    report.broker_failures += 1;
                    tracing::warn!(trade_id = %trade.id, "Exit fill query failed: {}", e);
                    continue;
                }
            };

            let reason = self.book.broker_close_reason(&trade, price);
            match self.book.close(trade.id, price, reason, closed_at) {
                Ok(outcome) => {
                    tracing::info!(
                        trade_id = %trade.id,
                        "🔁 {} {} closed at broker ({})",
                        trade.direction,
                        trade.symbol,
                        reason
                    );
                    report.closed.push((trade.id, reason));
                    outcomes.push(outcome);
                }
                Err(e) => tracing::error!("Cannot reconcile {}: {}", trade.id, e),
            }
        }
        outcomes
    }

    async fn poll_account(&mut self, report: &mut TickReport) -> Option<AccountInfo> {
        match self.broker.account().await {
            Ok(info) => Some(info),
            Err(e) => {
                report.broker_failures += 1;
                tracing::warn!("Balance poll failed: {}", e);
                None
            }
        }
    }

    /// Quote every symbol with an open trade and record unrealized P&L
    async fn mark_open_trades(
        &mut self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> HashMap<Symbol, Quote> {
        let mut quotes = HashMap::new();
        let mut symbols: Vec<Symbol> = self.book.open_trades().iter().map(|t| t.symbol).collect();
        symbols.sort();
        symbols.dedup();

        for symbol in symbols {
            match self.broker.quote(symbol).await {
                Ok(quote) => {
                    quotes.insert(symbol, quote);
                }
                Err(e) => {
                    report.broker_failures += 1;
                    tracing::warn!(%symbol, "Quote failed: {}", e);
                }
            }
        }

        for trade in self.book.open_trades() {
            if let Some(quote) = quotes.get(&trade.symbol) {
                let mark = trade.pnl_at(quote.exit_price(trade.direction));
                self.ledger.mark_open(trade.id, mark, now);
            }
        }
        quotes
    }

    /// Close trades that hit SL/TP/max hold, and everything once the Friday close is due
    async fn manage_exits(
        &mut self,
        now: DateTime<Utc>,
        quotes: &HashMap<Symbol, Quote>,
        report: &mut TickReport,
    ) {
        let forced: HashMap<Uuid, CloseReason> = self
            .compliance
            .forced_closures(self.book.open_trades(), now)
            .into_iter()
            .map(|f| (f.trade_id, f.reason))
            .collect();
        if !forced.is_empty() {
            tracing::warn!("📆 Friday close: force-closing {} trades", forced.len());
        }

        let equity = self.ledger.snapshot().equity;
        let exits: Vec<(Uuid, CloseReason)> = self
            .book
            .open_trades()
            .iter()
            .filter_map(|trade| {
                let reason = forced.get(&trade.id).copied().or_else(|| {
                    quotes
                        .get(&trade.symbol)
                        .and_then(|q| self.book.exit_reason(trade, q, equity, now))
                })?;
                Some((trade.id, reason))
            })
            .collect();

        for (id, reason) in exits {
            if self.close_trade(id, reason, now, report).await {
                report.closed.push((id, reason));
            }
        }
    }

    async fn close_trade(
        &mut self,
        id: Uuid,
        reason: CloseReason,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> bool {
        let request = match self.book.close_request(id) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("Cannot close {}: {}", id, e);
                return false;
            }
        };

        let fill = match self.broker.close_trade(&request).await {
            Ok(fill) => fill,
            Err(e) => {
                // Stays OPEN either way; the next tick closes it or reconciles it
                if let Ok(Some(_)) = self.broker.closed_fill(&request).await {
                    tracing::info!(trade_id = %id, "Already closed at broker, settling next tick");
                } else {
                    report.broker_failures += 1;
                    tracing::error!(trade_id = %id, "Close ({}) failed: {}", reason, e);
                }
                return false;
            }
        };

        let outcome = match self.book.close(id, fill.price, reason, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Closed at broker but not in book: {}", e);
                return false;
            }
        };
        self.ledger.record_close(&outcome);
        self.report_closed(id).await;
        true
    }

    async fn report_closed(&self, id: Uuid) {
        if let Some(trade) = self.book.closed_trade(id) {
            if let Err(e) = self.reports.trade_closed(trade).await {
                tracing::warn!("Failed to report closed trade {}: {}", id, e);
            }
        }
    }

    async fn evaluate_entries(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        if let ComplianceVerdict::Reject(reason) = self.compliance.check(&self.ledger.snapshot(), now) {
            tracing::debug!("Entries blocked: {}", reason);
            for symbol in self.settings.symbols.clone() {
                report.skip(symbol, EngineError::ComplianceRejected(reason));
            }
            return;
        }

        for symbol in self.settings.symbols.clone() {
            if let Err(e) = self.try_enter(symbol, now, report).await {
                tracing::info!(%symbol, "No entry: {}", e);
                report.skip(symbol, e);
            }
        }
    }

    /// Gate, signal, size, propose, place, confirm for one symbol
    async fn try_enter(
        &mut self,
        symbol: Symbol,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), EngineError> {
        if let ComplianceVerdict::Reject(reason) =
            self.compliance.check_symbol(&self.ledger.snapshot(), symbol, now)
        {
            return Err(EngineError::ComplianceRejected(reason));
        }

        let count = self
            .settings
            .bars_per_timeframe
            .max(self.strategy.min_bars_required());
        let mut snapshots = TimeframeSnapshots::default();
        for timeframe in Timeframe::ALL {
            let bars = counted(report, self.broker.fetch_bars(symbol, timeframe, count).await)?;
            match build_snapshot(symbol, timeframe, &bars, &self.indicators, &self.signals, now) {
                Ok(snapshot) => snapshots.set(timeframe, Some(snapshot)),
                Err(e) => tracing::debug!("{}", e),
            }
        }

        let signal = self.strategy.generate_signal(symbol, &snapshots, now);
        if !signal.is_actionable() {
            return Err(EngineError::AmbiguousSignal {
                symbol,
                reason: signal.rationale,
            });
        }

        let quote = counted(report, self.broker.quote(symbol).await)?;
        let spec = SymbolSpec::standard(symbol);
        let order = self
            .sizer
            .size(
                &signal,
                quote.entry_price(signal.direction),
                &self.ledger.snapshot(),
                &spec,
            )
            .map_err(EngineError::SizingRejected)?;

        let proposed = self.book.propose(&order, spec.value_per_point, now);
        tracing::info!(
            %symbol,
            "📝 Proposed {} x{} (risk {:.2}%, {:.2})",
            order.direction,
            order.size,
            order.risk_pct * 100.0,
            order.risk_amount
        );

        let request = proposed.order_request();
        let result = counted(report, self.broker.place_order(&request).await)?;
        self.confirm(proposed, &result, now, report).await
    }

    /// PROPOSED -> OPEN, reading the halt flag only now that the broker answered
    async fn confirm(
        &mut self,
        proposed: ProposedTrade,
        result: &OrderResult,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), EngineError> {
        let symbol = proposed.trade().symbol;
        let flatten = CloseRequest {
            trade_id: proposed.trade().id,
            ticket: result.ticket.clone(),
            symbol,
            direction: proposed.trade().direction,
            size: result.filled_size,
        };

        let halted = self.ledger.is_halted();
        match self.book.confirm(proposed, result, halted, now) {
            Ok(trade) => {
                self.ledger.record_open(&trade);
                report.opened.push(trade);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%symbol, "Trade not opened: {}", e);
                if result.accepted && result.filled_size > 0.0 {
                    // Whatever the broker filled must not outlive the rejected proposal
                    if let Err(close_err) = self.broker.close_trade(&flatten).await {
                        tracing::error!(
                            %symbol,
                            "🚨 Could not flatten unconfirmed fill {:?}: {}",
                            flatten.ticket,
                            close_err
                        );
                        report.broker_failures += 1;
                    }
                }
                if halted {
                    let state = self.ledger.snapshot();
                    return Err(EngineError::DrawdownHalt {
                        drawdown_pct: state.total_drawdown_pct() * 100.0,
                        limit_pct: self.ledger.config().max_total_drawdown_pct * 100.0,
                    });
                }
                Err(EngineError::ExecutionFailure {
                    operation: "confirm".to_string(),
                    attempts: 1,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn persist(&self, now: DateTime<Utc>) {
        if let Err(e) = self.store.save(&self.snapshot(now)).await {
            tracing::error!("Failed to save state: {}", e);
        }
    }

    /// Degraded mode after repeated failed ticks; operational error past the fatal limit
    fn track_connectivity(&mut self, report: &mut TickReport) -> Result<(), EngineError> {
        if report.broker_failures == 0 {
            if self.degraded {
                tracing::info!("✅ Broker reachable again, leaving degraded mode");
            }
            self.consecutive_failures = 0;
            self.degraded = false;
            return Ok(());
        }

        self.consecutive_failures += 1;
        if !self.degraded && self.consecutive_failures >= self.settings.degrade_after_failures {
            tracing::warn!(
                "⚠️  {} consecutive failed ticks, suspending new entries",
                self.consecutive_failures
            );
            self.degraded = true;
        }
        report.degraded = self.degraded;

        if self.consecutive_failures >= self.settings.fatal_after_failures {
            return Err(EngineError::ConnectivityLost {
                consecutive_failures: self.consecutive_failures,
            });
        }
        Ok(())
    }
}

/// Count a failed broker call against the tick
fn counted<T>(report: &mut TickReport, result: Result<T, EngineError>) -> Result<T, EngineError> {
    if result.is_err() {
        report.broker_failures += 1;
    }
    result
}

/// Clear a persisted drawdown halt. Returns whether one was set.
pub async fn reset_halt(
    store: &dyn StateStore,
    challenge: Arc<ChallengeConfig>,
    at: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let mut snapshot = store
        .load()
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?
        .ok_or_else(|| EngineError::Store("no saved state".to_string()))?;

    let ledger = RiskLedger::new(snapshot.risk, challenge);
    let cleared = ledger.clear_halt();
    snapshot.risk = ledger.snapshot();
    snapshot.saved_at = at;

    store
        .save(&snapshot)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?;
    Ok(cleared)
}
