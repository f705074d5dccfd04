use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use metalsbot::backtest::{multi_timeframe_history, MarketScenario, PaperSession, SyntheticDataGenerator};
use metalsbot::config::AppConfig;
use metalsbot::engine::{self, TradingEngine};
use metalsbot::error::EngineError;
use metalsbot::execution::{
    AccountInfo, BrokerGateway, BrokerPosition, CloseRequest, Fill, OrderExecutor, OrderRequest,
    OrderResult, PaperBroker, RetryPolicy,
};
use metalsbot::models::{CloseReason, Direction, Signal, Symbol, TimeframeAlignment};
use metalsbot::persistence::{FileStateStore, MemoryStateStore, StateStore};
use metalsbot::reporting::LogReportSink;
use metalsbot::risk::{RejectReason, RiskLedger};
use metalsbot::scheduler;
use metalsbot::strategy::{Strategy, TimeframeSnapshots};
use std::sync::{Arc, Mutex};

/// Emits the same direction for every symbol until told otherwise
struct ScriptedStrategy {
    direction: Arc<Mutex<Direction>>,
}

impl Strategy for ScriptedStrategy {
    fn generate_signal(
        &self,
        symbol: Symbol,
        _snapshots: &TimeframeSnapshots,
        at: DateTime<Utc>,
    ) -> Signal {
        let direction = *self.direction.lock().unwrap();
        if direction.is_flat() {
            return Signal::none(symbol, at, TimeframeAlignment::empty(), "scripted flat");
        }
        let atr = match symbol {
            Symbol::XauUsd => 5.0,
            Symbol::XagUsd => 0.1,
        };
        Signal {
            symbol,
            direction,
            strength: 0.0,
            alignment: TimeframeAlignment {
                h4_bias: direction,
                h1_trigger: direction,
                m15_confirmed: true,
            },
            timestamp: at,
            atr: Some(atr),
            reference_price: None,
            rationale: "scripted".to_string(),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn min_bars_required(&self) -> usize {
        1
    }
}

/// Tuesday, 30s after an M15 close, inside trading hours
fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 30).unwrap()
}

fn tick(n: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(15 * n)
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        call_timeout_ms: 1_000,
    };
    config
}

async fn paper_broker() -> PaperBroker {
    let broker = PaperBroker::new(10_000.0, 0.0, t0());
    for (i, symbol) in [Symbol::XauUsd, Symbol::XagUsd].into_iter().enumerate() {
        let price = if symbol == Symbol::XauUsd { 2000.0 } else { 25.0 };
        let m15 = SyntheticDataGenerator::new(i as u64).generate(
            symbol,
            MarketScenario::Sideways,
            t0() - Duration::days(3),
            1_000,
            price,
            0.001,
        );
        broker.load_bars(multi_timeframe_history(m15)).await;
    }
    broker.set_price(Symbol::XauUsd, 2000.0).await;
    broker.set_price(Symbol::XagUsd, 25.0).await;
    broker
}

struct Harness {
    engine: TradingEngine,
    broker: PaperBroker,
    direction: Arc<Mutex<Direction>>,
}

async fn harness_with(
    config: &AppConfig,
    store: Arc<dyn StateStore>,
    broker: PaperBroker,
    executor: Option<Arc<dyn OrderExecutor>>,
) -> Harness {
    let direction = Arc::new(Mutex::new(Direction::Long));
    let executor = executor.unwrap_or_else(|| Arc::new(broker.clone()));
    let gateway = BrokerGateway::new(Arc::new(broker.clone()), executor, config.retry.clone());
    let engine = TradingEngine::new(
        config,
        gateway,
        store,
        Arc::new(LogReportSink),
        t0().date_naive(),
    )
    .with_strategy(Arc::new(ScriptedStrategy {
        direction: direction.clone(),
    }));
    Harness {
        engine,
        broker,
        direction,
    }
}

async fn harness() -> Harness {
    let broker = paper_broker().await;
    harness_with(&test_config(), Arc::new(MemoryStateStore::new()), broker, None).await
}

async fn run_tick(h: &mut Harness, at: DateTime<Utc>) -> metalsbot::TickReport {
    h.broker.set_time(at).await;
    h.engine.on_tick(at).await.unwrap()
}

#[tokio::test]
async fn test_opens_trades_up_to_concurrency_limits() {
    let mut h = harness().await;

    let first = run_tick(&mut h, tick(0)).await;
    assert_eq!(first.opened.len(), 2);
    let gold = first.opened.iter().find(|t| t.symbol == Symbol::XauUsd).unwrap();
    assert!((gold.size - 0.12).abs() < 1e-9);
    assert!((gold.stop_loss - 1990.0).abs() < 1e-9);
    assert!((gold.take_profit - 2015.0).abs() < 1e-9);

    let second = run_tick(&mut h, tick(1)).await;
    assert_eq!(second.opened.len(), 2);

    let third = run_tick(&mut h, tick(2)).await;
    assert!(third.opened.is_empty());
    let expected = EngineError::ComplianceRejected(RejectReason::MaxConcurrentTrades).to_string();
    assert!(third.skipped.iter().all(|(_, reason)| *reason == expected));

    let state = h.engine.ledger().snapshot();
    assert_eq!(state.open_trade_count, 4);
    assert_eq!(state.trades_for(Symbol::XauUsd), 2);
    assert_eq!(h.broker.open_position_count().await, 4);
}

#[tokio::test]
async fn test_friday_close_forces_every_trade_out() {
    let mut h = harness().await;
    let friday_morning = Utc.with_ymd_and_hms(2024, 3, 8, 10, 0, 30).unwrap();
    let opened = run_tick(&mut h, friday_morning).await;
    assert_eq!(opened.opened.len(), 2);

    // Inside the pre-close cutoff nothing new opens
    let cutoff = run_tick(&mut h, Utc.with_ymd_and_hms(2024, 3, 8, 20, 15, 30).unwrap()).await;
    assert!(cutoff.opened.is_empty());
    assert!(cutoff.closed.is_empty());

    let close = run_tick(&mut h, Utc.with_ymd_and_hms(2024, 3, 8, 21, 5, 30).unwrap()).await;
    assert_eq!(close.closed.len(), 2);
    assert!(close
        .closed
        .iter()
        .all(|(_, reason)| *reason == CloseReason::FridayClose));
    assert!(close.opened.is_empty());
    assert!(h.engine.open_trades().is_empty());
    assert_eq!(h.engine.ledger().snapshot().open_trade_count, 0);
    assert_eq!(h.broker.open_position_count().await, 0);
}

#[tokio::test]
async fn test_drawdown_breach_halts_new_trades() {
    let store = Arc::new(MemoryStateStore::new());
    let config = test_config();
    let broker = paper_broker().await;
    let mut h = harness_with(&config, store.clone(), broker, None).await;

    assert_eq!(run_tick(&mut h, tick(0)).await.opened.len(), 2);

    // 60 points against 0.12 lots of gold: -720, a 7.2% drawdown
    h.broker.set_price(Symbol::XauUsd, 1940.0).await;
    let crash = run_tick(&mut h, tick(1)).await;
    assert!(crash.halted);
    assert_eq!(crash.closed.len(), 1);
    assert_eq!(crash.closed[0].1, CloseReason::StopLoss);
    assert!(crash.opened.is_empty());

    // Recovery of the price does not lift the halt
    h.broker.set_price(Symbol::XauUsd, 2000.0).await;
    let after = run_tick(&mut h, tick(2)).await;
    assert!(after.halted);
    assert!(after.opened.is_empty());
    assert!(h.engine.ledger().is_halted());

    let saved = store.load().await.unwrap().unwrap();
    assert!(saved.risk.halt.is_some());

    let cleared = engine::reset_halt(store.as_ref(), Arc::new(config.challenge_config()), tick(3))
        .await
        .unwrap();
    assert!(cleared);
    assert!(store.load().await.unwrap().unwrap().risk.halt.is_none());
}

/// Executor that latches a drawdown halt while an order is in flight
struct HaltingExecutor {
    inner: PaperBroker,
    ledger: Arc<Mutex<Option<RiskLedger>>>,
}

#[async_trait]
impl OrderExecutor for HaltingExecutor {
    async fn account(&self) -> metalsbot::Result<AccountInfo> {
        self.inner.account().await
    }

    async fn place_order(&self, order: &OrderRequest) -> metalsbot::Result<OrderResult> {
        let ledger = self.ledger.lock().unwrap().clone();
        if let Some(ledger) = ledger {
            ledger.apply_account(10_000.0, 9_000.0, t0());
        }
        self.inner.place_order(order).await
    }

    async fn close_trade(&self, request: &CloseRequest) -> metalsbot::Result<Fill> {
        self.inner.close_trade(request).await
    }

    async fn open_positions(&self) -> metalsbot::Result<Vec<BrokerPosition>> {
        self.inner.open_positions().await
    }

    async fn closed_fill(&self, request: &CloseRequest) -> metalsbot::Result<Option<Fill>> {
        self.inner.closed_fill(request).await
    }
}

#[tokio::test]
async fn test_halt_during_order_blocks_confirmation() {
    let broker = paper_broker().await;
    let slot = Arc::new(Mutex::new(None));
    let executor = Arc::new(HaltingExecutor {
        inner: broker.clone(),
        ledger: slot.clone(),
    });
    let mut h = harness_with(
        &test_config(),
        Arc::new(MemoryStateStore::new()),
        broker,
        Some(executor),
    )
    .await;
    *slot.lock().unwrap() = Some(h.engine.ledger().clone());

    let report = run_tick(&mut h, tick(0)).await;
    assert!(report.opened.is_empty());
    assert!(report.halted);
    assert!(report
        .skipped
        .iter()
        .any(|(symbol, reason)| *symbol == Symbol::XauUsd && reason.contains("halted")));
    // The fill that arrived after the halt was flattened
    assert_eq!(h.broker.open_position_count().await, 0);
    assert_eq!(h.engine.ledger().snapshot().open_trade_count, 0);
}

#[tokio::test]
async fn test_restart_resumes_open_trades_without_reentry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = test_config();
    let broker = paper_broker().await;

    let mut first = harness_with(
        &config,
        Arc::new(FileStateStore::new(path.clone())),
        broker.clone(),
        None,
    )
    .await;
    assert_eq!(run_tick(&mut first, tick(0)).await.opened.len(), 2);
    drop(first);

    let mut second = harness_with(&config, Arc::new(FileStateStore::new(path)), broker, None).await;
    assert!(second.engine.restore().await.unwrap());
    assert_eq!(second.engine.open_trades().len(), 2);
    assert_eq!(second.engine.last_tick(), Some(tick(0)));
    assert_eq!(second.engine.ledger().snapshot().open_trade_count, 2);

    *second.direction.lock().unwrap() = Direction::Flat;
    second.broker.set_price(Symbol::XauUsd, 2015.0).await;
    let report = run_tick(&mut second, tick(1)).await;

    assert!(report.opened.is_empty());
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].1, CloseReason::TakeProfit);
    assert_eq!(second.broker.open_position_count().await, 1);

    // +15 points on 0.12 lots, counted once
    let state = second.engine.ledger().snapshot();
    assert!((state.account_balance - 10_180.0).abs() < 1e-6);
    assert!((state.equity - 10_180.0).abs() < 1e-6);
    assert_eq!(state.open_trade_count, 1);
}

#[tokio::test]
async fn test_server_side_stop_is_reconciled_not_counted_as_failure() {
    let mut h = harness().await;
    let opened = run_tick(&mut h, tick(0)).await;
    let gold = opened
        .opened
        .iter()
        .find(|t| t.symbol == Symbol::XauUsd)
        .unwrap()
        .clone();
    *h.direction.lock().unwrap() = Direction::Flat;

    // The broker fills the gold stop between ticks
    h.broker.set_price(Symbol::XauUsd, 1985.0).await;
    assert_eq!(h.broker.fill_protective_levels().await, 1);

    let report = run_tick(&mut h, tick(1)).await;
    assert_eq!(report.closed, vec![(gold.id, CloseReason::StopLoss)]);
    assert_eq!(report.broker_failures, 0);
    let closed = h.engine.book().closed_trade(gold.id).unwrap();
    assert_eq!(closed.exit.as_ref().unwrap().exit_price, 1990.0);

    for n in 2..25 {
        let report = run_tick(&mut h, tick(n)).await;
        assert_eq!(report.broker_failures, 0);
        assert!(report.closed.is_empty());
        assert!(!report.degraded);
    }
    assert!(!h.engine.is_degraded());

    // -10 points on 0.12 lots, booked once
    let state = h.engine.ledger().snapshot();
    assert_eq!(h.engine.open_trades().len(), 1);
    assert_eq!(state.open_trade_count, 1);
    assert_eq!(state.trades_for(Symbol::XauUsd), 0);
    assert!((state.account_balance - 9_880.0).abs() < 1e-6);
    assert!((state.equity - 9_880.0).abs() < 1e-6);
    assert!((state.daily_realized_pnl + 120.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_profit_lock_closes_before_target() {
    let mut config = test_config();
    config.engine.profit_lock_pct = 0.01;
    let broker = paper_broker().await;
    let mut h = harness_with(&config, Arc::new(MemoryStateStore::new()), broker, None).await;
    assert_eq!(run_tick(&mut h, tick(0)).await.opened.len(), 2);
    *h.direction.lock().unwrap() = Direction::Flat;

    // +9 points on 0.12 lots is 108, over 1% of equity and short of the 2015 target
    h.broker.set_price(Symbol::XauUsd, 2009.0).await;
    let report = run_tick(&mut h, tick(1)).await;
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].1, CloseReason::ProfitLock);
    assert_eq!(h.broker.open_position_count().await, 1);
}

#[tokio::test]
async fn test_repeated_failures_degrade_then_recover() {
    let mut h = harness().await;
    h.broker.fail_next_calls(10_000).await;

    for n in 0..3 {
        let report = run_tick(&mut h, tick(n)).await;
        assert!(report.opened.is_empty());
        assert_eq!(report.broker_failures, 1);
    }
    assert!(h.engine.is_degraded());
    assert_eq!(h.engine.consecutive_failures(), 3);

    h.broker.fail_next_calls(0).await;
    let recovering = run_tick(&mut h, tick(3)).await;
    assert!(recovering.opened.is_empty());
    assert!(!recovering.degraded);
    assert!(!h.engine.is_degraded());

    let resumed = run_tick(&mut h, tick(4)).await;
    assert_eq!(resumed.opened.len(), 2);
}

#[tokio::test]
async fn test_persistent_failures_surface_connectivity_loss() {
    let mut config = test_config();
    config.engine.fatal_after_failures = 5;
    let broker = paper_broker().await;
    let mut h = harness_with(&config, Arc::new(MemoryStateStore::new()), broker, None).await;
    h.broker.fail_next_calls(10_000).await;

    for n in 0..4 {
        h.broker.set_time(tick(n)).await;
        assert!(h.engine.on_tick(tick(n)).await.is_ok());
    }
    h.broker.set_time(tick(4)).await;
    match h.engine.on_tick(tick(4)).await {
        Err(EngineError::ConnectivityLost {
            consecutive_failures,
        }) => assert_eq!(consecutive_failures, 5),
        other => panic!("expected ConnectivityLost, got {:?}", other),
    }
}

#[tokio::test]
async fn test_new_day_emits_summary() {
    let mut h = harness().await;
    assert_eq!(run_tick(&mut h, tick(0)).await.opened.len(), 2);

    *h.direction.lock().unwrap() = Direction::Flat;
    let wednesday = Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 30).unwrap();
    let report = run_tick(&mut h, wednesday).await;

    let summary = report.daily_summary.expect("summary for Tuesday");
    assert_eq!(summary.date, t0().date_naive());
    assert_eq!(summary.trade_count, 2);
    assert_eq!(summary.trading_days, 1);
    assert_eq!(h.engine.ledger().snapshot().daily_trade_count, 0);
}

#[tokio::test]
async fn test_new_day_starts_from_polled_equity() {
    let mut h = harness().await;
    assert_eq!(run_tick(&mut h, tick(0)).await.opened.len(), 2);
    *h.direction.lock().unwrap() = Direction::Flat;

    // Gold moves +10 points while the process is down overnight
    h.broker.set_price(Symbol::XauUsd, 2010.0).await;
    let wednesday = Utc.with_ymd_and_hms(2024, 3, 6, 9, 0, 30).unwrap();
    let report = run_tick(&mut h, wednesday).await;
    assert!(report.daily_summary.is_some());
    assert!(report.closed.is_empty());

    let state = h.engine.ledger().snapshot();
    assert!((state.equity - 10_120.0).abs() < 1e-6);
    assert!((state.daily_start_equity - 10_120.0).abs() < 1e-6);
    assert!((state.daily_high_equity - 10_120.0).abs() < 1e-6);
    assert_eq!(state.daily_loss(), 0.0);
}

#[tokio::test]
async fn test_paper_session_runs_full_engine() {
    let config = AppConfig::default();
    let start = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
    let mut session = PaperSession::new(
        &config,
        start,
        2,
        Arc::new(MemoryStateStore::new()),
        Arc::new(LogReportSink),
    )
    .await;

    let mut ticks = session.ticks();
    assert_eq!(ticks.remaining(), 192);
    let count = scheduler::run(&mut ticks, &mut session).await.unwrap();
    assert_eq!(count, 192);

    let state = session.engine().ledger().snapshot();
    assert!(state.open_trade_count <= config.challenge.max_concurrent_trades);
    assert_eq!(state.open_trade_count, session.engine().open_trades().len());
    assert_eq!(
        session.broker().open_position_count().await,
        session.engine().open_trades().len()
    );
    assert!(state.peak_equity >= state.initial_balance);
}
