use super::synthetic::{history_start, m15_bars_for_h4_history, multi_timeframe_history, MarketScenario, SyntheticDataGenerator};
use crate::config::AppConfig;
use crate::engine::{TickReport, TradingEngine};
use crate::error::EngineError;
use crate::execution::{BrokerGateway, PaperBroker};
use crate::models::{Symbol, Timeframe};
use crate::persistence::StateStore;
use crate::reporting::ReportSink;
use crate::scheduler::{ClockAlignedTicker, ReplayTicks, TickHandler};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Engine wired to a paper broker over synthetic history
///
/// Each tick first moves the paper clock, so the engine sees exactly the
/// bars that would have closed by then.
pub struct PaperSession {
    engine: TradingEngine,
    broker: PaperBroker,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    offset_secs: u64,
}

impl PaperSession {
    pub async fn new(
        config: &AppConfig,
        start: DateTime<Utc>,
        days: i64,
        store: Arc<dyn StateStore>,
        reports: Arc<dyn ReportSink>,
    ) -> Self {
        let end = start + Duration::days(days.max(1));
        let challenge = config.challenge_config();
        let broker = PaperBroker::new(challenge.initial_balance, config.paper.spread_pct, start);

        let warmup = m15_bars_for_h4_history(config.engine.bars_per_timeframe);
        let history_from = history_start(start, warmup);
        let slots = ((end - history_from).num_minutes() / Timeframe::M15.minutes()).max(0) as usize;

        for (i, symbol) in config.engine.symbols.iter().enumerate() {
            let start_price = match symbol {
                Symbol::XauUsd => config.paper.gold_start_price,
                Symbol::XagUsd => config.paper.silver_start_price,
            };
            let m15 = SyntheticDataGenerator::new(config.paper.seed.wrapping_add(i as u64))
                .generate(
                    *symbol,
                    MarketScenario::Trending,
                    history_from,
                    slots,
                    start_price,
                    config.paper.volatility,
                );
            broker.load_bars(multi_timeframe_history(m15)).await;
        }

        tracing::info!(
            "📄 Paper session {} -> {} with {} M15 slots of history per symbol",
            start,
            end,
            slots
        );

        let gateway = BrokerGateway::new(
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            config.retry.clone(),
        );
        let engine = TradingEngine::new(config, gateway, store, reports, start.date_naive());

        Self {
            engine,
            broker,
            start,
            end,
            offset_secs: config.engine.tick_offset_secs,
        }
    }

    /// Every M15 tick of the session, aligned the way the live ticker aligns them
    pub fn ticks(&self) -> ReplayTicks {
        let first = ClockAlignedTicker::new(Timeframe::M15, self.offset_secs).next_boundary(self.start);
        ReplayTicks::every(first, self.end, Timeframe::M15.duration())
    }

    pub fn engine(&self) -> &TradingEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TradingEngine {
        &mut self.engine
    }

    pub fn broker(&self) -> &PaperBroker {
        &self.broker
    }
}

#[async_trait]
impl TickHandler for PaperSession {
    async fn on_tick(&mut self, at: DateTime<Utc>) -> Result<TickReport, EngineError> {
        self.broker.set_time(at).await;
        // Stops and targets rest at the broker between ticks
        let filled = self.broker.fill_protective_levels().await;
        if filled > 0 {
            tracing::debug!("{} paper positions hit their stop or target", filled);
        }
        self.engine.on_tick(at).await
    }
}
