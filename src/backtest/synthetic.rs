use crate::models::{Bar, Symbol, Timeframe};
use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Random walk with drift regimes that flip every few days
    Trending,
    /// Mean-reverting chop around the start price
    Sideways,
}

/// Generates seeded M15 bars for metals, following the FX/CFD weekly session
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_volume: f64,
}

/// Spot metals trade Sunday 23:00 to Friday 22:00 UTC
pub fn is_market_open(time: DateTime<Utc>) -> bool {
    match time.weekday() {
        Weekday::Sat => false,
        Weekday::Fri => time.hour() < 22,
        Weekday::Sun => time.hour() >= 23,
        _ => true,
    }
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_volume: 1_000.0,
        }
    }

    /// `count` M15 bars starting at the first open slot at or after `start`
    ///
    /// `volatility` is the standard deviation of per-bar returns.
    pub fn generate(
        &mut self,
        symbol: Symbol,
        scenario: MarketScenario,
        start: DateTime<Utc>,
        count: usize,
        start_price: f64,
        volatility: f64,
    ) -> Vec<Bar> {
        let step = Timeframe::M15.duration();
        let mut timestamp = start.duration_trunc(step).unwrap_or(start);
        let mut bars = Vec::with_capacity(count);
        let mut price = start_price;
        let mut drift = 0.0;

        while bars.len() < count {
            if !is_market_open(timestamp) {
                timestamp += step;
                continue;
            }

            // Roughly every two trading days pick a new drift regime
            if scenario == MarketScenario::Trending && bars.len() % 184 == 0 {
                drift = volatility * self.rng.gen_range(-0.3..0.3);
            }

            let shock = self.normal() * volatility;
            let pull = match scenario {
                MarketScenario::Trending => drift,
                MarketScenario::Sideways => (start_price - price) / start_price * 0.05,
            };

            let open = price;
            let close = (open * (1.0 + pull + shock)).max(start_price * 0.05);
            let wick_up = self.rng.gen_range(0.0..1.0) * volatility * 0.6;
            let wick_down = self.rng.gen_range(0.0..1.0) * volatility * 0.6;

            bars.push(Bar {
                symbol,
                timeframe: Timeframe::M15,
                timestamp,
                open,
                high: open.max(close) * (1.0 + wick_up),
                low: open.min(close) * (1.0 - wick_down),
                close,
                volume: self.base_volume * self.rng.gen_range(0.5..1.5),
            });

            price = close;
            timestamp += step;
        }

        bars
    }

    /// Standard normal sample (Box-Muller)
    fn normal(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

/// Build higher-timeframe bars from M15 bars
///
/// Buckets are aligned to UTC multiples of the timeframe; a bucket with any
/// M15 bar produces one bar. Input must be sorted.
pub fn aggregate_bars(bars: &[Bar], timeframe: Timeframe) -> Vec<Bar> {
    let period = timeframe.duration();
    let mut out: Vec<Bar> = Vec::new();

    for bar in bars {
        let bucket = bar.timestamp.duration_trunc(period).unwrap_or(bar.timestamp);
        match out.last_mut() {
            Some(current) if current.timestamp == bucket && current.symbol == bar.symbol => {
                current.high = current.high.max(bar.high);
                current.low = current.low.min(bar.low);
                current.close = bar.close;
                current.volume += bar.volume;
            }
            _ => out.push(Bar {
                symbol: bar.symbol,
                timeframe,
                timestamp: bucket,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            }),
        }
    }

    out
}

/// M15, H1 and H4 history for one symbol
pub fn multi_timeframe_history(m15: Vec<Bar>) -> Vec<Bar> {
    let h1 = aggregate_bars(&m15, Timeframe::H1);
    let h4 = aggregate_bars(&m15, Timeframe::H4);
    let mut all = m15;
    all.extend(h1);
    all.extend(h4);
    all
}

/// M15 bars to generate so the H4 aggregate holds at least `h4_bars`
pub fn m15_bars_for_h4_history(h4_bars: usize) -> usize {
    // A trading week yields 31 H4 buckets from 476 M15 bars
    let weeks = (h4_bars as f64 / 31.0).ceil() as usize + 1;
    weeks * 476
}

/// Start time such that `m15_count` bars end shortly before `end`
pub fn history_start(end: DateTime<Utc>, m15_count: usize) -> DateTime<Utc> {
    let weeks = (m15_count / 476 + 1) as i64;
    end - Duration::weeks(weeks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::validate_bar_continuity;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_same_seed_same_series() {
        let a = SyntheticDataGenerator::new(7).generate(
            Symbol::XauUsd,
            MarketScenario::Trending,
            start(),
            300,
            2000.0,
            0.0015,
        );
        let b = SyntheticDataGenerator::new(7).generate(
            Symbol::XauUsd,
            MarketScenario::Trending,
            start(),
            300,
            2000.0,
            0.0015,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 300);
    }

    #[test]
    fn test_bars_are_well_formed_and_skip_weekend() {
        let bars = SyntheticDataGenerator::new(1).generate(
            Symbol::XagUsd,
            MarketScenario::Sideways,
            start(),
            1_000,
            25.0,
            0.002,
        );
        for bar in &bars {
            assert!(bar.high >= bar.open.max(bar.close));
            assert!(bar.low <= bar.open.min(bar.close));
            assert!(bar.low > 0.0);
            assert!(is_market_open(bar.timestamp));
        }
        // 1000 M15 bars from Monday run past Friday 22:00
        assert!(bars.iter().any(|b| b.timestamp.weekday() == Weekday::Sun));
        assert!(validate_bar_continuity(&bars, Timeframe::M15).is_ok());
    }

    #[test]
    fn test_aggregate_to_h1() {
        let bars = SyntheticDataGenerator::new(3).generate(
            Symbol::XauUsd,
            MarketScenario::Trending,
            start(),
            8,
            2000.0,
            0.001,
        );
        let h1 = aggregate_bars(&bars, Timeframe::H1);
        assert_eq!(h1.len(), 2);
        assert_eq!(h1[0].timestamp, start());
        assert_eq!(h1[0].open, bars[0].open);
        assert_eq!(h1[0].close, bars[3].close);
        assert_eq!(
            h1[0].high,
            bars[..4].iter().map(|b| b.high).fold(f64::MIN, f64::max)
        );
        assert_eq!(h1[1].timeframe, Timeframe::H1);
        assert!(validate_bar_continuity(&h1, Timeframe::H1).is_ok());
    }

    #[test]
    fn test_history_sizing_covers_h4_lookback() {
        let count = m15_bars_for_h4_history(250);
        let m15 = SyntheticDataGenerator::new(9).generate(
            Symbol::XauUsd,
            MarketScenario::Trending,
            start(),
            count,
            2000.0,
            0.0015,
        );
        let h4 = aggregate_bars(&m15, Timeframe::H4);
        assert!(h4.len() >= 250, "only {} H4 bars", h4.len());
    }
}
