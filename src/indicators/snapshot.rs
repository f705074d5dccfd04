use super::{
    atr::calculate_atr_series,
    bollinger::{bollinger_series, BollingerBands},
    levels::{detect_levels, SupportResistance},
    macd::{macd_lookback, macd_series, Macd},
    moving_average::ema_series,
    rsi::rsi_series,
};
use crate::models::{Bar, Symbol, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Indicator periods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub ema_trend: usize,
    pub atr_period: usize,
    pub levels_lookback: usize,
    pub swing_strength: usize,
    pub level_tolerance_pct: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_std_dev: 2.0,
            ema_fast: 20,
            ema_slow: 50,
            ema_trend: 200,
            atr_period: 14,
            levels_lookback: 60,
            swing_strength: 2,
            level_tolerance_pct: 0.002,
        }
    }
}

impl IndicatorConfig {
    /// Bars needed before every indicator in a snapshot has a value
    pub fn min_bars(&self) -> usize {
        [
            self.rsi_period + 1,
            macd_lookback(self.macd_slow, self.macd_signal),
            self.bollinger_period,
            self.ema_fast,
            self.ema_slow,
            self.ema_trend,
            self.atr_period + 1,
            self.levels_lookback,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaSet {
    pub fast: f64,
    pub slow: f64,
    pub trend: f64,
}

/// Indicator values at the close of one bar
///
/// Only ever built once every component is available, so a snapshot never
/// carries a placeholder value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub bar_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub rsi: f64,
    pub macd: Macd,
    pub bollinger: BollingerBands,
    pub ema: EmaSet,
    pub atr: f64,
    pub levels: SupportResistance,
    /// Values at the previous bar, when that bar also had a full snapshot
    pub prev_rsi: Option<f64>,
    pub prev_macd: Option<Macd>,
}

/// One entry per bar; `None` means "not yet available"
pub fn compute_snapshots(bars: &[Bar], config: &IndicatorConfig) -> Vec<Option<IndicatorSnapshot>> {
    let mut snapshots = vec![None; bars.len()];
    let min_bars = config.min_bars();
    if bars.is_empty() || bars.len() < min_bars {
        return snapshots;
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let rsi = rsi_series(&closes, config.rsi_period);
    let macd = macd_series(&closes, config.macd_fast, config.macd_slow, config.macd_signal);
    let bollinger = bollinger_series(&closes, config.bollinger_period, config.bollinger_std_dev);
    let ema_fast = ema_series(&closes, config.ema_fast);
    let ema_slow = ema_series(&closes, config.ema_slow);
    let ema_trend = ema_series(&closes, config.ema_trend);
    let atr = calculate_atr_series(bars, config.atr_period);

    for i in min_bars.saturating_sub(1)..bars.len() {
        let bar = &bars[i];
        let assembled = (|| {
            Some(IndicatorSnapshot {
                symbol: bar.symbol,
                timeframe: bar.timeframe,
                bar_time: bar.timestamp,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                rsi: rsi[i]?,
                macd: macd[i]?,
                bollinger: bollinger[i]?,
                ema: EmaSet {
                    fast: ema_fast[i]?,
                    slow: ema_slow[i]?,
                    trend: ema_trend[i]?,
                },
                atr: atr[i]?,
                levels: detect_levels(
                    &bars[..=i],
                    config.levels_lookback,
                    config.swing_strength,
                    config.level_tolerance_pct,
                )?,
                prev_rsi: None,
                prev_macd: None,
            })
        })();

        if let Some(mut snapshot) = assembled {
            if let Some(prev) = i.checked_sub(1).and_then(|p| snapshots[p].as_ref()) {
                snapshot.prev_rsi = Some(prev.rsi);
                snapshot.prev_macd = Some(prev.macd);
            }
            snapshots[i] = Some(snapshot);
        }
    }

    snapshots
}

/// Snapshot at the last bar, or None when history is insufficient
pub fn latest_snapshot(bars: &[Bar], config: &IndicatorConfig) -> Option<IndicatorSnapshot> {
    if bars.len() < config.min_bars() {
        return None;
    }
    compute_snapshots(bars, config).pop().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_bars;

    fn wave(n: usize) -> Vec<Bar> {
        let ohlc: Vec<(f64, f64, f64, f64)> = (0..n)
            .map(|i| {
                let c = 2000.0 + (i as f64 * 0.3).sin() * 15.0 + i as f64 * 0.2;
                (c - 0.5, c + 2.0, c - 2.0, c)
            })
            .collect();
        test_bars(&ohlc)
    }

    #[test]
    fn test_min_bars_is_longest_lookback() {
        let config = IndicatorConfig::default();
        assert_eq!(config.min_bars(), 200);
    }

    #[test]
    fn test_short_history_is_unavailable_everywhere() {
        let config = IndicatorConfig::default();
        for n in [0, 1, 50, 199] {
            let bars = wave(n);
            let snapshots = compute_snapshots(&bars, &config);
            assert_eq!(snapshots.len(), n);
            assert!(snapshots.iter().all(Option::is_none), "n = {}", n);
            assert!(latest_snapshot(&bars, &config).is_none());
        }
    }

    #[test]
    fn test_snapshot_available_at_min_bars() {
        let config = IndicatorConfig::default();
        let bars = wave(200);
        let snapshot = latest_snapshot(&bars, &config).unwrap();
        assert_eq!(snapshot.bar_time, bars[199].timestamp);
        assert_eq!(snapshot.close, bars[199].close);
        assert!(snapshot.atr > 0.0);
        assert!(snapshot.rsi > 0.0 && snapshot.rsi < 100.0);
        // First snapshot has no predecessor
        assert!(snapshot.prev_rsi.is_none());
    }

    #[test]
    fn test_previous_values_carried() {
        let config = IndicatorConfig::default();
        let bars = wave(230);
        let all = compute_snapshots(&bars, &config);
        let last = all[229].as_ref().unwrap();
        let prev = all[228].as_ref().unwrap();
        assert_eq!(last.prev_rsi, Some(prev.rsi));
        assert_eq!(last.prev_macd, Some(prev.macd));

        let latest = latest_snapshot(&bars, &config).unwrap();
        assert_eq!(latest, *last);
    }
}
