use crate::config::ConfigError;
use crate::error::EngineError;
use crate::indicators::{latest_snapshot, IndicatorConfig, IndicatorSnapshot};
use crate::models::{Bar, Symbol, Timeframe};
use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Daily maintenance break tolerated between bars, on top of the bar period
const SESSION_BREAK_MINUTES: i64 = 90;
/// Longest weekend closure, Friday close to Sunday reopen
const WEEKEND_GAP_HOURS: i64 = 72;

/// Configuration for signal generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// M15 ATR as a fraction of price below which timing is vetoed
    pub min_volatility_pct: f64,
    /// M15 bar range above this many ATRs is treated as a spread/shock bar
    pub max_range_atr_multiple: f64,
    /// |EMA fast - EMA slow| in H4 ATRs that counts as a full-strength trend
    pub trend_saturation_atr: f64,
    pub trend_weight: f64,
    pub trigger_weight: f64,
    pub timing_weight: f64,
    /// Signals weaker than this come back as NONE
    pub min_strength: f64,
    /// How late the newest closed bar may be before the timeframe is stale
    pub max_bar_delay_secs: i64,
    /// Trailing bars that must be gap-free; older gaps such as exchange
    /// holidays stay in the history as they are
    pub continuity_bars: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            min_volatility_pct: 0.0003,
            max_range_atr_multiple: 3.0,
            trend_saturation_atr: 2.0,
            trend_weight: 0.5,
            trigger_weight: 0.3,
            timing_weight: 0.2,
            min_strength: 0.2,
            max_bar_delay_secs: 300,
            continuity_bars: 4,
        }
    }
}

impl SignalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0 < self.rsi_oversold && self.rsi_oversold < self.rsi_overbought && self.rsi_overbought < 100.0) {
            return Err(ConfigError::invalid(
                "signal.rsi_oversold",
                "need 0 < oversold < overbought < 100",
            ));
        }
        let weights = [self.trend_weight, self.trigger_weight, self.timing_weight];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::invalid(
                "signal.trend_weight",
                "weights must be non-negative with a positive sum",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_strength) {
            return Err(ConfigError::invalid("signal.min_strength", "must be in [0, 1]"));
        }
        if self.trend_saturation_atr <= 0.0 || self.max_range_atr_multiple <= 0.0 {
            return Err(ConfigError::invalid(
                "signal.trend_saturation_atr",
                "ATR multiples must be positive",
            ));
        }
        if self.max_bar_delay_secs < 0 {
            return Err(ConfigError::invalid("signal.max_bar_delay_secs", "must not be negative"));
        }
        if self.continuity_bars == 0 {
            return Err(ConfigError::invalid("signal.continuity_bars", "must be at least 1"));
        }
        Ok(())
    }
}

/// Validate that bars are contiguous for their timeframe
///
/// Bars must be strictly increasing. A gap longer than one period is only
/// accepted for the daily session break or a weekend closure; anything else
/// means missing data, which is never interpolated.
pub fn validate_bar_continuity(bars: &[Bar], timeframe: Timeframe) -> Result<(), String> {
    let period = timeframe.duration();

    for window in bars.windows(2) {
        let gap = window[1].timestamp - window[0].timestamp;

        if gap <= Duration::zero() {
            return Err(format!(
                "bars not strictly ordered at {}",
                window[1].timestamp.format("%Y-%m-%d %H:%M")
            ));
        }
        if gap <= period + Duration::minutes(SESSION_BREAK_MINUTES) {
            continue;
        }
        if spans_weekend(window[0].timestamp, window[1].timestamp)
            && gap <= Duration::hours(WEEKEND_GAP_HOURS)
        {
            continue;
        }

        return Err(format!(
            "data gap of {} minutes between {} and {} (expected {} minutes)",
            gap.num_minutes(),
            window[0].timestamp.format("%Y-%m-%d %H:%M"),
            window[1].timestamp.format("%Y-%m-%d %H:%M"),
            timeframe.minutes()
        ));
    }

    Ok(())
}

fn spans_weekend(from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    let mut day = from.date_naive();
    let last = to.date_naive();
    while day <= last {
        if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            return true;
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    false
}

/// Latest indicator snapshot for one (symbol, timeframe) as of `now`
///
/// Still-forming bars are dropped. Late data, short history and a gap among
/// the last `continuity_bars` bars all come back as `DataUnavailable`.
pub fn build_snapshot(
    symbol: Symbol,
    timeframe: Timeframe,
    bars: &[Bar],
    indicators: &IndicatorConfig,
    signal: &SignalConfig,
    now: DateTime<Utc>,
) -> Result<IndicatorSnapshot, EngineError> {
    let unavailable = |reason: String| EngineError::DataUnavailable {
        symbol,
        timeframe,
        reason,
    };

    let closed: Vec<Bar> = bars
        .iter()
        .filter(|b| b.symbol == symbol && b.timeframe == timeframe && b.is_closed(now))
        .cloned()
        .collect();

    let last = closed
        .last()
        .ok_or_else(|| unavailable("no closed bars".to_string()))?;

    let age = now - last.close_time();
    if age > timeframe.duration() + Duration::seconds(signal.max_bar_delay_secs) {
        return Err(unavailable(format!(
            "latest bar closed {} minutes ago",
            age.num_minutes()
        )));
    }

    let recent = closed.len().saturating_sub(signal.continuity_bars + 1);
    validate_bar_continuity(&closed[recent..], timeframe).map_err(unavailable)?;

    if closed.len() < indicators.min_bars() {
        return Err(unavailable(format!(
            "insufficient history: {} bars, need {}",
            closed.len(),
            indicators.min_bars()
        )));
    }

    latest_snapshot(&closed, indicators)
        .ok_or_else(|| unavailable("indicators not yet available".to_string()))
}
