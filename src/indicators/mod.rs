// Technical indicators module
// Implements RSI, EMA, MACD, Bollinger Bands, ATR and support/resistance levels

pub mod atr;
pub mod bollinger;
pub mod levels;
pub mod macd;
pub mod moving_average;
pub mod rsi;
pub mod snapshot;

pub use bollinger::BollingerBands;
pub use levels::{detect_levels, PriceLevel, SupportResistance};
pub use macd::Macd;
pub use snapshot::{compute_snapshots, latest_snapshot, EmaSet, IndicatorConfig, IndicatorSnapshot};

/// Hourly bars from (open, high, low, close) tuples, oldest first
#[cfg(test)]
pub(crate) fn test_bars(prices: &[(f64, f64, f64, f64)]) -> Vec<crate::models::Bar> {
    use crate::models::{Bar, Symbol, Timeframe};
    use chrono::{TimeZone, Utc};

    let start = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
    prices
        .iter()
        .enumerate()
        .map(|(i, &(open, high, low, close))| Bar {
            symbol: Symbol::XauUsd,
            timeframe: Timeframe::H1,
            timestamp: start + chrono::Duration::hours(i as i64),
            open,
            high,
            low,
            close,
            volume: 1000.0,
        })
        .collect()
}
