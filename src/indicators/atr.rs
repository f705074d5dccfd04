/// Average True Range (ATR) indicator
///
/// Measures market volatility by calculating the average of true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// Uses Wilder's smoothing (same as RSI) for the moving average.

use crate::models::Bar;

/// ATR aligned with `bars`: `None` until `period + 1` bars exist
pub fn calculate_atr_series(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut series = vec![None; bars.len()];
    if period == 0 || bars.len() < period + 1 {
        return series;
    }

    // Calculate true ranges
    let true_ranges: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let (prev_close, high, low) = (w[0].close, w[1].high, w[1].low);
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect();

    // First ATR is simple average of first 'period' true ranges
    let mut atr: f64 = true_ranges.iter().take(period).sum::<f64>() / period as f64;
    series[period] = Some(atr);

    // Apply Wilder's smoothing for subsequent values
    for i in period..true_ranges.len() {
        atr = (atr * (period as f64 - 1.0) + true_ranges[i]) / period as f64;
        series[i + 1] = Some(atr);
    }

    series
}
