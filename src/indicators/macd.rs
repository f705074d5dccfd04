/// Moving Average Convergence Divergence
///
/// Line = EMA(fast) - EMA(slow), signal = EMA(line, signal_period),
/// histogram = line - signal.
use super::moving_average::{ema_series, ema_series_sparse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Minimum number of prices before a MACD value exists
pub fn macd_lookback(slow: usize, signal_period: usize) -> usize {
    slow + signal_period - 1
}

pub fn macd_series(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Vec<Option<Macd>> {
    if fast == 0 || fast >= slow {
        return vec![None; prices.len()];
    }

    let fast_ema = ema_series(prices, fast);
    let slow_ema = ema_series(prices, slow);

    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    let signal = ema_series_sparse(&line, signal_period);

    line.iter()
        .zip(&signal)
        .map(|(l, s)| {
            let (line, signal) = ((*l)?, (*s)?);
            Some(Macd {
                line,
                signal,
                histogram: line - signal,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_macd(prices: &[f64]) -> Option<Macd> {
        macd_series(prices, 12, 26, 9).last().copied().flatten()
    }

    #[test]
    fn test_macd_insufficient_data() {
        let prices: Vec<f64> = (0..30).map(|i| i as f64).collect();
        assert!(last_macd(&prices).is_none());
    }

    #[test]
    fn test_macd_first_value_at_lookback() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let series = macd_series(&prices, 12, 26, 9);
        let lookback = macd_lookback(26, 9);
        assert!(series[lookback - 2].is_none());
        assert!(series[lookback - 1].is_some());
    }

    #[test]
    fn test_macd_uptrend_positive_line() {
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.5).collect();
        let macd = last_macd(&prices).unwrap();
        assert!(macd.line > 0.0);
        assert!((macd.histogram - (macd.line - macd.signal)).abs() < 1e-12);
    }

    #[test]
    fn test_macd_flat_prices_zero() {
        let prices = vec![50.0; 50];
        let macd = last_macd(&prices).unwrap();
        assert!(macd.line.abs() < 1e-9);
        assert!(macd.histogram.abs() < 1e-9);
    }
}
