/// Exponential Moving Average for every input position, `None` until `period` values exist
///
/// Seeded with the SMA of the first `period` values.
pub fn ema_series(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut series = vec![None; prices.len()];
    if period == 0 || prices.len() < period {
        return series;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);

    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    series[period - 1] = Some(ema);

    for (i, price) in prices.iter().enumerate().skip(period) {
        ema = (price - ema) * multiplier + ema;
        series[i] = Some(ema);
    }

    series
}

/// EMA over a partially available input (e.g. the MACD line)
///
/// Leading `None`s are skipped; the EMA is seeded once `period` values are seen.
pub fn ema_series_sparse(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut series = vec![None; values.len()];
    let Some(start) = values.iter().position(Option::is_some) else {
        return series;
    };

    let dense: Vec<f64> = values[start..].iter().map_while(|v| *v).collect();
    for (offset, value) in ema_series(&dense, period).into_iter().enumerate() {
        series[start + offset] = value;
    }

    series
}
