use serde::{Deserialize, Serialize};

/// Bollinger Bands: SMA ± k sample standard deviations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

pub fn bollinger_series(prices: &[f64], period: usize, std_dev: f64) -> Vec<Option<BollingerBands>> {
    let mut series = vec![None; prices.len()];
    if period < 2 || prices.len() < period {
        return series;
    }

    for end in period..=prices.len() {
        series[end - 1] = Some(bands(&prices[end - period..end], std_dev));
    }

    series
}

fn bands(window: &[f64], std_dev: f64) -> BollingerBands {
    let n = window.len() as f64;
    let middle = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|p| (p - middle).powi(2)).sum::<f64>() / (n - 1.0);
    let width = variance.sqrt() * std_dev;

    BollingerBands {
        upper: middle + width,
        middle,
        lower: middle - width,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_bands(prices: &[f64], period: usize) -> Option<BollingerBands> {
        bollinger_series(prices, period, 2.0).last().copied().flatten()
    }

    #[test]
    fn test_bollinger_flat_prices() {
        let prices = vec![10.0; 20];
        let bb = last_bands(&prices, 20).unwrap();
        assert_eq!(bb.middle, 10.0);
        assert_eq!(bb.upper, 10.0);
        assert_eq!(bb.lower, 10.0);
    }

    #[test]
    fn test_bollinger_known_values() {
        // mean 3, sample variance 2.5
        let prices = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let bb = last_bands(&prices, 5).unwrap();
        assert_eq!(bb.middle, 3.0);
        let expected_width = 2.5_f64.sqrt() * 2.0;
        assert!((bb.upper - (3.0 + expected_width)).abs() < 1e-12);
        assert!((bb.lower - (3.0 - expected_width)).abs() < 1e-12);
    }

    #[test]
    fn test_bollinger_insufficient_data() {
        let prices = vec![1.0, 2.0];
        assert!(last_bands(&prices, 20).is_none());
        assert!(bollinger_series(&prices, 20, 2.0).iter().all(Option::is_none));
    }
}
