//! Support / resistance detection
//!
//! Finds swing highs and lows (local peaks and troughs) over a rolling window
//! and clusters nearby swings into price levels.

use crate::models::Bar;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    /// Number of swings merged into this level
    pub touches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportResistance {
    /// Clusters of swing lows, ascending by price
    pub supports: Vec<PriceLevel>,
    /// Clusters of swing highs, ascending by price
    pub resistances: Vec<PriceLevel>,
    /// Close of the last bar in the window
    pub reference_price: f64,
}

impl SupportResistance {
    /// Most-touched support cluster; ties go to the level nearest the reference price
    pub fn key_support(&self) -> Option<PriceLevel> {
        strongest(&self.supports, self.reference_price)
    }

    /// Most-touched resistance cluster; ties go to the level nearest the reference price
    pub fn key_resistance(&self) -> Option<PriceLevel> {
        strongest(&self.resistances, self.reference_price)
    }
}

fn strongest(levels: &[PriceLevel], reference: f64) -> Option<PriceLevel> {
    levels.iter().copied().reduce(|best, level| {
        let closer = (level.price - reference).abs() < (best.price - reference).abs();
        if level.touches > best.touches || (level.touches == best.touches && closer) {
            level
        } else {
            best
        }
    })
}

/// Detect levels over the last `lookback` bars
///
/// A swing needs `strength` bars on each side that do not exceed it.
/// Swings within `tolerance_pct` of a cluster's mean join that cluster.
/// Returns None if there are fewer than `lookback` bars.
pub fn detect_levels(
    bars: &[Bar],
    lookback: usize,
    strength: usize,
    tolerance_pct: f64,
) -> Option<SupportResistance> {
    if strength == 0 || lookback < 2 * strength + 1 || bars.len() < lookback {
        return None;
    }

    let window = &bars[bars.len() - lookback..];
    let reference_price = window.last()?.close;

    let mut swing_highs = Vec::new();
    let mut swing_lows = Vec::new();

    for i in strength..window.len() - strength {
        let neighbours = window[i - strength..=i + strength]
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != strength);

        let (mut is_high, mut is_low) = (true, true);
        for (_, other) in neighbours {
            if other.high > window[i].high {
                is_high = false;
            }
            if other.low < window[i].low {
                is_low = false;
            }
        }

        // Plateaus count once, at their first bar
        if is_high && window[i - 1].high < window[i].high {
            swing_highs.push(window[i].high);
        }
        if is_low && window[i - 1].low > window[i].low {
            swing_lows.push(window[i].low);
        }
    }

    Some(SupportResistance {
        supports: cluster(swing_lows, tolerance_pct),
        resistances: cluster(swing_highs, tolerance_pct),
        reference_price,
    })
}

fn cluster(mut prices: Vec<f64>, tolerance_pct: f64) -> Vec<PriceLevel> {
    prices.sort_by(|a, b| a.total_cmp(b));

    let mut levels: Vec<(f64, usize)> = Vec::new();
    for price in prices {
        match levels.last_mut() {
            Some((sum, count)) if (price - *sum / *count as f64).abs() <= price * tolerance_pct => {
                *sum += price;
                *count += 1;
            }
            _ => levels.push((price, 1)),
        }
    }

    levels
        .into_iter()
        .map(|(sum, touches)| PriceLevel {
            price: sum / touches as f64,
            touches,
        })
        .collect()
}
