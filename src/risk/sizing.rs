use super::challenge::ChallengeConfig;
use super::state::RiskState;
use crate::models::{Direction, Signal, Symbol, SymbolSpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Absorbs float noise before flooring to the size step
const STEP_EPSILON: f64 = 1e-9;

/// Drawdown-to-risk taper
///
/// Below `taper_start` (as a fraction of the drawdown limit) risk is untouched.
/// From there it falls linearly to `floor` x risk at the limit itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskCurve {
    pub taper_start: f64,
    pub floor: f64,
}

impl Default for RiskCurve {
    fn default() -> Self {
        Self {
            taper_start: 0.5,
            floor: 0.25,
        }
    }
}

impl RiskCurve {
    /// Multiplier in [floor, 1.0], non-increasing in `drawdown_pct`
    pub fn multiplier(&self, drawdown_pct: f64, max_drawdown_pct: f64) -> f64 {
        if max_drawdown_pct <= 0.0 {
            return self.floor;
        }
        let used = (drawdown_pct / max_drawdown_pct).clamp(0.0, 1.0);
        if used <= self.taper_start {
            return 1.0;
        }
        let span = (1.0 - self.taper_start).max(f64::EPSILON);
        let progress = (used - self.taper_start) / span;
        1.0 - (1.0 - self.floor) * progress
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Stop distance = ATR x this
    pub stop_atr_multiple: f64,
    pub reward_risk_ratio: f64,
    pub risk_curve: RiskCurve,
    pub loss_streak_threshold: u32,
    pub loss_streak_factor: f64,
    /// Cap on summed XAU + XAG stop exposure, as a fraction of balance.
    /// Unset means a full book at base risk:
    /// `base_risk_pct x max_concurrent_trades`.
    pub max_correlated_risk_pct: Option<f64>,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            stop_atr_multiple: 2.0,
            reward_risk_ratio: 1.5,
            risk_curve: RiskCurve::default(),
            loss_streak_threshold: 3,
            loss_streak_factor: 0.5,
            max_correlated_risk_pct: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingRejection {
    #[error("INSUFFICIENT_RISK_BUDGET: size {size} below broker minimum {min_size}")]
    InsufficientRiskBudget { size: f64, min_size: f64 },

    #[error("correlated exposure {combined:.2} would exceed cap {cap:.2}")]
    CorrelationCap { combined: f64, cap: f64 },

    #[error("invalid stop: {0}")]
    InvalidStop(String),

    #[error("signal is not actionable")]
    NotActionable,
}

/// A sized, stop-protected order ready for the lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizedOrder {
    pub symbol: Symbol,
    pub direction: Direction,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub stop_distance: f64,
    pub risk_pct: f64,
    /// Loss at the stop for the rounded size
    pub risk_amount: f64,
}

pub struct PositionSizer {
    challenge: Arc<ChallengeConfig>,
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(challenge: Arc<ChallengeConfig>, config: SizingConfig) -> Self {
        Self { challenge, config }
    }

    pub fn correlated_cap_pct(&self) -> f64 {
        self.config.max_correlated_risk_pct.unwrap_or_else(|| {
            self.challenge.base_risk_pct * self.challenge.max_concurrent_trades as f64
        })
    }

    /// Risk fraction for a trade of the given signal strength
    ///
    /// Strength places the trade between base and max risk, then the drawdown
    /// taper and loss-streak throttle can only shrink it.
    pub fn risk_pct(&self, state: &RiskState, strength: f64) -> f64 {
        let base = self.challenge.base_risk_pct;
        let max = self.challenge.max_risk_pct;

        let mut risk = base + (max - base) * strength.clamp(0.0, 1.0);
        risk *= self
            .config
            .risk_curve
            .multiplier(state.total_drawdown_pct(), self.challenge.max_total_drawdown_pct);

        if self.config.loss_streak_threshold > 0
            && state.consecutive_losses >= self.config.loss_streak_threshold
        {
            risk *= self.config.loss_streak_factor;
        }

        risk.min(max)
    }

    pub fn size(
        &self,
        signal: &Signal,
        entry_price: f64,
        state: &RiskState,
        spec: &SymbolSpec,
    ) -> Result<SizedOrder, SizingRejection> {
        if !signal.is_actionable() {
            return Err(SizingRejection::NotActionable);
        }
        let atr = signal.atr.unwrap_or(0.0);
        if !(atr > 0.0) || !atr.is_finite() {
            return Err(SizingRejection::InvalidStop(format!("ATR {} unusable", atr)));
        }
        if !(entry_price > 0.0) {
            return Err(SizingRejection::InvalidStop(format!(
                "entry price {} unusable",
                entry_price
            )));
        }

        let stop_distance = atr * self.config.stop_atr_multiple;
        let sign = signal.direction.sign();
        let stop_loss = entry_price - sign * stop_distance;
        let take_profit = entry_price + sign * stop_distance * self.config.reward_risk_ratio;
        if stop_loss <= 0.0 {
            return Err(SizingRejection::InvalidStop(format!(
                "stop {:.4} at or below zero",
                stop_loss
            )));
        }

        let risk_pct = self.risk_pct(state, signal.strength);
        let risk_budget = state.account_balance * risk_pct;
        let raw_size = risk_budget / (stop_distance * spec.value_per_point);
        let size = floor_to_step(raw_size, spec.size_step).min(spec.max_size);

        if size + STEP_EPSILON < spec.min_size {
            return Err(SizingRejection::InsufficientRiskBudget {
                size,
                min_size: spec.min_size,
            });
        }

        let risk_amount = size * stop_distance * spec.value_per_point;
        let combined = state.open_risk_for(&Symbol::ALL) + risk_amount;
        let cap = state.account_balance * self.correlated_cap_pct();
        if combined > cap + STEP_EPSILON {
            return Err(SizingRejection::CorrelationCap { combined, cap });
        }

        Ok(SizedOrder {
            symbol: signal.symbol,
            direction: signal.direction,
            entry_price,
            size,
            stop_loss,
            take_profit,
            stop_distance,
            risk_pct,
            risk_amount,
        })
    }
}

/// Round down to a whole number of `step`s
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = (value / step + STEP_EPSILON).floor();
    // Re-round to drop representation error from the multiplication
    let decimals = (-step.log10()).ceil().max(0.0) as i32 + 2;
    let scale = 10f64.powi(decimals);
    (steps * step * scale).round() / scale
}
