// Trading strategy module
pub mod multi_timeframe;
pub mod signals;

pub use multi_timeframe::MultiTimeframeStrategy;
pub use signals::{build_snapshot, validate_bar_continuity, SignalConfig};

use crate::indicators::IndicatorSnapshot;
use crate::models::{Signal, Symbol, Timeframe};
use chrono::{DateTime, Utc};

/// Latest snapshot per timeframe for one symbol; `None` = not yet available
#[derive(Debug, Clone, Default)]
pub struct TimeframeSnapshots {
    pub h4: Option<IndicatorSnapshot>,
    pub h1: Option<IndicatorSnapshot>,
    pub m15: Option<IndicatorSnapshot>,
}

impl TimeframeSnapshots {
    pub fn get(&self, timeframe: Timeframe) -> Option<&IndicatorSnapshot> {
        match timeframe {
            Timeframe::H4 => self.h4.as_ref(),
            Timeframe::H1 => self.h1.as_ref(),
            Timeframe::M15 => self.m15.as_ref(),
        }
    }

    pub fn set(&mut self, timeframe: Timeframe, snapshot: Option<IndicatorSnapshot>) {
        match timeframe {
            Timeframe::H4 => self.h4 = snapshot,
            Timeframe::H1 => self.h1 = snapshot,
            Timeframe::M15 => self.m15 = snapshot,
        }
    }
}

/// Base trait for all trading strategies
///
/// Implementations fail closed: anything they cannot decide comes back as a
/// `NONE` signal with the reason in `rationale`, never as a guessed direction.
pub trait Strategy: Send + Sync {
    /// Generate a trading signal for `symbol` from the latest snapshots
    fn generate_signal(
        &self,
        symbol: Symbol,
        snapshots: &TimeframeSnapshots,
        at: DateTime<Utc>,
    ) -> Signal;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum bars per timeframe before a snapshot can exist
    fn min_bars_required(&self) -> usize;
}
