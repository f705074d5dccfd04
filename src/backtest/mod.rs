// Synthetic market replay for the paper mode
pub mod session;
pub mod synthetic;

pub use session::PaperSession;
pub use synthetic::{
    aggregate_bars, history_start, is_market_open, m15_bars_for_h4_history,
    multi_timeframe_history, MarketScenario, SyntheticDataGenerator,
};
