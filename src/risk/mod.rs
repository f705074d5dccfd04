// Risk management module
pub mod challenge;
pub mod compliance;
pub mod sizing;
pub mod state;

pub use challenge::{ChallengeConfig, ChallengeRules, ChallengeType, TradingHours};
pub use compliance::{ComplianceMonitor, ComplianceVerdict, ForcedClose, RejectReason};
pub use sizing::{floor_to_step, PositionSizer, RiskCurve, SizedOrder, SizingConfig, SizingRejection};
pub use state::{HaltRecord, RiskLedger, RiskState};
