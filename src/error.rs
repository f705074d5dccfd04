use crate::config::ConfigError;
use crate::models::{Symbol, Timeframe};
use crate::risk::{RejectReason, SizingRejection};
use thiserror::Error;

/// Failure taxonomy of the decision engine
///
/// Only `ConnectivityLost` is meant to stop the evaluation loop; every other
/// variant ends the current trade attempt and nothing more.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("data unavailable for {symbol} {timeframe}: {reason}")]
    DataUnavailable {
        symbol: Symbol,
        timeframe: Timeframe,
        reason: String,
    },

    #[error("ambiguous signal for {symbol}: {reason}")]
    AmbiguousSignal { symbol: Symbol, reason: String },

    #[error("compliance rejected: {0}")]
    ComplianceRejected(RejectReason),

    #[error("sizing rejected: {0}")]
    SizingRejected(SizingRejection),

    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    ExecutionFailure {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("trading halted: drawdown {drawdown_pct:.2}% reached the {limit_pct:.2}% limit")]
    DrawdownHalt { drawdown_pct: f64, limit_pct: f64 },

    #[error("broker unreachable for {consecutive_failures} consecutive ticks")]
    ConnectivityLost { consecutive_failures: u32 },

    #[error("state store: {0}")]
    Store(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// True for conditions that must stop the process and ask for intervention
    pub fn is_operational(&self) -> bool {
        matches!(self, EngineError::ConnectivityLost { .. } | EngineError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_and_config_are_operational() {
        let lost = EngineError::ConnectivityLost {
            consecutive_failures: 20,
        };
        assert!(lost.is_operational());

        let halt = EngineError::DrawdownHalt {
            drawdown_pct: 6.0,
            limit_pct: 6.0,
        };
        assert!(!halt.is_operational());

        let exec = EngineError::ExecutionFailure {
            operation: "place_order".to_string(),
            attempts: 3,
            message: "timeout".to_string(),
        };
        assert!(!exec.is_operational());
        assert_eq!(
            exec.to_string(),
            "place_order failed after 3 attempt(s): timeout"
        );
    }
}
