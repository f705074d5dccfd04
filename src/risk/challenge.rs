use crate::config::ConfigError;
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Prop-firm evaluation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeType {
    OneStep,
    TwoStep,
}

/// Firm-imposed limits for a challenge type (fractions, 0.03 = 3%)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChallengeRules {
    pub profit_target_pct: f64,
    pub max_total_drawdown_pct: f64,
    pub max_daily_loss_pct: f64,
    /// Loss measured from the day's highest equity
    pub max_daily_trailing_drawdown_pct: f64,
    /// Loss measured from the initial balance
    pub max_loss_from_initial_pct: f64,
    pub min_trading_days: u32,
}

impl ChallengeType {
    pub fn rules(&self) -> ChallengeRules {
        match self {
            ChallengeType::OneStep => ChallengeRules {
                profit_target_pct: 0.10,
                max_total_drawdown_pct: 0.06,
                max_daily_loss_pct: 0.03,
                max_daily_trailing_drawdown_pct: 0.04,
                max_loss_from_initial_pct: 0.08,
                min_trading_days: 7,
            },
            ChallengeType::TwoStep => ChallengeRules {
                profit_target_pct: 0.08,
                max_total_drawdown_pct: 0.08,
                max_daily_loss_pct: 0.05,
                max_daily_trailing_drawdown_pct: 0.07,
                max_loss_from_initial_pct: 0.10,
                min_trading_days: 7,
            },
        }
    }
}

/// Daily entry window, in UTC. `start` inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradingHours {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TradingHours {
    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start && time < self.end
    }
}

impl Default for TradingHours {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(1, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default(),
        }
    }
}

/// Challenge parameters, fixed for the lifetime of the process
///
/// All `_pct` fields are fractions of account value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeConfig {
    pub challenge_type: ChallengeType,
    pub initial_balance: f64,
    pub max_daily_loss_pct: f64,
    pub max_total_drawdown_pct: f64,
    pub max_daily_trailing_drawdown_pct: f64,
    pub max_loss_from_initial_pct: f64,
    pub profit_target_pct: f64,
    pub min_trading_days: u32,
    pub trading_hours: TradingHours,
    #[serde(with = "hhmm")]
    pub friday_close: NaiveTime,
    /// No new entries this many minutes before `friday_close` on Friday
    pub friday_entry_cutoff_minutes: i64,
    pub base_risk_pct: f64,
    pub max_risk_pct: f64,
    pub max_concurrent_trades: usize,
    pub max_trades_per_symbol: usize,
}

impl ChallengeConfig {
    pub fn new(challenge_type: ChallengeType, initial_balance: f64) -> Self {
        let rules = challenge_type.rules();
        Self {
            challenge_type,
            initial_balance,
            max_daily_loss_pct: rules.max_daily_loss_pct,
            max_total_drawdown_pct: rules.max_total_drawdown_pct,
            max_daily_trailing_drawdown_pct: rules.max_daily_trailing_drawdown_pct,
            max_loss_from_initial_pct: rules.max_loss_from_initial_pct,
            profit_target_pct: rules.profit_target_pct,
            min_trading_days: rules.min_trading_days,
            trading_hours: TradingHours::default(),
            friday_close: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default(),
            friday_entry_cutoff_minutes: 60,
            base_risk_pct: 0.012,
            max_risk_pct: 0.02,
            max_concurrent_trades: 4,
            max_trades_per_symbol: 2,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = |field: &str, value: f64| {
            if value > 0.0 && value < 1.0 {
                Ok(())
            } else {
                Err(ConfigError::invalid(field, format!("{} must be in (0, 1)", value)))
            }
        };

        if self.initial_balance <= 0.0 {
            return Err(ConfigError::invalid(
                "challenge.initial_balance",
                "must be positive",
            ));
        }
        fraction("challenge.max_daily_loss_pct", self.max_daily_loss_pct)?;
        fraction("challenge.max_total_drawdown_pct", self.max_total_drawdown_pct)?;
        fraction(
            "challenge.max_daily_trailing_drawdown_pct",
            self.max_daily_trailing_drawdown_pct,
        )?;
        fraction(
            "challenge.max_loss_from_initial_pct",
            self.max_loss_from_initial_pct,
        )?;
        fraction("challenge.profit_target_pct", self.profit_target_pct)?;
        fraction("challenge.base_risk_pct", self.base_risk_pct)?;
        fraction("challenge.max_risk_pct", self.max_risk_pct)?;

        if self.base_risk_pct > self.max_risk_pct {
            return Err(ConfigError::invalid(
                "challenge.base_risk_pct",
                format!(
                    "base risk {} exceeds max risk {}",
                    self.base_risk_pct, self.max_risk_pct
                ),
            ));
        }
        if self.trading_hours.start >= self.trading_hours.end {
            return Err(ConfigError::invalid(
                "challenge.trading_hours",
                "start must be before end",
            ));
        }
        if self.friday_entry_cutoff_minutes < 0 {
            return Err(ConfigError::invalid(
                "challenge.friday_entry_cutoff_minutes",
                "must not be negative",
            ));
        }
        // The cutoff is a time of day; it cannot reach back into Thursday
        let close_minutes = i64::from(self.friday_close.num_seconds_from_midnight() / 60);
        if self.friday_entry_cutoff_minutes > close_minutes {
            return Err(ConfigError::invalid(
                "challenge.friday_entry_cutoff_minutes",
                format!(
                    "{} minutes reaches past midnight before friday_close {}",
                    self.friday_entry_cutoff_minutes,
                    self.friday_close.format("%H:%M")
                ),
            ));
        }
        if self.max_concurrent_trades == 0 || self.max_trades_per_symbol == 0 {
            return Err(ConfigError::invalid(
                "challenge.max_concurrent_trades",
                "trade limits must be at least 1",
            ));
        }
        if self.max_trades_per_symbol > self.max_concurrent_trades {
            return Err(ConfigError::invalid(
                "challenge.max_trades_per_symbol",
                "cannot exceed max_concurrent_trades",
            ));
        }

        Ok(())
    }
}

/// "HH:MM" (seconds optional) serde format for `NaiveTime`
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<NaiveTime, String> {
        let raw = raw.trim();
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .map_err(|e| format!("invalid time '{}': {}", raw, e))
    }
}
