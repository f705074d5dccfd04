//! Application configuration
//!
//! Built once at startup from three layers, later layers winning:
//! struct defaults, an optional TOML file, then `METALSBOT__SECTION__KEY`
//! environment variables. The flat keys of the legacy `.env` layout
//! (`BASE_RISK_PER_TRADE`, `CHALLENGE_TYPE`, ...) are honoured on top.
//! After `validate` the result is never mutated.

use crate::execution::RetryPolicy;
use crate::indicators::IndicatorConfig;
use crate::models::Symbol;
use crate::risk::challenge::hhmm;
use crate::risk::{ChallengeConfig, ChallengeType, SizingConfig, TradingHours};
use crate::strategy::SignalConfig;
use chrono::NaiveTime;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const ENV_PREFIX: &str = "METALSBOT";

/// Flat environment keys and the setting each one overrides
const LEGACY_KEYS: &[(&str, &str)] = &[
    ("BASE_RISK_PER_TRADE", "challenge.base_risk_pct"),
    ("MAX_RISK_PER_TRADE", "challenge.max_risk_pct"),
    ("MAX_CONCURRENT_TRADES", "challenge.max_concurrent_trades"),
    ("MAX_TRADES_PER_SYMBOL", "challenge.max_trades_per_symbol"),
    ("CHALLENGE_TYPE", "challenge.challenge_type"),
    ("ACCOUNT_BALANCE", "challenge.initial_balance"),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Challenge parameters as configured
///
/// Limits left unset fall back to the rule set of `challenge_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeSettings {
    pub challenge_type: ChallengeType,
    pub initial_balance: f64,
    pub max_daily_loss_pct: Option<f64>,
    pub max_total_drawdown_pct: Option<f64>,
    pub max_daily_trailing_drawdown_pct: Option<f64>,
    pub max_loss_from_initial_pct: Option<f64>,
    pub profit_target_pct: Option<f64>,
    pub min_trading_days: Option<u32>,
    pub trading_hours: TradingHours,
    #[serde(with = "hhmm")]
    pub friday_close: NaiveTime,
    pub friday_entry_cutoff_minutes: i64,
    pub base_risk_pct: f64,
    pub max_risk_pct: f64,
    pub max_concurrent_trades: usize,
    pub max_trades_per_symbol: usize,
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        let base = ChallengeConfig::new(ChallengeType::OneStep, 10_000.0);
        Self {
            challenge_type: base.challenge_type,
            initial_balance: base.initial_balance,
            max_daily_loss_pct: None,
            max_total_drawdown_pct: None,
            max_daily_trailing_drawdown_pct: None,
            max_loss_from_initial_pct: None,
            profit_target_pct: None,
            min_trading_days: None,
            trading_hours: base.trading_hours,
            friday_close: base.friday_close,
            friday_entry_cutoff_minutes: base.friday_entry_cutoff_minutes,
            base_risk_pct: base.base_risk_pct,
            max_risk_pct: base.max_risk_pct,
            max_concurrent_trades: base.max_concurrent_trades,
            max_trades_per_symbol: base.max_trades_per_symbol,
        }
    }
}

impl ChallengeSettings {
    pub fn resolve(&self) -> ChallengeConfig {
        let rules = self.challenge_type.rules();
        ChallengeConfig {
            challenge_type: self.challenge_type,
            initial_balance: self.initial_balance,
            max_daily_loss_pct: self.max_daily_loss_pct.unwrap_or(rules.max_daily_loss_pct),
            max_total_drawdown_pct: self
                .max_total_drawdown_pct
                .unwrap_or(rules.max_total_drawdown_pct),
            max_daily_trailing_drawdown_pct: self
                .max_daily_trailing_drawdown_pct
                .unwrap_or(rules.max_daily_trailing_drawdown_pct),
            max_loss_from_initial_pct: self
                .max_loss_from_initial_pct
                .unwrap_or(rules.max_loss_from_initial_pct),
            profit_target_pct: self.profit_target_pct.unwrap_or(rules.profit_target_pct),
            min_trading_days: self.min_trading_days.unwrap_or(rules.min_trading_days),
            trading_hours: self.trading_hours,
            friday_close: self.friday_close,
            friday_entry_cutoff_minutes: self.friday_entry_cutoff_minutes,
            base_risk_pct: self.base_risk_pct,
            max_risk_pct: self.max_risk_pct,
            max_concurrent_trades: self.max_concurrent_trades,
            max_trades_per_symbol: self.max_trades_per_symbol,
        }
    }
}

/// Evaluation loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbols: Vec<Symbol>,
    /// Bars requested per timeframe each tick
    pub bars_per_timeframe: usize,
    pub max_hold_hours: i64,
    /// Close a trade once its open profit exceeds this share of equity (0 disables)
    pub profit_lock_pct: f64,
    /// Settle delay after each M15 close before evaluating
    pub tick_offset_secs: u64,
    /// Consecutive failed ticks before new entries are suspended
    pub degrade_after_failures: u32,
    /// Consecutive failed ticks before the loop gives up
    pub fatal_after_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: Symbol::ALL.to_vec(),
            bars_per_timeframe: 250,
            max_hold_hours: 24,
            profit_lock_pct: 0.02,
            tick_offset_secs: 30,
            degrade_after_failures: 3,
            fatal_after_failures: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Base URL of the HTTP trading bridge
    pub bridge_url: String,
    pub api_key: Option<String>,
    pub requests_per_minute: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bridge_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            requests_per_minute: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_file: PathBuf,
    /// When set, snapshots go to Redis instead of `state_file`
    pub redis_url: Option<String>,
    /// When set, closed trades and daily summaries are journaled to Postgres
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("metalsbot_state.json"),
            redis_url: None,
            database_url: None,
        }
    }
}

/// Synthetic market used by the `paper` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub seed: u64,
    pub gold_start_price: f64,
    pub silver_start_price: f64,
    /// Per-M15-bar return volatility
    pub volatility: f64,
    pub spread_pct: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            gold_start_price: 2000.0,
            silver_start_price: 25.0,
            volatility: 0.0015,
            spread_pct: 0.0001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "metalsbot=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub challenge: ChallengeSettings,
    pub sizing: SizingConfig,
    pub indicators: IndicatorConfig,
    pub signal: SignalConfig,
    pub engine: EngineConfig,
    pub retry: RetryPolicy,
    pub broker: BrokerConfig,
    pub storage: StorageConfig,
    pub paper: PaperConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load from the process environment and an optional TOML file, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, std::env::vars().collect())
    }

    /// Same as `load`, reading variables from `vars` instead of the process
    pub fn load_from(path: Option<&Path>, vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("engine.symbols")
                .source(Some(vars.clone())),
        );

        for (legacy, key) in LEGACY_KEYS {
            builder = builder.set_override_option(*key, vars.get(*legacy).cloned())?;
        }

        let app: AppConfig = builder.build()?.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    pub fn challenge_config(&self) -> ChallengeConfig {
        self.challenge.resolve()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.challenge.resolve().validate()?;

        let sizing = &self.sizing;
        if sizing.stop_atr_multiple <= 0.0 {
            return Err(ConfigError::invalid("sizing.stop_atr_multiple", "must be positive"));
        }
        if sizing.reward_risk_ratio <= 0.0 {
            return Err(ConfigError::invalid("sizing.reward_risk_ratio", "must be positive"));
        }
        if !(0.0..1.0).contains(&sizing.risk_curve.taper_start) {
            return Err(ConfigError::invalid(
                "sizing.risk_curve.taper_start",
                "must be in [0, 1)",
            ));
        }
        if !(sizing.risk_curve.floor > 0.0 && sizing.risk_curve.floor <= 1.0) {
            return Err(ConfigError::invalid("sizing.risk_curve.floor", "must be in (0, 1]"));
        }
        if !(sizing.loss_streak_factor > 0.0 && sizing.loss_streak_factor <= 1.0) {
            return Err(ConfigError::invalid(
                "sizing.loss_streak_factor",
                "must be in (0, 1]; the throttle never raises risk",
            ));
        }
        if sizing.max_correlated_risk_pct.is_some_and(|cap| cap <= 0.0) {
            return Err(ConfigError::invalid(
                "sizing.max_correlated_risk_pct",
                "must be positive",
            ));
        }

        let ind = &self.indicators;
        let periods = [
            ind.rsi_period,
            ind.macd_fast,
            ind.macd_slow,
            ind.macd_signal,
            ind.bollinger_period,
            ind.ema_fast,
            ind.ema_slow,
            ind.ema_trend,
            ind.atr_period,
            ind.swing_strength,
        ];
        if periods.contains(&0) {
            return Err(ConfigError::invalid("indicators", "periods must be at least 1"));
        }
        if ind.macd_fast >= ind.macd_slow {
            return Err(ConfigError::invalid("indicators.macd_fast", "must be below macd_slow"));
        }
        if ind.ema_fast >= ind.ema_slow {
            return Err(ConfigError::invalid("indicators.ema_fast", "must be below ema_slow"));
        }
        if ind.levels_lookback < 2 * ind.swing_strength + 1 {
            return Err(ConfigError::invalid(
                "indicators.levels_lookback",
                "too short for the swing strength",
            ));
        }

        self.signal.validate()?;

        let engine = &self.engine;
        if engine.symbols.is_empty() {
            return Err(ConfigError::invalid("engine.symbols", "at least one symbol required"));
        }
        if engine.bars_per_timeframe < ind.min_bars() {
            return Err(ConfigError::invalid(
                "engine.bars_per_timeframe",
                format!("must cover the longest lookback ({} bars)", ind.min_bars()),
            ));
        }
        if engine.max_hold_hours <= 0 {
            return Err(ConfigError::invalid("engine.max_hold_hours", "must be positive"));
        }
        if !(0.0..1.0).contains(&engine.profit_lock_pct) {
            return Err(ConfigError::invalid("engine.profit_lock_pct", "must be in [0, 1)"));
        }
        if engine.degrade_after_failures == 0 || engine.degrade_after_failures >= engine.fatal_after_failures {
            return Err(ConfigError::invalid(
                "engine.degrade_after_failures",
                "must be at least 1 and below fatal_after_failures",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.call_timeout_ms == 0 {
            return Err(ConfigError::invalid("retry.call_timeout_ms", "must be positive"));
        }
        if self.broker.requests_per_minute == 0 {
            return Err(ConfigError::invalid("broker.requests_per_minute", "must be positive"));
        }

        Ok(())
    }
}
