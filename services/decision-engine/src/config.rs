//! Engine Configuration
//!
//! Loaded once at startup from an optional config file followed by
//! `ENGINE_*` environment variables (nested keys use `__`, e.g.
//! `ENGINE_RISK_LIMITS__MAX_OPEN_LONG=2`). A load or validation failure is
//! the only fatal error in the engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::exit::ExitParams;
use crate::signal::SignalParams;
use crate::sizing::SizingParams;
use crate::types::RiskLimits;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "ENGINE_CONFIG";

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }
}

/// Full engine configuration for one (account, instrument) stream
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Broker account to trade; first account when unset
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default = "default_instrument")]
    pub instrument: String,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Snapshots older than this never open positions
    #[serde(default = "default_max_feature_age_secs")]
    pub max_feature_age_secs: i64,
    /// Tracker file, journal and status file live here
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub risk_limits: RiskLimits,
    #[serde(default)]
    pub sizing: SizingParams,
    #[serde(default)]
    pub signal: SignalParams,
    #[serde(default)]
    pub exit: ExitParams,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub indicators: IndicatorSettings,
    #[serde(default)]
    pub paper: PaperSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            instrument: default_instrument(),
            trading_mode: TradingMode::default(),
            poll_interval_secs: default_poll_interval_secs(),
            max_feature_age_secs: default_max_feature_age_secs(),
            state_dir: default_state_dir(),
            risk_limits: RiskLimits::default(),
            sizing: SizingParams::default(),
            signal: SignalParams::default(),
            exit: ExitParams::default(),
            broker: BrokerSettings::default(),
            indicators: IndicatorSettings::default(),
            paper: PaperSettings::default(),
        }
    }
}

/// Brokerage API credentials and endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerSettings {
    #[serde(default = "default_broker_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            base_url: default_broker_url(),
            api_key: String::new(),
            identifier: String::new(),
            password: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Feature service endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndicatorSettings {
    #[serde(default = "default_indicator_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            base_url: default_indicator_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Simulated account used in paper mode
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct PaperSettings {
    #[serde(default = "default_starting_balance")]
    pub starting_balance: Decimal,
    /// Max slippage in basis points (e.g., 5 for 0.05%)
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            starting_balance: default_starting_balance(),
            slippage_bps: default_slippage_bps(),
        }
    }
}

fn default_instrument() -> String { "GOLD".to_string() }
fn default_poll_interval_secs() -> u64 { 60 }
fn default_max_feature_age_secs() -> i64 { 300 }
fn default_broker_url() -> String { "https://demo-api-capital.backend-capital.com".to_string() }
fn default_indicator_url() -> String { "http://localhost:8080".to_string() }
fn default_timeout_secs() -> u64 { 30 }
fn default_starting_balance() -> Decimal { Decimal::from(10_000) }
fn default_slippage_bps() -> u32 { 5 }

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".decision-engine")
}

impl EngineConfig {
    /// Load from `ENGINE_CONFIG` (or `engine.{toml,yaml,json}` if present)
    /// and `ENGINE_*` environment variables, then validate.
    pub fn load() -> anyhow::Result<Self> {
        let file = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => config::File::with_name(&path).required(true),
            Err(_) => config::File::with_name("engine").required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("ENGINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Invalid config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.sizing;
        let e = &self.exit;

        if self.instrument.trim().is_empty() {
            return Err(anyhow::anyhow!("instrument must not be empty"));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow::anyhow!("poll_interval_secs must be positive"));
        }
        if self.max_feature_age_secs <= 0 {
            return Err(anyhow::anyhow!("max_feature_age_secs must be positive"));
        }
        if s.leverage <= Decimal::ZERO {
            return Err(anyhow::anyhow!("sizing.leverage must be positive, got {}", s.leverage));
        }
        if s.risk_fraction <= Decimal::ZERO || s.risk_fraction > Decimal::ONE {
            return Err(anyhow::anyhow!(
                "sizing.risk_fraction must be in (0, 1], got {}",
                s.risk_fraction
            ));
        }
        if s.margin_protection <= Decimal::ZERO || s.margin_protection > Decimal::ONE {
            return Err(anyhow::anyhow!(
                "sizing.margin_protection must be in (0, 1], got {}",
                s.margin_protection
            ));
        }
        if s.min_size <= Decimal::ZERO || s.min_size > s.max_size {
            return Err(anyhow::anyhow!(
                "sizing bounds invalid: min {} max {}",
                s.min_size,
                s.max_size
            ));
        }
        for (name, atr) in [("stop_loss_atr", s.stop_loss_atr), ("take_profit_atr", s.take_profit_atr)] {
            if let Some(v) = atr {
                if !(v.is_finite() && v > 0.0) {
                    return Err(anyhow::anyhow!("sizing.{} must be positive, got {}", name, v));
                }
            }
        }
        if !(e.retracement_floor > 0.0 && e.retracement_floor <= 1.0) {
            return Err(anyhow::anyhow!(
                "exit.retracement_floor must be in (0, 1], got {}",
                e.retracement_floor
            ));
        }
        if !(e.min_profit_threshold >= 0.0 && e.time_exit_min_profit >= 0.0) {
            return Err(anyhow::anyhow!("exit profit thresholds must be non-negative"));
        }
        if !(e.max_age_hours > 0.0) {
            return Err(anyhow::anyhow!("exit.max_age_hours must be positive"));
        }
        if self.trading_mode == TradingMode::Live
            && (self.broker.api_key.is_empty() || self.broker.identifier.is_empty())
        {
            return Err(anyhow::anyhow!(
                "live trading requires broker.api_key and broker.identifier"
            ));
        }
        Ok(())
    }

    /// Tracker file for this account and instrument
    pub fn tracker_path(&self) -> PathBuf {
        let account = self.account_id.as_deref().unwrap_or(self.trading_mode.as_str());
        self.state_dir
            .join("state")
            .join(format!("tracker-{}-{}.json", account, self.instrument))
    }
}
