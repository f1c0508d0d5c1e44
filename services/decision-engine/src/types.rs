//! Core types shared by the evaluators and the decision loop
//!
//! These types define the contract between the indicator feed, the broker
//! and the two evaluators.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Directional recommendation produced by trend detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// Side a new position would take for this signal
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Signal::Buy => Some(Direction::Long),
            Signal::Sell => Some(Direction::Short),
            Signal::Hold => None,
        }
    }
}

/// Market regime label from the trend pre-classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendLabel {
    ConfirmedBullish,
    ConfirmedBearish,
    #[serde(rename = "none")]
    Neutral,
}

/// Indicator snapshot for one instrument, built once per tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub price: Decimal,
    pub rsi: f64,
    pub macd: f64,
    pub atr: f64,
    pub volume_change: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    /// Short-term impulse as a signed fraction of price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub micro_trend: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resistance: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_high: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_low: Option<Decimal>,
}

impl FeatureSnapshot {
    /// Snapshot with only the required indicators, stamped now
    pub fn new(price: Decimal, rsi: f64, macd: f64, atr: f64, volume_change: f64) -> Self {
        Self {
            price,
            rsi,
            macd,
            atr,
            volume_change,
            timestamp: Utc::now(),
            trend: None,
            signal: None,
            micro_trend: None,
            support: None,
            resistance: None,
            recent_high: None,
            recent_low: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_trend(mut self, trend: TrendLabel, micro_trend: Option<f64>) -> Self {
        self.trend = Some(trend);
        self.micro_trend = micro_trend;
        self
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_levels(mut self, support: Option<Decimal>, resistance: Option<Decimal>) -> Self {
        self.support = support;
        self.resistance = resistance;
        self
    }

    pub fn with_extremes(mut self, recent_high: Option<Decimal>, recent_low: Option<Decimal>) -> Self {
        self.recent_high = recent_high;
        self.recent_low = recent_low;
        self
    }

    /// True when every required indicator is a usable number
    pub fn is_complete(&self) -> bool {
        self.price > Decimal::ZERO
            && self.rsi.is_finite()
            && self.macd.is_finite()
            && self.atr.is_finite()
            && self.volume_change.is_finite()
    }

    /// Age of the snapshot relative to `now`, clamped at zero
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds().max(0)
    }

    /// Relative distance from price to a level, as a fraction of price
    pub fn distance_to(&self, level: Decimal) -> Option<f64> {
        if self.price <= Decimal::ZERO {
            return None;
        }
        ((self.price - level).abs() / self.price).to_f64()
    }
}

/// Open position as seen by the engine for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub deal_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub profit_fraction: f64,
    pub age_hours: f64,
}

/// Per-side open position counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PositionCounts {
    pub long: u32,
    pub short: u32,
}

impl PositionCounts {
    /// Count positions on `instrument` by side
    pub fn from_positions(positions: &[OpenPosition], instrument: &str) -> Self {
        positions
            .iter()
            .filter(|p| p.instrument == instrument)
            .fold(Self::default(), |mut counts, p| {
                match p.direction {
                    Direction::Long => counts.long += 1,
                    Direction::Short => counts.short += 1,
                }
                counts
            })
    }

    /// Count one broker position; an unknown side counts against both
    pub fn add(&mut self, direction: Option<Direction>) {
        match direction {
            Some(Direction::Long) => self.long += 1,
            Some(Direction::Short) => self.short += 1,
            None => {
                self.long += 1;
                self.short += 1;
            }
        }
    }

    pub fn get(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Long => self.long,
            Direction::Short => self.short,
        }
    }
}

/// Per-side position limits for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLimits {
    #[serde(default = "default_max_open")]
    pub max_open_long: u32,
    #[serde(default = "default_max_open")]
    pub max_open_short: u32,
}

impl RiskLimits {
    pub fn limit(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Long => self.max_open_long,
            Direction::Short => self.max_open_short,
        }
    }

    /// Whether one more position on `direction` stays within the limit
    pub fn allows(&self, direction: Direction, counts: &PositionCounts) -> bool {
        counts.get(direction) < self.limit(direction)
    }
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_open_long: default_max_open(),
            max_open_short: default_max_open(),
        }
    }
}

fn default_max_open() -> u32 { 1 }

/// Decision action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Hold,
    Open,
    Close,
}

/// Immutable decision record, logged in full
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    pub size: Decimal,
    pub margin_required: Decimal,
    pub reason: String,
}

impl Decision {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            direction: None,
            size: Decimal::ZERO,
            margin_required: Decimal::ZERO,
            reason: reason.into(),
        }
    }

    pub fn open(
        direction: Direction,
        size: Decimal,
        margin_required: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action: Action::Open,
            direction: Some(direction),
            size,
            margin_required,
            reason: reason.into(),
        }
    }

    pub fn close(direction: Direction, size: Decimal, reason: impl Into<String>) -> Self {
        Self {
            action: Action::Close,
            direction: Some(direction),
            size,
            margin_required: Decimal::ZERO,
            reason: reason.into(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.action == Action::Open
    }
}
