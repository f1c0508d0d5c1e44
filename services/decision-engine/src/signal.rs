//! Signal evaluation - indicators to an open/hold decision
//!
//! Evaluation order is fixed:
//! 1. input validation (non-positive price/balance, missing indicators)
//! 2. side limits, before any market condition is looked at
//! 3. regime override from the trend pre-classifier
//! 4. the rule cascade, first match wins
//! 5. sizing and affordability

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::sizing::PositionSizer;
use crate::types::{Decision, Direction, FeatureSnapshot, PositionCounts, RiskLimits, TrendLabel};

/// Thresholds for the entry rules
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalParams {
    #[serde(default = "default_overbought")]
    pub overbought: f64,
    #[serde(default = "default_oversold")]
    pub oversold: f64,
    /// Minimum ATR (price units) for momentum entries
    #[serde(default = "default_min_atr")]
    pub min_atr: f64,
    /// Minimum volume change (fraction) for momentum entries
    #[serde(default = "default_min_volume_change")]
    pub min_volume_change: f64,
    /// How far MACD may sit on the wrong side of zero for a reversal entry
    #[serde(default = "default_macd_tolerance")]
    pub macd_tolerance: f64,
    /// Max distance to support/resistance, as a fraction of price
    #[serde(default = "default_level_proximity")]
    pub level_proximity: f64,
    /// Min pullback from a recent extreme, as a fraction of price
    #[serde(default = "default_pullback")]
    pub pullback: f64,
    /// Micro-trend magnitude that overrides a confirmed regime
    #[serde(default = "default_strong_impulse")]
    pub strong_impulse: f64,
}

impl Default for SignalParams {
    fn default() -> Self {
        Self {
            overbought: default_overbought(),
            oversold: default_oversold(),
            min_atr: default_min_atr(),
            min_volume_change: default_min_volume_change(),
            macd_tolerance: default_macd_tolerance(),
            level_proximity: default_level_proximity(),
            pullback: default_pullback(),
            strong_impulse: default_strong_impulse(),
        }
    }
}

fn default_overbought() -> f64 { 70.0 }
fn default_oversold() -> f64 { 30.0 }
fn default_min_atr() -> f64 { 1.0 }
fn default_min_volume_change() -> f64 { 0.2 }
fn default_macd_tolerance() -> f64 { 0.05 }
fn default_level_proximity() -> f64 { 0.002 }
fn default_pullback() -> f64 { 0.01 }
fn default_strong_impulse() -> f64 { 0.003 }

type Predicate = fn(&FeatureSnapshot, &SignalParams) -> bool;
type Explain = fn(&FeatureSnapshot, &SignalParams) -> String;

/// One entry of the cascade
#[derive(Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub direction: Direction,
    predicate: Predicate,
    reason: Explain,
}

impl Rule {
    pub fn matches(&self, features: &FeatureSnapshot, params: &SignalParams) -> bool {
        (self.predicate)(features, params)
    }

    pub fn reason(&self, features: &FeatureSnapshot, params: &SignalParams) -> String {
        (self.reason)(features, params)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Entry rules in priority order
pub const CASCADE: &[Rule] = &[
    Rule {
        name: "momentum_volume_long",
        direction: Direction::Long,
        predicate: momentum_volume_long,
        reason: momentum_volume_reason,
    },
    Rule {
        name: "momentum_volume_short",
        direction: Direction::Short,
        predicate: momentum_volume_short,
        reason: momentum_volume_reason,
    },
    Rule {
        name: "oversold_rebound",
        direction: Direction::Long,
        predicate: oversold_rebound,
        reason: oversold_reason,
    },
    Rule {
        name: "overbought_rejection",
        direction: Direction::Short,
        predicate: overbought_rejection,
        reason: overbought_reason,
    },
    Rule {
        name: "support_bounce",
        direction: Direction::Long,
        predicate: support_bounce,
        reason: support_reason,
    },
    Rule {
        name: "resistance_rejection",
        direction: Direction::Short,
        predicate: resistance_rejection,
        reason: resistance_reason,
    },
    Rule {
        name: "pullback_from_high",
        direction: Direction::Long,
        predicate: pullback_from_high,
        reason: pullback_reason,
    },
    Rule {
        name: "bounce_from_low",
        direction: Direction::Short,
        predicate: bounce_from_low,
        reason: bounce_reason,
    },
];

fn momentum_volume_long(f: &FeatureSnapshot, p: &SignalParams) -> bool {
    f.rsi > 50.0
        && f.rsi < p.overbought
        && f.macd > 0.0
        && f.atr >= p.min_atr
        && f.volume_change >= p.min_volume_change
}

fn momentum_volume_short(f: &FeatureSnapshot, p: &SignalParams) -> bool {
    f.rsi < 50.0
        && f.rsi > p.oversold
        && f.macd < 0.0
        && f.atr >= p.min_atr
        && f.volume_change >= p.min_volume_change
}

fn momentum_volume_reason(f: &FeatureSnapshot, _: &SignalParams) -> String {
    format!(
        "momentum + volume confirmation: RSI {:.1}, MACD {:.4}, ATR {:.4}, volume {:+.1}%",
        f.rsi,
        f.macd,
        f.atr,
        f.volume_change * 100.0
    )
}

fn oversold_rebound(f: &FeatureSnapshot, p: &SignalParams) -> bool {
    f.rsi <= p.oversold && f.macd > -p.macd_tolerance && f.volume_change > 0.0
}

fn oversold_reason(f: &FeatureSnapshot, p: &SignalParams) -> String {
    format!(
        "oversold rebound: RSI {:.1} <= {:.0}, MACD {:.4} turning, volume {:+.1}%",
        f.rsi,
        p.oversold,
        f.macd,
        f.volume_change * 100.0
    )
}

fn overbought_rejection(f: &FeatureSnapshot, p: &SignalParams) -> bool {
    f.rsi >= p.overbought && f.macd < p.macd_tolerance && f.volume_change > 0.0
}

fn overbought_reason(f: &FeatureSnapshot, p: &SignalParams) -> String {
    format!(
        "overbought rejection: RSI {:.1} >= {:.0}, MACD {:.4} rolling over, volume {:+.1}%",
        f.rsi,
        p.overbought,
        f.macd,
        f.volume_change * 100.0
    )
}

fn near(f: &FeatureSnapshot, level: Option<Decimal>, proximity: f64) -> bool {
    level
        .and_then(|l| f.distance_to(l))
        .map(|d| d <= proximity)
        .unwrap_or(false)
}

fn support_bounce(f: &FeatureSnapshot, p: &SignalParams) -> bool {
    f.rsi < 50.0 && near(f, f.support, p.level_proximity)
}

fn support_reason(f: &FeatureSnapshot, _: &SignalParams) -> String {
    format!(
        "support bounce: price {} near support {}, RSI {:.1}",
        f.price,
        f.support.unwrap_or_default(),
        f.rsi
    )
}

fn resistance_rejection(f: &FeatureSnapshot, p: &SignalParams) -> bool {
    f.rsi > 50.0 && near(f, f.resistance, p.level_proximity)
}

fn resistance_reason(f: &FeatureSnapshot, _: &SignalParams) -> String {
    format!(
        "resistance rejection: price {} near resistance {}, RSI {:.1}",
        f.price,
        f.resistance.unwrap_or_default(),
        f.rsi
    )
}

fn pullback_from_high(f: &FeatureSnapshot, p: &SignalParams) -> bool {
    match f.recent_high {
        Some(high) if f.price < high => {
            f.macd > 0.0 && f.distance_to(high).map(|d| d >= p.pullback).unwrap_or(false)
        }
        _ => false,
    }
}

fn pullback_reason(f: &FeatureSnapshot, _: &SignalParams) -> String {
    let high = f.recent_high.unwrap_or_default();
    format!(
        "pullback of {:.2}% from recent high {} with MACD {:.4} still positive",
        f.distance_to(high).unwrap_or(0.0) * 100.0,
        high,
        f.macd
    )
}

fn bounce_from_low(f: &FeatureSnapshot, p: &SignalParams) -> bool {
    match f.recent_low {
        Some(low) if f.price > low => {
            f.macd < 0.0 && f.distance_to(low).map(|d| d >= p.pullback).unwrap_or(false)
        }
        _ => false,
    }
}

fn bounce_reason(f: &FeatureSnapshot, _: &SignalParams) -> String {
    let low = f.recent_low.unwrap_or_default();
    format!(
        "bounce of {:.2}% from recent low {} with MACD {:.4} still negative",
        f.distance_to(low).unwrap_or(0.0) * 100.0,
        low,
        f.macd
    )
}

/// Candidate entry before limits and sizing are applied
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub rule: &'static str,
    pub direction: Direction,
    pub reason: String,
}

/// Signal evaluator - pure mapping from features to a decision
#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    params: SignalParams,
    sizer: PositionSizer,
    rules: Vec<Rule>,
}

impl SignalEvaluator {
    pub fn new(params: SignalParams, sizer: PositionSizer) -> Self {
        Self {
            params,
            sizer,
            rules: CASCADE.to_vec(),
        }
    }

    /// Replace the cascade (first entry has highest priority)
    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn sizer(&self) -> &PositionSizer {
        &self.sizer
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Produce the open/hold decision for this tick
    pub fn evaluate(
        &self,
        price: Decimal,
        balance: Decimal,
        features: &FeatureSnapshot,
        counts: PositionCounts,
        limits: &RiskLimits,
    ) -> Decision {
        if price <= Decimal::ZERO {
            return Decision::hold(format!("invalid price {}", price));
        }
        if balance <= Decimal::ZERO {
            return Decision::hold(format!("invalid balance {}", balance));
        }
        if !features.is_complete() {
            return Decision::hold("missing indicator features");
        }

        let full = |d: Direction| !limits.allows(d, &counts);
        let limit_reason = |d: Direction| {
            format!("{} limit reached ({}/{})", d, counts.get(d), limits.limit(d))
        };

        if full(Direction::Long) && full(Direction::Short) {
            return Decision::hold(format!(
                "limit reached: {}, {}",
                limit_reason(Direction::Long),
                limit_reason(Direction::Short)
            ));
        }
        if let Some(side) = features.signal.and_then(|s| s.direction()) {
            if full(side) {
                return Decision::hold(limit_reason(side));
            }
        }

        let candidate = match self
            .regime_override(features)
            .or_else(|| self.first_match(features))
        {
            Some(c) => c,
            None => return Decision::hold("no condition met"),
        };

        if full(candidate.direction) {
            return Decision::hold(format!(
                "{}; {} not opened",
                limit_reason(candidate.direction),
                candidate.rule
            ));
        }

        let sizing = match self.sizer.size(balance, price) {
            Some(s) => s,
            None => return Decision::hold("position sizing inputs invalid"),
        };
        if !sizing.is_affordable() {
            return Decision::hold(format!(
                "unaffordable: minimum size {} needs margin {} above budget {}",
                sizing.size, sizing.margin_required, sizing.margin_budget
            ));
        }

        Decision::open(
            candidate.direction,
            sizing.size,
            sizing.margin_required,
            candidate.reason,
        )
    }

    /// Confirmed regime vs micro trend, checked before the cascade
    pub fn regime_override(&self, features: &FeatureSnapshot) -> Option<Candidate> {
        let (regime, label) = match features.trend? {
            TrendLabel::ConfirmedBullish => (Direction::Long, "bullish"),
            TrendLabel::ConfirmedBearish => (Direction::Short, "bearish"),
            TrendLabel::Neutral => return None,
        };
        let micro = features.micro_trend.filter(|m| m.is_finite())?;
        let aligned = micro * regime.sign();

        if aligned > 0.0 {
            Some(Candidate {
                rule: "regime_confirmation",
                direction: regime,
                reason: format!(
                    "confirmed {} regime reinforced by micro trend {:+.3}%",
                    label,
                    micro * 100.0
                ),
            })
        } else if -aligned >= self.params.strong_impulse {
            let (rule, what) = match regime {
                Direction::Long => ("regime_rejection", "rejection"),
                Direction::Short => ("regime_rebound", "rebound"),
            };
            Some(Candidate {
                rule,
                direction: regime.opposite(),
                reason: format!(
                    "{} override: micro trend {:+.3}% against confirmed {} regime",
                    what,
                    micro * 100.0,
                    label
                ),
            })
        } else {
            None
        }
    }

    /// First cascade rule that matches; later rules are not evaluated
    pub fn first_match(&self, features: &FeatureSnapshot) -> Option<Candidate> {
        self.rules
            .iter()
            .find(|rule| rule.matches(features, &self.params))
            .map(|rule| Candidate {
                rule: rule.name,
                direction: rule.direction,
                reason: rule.reason(features, &self.params),
            })
    }
}
