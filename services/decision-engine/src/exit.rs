//! Exit evaluation - open positions to close/hold decisions
//!
//! Every position is evaluated independently each tick:
//! loss guard, peak update, retracement check (unless momentum still
//! favors the position), forced time exit. A close proposal carries the
//! reason of every rule that fired.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tracker::PositionTracker;
use crate::types::{Action, Decision, Direction, FeatureSnapshot, OpenPosition};

/// Exit thresholds. Profit values are fractions of entry value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitParams {
    /// Profit must exceed this before a retracement can close the position
    #[serde(default = "default_min_profit_threshold")]
    pub min_profit_threshold: f64,
    /// Close once profit falls below `peak * retracement_floor`
    #[serde(default = "default_retracement_floor")]
    pub retracement_floor: f64,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: f64,
    /// Minimum profit for the forced time exit (0.005 = 0.5%)
    #[serde(default = "default_time_exit_min_profit")]
    pub time_exit_min_profit: f64,
    /// RSI level separating bullish from bearish momentum
    #[serde(default = "default_rsi_pivot")]
    pub rsi_pivot: f64,
}

impl Default for ExitParams {
    fn default() -> Self {
        Self {
            min_profit_threshold: default_min_profit_threshold(),
            retracement_floor: default_retracement_floor(),
            max_age_hours: default_max_age_hours(),
            time_exit_min_profit: default_time_exit_min_profit(),
            rsi_pivot: default_rsi_pivot(),
        }
    }
}

fn default_min_profit_threshold() -> f64 { 0.03 }
fn default_retracement_floor() -> f64 { 0.90 }
fn default_max_age_hours() -> f64 { 24.0 }
fn default_time_exit_min_profit() -> f64 { 0.005 }
fn default_rsi_pivot() -> f64 { 50.0 }

/// Close request for one deal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseAction {
    pub deal_id: String,
    pub direction: Direction,
    pub profit_fraction: f64,
    pub reason: String,
}

/// Per-position evaluation detail, logged every tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionEvaluation {
    pub deal_id: String,
    pub direction: Direction,
    pub profit_fraction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_profit: Option<f64>,
    pub age_hours: f64,
    pub decision: Decision,
}

/// Result of one exit pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExitReport {
    pub closes: Vec<CloseAction>,
    pub evaluations: Vec<PositionEvaluation>,
}

/// Exit evaluator
#[derive(Debug, Clone)]
pub struct ExitEvaluator {
    params: ExitParams,
}

impl ExitEvaluator {
    pub fn new(params: ExitParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ExitParams {
        &self.params
    }

    /// Evaluate all positions, updating high-water marks in `tracker`.
    ///
    /// Without a feature snapshot the retracement check is deferred; the
    /// loss guard, peak update and time exit still apply.
    pub fn evaluate(
        &self,
        positions: &[OpenPosition],
        tracker: &mut PositionTracker,
        features: Option<&FeatureSnapshot>,
    ) -> ExitReport {
        let mut report = ExitReport::default();

        for position in positions {
            let (max_profit, decision) = self.evaluate_position(position, tracker, features);

            debug!(
                "Exit check {} {} | profit {:.4} | peak {:?} | age {:.1}h | {:?}: {}",
                position.deal_id,
                position.direction,
                position.profit_fraction,
                max_profit,
                position.age_hours,
                decision.action,
                decision.reason
            );

            if decision.action == Action::Close {
                report.closes.push(CloseAction {
                    deal_id: position.deal_id.clone(),
                    direction: position.direction,
                    profit_fraction: position.profit_fraction,
                    reason: decision.reason.clone(),
                });
            }

            report.evaluations.push(PositionEvaluation {
                deal_id: position.deal_id.clone(),
                direction: position.direction,
                profit_fraction: position.profit_fraction,
                max_profit,
                age_hours: position.age_hours,
                decision,
            });
        }

        report
    }

    fn evaluate_position(
        &self,
        position: &OpenPosition,
        tracker: &mut PositionTracker,
        features: Option<&FeatureSnapshot>,
    ) -> (Option<f64>, Decision) {
        let p = &self.params;
        let profit = position.profit_fraction;
        if !profit.is_finite() {
            return (
                tracker.max_profit(&position.deal_id),
                Decision::hold("profit unavailable"),
            );
        }

        // Loss guard: never close at a loss
        if profit < 0.0 {
            return (
                tracker.max_profit(&position.deal_id),
                Decision::hold(format!("loss guard: profit {:.2}% below zero", profit * 100.0)),
            );
        }

        // Entries start on the first positive reading
        let peak = if profit > 0.0 {
            tracker.observe(&position.deal_id, profit)
        } else {
            tracker.max_profit(&position.deal_id).unwrap_or(0.0)
        };
        let mut fired = Vec::new();
        let mut notes = Vec::new();

        let floor = peak * p.retracement_floor;
        if profit > p.min_profit_threshold && profit < floor {
            let retraced = format!(
                "profit {:.2}% retraced below {:.0}% of peak {:.2}%",
                profit * 100.0,
                p.retracement_floor * 100.0,
                peak * 100.0
            );
            match features {
                None => notes.push(format!("{}, check deferred: indicators unavailable", retraced)),
                Some(f) if self.momentum_favorable(position.direction, f) => notes.push(format!(
                    "{}, sustained by favorable indicators (RSI {:.1}, MACD {:.4}, volume {:+.1}%)",
                    retraced,
                    f.rsi,
                    f.macd,
                    f.volume_change * 100.0
                )),
                Some(_) => fired.push(format!("retracement: {}", retraced)),
            }
        }

        if position.age_hours >= p.max_age_hours && profit >= p.time_exit_min_profit {
            fired.push(format!(
                "time exit: open {:.1}h >= {:.0}h with profit {:.2}%",
                position.age_hours,
                p.max_age_hours,
                profit * 100.0
            ));
        }

        let decision = if !fired.is_empty() && profit > 0.0 {
            Decision::close(position.direction, position.size, fired.join("; "))
        } else if !notes.is_empty() {
            Decision::hold(notes.join("; "))
        } else {
            Decision::hold(format!(
                "holding: profit {:.2}%, peak {:.2}%",
                profit * 100.0,
                peak * 100.0
            ))
        };

        (tracker.max_profit(&position.deal_id), decision)
    }

    /// RSI, MACD and volume all still pointing the position's way
    pub fn momentum_favorable(&self, direction: Direction, features: &FeatureSnapshot) -> bool {
        if !features.is_complete() {
            return false;
        }
        let volume_rising = features.volume_change > 0.0;
        match direction {
            Direction::Long => {
                features.rsi > self.params.rsi_pivot && features.macd > 0.0 && volume_rising
            }
            Direction::Short => {
                features.rsi < self.params.rsi_pivot && features.macd < 0.0 && volume_rising
            }
        }
    }
}
