//! Decision Engine - main tick loop
//!
//! One engine drives one (account, instrument) stream. Each tick:
//! refresh broker state, fetch features, prune externally closed deals,
//! maybe open, evaluate exits and close, persist the tracker, then log and
//! journal the full decision trail. Ticks never overlap and a failed step
//! degrades to HOLD instead of stopping the loop.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::{AccountSummary, BrokerClient, BrokerSession, OpenRequest, PositionRecord};
use crate::config::{EngineConfig, TradingMode};
use crate::error::BrokerError;
use crate::exit::{ExitEvaluator, PositionEvaluation};
use crate::indicators::IndicatorProvider;
use crate::journal::{DecisionJournal, NowState, SessionStats};
use crate::signal::SignalEvaluator;
use crate::sizing::PositionSizer;
use crate::tracker::PositionTracker;
use crate::types::{Decision, Direction, FeatureSnapshot, OpenPosition, PositionCounts, RiskLimits};

/// Outcome of one close request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseOutcome {
    pub deal_id: String,
    pub direction: Direction,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CloseOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything decided and done in one tick
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub price: Option<Decimal>,
    pub balance: Option<Decimal>,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened: Option<String>,
    pub evaluations: Vec<PositionEvaluation>,
    pub closes: Vec<CloseOutcome>,
    /// Tracker entries dropped because the broker no longer reports the deal
    pub pruned: Vec<String>,
    pub skipped_records: usize,
    pub persisted: bool,
    pub errors: Vec<String>,
}

impl TickReport {
    fn new(timestamp: DateTime<Utc>, instrument: &str) -> Self {
        Self {
            timestamp,
            instrument: instrument.to_string(),
            price: None,
            balance: None,
            decision: Decision::hold("tick not evaluated"),
            opened: None,
            evaluations: Vec::new(),
            closes: Vec::new(),
            pruned: Vec::new(),
            skipped_records: 0,
            persisted: false,
            errors: Vec::new(),
        }
    }
}

/// Decision loop for one (account, instrument) stream
pub struct DecisionEngine {
    instrument: String,
    mode: TradingMode,
    poll_interval: Duration,
    max_feature_age_secs: i64,
    limits: RiskLimits,
    signals: SignalEvaluator,
    exits: ExitEvaluator,
    session: BrokerSession,
    indicators: Arc<dyn IndicatorProvider>,
    tracker: PositionTracker,
    journal: Option<DecisionJournal>,
    stats: SessionStats,
}

impl DecisionEngine {
    pub fn new(
        config: &EngineConfig,
        broker: Arc<dyn BrokerClient>,
        indicators: Arc<dyn IndicatorProvider>,
        tracker: PositionTracker,
    ) -> Self {
        let sizer = PositionSizer::new(config.sizing);

        Self {
            instrument: config.instrument.clone(),
            mode: config.trading_mode,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            max_feature_age_secs: config.max_feature_age_secs,
            limits: config.risk_limits,
            signals: SignalEvaluator::new(config.signal, sizer),
            exits: ExitEvaluator::new(config.exit),
            session: BrokerSession::new(broker),
            indicators,
            tracker,
            journal: None,
            stats: SessionStats::default(),
        }
    }

    pub fn with_journal(mut self, journal: DecisionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn reauth_count(&self) -> u64 {
        self.session.reauth_count()
    }

    /// Run ticks until `shutdown` flips to true or its sender is dropped.
    ///
    /// A tick in progress always completes; the tracker is flushed once
    /// more before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            "Decision engine starting: {} via {} ({} mode), every {:?}",
            self.instrument,
            self.session.broker().name(),
            self.mode.as_str(),
            self.poll_interval
        );

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.init().await {
                warn!("Journal unavailable: {}", e);
            }
        }

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed");
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                info!("Shutdown requested");
                break;
            }
        }

        if let Err(e) = self.tracker.persist().await {
            error!("Final tracker flush failed: {}", e);
        }
        info!(
            "Decision engine stopped after {} ticks ({} opens, {} closes)",
            self.stats.ticks, self.stats.opens, self.stats.closes
        );
        Ok(())
    }

    /// Run one full tick
    pub async fn tick(&mut self) -> TickReport {
        let now = Utc::now();
        let mut report = TickReport::new(now, &self.instrument);
        self.session.begin_tick();
        self.stats.ticks += 1;

        let (account, records) = match self.refresh().await {
            Ok(state) => state,
            Err(e) => {
                error!("Broker refresh failed, skipping tick: {}", e);
                report.errors.push(format!("refresh: {}", e));
                report.decision = Decision::hold(format!("broker unavailable: {}", e));
                self.finish(&mut report).await;
                return report;
            }
        };
        report.balance = Some(account.balance);

        let features = match self.indicators.features(&self.instrument).await {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("Features unavailable for {}: {}", self.instrument, e);
                report.errors.push(format!("indicators: {}", e));
                None
            }
        };
        report.price = features.as_ref().map(|f| f.price);

        let (positions, counts) =
            self.collect_positions(records, features.as_ref(), now, &mut report);

        report.decision = self.entry_decision(&account, counts, features.as_ref(), now);
        if report.decision.is_open() {
            if let Some(f) = &features {
                self.open(f, &mut report).await;
            }
        }

        let exits = self
            .exits
            .evaluate(&positions, &mut self.tracker, features.as_ref());
        report.evaluations = exits.evaluations;

        for close in exits.closes {
            let outcome = match self.session.close_position(&close.deal_id).await {
                Ok(confirmation) => {
                    self.tracker.remove(&close.deal_id);
                    self.stats.closes += 1;
                    info!("✓ Closed {} {}: {}", close.direction, close.deal_id, close.reason);
                    CloseOutcome {
                        deal_id: close.deal_id,
                        direction: close.direction,
                        reason: close.reason,
                        deal_reference: Some(confirmation.deal_reference),
                        error: None,
                    }
                }
                Err(e) => {
                    error!("Close of {} failed: {}", close.deal_id, e);
                    report.errors.push(format!("close {}: {}", close.deal_id, e));
                    CloseOutcome {
                        deal_id: close.deal_id,
                        direction: close.direction,
                        reason: close.reason,
                        deal_reference: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.closes.push(outcome);
        }

        self.finish(&mut report).await;
        report
    }

    async fn refresh(&mut self) -> Result<(AccountSummary, Vec<PositionRecord>), BrokerError> {
        let account = self.session.account_summary().await?;
        let records = self.session.open_positions().await?;
        Ok((account, records))
    }

    /// Convert broker records for this instrument, count sides and prune
    /// the tracker.
    ///
    /// Incomplete records are left out of the exit pass but still count
    /// toward side limits and keep their high-water marks, since the broker
    /// still holds them. A record without an instrument is counted as ours.
    fn collect_positions(
        &mut self,
        records: Vec<PositionRecord>,
        features: Option<&FeatureSnapshot>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> (Vec<OpenPosition>, PositionCounts) {
        let mark = features.map(|f| f.price);
        let mut open_ids = HashSet::new();
        let mut positions = Vec::new();
        let mut counts = PositionCounts::default();

        for record in records {
            if let Some(id) = &record.deal_id {
                open_ids.insert(id.clone());
            }
            if matches!(&record.instrument, Some(i) if *i != self.instrument) {
                continue;
            }
            counts.add(record.direction);
            match record.into_position(mark, now) {
                Ok(position) => positions.push(position),
                Err(e) => {
                    warn!("Skipping position: {}", e);
                    report.skipped_records += 1;
                }
            }
        }

        report.pruned = self.tracker.retain_open(&open_ids);
        if !report.pruned.is_empty() {
            info!("Dropped tracking for closed deals: {:?}", report.pruned);
        }
        (positions, counts)
    }

    fn entry_decision(
        &self,
        account: &AccountSummary,
        counts: PositionCounts,
        features: Option<&FeatureSnapshot>,
        now: DateTime<Utc>,
    ) -> Decision {
        let features = match features {
            Some(f) => f,
            None => return Decision::hold("indicators unavailable"),
        };

        let age = features.age_secs(now);
        if age > self.max_feature_age_secs {
            return Decision::hold(format!(
                "stale features: {}s old (max {}s)",
                age, self.max_feature_age_secs
            ));
        }

        self.signals
            .evaluate(features.price, account.balance, features, counts, &self.limits)
    }

    async fn open(&mut self, features: &FeatureSnapshot, report: &mut TickReport) {
        let direction = match report.decision.direction {
            Some(d) => d,
            None => return,
        };
        let (stop_loss, take_profit) = self.protective_levels(direction, features);

        let request = OpenRequest {
            instrument: self.instrument.clone(),
            direction,
            size: report.decision.size,
            reference_price: features.price,
            stop_loss,
            take_profit,
        };

        match self.session.open_position(&request).await {
            Ok(confirmation) => {
                self.stats.opens += 1;
                info!(
                    "🚀 Opened {} {} {} @ ~{}: {}",
                    direction, request.size, self.instrument, features.price, report.decision.reason
                );
                report.opened = Some(confirmation.deal_reference);
            }
            Err(e) => {
                error!("Open {} failed: {}", direction, e);
                report.errors.push(format!("open: {}", e));
            }
        }
    }

    /// Stop/take levels at configured ATR multiples from the entry price
    fn protective_levels(
        &self,
        direction: Direction,
        features: &FeatureSnapshot,
    ) -> (Option<Decimal>, Option<Decimal>) {
        let params = self.signals.sizer().params();
        let offset = |multiple: Option<f64>| {
            multiple
                .and_then(|m| Decimal::from_f64(features.atr * m))
                .filter(|d| *d > Decimal::ZERO)
        };
        let price = features.price;

        let (stop, take) = match direction {
            Direction::Long => (
                offset(params.stop_loss_atr).map(|o| price - o),
                offset(params.take_profit_atr).map(|o| price + o),
            ),
            Direction::Short => (
                offset(params.stop_loss_atr).map(|o| price + o),
                offset(params.take_profit_atr).map(|o| price - o),
            ),
        };
        (
            stop.filter(|s| *s > Decimal::ZERO),
            take.filter(|t| *t > Decimal::ZERO),
        )
    }

    /// Persist, log and journal the tick
    async fn finish(&mut self, report: &mut TickReport) {
        match self.tracker.persist().await {
            Ok(written) => report.persisted = written,
            Err(e) => {
                error!("Tracker persistence failed, keeping state in memory: {}", e);
                report.errors.push(format!("persist: {}", e));
            }
        }

        if !report.errors.is_empty() {
            self.stats.failed_ticks += 1;
        }

        info!(
            "📊 {} | price {} | balance {} | {:?}: {} | {} positions, {} closes",
            report.instrument,
            report.price.map(|p| p.to_string()).unwrap_or_else(|| "n/a".to_string()),
            report.balance.map(|b| b.to_string()).unwrap_or_else(|| "n/a".to_string()),
            report.decision.action,
            report.decision.reason,
            report.evaluations.len(),
            report.closes.iter().filter(|c| c.is_confirmed()).count()
        );
        for eval in &report.evaluations {
            debug!(
                "  {} {} profit {:.4} peak {:?} age {:.1}h -> {:?}: {}",
                eval.deal_id,
                eval.direction,
                eval.profit_fraction,
                eval.max_profit,
                eval.age_hours,
                eval.decision.action,
                eval.decision.reason
            );
        }

        let journal = match &self.journal {
            Some(j) => j,
            None => return,
        };
        if let Err(e) = journal.append(report).await {
            warn!("Journal append failed: {}", e);
        }

        let now = NowState {
            timestamp: report.timestamp,
            instrument: report.instrument.clone(),
            mode: self.mode.as_str().to_string(),
            status: if report.errors.is_empty() { "running" } else { "degraded" }.to_string(),
            last_action: format!("{:?}", report.decision.action),
            last_reason: report.decision.reason.clone(),
            open_positions: report.evaluations.len(),
            tracked_positions: self.tracker.len(),
            session_stats: self.stats.clone(),
        };
        if let Err(e) = journal.write_now(&now).await {
            warn!("Status write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizing::SizingParams;
    use crate::tracker::MemoryStore;

    struct NoBroker;

    #[async_trait::async_trait]
    impl BrokerClient for NoBroker {
        fn name(&self) -> &str {
            "none"
        }
        async fn authenticate(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn account_summary(&self) -> Result<AccountSummary, BrokerError> {
            Err(BrokerError::Transport("offline".to_string()))
        }
        async fn open_positions(&self) -> Result<Vec<PositionRecord>, BrokerError> {
            Err(BrokerError::Transport("offline".to_string()))
        }
        async fn open_position(
            &self,
            _: &OpenRequest,
        ) -> Result<crate::broker::DealConfirmation, BrokerError> {
            Err(BrokerError::Transport("offline".to_string()))
        }
        async fn close_position(
            &self,
            _: &str,
        ) -> Result<crate::broker::DealConfirmation, BrokerError> {
            Err(BrokerError::Transport("offline".to_string()))
        }
    }

    struct NoFeatures;

    #[async_trait::async_trait]
    impl IndicatorProvider for NoFeatures {
        async fn features(
            &self,
            _: &str,
        ) -> Result<FeatureSnapshot, crate::error::IndicatorError> {
            Err(crate::error::IndicatorError::Transport("offline".to_string()))
        }
    }

    fn engine(config: &EngineConfig) -> DecisionEngine {
        DecisionEngine::new(
            config,
            Arc::new(NoBroker),
            Arc::new(NoFeatures),
            PositionTracker::new(Box::new(MemoryStore::new())),
        )
    }

    #[test]
    fn test_protective_levels_follow_direction() {
        let mut config = EngineConfig::default();
        config.sizing = SizingParams {
            stop_loss_atr: Some(2.0),
            take_profit_atr: Some(3.0),
            ..SizingParams::default()
        };
        let engine = engine(&config);
        let features = FeatureSnapshot::new(Decimal::from(2000), 60.0, 0.4, 5.0, 0.3);

        let (stop, take) = engine.protective_levels(Direction::Long, &features);
        assert_eq!(stop, Some(Decimal::from(1990)));
        assert_eq!(take, Some(Decimal::from(2015)));

        let (stop, take) = engine.protective_levels(Direction::Short, &features);
        assert_eq!(stop, Some(Decimal::from(2010)));
        assert_eq!(take, Some(Decimal::from(1985)));
    }

    #[test]
    fn test_no_protective_levels_by_default() {
        let engine = engine(&EngineConfig::default());
        let features = FeatureSnapshot::new(Decimal::from(2000), 60.0, 0.4, 5.0, 0.3);
        assert_eq!(engine.protective_levels(Direction::Long, &features), (None, None));
    }

    #[tokio::test]
    async fn test_broker_failure_degrades_to_hold() {
        let mut engine = engine(&EngineConfig::default());
        let report = engine.tick().await;

        assert!(!report.decision.is_open());
        assert!(report.decision.reason.starts_with("broker unavailable"));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(engine.stats().failed_ticks, 1);
    }
}
