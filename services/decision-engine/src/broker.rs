//! Broker capability - account, positions, open/close
//!
//! The engine talks to any brokerage through [`BrokerClient`]. Calls go
//! through a [`BrokerSession`], which re-authenticates once per tick when
//! the broker reports an expired session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::types::{Direction, OpenPosition};

/// Account balance as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub balance: Decimal,
    pub available: Decimal,
}

/// Raw open-position record. Every field may be missing on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub deal_id: Option<String>,
    pub instrument: Option<String>,
    pub direction: Option<Direction>,
    /// Entry level
    pub level: Option<Decimal>,
    pub size: Option<Decimal>,
    /// Unrealized P/L in account currency
    pub upl: Option<Decimal>,
    pub created_at: Option<DateTime<Utc>>,
}

impl PositionRecord {
    pub fn deal_label(&self) -> &str {
        self.deal_id.as_deref().unwrap_or("<unknown>")
    }

    /// Convert to an [`OpenPosition`].
    ///
    /// Profit is `upl / (entry * size)` when the broker reports P/L, otherwise
    /// it is derived from `mark`. A record missing a required field, or with
    /// no way to compute profit, is rejected as incomplete.
    pub fn into_position(
        self,
        mark: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<OpenPosition, BrokerError> {
        let label = self.deal_label().to_string();
        let missing = |field: &'static str| BrokerError::IncompleteRecord {
            deal_id: label.clone(),
            field,
        };

        let deal_id = self.deal_id.clone().ok_or_else(|| missing("deal_id"))?;
        let instrument = self.instrument.ok_or_else(|| missing("instrument"))?;
        let direction = self.direction.ok_or_else(|| missing("direction"))?;
        let entry = self
            .level
            .filter(|l| *l > Decimal::ZERO)
            .ok_or_else(|| missing("level"))?;
        let size = self
            .size
            .filter(|s| *s > Decimal::ZERO)
            .ok_or_else(|| missing("size"))?;

        let profit = match (self.upl, mark) {
            (Some(upl), _) => entry
                .checked_mul(size)
                .and_then(|value| upl.checked_div(value))
                .and_then(|p| p.to_f64()),
            (None, Some(mark)) => (mark - entry)
                .checked_div(entry)
                .and_then(|p| p.to_f64())
                .map(|p| p * direction.sign()),
            (None, None) => None,
        }
        .ok_or_else(|| missing("upl"))?;

        let age_hours = self
            .created_at
            .map(|t| (now - t).num_seconds().max(0) as f64 / 3600.0)
            .unwrap_or(0.0);

        Ok(OpenPosition {
            deal_id,
            instrument,
            direction,
            entry_price: entry,
            size,
            profit_fraction: profit,
            age_hours,
        })
    }
}

/// Request to open a market position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenRequest {
    pub instrument: String,
    pub direction: Direction,
    pub size: Decimal,
    /// Price the decision was made at
    pub reference_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Broker acknowledgement of an open or close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealConfirmation {
    pub deal_reference: String,
}

/// Brokerage operations used by the engine
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    async fn authenticate(&self) -> Result<(), BrokerError>;

    async fn account_summary(&self) -> Result<AccountSummary, BrokerError>;

    async fn open_positions(&self) -> Result<Vec<PositionRecord>, BrokerError>;

    async fn open_position(&self, request: &OpenRequest) -> Result<DealConfirmation, BrokerError>;

    async fn close_position(&self, deal_id: &str) -> Result<DealConfirmation, BrokerError>;
}

/// Broker handle with a one-shot re-authentication budget per tick
pub struct BrokerSession {
    broker: Arc<dyn BrokerClient>,
    reauth_available: bool,
    reauth_count: u64,
}

impl BrokerSession {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            reauth_available: true,
            reauth_count: 0,
        }
    }

    pub fn broker(&self) -> &Arc<dyn BrokerClient> {
        &self.broker
    }

    /// Reset the re-auth budget at the start of a tick
    pub fn begin_tick(&mut self) {
        self.reauth_available = true;
    }

    /// Re-authentications performed since startup
    pub fn reauth_count(&self) -> u64 {
        self.reauth_count
    }

    /// Re-authenticate if `err` is an expired session and the budget allows.
    /// Returns the original error otherwise.
    async fn recover(&mut self, err: BrokerError) -> Result<(), BrokerError> {
        if !err.is_auth_expired() || !self.reauth_available {
            return Err(err);
        }
        self.reauth_available = false;

        warn!("{} session expired ({}), re-authenticating", self.broker.name(), err);
        self.broker.authenticate().await?;
        self.reauth_count += 1;
        info!("✓ {} session renewed", self.broker.name());
        Ok(())
    }

    pub async fn account_summary(&mut self) -> Result<AccountSummary, BrokerError> {
        match self.broker.account_summary().await {
            Err(e) => {
                self.recover(e).await?;
                self.broker.account_summary().await
            }
            ok => ok,
        }
    }

    pub async fn open_positions(&mut self) -> Result<Vec<PositionRecord>, BrokerError> {
        match self.broker.open_positions().await {
            Err(e) => {
                self.recover(e).await?;
                self.broker.open_positions().await
            }
            ok => ok,
        }
    }

    pub async fn open_position(
        &mut self,
        request: &OpenRequest,
    ) -> Result<DealConfirmation, BrokerError> {
        match self.broker.open_position(request).await {
            Err(e) => {
                self.recover(e).await?;
                self.broker.open_position(request).await
            }
            ok => ok,
        }
    }

    pub async fn close_position(&mut self, deal_id: &str) -> Result<DealConfirmation, BrokerError> {
        match self.broker.close_position(deal_id).await {
            Err(e) => {
                self.recover(e).await?;
                self.broker.close_position(deal_id).await
            }
            ok => ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn record() -> PositionRecord {
        PositionRecord {
            deal_id: Some("deal-1".to_string()),
            instrument: Some("GOLD".to_string()),
            direction: Some(Direction::Long),
            level: Some(d("2000")),
            size: Some(d("0.5")),
            upl: Some(d("50")),
            created_at: None,
        }
    }

    #[test]
    fn test_profit_from_upl() {
        let position = record().into_position(None, Utc::now()).unwrap();
        // 50 / (2000 * 0.5)
        assert!((position.profit_fraction - 0.05).abs() < 1e-12);
        assert_eq!(position.age_hours, 0.0);
    }

    #[test]
    fn test_profit_from_mark_respects_direction() {
        let mut short = record();
        short.upl = None;
        short.direction = Some(Direction::Short);

        let position = short.into_position(Some(d("1900")), Utc::now()).unwrap();
        assert!((position.profit_fraction - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_age_from_creation_time() {
        let now = Utc::now();
        let mut r = record();
        r.created_at = Some(now - Duration::minutes(90));

        let position = r.into_position(None, now).unwrap();
        assert!((position.age_hours - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_incomplete_records_rejected() {
        let mut no_level = record();
        no_level.level = None;
        match no_level.into_position(None, Utc::now()) {
            Err(BrokerError::IncompleteRecord { deal_id, field }) => {
                assert_eq!(deal_id, "deal-1");
                assert_eq!(field, "level");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let mut no_profit = record();
        no_profit.upl = None;
        assert!(no_profit.into_position(None, Utc::now()).is_err());

        let mut no_id = record();
        no_id.deal_id = None;
        assert!(no_id.into_position(None, Utc::now()).is_err());
    }

    /// Broker whose session is expired until it authenticates
    struct ExpiringBroker {
        expired: AtomicBool,
        auth_calls: AtomicU32,
        auth_fails: bool,
    }

    impl ExpiringBroker {
        fn new(auth_fails: bool) -> Self {
            Self {
                expired: AtomicBool::new(true),
                auth_calls: AtomicU32::new(0),
                auth_fails,
            }
        }

        fn expire(&self) {
            self.expired.store(true, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), BrokerError> {
            if self.expired.load(Ordering::SeqCst) {
                return Err(BrokerError::AuthExpired("401".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BrokerClient for ExpiringBroker {
        fn name(&self) -> &str {
            "expiring"
        }

        async fn authenticate(&self) -> Result<(), BrokerError> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            if self.auth_fails {
                return Err(BrokerError::AuthExpired("bad credentials".to_string()));
            }
            self.expired.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn account_summary(&self) -> Result<AccountSummary, BrokerError> {
            self.check()?;
            Ok(AccountSummary {
                account_id: "acc".to_string(),
                balance: d("10"),
                available: d("10"),
            })
        }

        async fn open_positions(&self) -> Result<Vec<PositionRecord>, BrokerError> {
            self.check()?;
            Ok(vec![])
        }

        async fn open_position(&self, _: &OpenRequest) -> Result<DealConfirmation, BrokerError> {
            self.check()?;
            Ok(DealConfirmation { deal_reference: "ref".to_string() })
        }

        async fn close_position(&self, _: &str) -> Result<DealConfirmation, BrokerError> {
            self.check()?;
            Ok(DealConfirmation { deal_reference: "ref".to_string() })
        }
    }

    #[tokio::test]
    async fn test_reauth_once_and_retry() {
        let broker = Arc::new(ExpiringBroker::new(false));
        let mut session = BrokerSession::new(broker.clone());

        let summary = session.account_summary().await.unwrap();
        assert_eq!(summary.balance, d("10"));
        assert_eq!(broker.auth_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.reauth_count(), 1);
    }

    #[tokio::test]
    async fn test_reauth_budget_is_per_tick() {
        let broker = Arc::new(ExpiringBroker::new(false));
        let mut session = BrokerSession::new(broker.clone());

        session.account_summary().await.unwrap();
        broker.expire();

        // Second expiry in the same tick is surfaced
        let err = session.open_positions().await.unwrap_err();
        assert!(err.is_auth_expired());
        assert_eq!(broker.auth_calls.load(Ordering::SeqCst), 1);

        session.begin_tick();
        session.open_positions().await.unwrap();
        assert_eq!(broker.auth_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_reauth_is_returned() {
        let broker = Arc::new(ExpiringBroker::new(true));
        let mut session = BrokerSession::new(broker.clone());

        let err = session.close_position("deal-1").await.unwrap_err();
        assert!(err.is_auth_expired());
        assert_eq!(broker.auth_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.reauth_count(), 0);
    }
}
