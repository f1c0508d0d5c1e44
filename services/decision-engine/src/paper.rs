//! Paper broker - in-process simulated account
//!
//! Fills at the reference price with random adverse slippage, marks open
//! positions from the indicator provider and credits realized P/L to the
//! simulated balance. Protective stop/take levels are settled on the next
//! position listing once the mark crosses them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{AccountSummary, BrokerClient, DealConfirmation, OpenRequest, PositionRecord};
use crate::error::BrokerError;
use crate::indicators::IndicatorProvider;
use crate::types::Direction;

#[derive(Debug, Clone)]
struct PaperPosition {
    deal_id: String,
    instrument: String,
    direction: Direction,
    level: Decimal,
    size: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
    created_at: DateTime<Utc>,
}

impl PaperPosition {
    fn pnl_at(&self, price: Decimal) -> Decimal {
        let diff = price - self.level;
        let signed = match self.direction {
            Direction::Long => diff,
            Direction::Short => -diff,
        };
        signed * self.size
    }

    /// Protective level crossed by `mark`, if any
    fn triggered_level(&self, mark: Decimal) -> Option<(Decimal, &'static str)> {
        let (stop_hit, take_hit) = match self.direction {
            Direction::Long => (
                self.stop_loss.filter(|s| mark <= *s),
                self.take_profit.filter(|t| mark >= *t),
            ),
            Direction::Short => (
                self.stop_loss.filter(|s| mark >= *s),
                self.take_profit.filter(|t| mark <= *t),
            ),
        };
        stop_hit
            .map(|s| (s, "stop loss"))
            .or_else(|| take_hit.map(|t| (t, "take profit")))
    }
}

#[derive(Debug)]
struct PaperBook {
    balance: Decimal,
    realized_pnl: Decimal,
    positions: Vec<PaperPosition>,
}

impl PaperBook {
    fn settle(&mut self, deal_id: &str, exit_price: Decimal) -> Option<Decimal> {
        let idx = self.positions.iter().position(|p| p.deal_id == deal_id)?;
        let position = self.positions.remove(idx);
        let pnl = position.pnl_at(exit_price);
        self.balance += pnl;
        self.realized_pnl += pnl;
        Some(pnl)
    }
}

/// Simulated broker account
pub struct PaperBroker {
    account_id: String,
    indicators: Arc<dyn IndicatorProvider>,
    slippage_bps: u32,
    book: Mutex<PaperBook>,
}

impl PaperBroker {
    pub fn new(
        account_id: impl Into<String>,
        starting_balance: Decimal,
        slippage_bps: u32,
        indicators: Arc<dyn IndicatorProvider>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            indicators,
            slippage_bps,
            book: Mutex::new(PaperBook {
                balance: starting_balance,
                realized_pnl: Decimal::ZERO,
                positions: Vec::new(),
            }),
        }
    }

    pub async fn realized_pnl(&self) -> Decimal {
        self.book.lock().await.realized_pnl
    }

    /// Price moved against the trader by a random fraction of the slippage cap
    fn slipped(&self, price: Decimal, buying: bool) -> Decimal {
        if self.slippage_bps == 0 {
            return price;
        }
        let bps = rand::thread_rng().gen_range(0..=self.slippage_bps);
        let slip = price * Decimal::new(i64::from(bps), 4);
        if buying {
            price + slip
        } else {
            price - slip
        }
    }

    async fn mark(&self, instrument: &str) -> Result<Decimal, BrokerError> {
        self.indicators
            .features(instrument)
            .await
            .map(|f| f.price)
            .map_err(|e| BrokerError::Transport(format!("paper mark for {}: {}", instrument, e)))
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn authenticate(&self) -> Result<(), BrokerError> {
        debug!("Paper broker needs no session");
        Ok(())
    }

    async fn account_summary(&self) -> Result<AccountSummary, BrokerError> {
        let book = self.book.lock().await;
        Ok(AccountSummary {
            account_id: self.account_id.clone(),
            balance: book.balance,
            available: book.balance,
        })
    }

    async fn open_positions(&self) -> Result<Vec<PositionRecord>, BrokerError> {
        let instruments: Vec<String> = {
            let book = self.book.lock().await;
            let mut seen: Vec<String> = book.positions.iter().map(|p| p.instrument.clone()).collect();
            seen.sort();
            seen.dedup();
            seen
        };

        let mut marks = HashMap::new();
        for instrument in instruments {
            match self.mark(&instrument).await {
                Ok(price) => {
                    marks.insert(instrument, price);
                }
                Err(e) => warn!("{}", e),
            }
        }

        let mut book = self.book.lock().await;

        let triggered: Vec<(String, Decimal, &'static str)> = book
            .positions
            .iter()
            .filter_map(|p| {
                let mark = marks.get(&p.instrument)?;
                p.triggered_level(*mark)
                    .map(|(level, kind)| (p.deal_id.clone(), level, kind))
            })
            .collect();
        for (deal_id, level, kind) in triggered {
            if let Some(pnl) = book.settle(&deal_id, level) {
                info!("📄 Paper {} hit on {} at {} (P/L {})", kind, deal_id, level, pnl);
            }
        }

        Ok(book
            .positions
            .iter()
            .map(|p| PositionRecord {
                deal_id: Some(p.deal_id.clone()),
                instrument: Some(p.instrument.clone()),
                direction: Some(p.direction),
                level: Some(p.level),
                size: Some(p.size),
                upl: marks.get(&p.instrument).map(|m| p.pnl_at(*m)),
                created_at: Some(p.created_at),
            })
            .collect())
    }

    async fn open_position(&self, request: &OpenRequest) -> Result<DealConfirmation, BrokerError> {
        if request.size <= Decimal::ZERO || request.reference_price <= Decimal::ZERO {
            return Err(BrokerError::Rejected {
                status: 400,
                message: format!("invalid paper order {:?}", request),
            });
        }

        let fill = self.slipped(request.reference_price, request.direction == Direction::Long);
        let deal_id = Uuid::new_v4().to_string();

        let position = PaperPosition {
            deal_id: deal_id.clone(),
            instrument: request.instrument.clone(),
            direction: request.direction,
            level: fill,
            size: request.size,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            created_at: Utc::now(),
        };
        self.book.lock().await.positions.push(position);

        info!(
            "📄 Paper open {} {} {} @ {} (ref {})",
            request.direction, request.size, request.instrument, fill, request.reference_price
        );
        Ok(DealConfirmation {
            deal_reference: deal_id,
        })
    }

    async fn close_position(&self, deal_id: &str) -> Result<DealConfirmation, BrokerError> {
        let (instrument, direction) = {
            let book = self.book.lock().await;
            let position = book
                .positions
                .iter()
                .find(|p| p.deal_id == deal_id)
                .ok_or_else(|| BrokerError::Rejected {
                    status: 404,
                    message: format!("unknown paper deal {}", deal_id),
                })?;
            (position.instrument.clone(), position.direction)
        };

        let mark = self.mark(&instrument).await?;
        // Closing a long sells, closing a short buys
        let exit = self.slipped(mark, direction == Direction::Short);

        let pnl = self
            .book
            .lock()
            .await
            .settle(deal_id, exit)
            .ok_or_else(|| BrokerError::Rejected {
                status: 404,
                message: format!("paper deal {} already closed", deal_id),
            })?;

        info!("📄 Paper close {} @ {} (P/L {})", deal_id, exit, pnl);
        Ok(DealConfirmation {
            deal_reference: deal_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndicatorError;
    use crate::types::FeatureSnapshot;
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    struct FixedPrice(StdMutex<Decimal>);

    impl FixedPrice {
        fn set(&self, price: Decimal) {
            *self.0.lock().unwrap() = price;
        }
    }

    #[async_trait]
    impl IndicatorProvider for FixedPrice {
        async fn features(&self, _: &str) -> Result<FeatureSnapshot, IndicatorError> {
            let price = *self.0.lock().unwrap();
            Ok(FeatureSnapshot::new(price, 50.0, 0.0, 1.0, 0.0))
        }
    }

    fn request(direction: Direction, size: &str) -> OpenRequest {
        OpenRequest {
            instrument: "GOLD".to_string(),
            direction,
            size: d(size),
            reference_price: d("2000"),
            stop_loss: None,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_credits_pnl() {
        let prices = Arc::new(FixedPrice(StdMutex::new(d("2000"))));
        let broker = PaperBroker::new("paper-1", d("10"), 0, prices.clone());

        let deal = broker.open_position(&request(Direction::Long, "0.01")).await.unwrap();
        prices.set(d("2100"));

        let records = broker.open_positions().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].upl, Some(d("1.00")));

        broker.close_position(&deal.deal_reference).await.unwrap();
        let summary = broker.account_summary().await.unwrap();
        assert_eq!(summary.balance, d("11.00"));
        assert_eq!(broker.realized_pnl().await, d("1.00"));
        assert!(broker.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slippage_is_adverse_and_bounded() {
        let prices = Arc::new(FixedPrice(StdMutex::new(d("2000"))));
        let broker = PaperBroker::new("paper-1", d("1000"), 50, prices);

        for _ in 0..20 {
            let fill = broker.slipped(d("2000"), true);
            assert!(fill >= d("2000") && fill <= d("2010"));
            let fill = broker.slipped(d("2000"), false);
            assert!(fill <= d("2000") && fill >= d("1990"));
        }
    }

    #[tokio::test]
    async fn test_stop_loss_settles_on_listing() {
        let prices = Arc::new(FixedPrice(StdMutex::new(d("2000"))));
        let broker = PaperBroker::new("paper-1", d("100"), 0, prices.clone());

        let mut req = request(Direction::Short, "1");
        req.stop_loss = Some(d("2010"));
        broker.open_position(&req).await.unwrap();

        prices.set(d("2015"));
        assert!(broker.open_positions().await.unwrap().is_empty());
        // Settled at the stop level, not the mark
        assert_eq!(broker.account_summary().await.unwrap().balance, d("90"));
    }

    #[tokio::test]
    async fn test_unknown_deal_rejected() {
        let prices = Arc::new(FixedPrice(StdMutex::new(d("2000"))));
        let broker = PaperBroker::new("paper-1", d("10"), 0, prices);

        let err = broker.close_position("missing").await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected { status: 404, .. }));
    }
}
