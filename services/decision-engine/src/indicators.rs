//! Indicator provider - precomputed feature snapshots per instrument

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::error::IndicatorError;
use crate::types::FeatureSnapshot;

/// Source of feature snapshots. Snapshots may be stale; the caller decides.
#[async_trait]
pub trait IndicatorProvider: Send + Sync {
    async fn features(&self, instrument: &str) -> Result<FeatureSnapshot, IndicatorError>;
}

/// Feature service over HTTP: `GET {base}/features/{instrument}`
pub struct HttpIndicatorProvider {
    client: Client,
    base_url: String,
}

impl HttpIndicatorProvider {
    pub fn new(base_url: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl IndicatorProvider for HttpIndicatorProvider {
    async fn features(&self, instrument: &str) -> Result<FeatureSnapshot, IndicatorError> {
        let url = format!("{}/features/{}", self.base_url, instrument);
        debug!("Fetching features from {}", url);

        let response = self.client.get(&url).send().await?;

        if response.status().is_success() {
            let snapshot: FeatureSnapshot = response.json().await?;
            if !snapshot.is_complete() {
                return Err(IndicatorError::InvalidResponse(format!(
                    "incomplete snapshot for {}",
                    instrument
                )));
            }
            Ok(snapshot)
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(IndicatorError::Status {
                status: status.as_u16(),
                message: text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetches_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/features/GOLD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "price": 2000,
                "rsi": 60.0,
                "macd": 0.4,
                "atr": 2.5,
                "volume_change": 0.3,
                "timestamp": "2026-01-05T10:00:00Z",
                "trend": "confirmed_bullish",
                "micro_trend": 0.001
            })))
            .mount(&server)
            .await;

        let provider = HttpIndicatorProvider::new(&format!("{}/", server.uri()), 5).unwrap();
        let snapshot = provider.features("GOLD").await.unwrap();

        assert_eq!(snapshot.price, Decimal::from(2000));
        assert_eq!(snapshot.micro_trend, Some(0.001));
        assert!(snapshot.signal.is_none());
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/features/GOLD"))
            .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
            .mount(&server)
            .await;

        let provider = HttpIndicatorProvider::new(&server.uri(), 5).unwrap();
        match provider.features("GOLD").await {
            Err(IndicatorError::Status { status, message }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "warming up");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/features/GOLD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"price": 2000})))
            .mount(&server)
            .await;

        let provider = HttpIndicatorProvider::new(&server.uri(), 5).unwrap();
        let err = provider.features("GOLD").await.unwrap_err();
        assert!(matches!(err, IndicatorError::InvalidResponse(_)));
    }
}
