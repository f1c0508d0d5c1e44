//! Brokerage REST API client
//!
//! Session-token API: `POST /session` returns `CST` and `X-SECURITY-TOKEN`
//! headers that must accompany every later request. An expired session
//! shows up as 401/403 and is reported as [`BrokerError::AuthExpired`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::broker::{AccountSummary, BrokerClient, DealConfirmation, OpenRequest, PositionRecord};
use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::types::Direction;

const API_KEY_HEADER: &str = "X-CAP-API-KEY";
const CST_HEADER: &str = "CST";
const SECURITY_TOKEN_HEADER: &str = "X-SECURITY-TOKEN";

#[derive(Debug, Clone)]
struct SessionTokens {
    cst: String,
    security_token: String,
}

/// HTTP client for the brokerage API
pub struct HttpBrokerClient {
    client: Client,
    base_url: String,
    api_key: String,
    identifier: String,
    password: String,
    account_id: Option<String>,
    session: RwLock<Option<SessionTokens>>,
}

impl HttpBrokerClient {
    /// Create new broker client. No request is made until [`authenticate`].
    ///
    /// [`authenticate`]: BrokerClient::authenticate
    pub fn new(settings: &BrokerSettings, account_id: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            identifier: settings.identifier.clone(),
            password: settings.password.clone(),
            account_id,
            session: RwLock::new(None),
        })
    }

    pub async fn has_session(&self) -> bool {
        self.session.read().await.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    /// Request carrying the session headers
    async fn authed(&self, method: Method, path: &str) -> Result<RequestBuilder, BrokerError> {
        let guard = self.session.read().await;
        let tokens = guard
            .as_ref()
            .ok_or_else(|| BrokerError::AuthExpired("no active session".to_string()))?;

        Ok(self
            .client
            .request(method, self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .header(CST_HEADER, &tokens.cst)
            .header(SECURITY_TOKEN_HEADER, &tokens.security_token))
    }

    /// Map non-2xx responses to broker errors
    async fn check(response: Response, context: &str) -> Result<Response, BrokerError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                Err(BrokerError::AuthExpired(format!("{}: {} - {}", context, status, text)))
            } else {
                Err(BrokerError::Rejected {
                    status: status.as_u16(),
                    message: format!("{}: {}", context, text),
                })
            }
        }
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    fn name(&self) -> &str {
        "broker-api"
    }

    async fn authenticate(&self) -> Result<(), BrokerError> {
        let req = SessionRequest {
            identifier: &self.identifier,
            password: &self.password,
        };

        let response = self
            .client
            .post(self.url("session"))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&req)
            .send()
            .await?;
        let response = Self::check(response, "Session").await?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| BrokerError::Decode(format!("session response missing {}", name)))
        };
        let tokens = SessionTokens {
            cst: header(CST_HEADER)?,
            security_token: header(SECURITY_TOKEN_HEADER)?,
        };

        *self.session.write().await = Some(tokens);
        info!("✓ Broker session established for {}", self.identifier);
        Ok(())
    }

    async fn account_summary(&self) -> Result<AccountSummary, BrokerError> {
        let response = self.authed(Method::GET, "accounts").await?.send().await?;
        let response = Self::check(response, "Accounts").await?;
        let body: AccountsResponse = response.json().await?;

        let account = match &self.account_id {
            Some(id) => body.accounts.into_iter().find(|a| &a.account_id == id),
            None => body.accounts.into_iter().next(),
        }
        .ok_or_else(|| {
            BrokerError::Decode(format!(
                "account {} not found",
                self.account_id.as_deref().unwrap_or("<any>")
            ))
        })?;

        debug!("Account {} balance {}", account.account_id, account.balance.balance);
        Ok(AccountSummary {
            account_id: account.account_id,
            balance: account.balance.balance,
            available: account.balance.available.unwrap_or(account.balance.balance),
        })
    }

    async fn open_positions(&self) -> Result<Vec<PositionRecord>, BrokerError> {
        let response = self.authed(Method::GET, "positions").await?.send().await?;
        let response = Self::check(response, "Positions").await?;
        let body: PositionsResponse = response.json().await?;

        Ok(body.positions.into_iter().map(PositionEntry::into_record).collect())
    }

    async fn open_position(&self, request: &OpenRequest) -> Result<DealConfirmation, BrokerError> {
        let req = CreatePositionRequest {
            epic: &request.instrument,
            direction: wire_direction(request.direction),
            size: request.size,
            stop_level: request.stop_loss,
            profit_level: request.take_profit,
        };

        let response = self
            .authed(Method::POST, "positions")
            .await?
            .json(&req)
            .send()
            .await?;
        let response = Self::check(response, "Open position").await?;
        let resp: DealReferenceResponse = response.json().await?;

        info!(
            "Opened {} {} {} (ref {})",
            request.direction, request.size, request.instrument, resp.deal_reference
        );
        Ok(DealConfirmation {
            deal_reference: resp.deal_reference,
        })
    }

    async fn close_position(&self, deal_id: &str) -> Result<DealConfirmation, BrokerError> {
        let path = format!("positions/{}", deal_id);
        let response = self.authed(Method::DELETE, &path).await?.send().await?;
        let response = Self::check(response, "Close position").await?;
        let resp: DealReferenceResponse = response.json().await?;

        info!("Closed {} (ref {})", deal_id, resp.deal_reference);
        Ok(DealConfirmation {
            deal_reference: resp.deal_reference,
        })
    }
}

fn wire_direction(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "BUY",
        Direction::Short => "SELL",
    }
}

fn parse_direction(raw: &str) -> Option<Direction> {
    match raw {
        "BUY" => Some(Direction::Long),
        "SELL" => Some(Direction::Short),
        _ => None,
    }
}

/// Broker timestamps come with or without an offset; offset-less ones are UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

// Request/Response types

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<AccountWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountWire {
    account_id: String,
    balance: BalanceWire,
}

#[derive(Debug, Deserialize)]
struct BalanceWire {
    balance: Decimal,
    #[serde(default)]
    available: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    positions: Vec<PositionEntry>,
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    #[serde(default)]
    position: PositionWire,
    #[serde(default)]
    market: MarketWire,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionWire {
    deal_id: Option<String>,
    direction: Option<String>,
    level: Option<Decimal>,
    size: Option<Decimal>,
    upl: Option<Decimal>,
    #[serde(rename = "createdDateUTC")]
    created_date_utc: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MarketWire {
    epic: Option<String>,
}

impl PositionEntry {
    fn into_record(self) -> PositionRecord {
        let p = self.position;
        let direction = p.direction.as_deref().and_then(parse_direction);
        if direction.is_none() && p.direction.is_some() {
            warn!("Unknown direction {:?} on deal {:?}", p.direction, p.deal_id);
        }

        PositionRecord {
            deal_id: p.deal_id,
            instrument: self.market.epic,
            direction,
            level: p.level,
            size: p.size,
            upl: p.upl,
            created_at: p.created_date_utc.as_deref().and_then(parse_timestamp),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePositionRequest<'a> {
    epic: &'a str,
    direction: &'static str,
    size: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_level: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    profit_level: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DealReferenceResponse {
    deal_reference: String,
}
