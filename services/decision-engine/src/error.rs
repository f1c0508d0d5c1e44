//! Error types for the engine's collaborator boundaries

/// Errors returned by a broker client
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Broker session expired: {0}")]
    AuthExpired(String),

    #[error("Broker rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid broker response: {0}")]
    Decode(String),

    #[error("Incomplete position record {deal_id}: missing {field}")]
    IncompleteRecord { deal_id: String, field: &'static str },
}

impl BrokerError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, BrokerError::AuthExpired(_))
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BrokerError::Decode(e.to_string())
        } else {
            BrokerError::Transport(e.to_string())
        }
    }
}

/// Errors returned by an indicator provider
#[derive(Debug, thiserror::Error)]
pub enum IndicatorError {
    #[error("Indicator request failed: {0}")]
    Transport(String),

    #[error("Indicator service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid feature snapshot: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for IndicatorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            IndicatorError::InvalidResponse(e.to_string())
        } else {
            IndicatorError::Transport(e.to_string())
        }
    }
}

/// Errors from the tracker's durable store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Tracker store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tracker store is corrupt: {0}")]
    Corrupt(String),
}
