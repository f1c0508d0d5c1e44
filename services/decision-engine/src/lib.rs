//! Decision Engine Library
//!
//! Position lifecycle and trading decisions for one (account, instrument)
//! stream: entry signals, position sizing, exit rules and the durable
//! high-water-mark tracker, driven by a polling tick loop.

pub mod broker;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod exit;
pub mod indicators;
pub mod journal;
pub mod paper;
pub mod signal;
pub mod sizing;
pub mod tracker;
pub mod types;

// Re-export main types for convenience
pub use broker::{AccountSummary, BrokerClient, BrokerSession, DealConfirmation, OpenRequest, PositionRecord};
pub use client::HttpBrokerClient;
pub use config::{EngineConfig, TradingMode};
pub use engine::{CloseOutcome, DecisionEngine, TickReport};
pub use error::{BrokerError, IndicatorError, StoreError};
pub use exit::{CloseAction, ExitEvaluator, ExitParams, ExitReport, PositionEvaluation};
pub use indicators::{HttpIndicatorProvider, IndicatorProvider};
pub use journal::DecisionJournal;
pub use paper::PaperBroker;
pub use signal::{SignalEvaluator, SignalParams};
pub use sizing::{PositionSizer, Sizing, SizingParams};
pub use tracker::{JsonFileStore, MemoryStore, PositionTracker, TrackerStore};
pub use types::{
    Action, Decision, Direction, FeatureSnapshot, OpenPosition, PositionCounts, RiskLimits,
    Signal, TrendLabel,
};
