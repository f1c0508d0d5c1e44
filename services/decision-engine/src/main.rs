//! Decision Engine - trading loop for one account and instrument
//!
//! 1. Loads configuration (file + ENGINE_* environment)
//! 2. Builds the broker (paper or live) and the indicator feed
//! 3. Restores the position tracker from the state directory
//! 4. Runs ticks until Ctrl-C

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use decision_engine::{
    BrokerClient, DecisionEngine, DecisionJournal, EngineConfig, HttpBrokerClient,
    HttpIndicatorProvider, IndicatorProvider, JsonFileStore, PaperBroker, PositionTracker,
    TradingMode,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Decision Engine...");

    let config = EngineConfig::load().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        "Instrument: {}, mode: {}, state dir: {}",
        config.instrument,
        config.trading_mode.as_str(),
        config.state_dir.display()
    );

    let indicators: Arc<dyn IndicatorProvider> = Arc::new(HttpIndicatorProvider::new(
        &config.indicators.base_url,
        config.indicators.timeout_secs,
    )?);

    let broker: Arc<dyn BrokerClient> = match config.trading_mode {
        TradingMode::Paper => Arc::new(PaperBroker::new(
            config.account_id.clone().unwrap_or_else(|| "paper".to_string()),
            config.paper.starting_balance,
            config.paper.slippage_bps,
            indicators.clone(),
        )),
        TradingMode::Live => Arc::new(HttpBrokerClient::new(
            &config.broker,
            config.account_id.clone(),
        )?),
    };

    // The first tick retries through the session anyway
    if let Err(e) = broker.authenticate().await {
        warn!("Initial authentication failed: {}", e);
    }

    let tracker_path = config.tracker_path();
    let tracker = PositionTracker::open(Box::new(JsonFileStore::new(&tracker_path))).await;
    info!("Tracking {} positions from {}", tracker.len(), tracker_path.display());

    let engine = DecisionEngine::new(&config, broker, indicators, tracker)
        .with_journal(DecisionJournal::new(&config.state_dir));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, finishing current tick");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl-C: {}", e);
                // Hold the sender so the engine runs without a shutdown signal
                let _keep_alive = shutdown_tx;
                std::future::pending::<()>().await;
            }
        }
    });

    engine.run(shutdown_rx).await
}
