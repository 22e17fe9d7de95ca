// =============================================================================
// ta-pulse — Main Entry Point
// =============================================================================
//
// Streams public Binance trades, maintains candles and indicators for every
// configured (symbol, timeframe), and serves them over REST and WebSocket.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ta_pulse::api;
use ta_pulse::app_state::AppState;
use ta_pulse::stream::BinanceSource;
use ta_pulse::RuntimeConfig;

const CONFIG_PATH: &str = "ta_pulse.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("ta-pulse starting up");

    let mut config = RuntimeConfig::load_or_default(CONFIG_PATH);
    config.apply_env().context("invalid environment override")?;
    config.validate().context("invalid runtime config")?;

    info!(
        symbols = ?config.symbols,
        timeframes = ?config.timeframes,
        history_len = config.history_len,
        "configured series"
    );

    // ── 2. Upstream & engine ─────────────────────────────────────────────
    let source = Arc::new(BinanceSource::new()?);
    let engine = ta_pulse::start(config.clone(), source).await?;

    // ── 3. API server ────────────────────────────────────────────────────
    let state = Arc::new(AppState::from_engine(config.clone(), &engine));
    let app = api::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    engine.shutdown().await;
    server.abort();

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("ta-pulse stopped");
    Ok(())
}
