use chrono::Utc;
use holdfast::application::actors::PriceFeed;
use holdfast::application::handlers::{router, ApiState};
use holdfast::application::services::{Agent, AgentContext, PositionLedger, StateWriter};
use holdfast::config::AgentConfig;
use holdfast::domain::repositories::{
    EntrySignalSource, LivePriceSource, MarketData, NoEntrySignals, StateStore,
};
use holdfast::infrastructure::{HttpEntrySignals, HttpMarketData, PaperExecutor};
use holdfast::persistence::{init_database, SqliteStateStore};
use holdfast::rate_limit::create_rate_limiter;
use holdfast::secrets::load_feed_api_key;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "holdfast=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Holdfast agent starting...");

    let config = AgentConfig::from_env();
    config.validate()?;

    // State store and restore
    let pool = init_database(&config.database_url).await?;
    let store = Arc::new(SqliteStateStore::new(pool));
    let ctx = match store.load().await {
        Ok(Some(snapshot)) => AgentContext::restore(&config, snapshot),
        Ok(None) => {
            info!("No saved state; starting fresh");
            AgentContext::new(&config, Utc::now())
        }
        Err(e) => {
            error!("Saved state could not be read ({}); starting fresh", e);
            AgentContext::new(&config, Utc::now())
        }
    };

    // Live feed
    let feed = Arc::new(PriceFeed::new(config.feed.clone(), load_feed_api_key()?)?);
    let live_prices = feed.price_stream(config.feed.event_buffer).await;
    if feed.is_configured() {
        feed.connect().await?;
    } else {
        warn!("No live feed configured; exits rely on polling only");
    }

    // Collaborators
    let market: Arc<dyn MarketData> = Arc::new(HttpMarketData::new(&config.market_data)?);
    let executor = Arc::new(PaperExecutor::new(
        market.clone(),
        config.agent.paper_starting_balance,
        config.agent.paper_slippage_bps,
        config.agent.paper_fee_bps,
    ));
    {
        let book = ctx.book.lock().await;
        for position in book.snapshot() {
            executor.credit_holding(&position.asset, position.quantity).await;
        }
    }
    {
        let survival = ctx.survival.lock().await;
        if let Some(reserve) = survival.config().reserve_asset.as_deref() {
            let held = survival.state().reserve_balance;
            if held > 0.0 {
                executor.credit_holding(reserve, held).await;
            }
        }
    }
    let entries: Arc<dyn EntrySignalSource> = match config.entry_signal_url.as_deref() {
        Some(url) => Arc::new(HttpEntrySignals::new(url, config.market_data.request_timeout)?),
        None => {
            info!("No entry signal source configured; the agent will only manage exits");
            Arc::new(NoEntrySignals)
        }
    };

    let (urgent_tx, urgent_rx) = mpsc::channel(config.agent.urgent_channel_capacity);
    let ledger = Arc::new(PositionLedger::new(
        ctx.book.clone(),
        market.clone(),
        feed.clone() as Arc<dyn LivePriceSource>,
        &config.agent,
        &config.market_data,
        urgent_tx,
    ));
    ledger.track_all().await;

    let journal: Arc<dyn StateStore> = store.clone();
    let writer = Arc::new(StateWriter::new(
        ctx.clone(),
        journal.clone(),
        config.agent.persist_debounce,
    ));
    let agent = Arc::new(Agent::new(
        ctx,
        ledger.clone(),
        executor,
        market,
        entries,
        journal,
        writer.clone(),
        config.agent.clone(),
        config.survival.reserve_asset.clone(),
    ));

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        writer.clone().spawn(shutdown_rx.clone()),
        ledger.spawn_live_watcher(live_prices, shutdown_rx.clone()),
        agent.clone().spawn_urgent_exits(urgent_rx, shutdown_rx.clone()),
        agent.clone().spawn_loop(shutdown_rx),
    ];

    let app = router(
        ApiState {
            agent: agent.clone(),
            feed: feed.clone(),
            journal: store,
        },
        create_rate_limiter(config.api_requests_per_minute),
    );

    let listener = tokio::net::TcpListener::bind(&config.api_bind).await?;
    info!("Listening on {}", config.api_bind);
    let server = axum::serve(listener, app);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Agent started. Press Ctrl+C to stop.");
    server.with_graceful_shutdown(shutdown_signal).await?;

    info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    feed.disconnect().await;
    // failures are logged by the writer
    let _ = writer.flush_now().await;

    info!("Shutdown complete");
    Ok(())
}
