// =============================================================================
// Signal Tracker — Main Entry Point
// =============================================================================
//
// Startup order matters: the ledger must be readable before anything else
// runs, because the row allocator is seeded from it exactly once. A ledger
// that stays unreachable through every retry aborts the process.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod feed;
mod ingest;
mod ladder;
mod ledger;
mod notify;
mod position;
mod runtime_config;
mod supervisor;
mod tracker;
mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app_state::AppState;
use crate::feed::{protocol_for, FeedEvent, PriceFeedManager};
use crate::ingest::{SignalIngester, SIGNAL_QUEUE_CAPACITY};
use crate::ledger::{
    run_ledger_writer, with_retry, CsvSheetLedger, Ledger, LedgerHandle, LEDGER_QUEUE_CAPACITY,
};
use crate::notify::telegram::ChatIds;
use crate::notify::{run_alert_dispatcher, AlertSender, TelegramNotifier, ALERT_QUEUE_CAPACITY};
use crate::runtime_config::{AppConfig, CONFIG_PATH};
use crate::supervisor::{PositionSupervisor, RowAllocator};
use crate::types::Exchange;

const LOG_DIR: &str = "logs";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment, logging & config ─────────────────────────────────
    let _ = dotenv::dotenv();

    let file_appender = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, "bot.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Signal Tracker — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = AppConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let defaults = AppConfig::default();
        if let Err(e) = defaults.save(CONFIG_PATH) {
            warn!(error = %e, "Failed to write default config");
        }
        defaults
    });
    config.apply_env()?;
    config.validate().context("invalid tracker config")?;

    if config.telegram.bot_token.is_empty() {
        warn!("TOKEN is not set: alerts are only logged and no signals will be ingested");
    }

    // ── 2. Alerts ────────────────────────────────────────────────────────
    let (alerts, alert_rx) = AlertSender::channel(ALERT_QUEUE_CAPACITY);
    let chats = if config.telegram.bot_token.is_empty() {
        ChatIds::default()
    } else {
        config.chat_ids()
    };
    let notifier = Arc::new(TelegramNotifier::new(
        config.telegram.bot_token.clone(),
        chats,
        config.delivery_policy(),
    )?);
    tokio::spawn(run_alert_dispatcher(notifier, alert_rx));

    // ── 3. Ledger (fatal if unreachable) ─────────────────────────────────
    let policy = config.retry_policy();
    let ledger_path = config.ledger_path.clone();
    let sheet = with_retry(policy, "open_ledger", || {
        let path = ledger_path.clone();
        async move { CsvSheetLedger::open(path) }
    })
    .await
    .with_context(|| format!("ledger {ledger_path} is unreachable"))?;
    info!(path = %sheet.path().display(), "ledger opened");
    let ledger: Arc<dyn Ledger> = Arc::new(sheet);

    let open_rows = with_retry(policy, "unclosed_positions", || {
        let ledger = ledger.clone();
        async move { ledger.unclosed_positions().await }
    })
    .await
    .context("failed to read open positions from the ledger")?;

    let (first_free_row, next_order) = with_retry(policy, "allocate_next_row", || {
        let ledger = ledger.clone();
        async move { ledger.allocate_next_row_and_order_number().await }
    })
    .await
    .context("failed to seed row allocation from the ledger")?;

    info!(
        path = %ledger_path,
        open = open_rows.len(),
        first_free_row,
        next_order,
        "ledger loaded"
    );

    let (ledger_handle, ledger_rx) = LedgerHandle::channel(LEDGER_QUEUE_CAPACITY);
    tokio::spawn(run_ledger_writer(ledger.clone(), ledger_rx, policy, alerts.clone()));

    // ── 4. Price feeds ───────────────────────────────────────────────────
    let mut feeds: BTreeMap<Exchange, Arc<PriceFeedManager>> = BTreeMap::new();
    for exchange in &config.exchanges {
        if feeds.contains_key(exchange) {
            continue;
        }
        let feed = Arc::new(PriceFeedManager::new(
            protocol_for(*exchange),
            config.feed_settings(),
        ));
        tokio::spawn(forward_feed_events(*exchange, feed.events(), alerts.clone()));
        tokio::spawn(feed.clone().run());
        feeds.insert(*exchange, feed);
    }
    if !feeds.contains_key(&config.default_exchange) {
        warn!(
            default = %config.default_exchange,
            "default exchange has no feed enabled, falling back to the first feed"
        );
    }
    info!(count = feeds.len(), "Price feeds launched");

    // ── 5. Shared state & supervisor ─────────────────────────────────────
    let state = Arc::new(AppState::new(feeds.values().cloned().collect()));

    let mut supervisor = PositionSupervisor::new(
        feeds.clone(),
        config.default_exchange,
        ledger_handle,
        alerts.clone(),
        Arc::new(config.tracker_settings()),
        RowAllocator::new(first_free_row, next_order),
        state.clone(),
    );
    let resumed = supervisor.resume(open_rows);
    info!(resumed, "open positions resumed");

    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
    tokio::spawn(supervisor.run(signal_rx));

    // ── 6. Signal ingester ───────────────────────────────────────────────
    // Without a token the sender is kept here so the supervisor keeps
    // running for the resumed positions.
    let _idle_signals = if config.telegram.bot_token.is_empty() {
        Some(signal_tx)
    } else {
        let ingester = SignalIngester::new(
            &config.telegram.bot_token,
            config.ingest_interval(),
            signal_tx,
            alerts.clone(),
            state.clone(),
        )?;
        tokio::spawn(ingester.run());
        None
    };

    // ── 7. Health API ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");
    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    alerts.tech(format!("Tracker started, {resumed} open positions resumed"));
    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    for feed in feeds.values() {
        feed.shutdown();
    }

    info!(open_trackers = state.open_trackers(), "Signal Tracker shut down complete.");
    Ok(())
}

/// Relay connection transitions of one feed to the tech channel.
async fn forward_feed_events(
    exchange: Exchange,
    mut events: broadcast::Receiver<FeedEvent>,
    alerts: AlertSender,
) {
    loop {
        match events.recv().await {
            Ok(FeedEvent::Connected) => alerts.tech(format!("{exchange} price feed connected")),
            Ok(FeedEvent::Reconnected) => alerts.tech(format!("{exchange} price feed reconnected")),
            Ok(FeedEvent::Disconnected { reason }) => {
                alerts.tech(format!("{exchange} price feed disconnected: {reason}"))
            }
            Ok(FeedEvent::Retrying { delay }) => {
                info!(%exchange, delay_secs = delay.as_secs(), "feed reconnect scheduled");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%exchange, skipped, "feed event relay lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
