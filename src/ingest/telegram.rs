// =============================================================================
// Telegram channel poller
// =============================================================================
//
// Polls `getUpdates?offset=-1`, which always returns only the newest update.
// The first successful poll just records where the channel is; every later
// change of update id is a fresh post that gets parsed and handed to the
// supervisor.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::parser::parse_signal;
use crate::app_state::AppState;
use crate::notify::AlertSender;
use crate::types::NormalizedSignal;

const TELEGRAM_API: &str = "https://api.telegram.org";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub channel_post: Option<ChannelPost>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelPost {
    #[serde(default)]
    pub text: Option<String>,
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Remembers the last update id seen.
#[derive(Debug, Default)]
pub struct UpdateCursor {
    last_id: Option<i64>,
}

impl UpdateCursor {
    /// Returns the post text when `update` is new. The very first update only
    /// primes the cursor so that a restart never replays an old post.
    pub fn observe<'a>(&mut self, update: &'a Update) -> Option<&'a str> {
        let previous = self.last_id.replace(update.update_id);
        match previous {
            None => None,
            Some(id) if id == update.update_id => None,
            Some(_) => update
                .channel_post
                .as_ref()
                .and_then(|post| post.text.as_deref()),
        }
    }
}

/// Tracks Telegram reachability and reports transitions only.
#[derive(Debug, Default)]
struct Connectivity {
    online: Option<bool>,
}

impl Connectivity {
    /// `Some(state)` when reachability changed since the last poll.
    fn observe(&mut self, online: bool) -> Option<bool> {
        match self.online.replace(online) {
            Some(previous) if previous == online => None,
            // Coming up the first time is not news.
            None if online => None,
            _ => Some(online),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingester
// ---------------------------------------------------------------------------

pub struct SignalIngester {
    client: Client,
    updates_url: String,
    poll_interval: Duration,
    signals: mpsc::Sender<NormalizedSignal>,
    alerts: AlertSender,
    state: Arc<AppState>,
}

impl SignalIngester {
    pub fn new(
        bot_token: &str,
        poll_interval: Duration,
        signals: mpsc::Sender<NormalizedSignal>,
        alerts: AlertSender,
        state: Arc<AppState>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build Telegram HTTP client")?;
        Ok(Self {
            client,
            updates_url: format!("{TELEGRAM_API}/bot{bot_token}/getUpdates?offset=-1"),
            poll_interval,
            signals,
            alerts,
            state,
        })
    }

    async fn fetch_latest(&self) -> Result<Option<Update>> {
        let response: GetUpdatesResponse = self
            .client
            .get(&self.updates_url)
            .send()
            .await
            .context("getUpdates request failed")?
            .error_for_status()
            .context("getUpdates returned an error status")?
            .json()
            .await
            .context("getUpdates body is not valid JSON")?;
        if !response.ok {
            anyhow::bail!("getUpdates answered ok=false");
        }
        Ok(response.result.into_iter().last())
    }

    /// Parse one post and forward it. Returns `false` once the supervisor
    /// side of the queue is gone.
    pub async fn handle_post(&self, text: &str) -> bool {
        match parse_signal(text) {
            Ok(signal) => {
                info!(coin = %signal.coin, side = %signal.side, "signal parsed");
                self.state.record_signal(true);
                self.signals.send(signal).await.is_ok()
            }
            Err(e) => {
                warn!(error = %e, "post is not a valid signal, skipped");
                debug!(text = %text, "rejected post");
                self.state.record_signal(false);
                true
            }
        }
    }

    /// Poll until the supervisor stops accepting signals.
    pub async fn run(self) {
        let mut cursor = UpdateCursor::default();
        let mut connectivity = Connectivity::default();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.poll_interval.as_millis() as u64, "signal ingester started");
        loop {
            ticker.tick().await;

            let latest = match self.fetch_latest().await {
                Ok(latest) => {
                    if connectivity.observe(true) == Some(true) {
                        info!("Telegram API reachable again");
                        self.alerts.tech("Telegram API connection restored");
                    }
                    latest
                }
                Err(e) => {
                    if connectivity.observe(false) == Some(false) {
                        self.alerts.tech(format!("Telegram API unreachable: {e:#}"));
                    }
                    debug!(error = %e, "poll failed");
                    continue;
                }
            };

            let Some(update) = latest else { continue };
            if let Some(text) = cursor.observe(&update) {
                if !self.handle_post(text).await {
                    info!("signal queue closed, ingester stopping");
                    break;
                }
            }
        }
    }
}
