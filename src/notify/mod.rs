// =============================================================================
// Notifications — alert routing and the dispatcher task
// =============================================================================
//
// Producers (trackers, the ledger writer, feed monitors) never wait on the
// network. They push `Alert`s into a bounded queue through an `AlertSender`;
// when the queue is full the alert is dropped and logged. A single dispatcher
// task drains the queue and hands each alert to a `Notifier`.
// =============================================================================

pub mod telegram;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use telegram::TelegramNotifier;

/// Alerts buffered ahead of the dispatcher.
pub const ALERT_QUEUE_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertChannel {
    /// Take-profits and the five-percent warning.
    Main,
    /// Averaging fills and breakeven closes.
    Averaging,
    /// Connectivity and persistence problems.
    Tech,
}

impl std::fmt::Display for AlertChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Averaging => write!(f, "averaging"),
            Self::Tech => write!(f, "tech"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub channel: AlertChannel,
    pub text: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: AlertChannel, text: &str) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Producer handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<Alert>,
}

impl AlertSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an alert without waiting.
    pub fn send(&self, channel: AlertChannel, text: impl Into<String>) {
        let alert = Alert {
            channel,
            text: text.into(),
        };
        if let Err(e) = self.tx.try_send(alert) {
            let (reason, alert) = match e {
                mpsc::error::TrySendError::Full(a) => ("queue full", a),
                mpsc::error::TrySendError::Closed(a) => ("dispatcher stopped", a),
            };
            warn!(channel = %alert.channel, reason, text = %alert.text, "alert dropped");
        }
    }

    pub fn main(&self, text: impl Into<String>) {
        self.send(AlertChannel::Main, text);
    }

    pub fn averaging(&self, text: impl Into<String>) {
        self.send(AlertChannel::Averaging, text);
    }

    /// Technical alerts are always written to the log as well. Their text
    /// carries raw error strings, so it is escaped for HTML delivery.
    pub fn tech(&self, text: impl Into<String>) {
        let text = text.into();
        warn!(alert = %text, "technical alert");
        self.send(AlertChannel::Tech, escape_html(&text));
    }
}

/// Escape the characters Telegram's HTML parse mode treats as markup.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Deliver queued alerts one at a time until every sender is dropped.
pub async fn run_alert_dispatcher(notifier: Arc<dyn Notifier>, mut rx: mpsc::Receiver<Alert>) {
    info!("alert dispatcher started");
    while let Some(alert) = rx.recv().await {
        if let Err(e) = notifier.send(alert.channel, &alert.text).await {
            warn!(channel = %alert.channel, error = %e, "alert delivery failed");
        }
    }
    info!("alert dispatcher stopped");
}
