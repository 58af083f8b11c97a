// =============================================================================
// Central Application State
// =============================================================================
//
// Read-mostly view of the running process for the health API. Trackers and
// feeds own their own state; this only holds handles and counters that the
// supervisor and ingester publish.
// =============================================================================

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::feed::{FeedStatus, PriceFeedManager};

pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub feeds: Vec<Arc<PriceFeedManager>>,
    open_trackers: AtomicUsize,
    signals_accepted: AtomicU64,
    signals_rejected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub started_at: String,
    pub uptime_secs: i64,
    pub open_trackers: usize,
    pub signals_accepted: u64,
    pub signals_rejected: u64,
    pub feeds: Vec<FeedStatus>,
    pub server_time: i64,
}

impl AppState {
    pub fn new(feeds: Vec<Arc<PriceFeedManager>>) -> Self {
        Self {
            started_at: Utc::now(),
            feeds,
            open_trackers: AtomicUsize::new(0),
            signals_accepted: AtomicU64::new(0),
            signals_rejected: AtomicU64::new(0),
        }
    }

    pub fn set_open_trackers(&self, count: usize) {
        self.open_trackers.store(count, Ordering::Relaxed);
    }

    pub fn open_trackers(&self) -> usize {
        self.open_trackers.load(Ordering::Relaxed)
    }

    pub fn record_signal(&self, accepted: bool) {
        let counter = if accepted {
            &self.signals_accepted
        } else {
            &self.signals_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn health(&self) -> HealthSnapshot {
        let now = Utc::now();
        HealthSnapshot {
            status: "ok",
            started_at: self.started_at.to_rfc3339(),
            uptime_secs: (now - self.started_at).num_seconds(),
            open_trackers: self.open_trackers(),
            signals_accepted: self.signals_accepted.load(Ordering::Relaxed),
            signals_rejected: self.signals_rejected.load(Ordering::Relaxed),
            feeds: self.feeds.iter().map(|f| f.status()).collect(),
            server_time: now.timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{protocol_for, FeedSettings};
    use crate::types::Exchange;

    #[test]
    fn health_reports_counters_and_feeds() {
        let feed = Arc::new(PriceFeedManager::new(
            protocol_for(Exchange::Bingx),
            FeedSettings::default(),
        ));
        let _sub = feed.subscribe("BTCUSDT");
        let state = AppState::new(vec![feed]);
        state.set_open_trackers(3);
        state.record_signal(true);
        state.record_signal(false);
        state.record_signal(false);

        let health = state.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.open_trackers, 3);
        assert_eq!(health.signals_accepted, 1);
        assert_eq!(health.signals_rejected, 2);
        assert_eq!(health.feeds.len(), 1);
        assert_eq!(health.feeds[0].exchange, Exchange::Bingx);
        assert_eq!(health.feeds[0].symbols, vec!["BTCUSDT".to_string()]);
    }
}
