// =============================================================================
// Position Supervisor — spawns and reaps trackers
// =============================================================================
//
// The supervisor is the only place ledger slots are handed out. It is seeded
// once from the ledger at startup and from then on counts forward, so two
// signals arriving back to back can never share a row.
//
// Trackers are never restarted or re-entered: a tracker that finished (or
// panicked) is reaped and forgotten.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::feed::PriceFeedManager;
use crate::ledger::{LedgerHandle, ResumedPosition, SheetRow};
use crate::notify::AlertSender;
use crate::position::LedgerSlot;
use crate::tracker::{run_tracker, TrackerContext, TrackerLaunch, TrackerOutcome, TrackerSettings};
use crate::types::{Exchange, NormalizedSignal};

const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Strictly increasing (row, order number) source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowAllocator {
    next_row: u32,
    next_order: u32,
}

impl RowAllocator {
    pub fn new(first_free_row: u32, next_order_number: u32) -> Self {
        Self {
            next_row: first_free_row.max(2),
            next_order: next_order_number.max(1),
        }
    }

    pub fn allocate(&mut self) -> LedgerSlot {
        let slot = LedgerSlot {
            row: self.next_row,
            order_number: self.next_order,
        };
        self.next_row += 1;
        self.next_order += 1;
        slot
    }
}

struct TrackerHandle {
    order_number: u32,
    coin: String,
    handle: JoinHandle<TrackerOutcome>,
}

pub struct PositionSupervisor {
    feeds: BTreeMap<Exchange, Arc<PriceFeedManager>>,
    default_exchange: Exchange,
    ledger: LedgerHandle,
    alerts: AlertSender,
    settings: Arc<TrackerSettings>,
    allocator: RowAllocator,
    state: Arc<AppState>,
    trackers: Vec<TrackerHandle>,
}

impl PositionSupervisor {
    pub fn new(
        feeds: BTreeMap<Exchange, Arc<PriceFeedManager>>,
        default_exchange: Exchange,
        ledger: LedgerHandle,
        alerts: AlertSender,
        settings: Arc<TrackerSettings>,
        allocator: RowAllocator,
        state: Arc<AppState>,
    ) -> Self {
        Self {
            feeds,
            default_exchange,
            ledger,
            alerts,
            settings,
            allocator,
            state,
            trackers: Vec::new(),
        }
    }

    pub fn live_trackers(&self) -> usize {
        self.trackers.len()
    }

    /// Pick the feed for `requested`, falling back to the default exchange.
    fn feed_for(&self, requested: Option<Exchange>) -> Option<Arc<PriceFeedManager>> {
        let wanted = requested.unwrap_or(self.default_exchange);
        if let Some(feed) = self.feeds.get(&wanted) {
            return Some(feed.clone());
        }
        warn!(requested = %wanted, fallback = %self.default_exchange, "no feed for exchange, using default");
        self.feeds
            .get(&self.default_exchange)
            .or_else(|| self.feeds.values().next())
            .cloned()
    }

    fn spawn(&mut self, launch: TrackerLaunch, feed: Arc<PriceFeedManager>) {
        let order_number = launch.order_number();
        let coin = launch.coin().to_string();
        let ctx = TrackerContext {
            feed,
            ledger: self.ledger.clone(),
            alerts: self.alerts.clone(),
            settings: self.settings.clone(),
        };
        let handle = tokio::spawn(run_tracker(launch, ctx));
        self.trackers.push(TrackerHandle {
            order_number,
            coin,
            handle,
        });
        self.state.set_open_trackers(self.trackers.len());
    }

    /// Start trackers for positions left open by a previous run.
    ///
    /// Rows that do not parse are logged and skipped.
    pub fn resume(&mut self, rows: Vec<SheetRow>) -> usize {
        let mut started = 0;
        for row in rows {
            let resumed = match ResumedPosition::from_sheet_row(&row) {
                Ok(resumed) => resumed,
                Err(e) => {
                    error!(row = row.row, error = %e, "skipping unreadable ledger row");
                    continue;
                }
            };
            let Some(feed) = self.feed_for(resumed.exchange) else {
                error!(row = row.row, "no price feed available, row not resumed");
                continue;
            };
            info!(order = resumed.order_number, coin = %resumed.coin, exchange = %feed.exchange(), "resuming position");
            self.spawn(TrackerLaunch::Resumed(resumed), feed);
            started += 1;
        }
        started
    }

    /// Start a tracker for a freshly accepted signal.
    pub fn accept_signal(&mut self, signal: NormalizedSignal) -> Option<LedgerSlot> {
        let Some(feed) = self.feed_for(signal.exchange) else {
            error!(coin = %signal.coin, "no price feed available, signal dropped");
            return None;
        };
        let slot = self.allocator.allocate();
        info!(
            order = slot.order_number,
            row = slot.row,
            coin = %signal.coin,
            side = %signal.side,
            exchange = %feed.exchange(),
            "new signal accepted"
        );
        self.spawn(TrackerLaunch::New { signal, slot }, feed);
        Some(slot)
    }

    /// Drop handles of finished trackers.
    pub fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .trackers
            .drain(..)
            .partition(|t| t.handle.is_finished());
        self.trackers = running;

        for mut tracker in finished {
            match (&mut tracker.handle).now_or_never() {
                Some(Ok(outcome)) => info!(
                    order = outcome.order_number,
                    coin = %outcome.coin,
                    reason = ?outcome.reason,
                    "tracker finished"
                ),
                Some(Err(e)) => {
                    error!(order = tracker.order_number, coin = %tracker.coin, error = %e, "tracker task failed");
                    self.alerts.tech(format!(
                        "Tracker for order {} ({}) stopped unexpectedly: {e}",
                        tracker.order_number, tracker.coin
                    ));
                }
                None => {}
            }
        }
        self.state.set_open_trackers(self.trackers.len());
    }

    /// Accept signals until the ingester goes away, then wait for the
    /// remaining trackers to close.
    pub async fn run(mut self, mut signals: mpsc::Receiver<NormalizedSignal>) {
        let mut reap_timer = tokio::time::interval(REAP_INTERVAL);
        let mut accepting = true;

        loop {
            tokio::select! {
                signal = signals.recv(), if accepting => match signal {
                    Some(signal) => {
                        self.accept_signal(signal);
                    }
                    None => {
                        info!(live = self.live_trackers(), "signal source closed");
                        accepting = false;
                    }
                },
                _ = reap_timer.tick() => {
                    self.reap();
                    if !accepting && self.trackers.is_empty() {
                        break;
                    }
                }
            }
        }
        info!("supervisor stopped");
    }
}
