// =============================================================================
// Ledger — persistent record of every tracked position
// =============================================================================
//
// Trackers never touch the ledger directly. They hand `LedgerWrite` commands
// to a single writer task through a bounded queue; the writer applies each one
// with a fixed retry policy and raises a technical alert when it gives up.
// A failed write never rolls back the in-memory position.
// =============================================================================

pub mod row;
pub mod sheet;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::notify::AlertSender;
use crate::types::{Exchange, Side};

pub use row::{ResumedPosition, SheetRow};
pub use sheet::CsvSheetLedger;

/// Pending writes the writer task may fall behind by before trackers wait.
pub const LEDGER_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger file is malformed: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {0} is outside the position area of the ledger")]
    BadRow(u32),
}

/// Cells written when a new position is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPositionFields {
    pub order_number: u32,
    pub coin: String,
    pub side: Side,
    pub opened_at: String,
    pub entry_price: f64,
    pub targets: [f64; 5],
    pub exchange: Exchange,
}

/// Storage operations used by the supervisor and the writer task.
///
/// Every write is idempotent with respect to the final stored value, so a
/// retried write after an ambiguous failure is harmless.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Rows whose open flag is set, in sheet order.
    async fn unclosed_positions(&self) -> Result<Vec<SheetRow>, LedgerError>;

    /// `(first free row, next order number)`.
    async fn allocate_next_row_and_order_number(&self) -> Result<(u32, u32), LedgerError>;

    async fn write_new_position(&self, row: u32, fields: &NewPositionFields) -> Result<(), LedgerError>;

    /// Store `count` only if it is strictly greater than the stored count.
    /// Returns whether the row changed.
    async fn update_take_profit_count(&self, row: u32, count: u32) -> Result<bool, LedgerError>;

    async fn close_by_take_profit(&self, row: u32, count: u32) -> Result<(), LedgerError>;

    async fn close_by_stop(&self, row: u32, price: f64) -> Result<(), LedgerError>;

    async fn close_by_breakeven(&self, row: u32) -> Result<(), LedgerError>;

    async fn update_averaging(&self, row: u32, count: u32, price: f64) -> Result<(), LedgerError>;

    async fn mark_five_percent_alert_sent(&self, row: u32) -> Result<(), LedgerError>;
}

// ---------------------------------------------------------------------------
// Write commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerWrite {
    NewPosition { row: u32, fields: NewPositionFields },
    TakeProfitCount { row: u32, count: u32 },
    CloseByTakeProfit { row: u32, count: u32 },
    CloseByStop { row: u32, price: f64 },
    CloseByBreakeven { row: u32 },
    Averaging { row: u32, count: u32, price: f64 },
    FivePercentAlertSent { row: u32 },
}

impl LedgerWrite {
    pub fn row(&self) -> u32 {
        match self {
            Self::NewPosition { row, .. }
            | Self::TakeProfitCount { row, .. }
            | Self::CloseByTakeProfit { row, .. }
            | Self::CloseByStop { row, .. }
            | Self::CloseByBreakeven { row }
            | Self::Averaging { row, .. }
            | Self::FivePercentAlertSent { row } => *row,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewPosition { .. } => "write_new_position",
            Self::TakeProfitCount { .. } => "update_take_profit_count",
            Self::CloseByTakeProfit { .. } => "close_by_take_profit",
            Self::CloseByStop { .. } => "close_by_stop",
            Self::CloseByBreakeven { .. } => "close_by_breakeven",
            Self::Averaging { .. } => "update_averaging",
            Self::FivePercentAlertSent { .. } => "mark_five_percent_alert_sent",
        }
    }

    pub async fn apply(&self, ledger: &dyn Ledger) -> Result<(), LedgerError> {
        match self {
            Self::NewPosition { row, fields } => ledger.write_new_position(*row, fields).await,
            Self::TakeProfitCount { row, count } => {
                if !ledger.update_take_profit_count(*row, *count).await? {
                    debug!(row, count, "take-profit count already recorded");
                }
                Ok(())
            }
            Self::CloseByTakeProfit { row, count } => ledger.close_by_take_profit(*row, *count).await,
            Self::CloseByStop { row, price } => ledger.close_by_stop(*row, *price).await,
            Self::CloseByBreakeven { row } => ledger.close_by_breakeven(*row).await,
            Self::Averaging { row, count, price } => ledger.update_averaging(*row, *count, *price).await,
            Self::FivePercentAlertSent { row } => ledger.mark_five_percent_alert_sent(*row).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(10),
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` attempts have failed.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                error!(op = op_name, attempts, error = %e, "ledger operation failed, giving up");
                return Err(e);
            }
            Err(e) => {
                warn!(op = op_name, attempt, attempts, error = %e, "ledger operation failed, retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Cloneable producer side of the writer queue.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerWrite>,
}

impl LedgerHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LedgerWrite>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a write. Waits only when the writer is a full queue behind.
    pub async fn submit(&self, write: LedgerWrite) {
        let name = write.name();
        let row = write.row();
        if self.tx.send(write).await.is_err() {
            error!(op = name, row, "ledger writer is gone, write lost");
        }
    }
}

/// Apply queued writes in arrival order until every handle is dropped.
pub async fn run_ledger_writer(
    ledger: Arc<dyn Ledger>,
    mut rx: mpsc::Receiver<LedgerWrite>,
    policy: RetryPolicy,
    alerts: AlertSender,
) {
    info!("ledger writer started");
    while let Some(write) = rx.recv().await {
        let name = write.name();
        let row = write.row();
        match with_retry(policy, name, || write.apply(ledger.as_ref())).await {
            Ok(()) => debug!(op = name, row, "ledger write applied"),
            Err(e) => alerts.tech(format!(
                "Ledger write {name} for row {row} failed after {} attempts: {e}",
                policy.max_attempts
            )),
        }
    }
    info!("ledger writer stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use crate::notify::{Alert, AlertChannel};

    /// In-memory ledger that records every call and can fail on demand.
    #[derive(Default)]
    pub(crate) struct MemoryLedger {
        pub rows: Mutex<Vec<SheetRow>>,
        pub calls: Mutex<Vec<LedgerWrite>>,
        pub tp_counts: Mutex<BTreeMap<u32, u32>>,
        pub failures_left: AtomicU32,
        pub next_slot: Mutex<(u32, u32)>,
    }

    impl MemoryLedger {
        pub fn new() -> Self {
            Self {
                next_slot: Mutex::new((2, 1)),
                ..Default::default()
            }
        }

        pub fn writes(&self) -> Vec<LedgerWrite> {
            self.calls.lock().clone()
        }

        fn check(&self) -> Result<(), LedgerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(LedgerError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected failure",
                )));
            }
            Ok(())
        }

        fn record(&self, write: LedgerWrite) -> Result<(), LedgerError> {
            self.check()?;
            self.calls.lock().push(write);
            Ok(())
        }
    }

    #[async_trait]
    impl Ledger for MemoryLedger {
        async fn unclosed_positions(&self) -> Result<Vec<SheetRow>, LedgerError> {
            self.check()?;
            Ok(self.rows.lock().clone())
        }

        async fn allocate_next_row_and_order_number(&self) -> Result<(u32, u32), LedgerError> {
            self.check()?;
            Ok(*self.next_slot.lock())
        }

        async fn write_new_position(&self, row: u32, fields: &NewPositionFields) -> Result<(), LedgerError> {
            self.record(LedgerWrite::NewPosition {
                row,
                fields: fields.clone(),
            })
        }

        async fn update_take_profit_count(&self, row: u32, count: u32) -> Result<bool, LedgerError> {
            self.check()?;
            let mut counts = self.tp_counts.lock();
            let stored = counts.entry(row).or_insert(0);
            if count <= *stored {
                return Ok(false);
            }
            *stored = count;
            self.calls.lock().push(LedgerWrite::TakeProfitCount { row, count });
            Ok(true)
        }

        async fn close_by_take_profit(&self, row: u32, count: u32) -> Result<(), LedgerError> {
            self.record(LedgerWrite::CloseByTakeProfit { row, count })
        }

        async fn close_by_stop(&self, row: u32, price: f64) -> Result<(), LedgerError> {
            self.record(LedgerWrite::CloseByStop { row, price })
        }

        async fn close_by_breakeven(&self, row: u32) -> Result<(), LedgerError> {
            self.record(LedgerWrite::CloseByBreakeven { row })
        }

        async fn update_averaging(&self, row: u32, count: u32, price: f64) -> Result<(), LedgerError> {
            self.record(LedgerWrite::Averaging { row, count, price })
        }

        async fn mark_five_percent_alert_sent(&self, row: u32) -> Result<(), LedgerError> {
            self.record(LedgerWrite::FivePercentAlertSent { row })
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let ledger = MemoryLedger::new();
        ledger.failures_left.store(2, Ordering::SeqCst);

        let write = LedgerWrite::CloseByBreakeven { row: 4 };
        let result = with_retry(fast_policy(3), write.name(), || write.apply(&ledger)).await;
        assert!(result.is_ok());
        assert_eq!(ledger.writes(), vec![write]);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let ledger = MemoryLedger::new();
        ledger.failures_left.store(10, Ordering::SeqCst);

        let write = LedgerWrite::FivePercentAlertSent { row: 4 };
        let result = with_retry(fast_policy(3), write.name(), || write.apply(&ledger)).await;
        assert!(matches!(result, Err(LedgerError::Io(_))));
        assert_eq!(ledger.failures_left.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn writer_applies_in_order_and_alerts_on_exhaustion() {
        let ledger = Arc::new(MemoryLedger::new());
        let (handle, rx) = LedgerHandle::channel(16);
        let (alerts, mut alert_rx) = AlertSender::channel(16);

        let writer = tokio::spawn(run_ledger_writer(
            ledger.clone(),
            rx,
            fast_policy(2),
            alerts,
        ));

        handle.submit(LedgerWrite::TakeProfitCount { row: 2, count: 1 }).await;
        handle.submit(LedgerWrite::TakeProfitCount { row: 2, count: 1 }).await;
        handle
            .submit(LedgerWrite::Averaging {
                row: 2,
                count: 1,
                price: 90.0,
            })
            .await;
        drop(handle);
        writer.await.unwrap();

        assert_eq!(
            ledger.writes(),
            vec![
                LedgerWrite::TakeProfitCount { row: 2, count: 1 },
                LedgerWrite::Averaging {
                    row: 2,
                    count: 1,
                    price: 90.0
                },
            ]
        );
        assert!(alert_rx.try_recv().is_err());

        // Exhausted retries surface on the technical channel.
        let ledger = Arc::new(MemoryLedger::new());
        ledger.failures_left.store(5, Ordering::SeqCst);
        let (handle, rx) = LedgerHandle::channel(4);
        let (alerts, mut alert_rx) = AlertSender::channel(4);
        let writer = tokio::spawn(run_ledger_writer(ledger.clone(), rx, fast_policy(2), alerts));
        handle.submit(LedgerWrite::CloseByBreakeven { row: 9 }).await;
        drop(handle);
        writer.await.unwrap();

        let Alert { channel, text } = alert_rx.try_recv().unwrap();
        assert_eq!(channel, AlertChannel::Tech);
        assert!(text.contains("close_by_breakeven"));
        assert!(text.contains("row 9"));
    }

    #[tokio::test]
    async fn full_queue_holds_the_tracker_instead_of_dropping() {
        let (handle, mut rx) = LedgerHandle::channel(1);
        handle.submit(LedgerWrite::TakeProfitCount { row: 3, count: 1 }).await;

        let blocked = handle.clone();
        let second = tokio::spawn(async move {
            blocked.submit(LedgerWrite::TakeProfitCount { row: 3, count: 2 }).await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!second.is_finished());

        assert_eq!(rx.recv().await, Some(LedgerWrite::TakeProfitCount { row: 3, count: 1 }));
        second.await.unwrap();
        assert_eq!(rx.recv().await, Some(LedgerWrite::TakeProfitCount { row: 3, count: 2 }));
    }
}
