// =============================================================================
// Position Tracker — one task per open position
// =============================================================================
//
//   Initializing --first price--> Active --final TP | breakeven--> Closed
//
// A tracker owns its `Position` outright. It polls a private tick buffer on a
// fixed interval, evaluates only the newest price, and turns the resulting
// events into ledger writes and alerts. Neither hand-off waits on the network.
// =============================================================================

pub mod messages;
mod runner;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::feed::PriceFeedManager;
use crate::ledger::{LedgerHandle, ResumedPosition};
use crate::notify::AlertSender;
use crate::position::{LadderSettings, LedgerSlot};
use crate::types::NormalizedSignal;

pub use runner::run_tracker;

/// Knobs shared by every tracker.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub ladder: LadderSettings,
    pub poll_interval: Duration,
    /// Offset of the timezone used for opened-at stamps.
    pub utc_offset_hours: i32,
    /// Appended to every position alert.
    pub footer: Option<String>,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            ladder: LadderSettings::default(),
            poll_interval: Duration::from_millis(300),
            utc_offset_hours: 3,
            footer: None,
        }
    }
}

/// How a tracker came to exist.
#[derive(Debug, Clone)]
pub enum TrackerLaunch {
    New {
        signal: NormalizedSignal,
        slot: LedgerSlot,
    },
    Resumed(ResumedPosition),
}

impl TrackerLaunch {
    pub fn coin(&self) -> &str {
        match self {
            Self::New { signal, .. } => &signal.coin,
            Self::Resumed(resumed) => &resumed.coin,
        }
    }

    pub fn order_number(&self) -> u32 {
        match self {
            Self::New { slot, .. } => slot.order_number,
            Self::Resumed(resumed) => resumed.order_number,
        }
    }
}

/// Collaborators a tracker talks to.
#[derive(Clone)]
pub struct TrackerContext {
    pub feed: Arc<PriceFeedManager>,
    pub ledger: LedgerHandle,
    pub alerts: AlertSender,
    pub settings: Arc<TrackerSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackerState {
    Initializing,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    FinalTakeProfit,
    Breakeven,
    /// A resumed ledger row had no targets left.
    ResumedClosed,
}

/// What a finished tracker reports to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerOutcome {
    pub order_number: u32,
    pub row: u32,
    pub coin: String,
    pub reason: CloseReason,
}
