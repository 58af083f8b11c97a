// =============================================================================
// Position — the path-dependent take-profit / averaging / breakeven machine
// =============================================================================
//
// A `Position` is owned by exactly one tracker and mutated only through
// `evaluate`, which is pure with respect to the outside world: it returns the
// events that happened and leaves persistence and notification to the caller.
//
// Per evaluation, against a single (latest) price:
//   1. Five-percent alert   -> once per position
//   2. Take-profit          -> at most one target, skipped in breakeven mode
//   3. Breakeven            -> only in breakeven mode, closes the position
//   4. Averaging            -> at most one fill; third fill enables breakeven
//                              mode permanently
//
// A close in step 2 or 3 ends the evaluation.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::ladder::{
    self, compute_averaging_ladder, compute_breakeven, recompute_volumes_after_partial_close,
    AveragingStep, VolumeStep, AVERAGING_STEPS,
};
use crate::ledger::ResumedPosition;
use crate::types::{Exchange, NormalizedSignal, Side};

/// Averaging fill number from which breakeven mode is active.
const BREAKEVEN_MODE_FILL: u32 = 3;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Numeric parameters of the ladder machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderSettings {
    /// Notional volume of the initial entry.
    pub entry_volume: f64,
    /// Distance of each averaging step from the running average.
    pub averaging_percentages: [f64; AVERAGING_STEPS],
    /// Round-trip fee used for the breakeven price.
    pub fee_rate: f64,
    /// Adverse move (fraction of entry) that triggers the averaging-request alert.
    pub five_percent_threshold: f64,
    /// Fraction of the entry volume released by each non-final take-profit.
    pub take_profit_volume_fraction: f64,
}

impl Default for LadderSettings {
    fn default() -> Self {
        Self {
            entry_volume: 1000.0,
            averaging_percentages: [0.1, 0.2, 0.2, 0.4, 0.8],
            fee_rate: 0.0008,
            five_percent_threshold: 0.05,
            take_profit_volume_fraction: 0.2,
        }
    }
}

/// Ledger coordinates handed to a tracker by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSlot {
    pub row: u32,
    pub order_number: u32,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Something the state machine decided during one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    /// Price moved against the position beyond the alert threshold.
    FivePercentAlert { price: f64, change_pct: f64 },
    /// A target was reached. `final_target` means the position is now closed.
    TakeProfit {
        number: u32,
        target: f64,
        price: f64,
        final_target: bool,
    },
    /// Price returned to breakeven after the third averaging fill. Terminal.
    Breakeven { breakeven: f64, price: f64 },
    /// An averaging step was filled.
    Averaged {
        number: u32,
        trigger_price: f64,
        average_price: f64,
        breakeven: f64,
        total_volume: f64,
        price: f64,
        breakeven_mode_started: bool,
    },
}

impl PositionEvent {
    /// `true` for events after which the position is closed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TakeProfit {
                final_target: true,
                ..
            } | Self::Breakeven { .. }
        )
    }
}

/// A single tracked signal position.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub order_number: u32,
    pub row: u32,
    pub coin: String,
    pub side: Side,
    pub exchange: Exchange,
    pub entry_price: f64,
    pub entry_volume: f64,
    /// "dd.mm, HH:MM" in the alert timezone.
    pub opened_at: String,
    pub stop_loss: Option<f64>,
    /// Targets not yet reached, front first.
    pub targets: VecDeque<f64>,
    /// Averaging steps not yet filled, in ladder order.
    pub averaging_steps: Vec<AveragingStep>,
    /// Fill sizes aligned with `averaging_steps`.
    pub volume_projection: Vec<VolumeStep>,
    pub tp_count: u32,
    pub averaging_count: u32,
    pub breakeven: f64,
    pub total_volume: f64,
    pub five_percent_alert_sent: bool,
    pub breakeven_mode: bool,
    pub status: PositionStatus,
}

impl Position {
    /// Open a position for a fresh signal at the first observed price.
    pub fn open(
        slot: LedgerSlot,
        signal: &NormalizedSignal,
        exchange: Exchange,
        entry_price: f64,
        opened_at: String,
        settings: &LadderSettings,
    ) -> Self {
        let averaging_steps = compute_averaging_ladder(
            signal.side,
            entry_price,
            settings.entry_volume,
            &settings.averaging_percentages,
        );
        let volume_projection = averaging_steps
            .iter()
            .map(|s| VolumeStep {
                fill_volume: s.fill_volume,
                cumulative_volume: s.cumulative_volume,
            })
            .collect();

        Self {
            order_number: slot.order_number,
            row: slot.row,
            coin: signal.coin.clone(),
            side: signal.side,
            exchange,
            entry_price,
            entry_volume: settings.entry_volume,
            opened_at,
            stop_loss: Some(signal.stop_loss),
            targets: signal.targets.iter().copied().collect(),
            averaging_steps,
            volume_projection,
            tp_count: 0,
            averaging_count: 0,
            breakeven: compute_breakeven(signal.side, entry_price, settings.fee_rate),
            total_volume: settings.entry_volume,
            five_percent_alert_sent: false,
            breakeven_mode: false,
            status: PositionStatus::Open,
        }
    }

    /// Rebuild a position from a ledger row left open by a previous run.
    ///
    /// Consumed targets and averaging steps are discarded, the total volume is
    /// reduced for every recorded take-profit, and the breakeven is derived
    /// from the average price of the last recorded fill. A row with every
    /// target consumed comes back already closed.
    pub fn resume(resumed: &ResumedPosition, exchange: Exchange, settings: &LadderSettings) -> Self {
        let ladder = compute_averaging_ladder(
            resumed.side,
            resumed.entry_price,
            settings.entry_volume,
            &settings.averaging_percentages,
        );

        let tp_count = resumed.tp_count.min(resumed.targets.len() as u32);
        let averaging_count = resumed.averaging_count.min(AVERAGING_STEPS as u32);

        let targets: VecDeque<f64> = resumed.targets[tp_count as usize..].iter().copied().collect();
        let total_volume = settings.entry_volume
            - tp_count as f64 * settings.entry_volume * settings.take_profit_volume_fraction;

        let averaging_steps: Vec<AveragingStep> = ladder[averaging_count as usize..].to_vec();
        let mut volume_projection = recompute_volumes_after_partial_close(total_volume);
        volume_projection.truncate(averaging_steps.len());

        let reference_price = if averaging_count > 0 {
            ladder[averaging_count as usize - 1].average_price
        } else {
            resumed.entry_price
        };

        let status = if targets.is_empty() {
            PositionStatus::Closed
        } else {
            PositionStatus::Open
        };

        Self {
            order_number: resumed.order_number,
            row: resumed.row,
            coin: resumed.coin.clone(),
            side: resumed.side,
            exchange,
            entry_price: resumed.entry_price,
            entry_volume: settings.entry_volume,
            opened_at: resumed.opened_at.clone(),
            stop_loss: None,
            targets,
            averaging_steps,
            volume_projection,
            tp_count,
            averaging_count,
            breakeven: compute_breakeven(resumed.side, reference_price, settings.fee_rate),
            total_volume,
            five_percent_alert_sent: resumed.five_percent_alert_sent,
            breakeven_mode: averaging_count >= BREAKEVEN_MODE_FILL,
            status,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Run one cycle of the state machine against `price`.
    ///
    /// A closed position never changes and yields no events.
    pub fn evaluate(&mut self, price: f64, settings: &LadderSettings) -> Vec<PositionEvent> {
        let mut events = Vec::new();
        if self.is_closed() || !price.is_finite() || price <= 0.0 {
            return events;
        }

        if let Some(event) = self.check_five_percent(price, settings) {
            events.push(event);
        }

        if self.breakeven_mode {
            if self.side.reached_profit(price, self.breakeven) {
                self.status = PositionStatus::Closed;
                events.push(PositionEvent::Breakeven {
                    breakeven: self.breakeven,
                    price,
                });
                return events;
            }
        } else if let Some(event) = self.check_take_profit(price, settings) {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }

        if let Some(event) = self.check_averaging(price, settings) {
            events.push(event);
        }

        events
    }

    fn check_five_percent(&mut self, price: f64, settings: &LadderSettings) -> Option<PositionEvent> {
        if self.five_percent_alert_sent {
            return None;
        }
        let change = (price - self.entry_price) / self.entry_price;
        let breached = match self.side {
            Side::Long => change < -settings.five_percent_threshold,
            Side::Short => change > settings.five_percent_threshold,
        };
        if !breached {
            return None;
        }
        self.five_percent_alert_sent = true;
        Some(PositionEvent::FivePercentAlert {
            price,
            change_pct: change * 100.0,
        })
    }

    /// Targets are strictly monotonic in the profit direction, so the first
    /// crossing in list order is always the front of the ladder.
    fn check_take_profit(&mut self, price: f64, settings: &LadderSettings) -> Option<PositionEvent> {
        let target = *self.targets.front()?;
        if !self.side.reached_profit(price, target) {
            return None;
        }

        self.tp_count += 1;
        let final_target = self.targets.len() == 1;
        self.targets.pop_front();

        if final_target {
            self.status = PositionStatus::Closed;
        } else {
            self.total_volume -= self.entry_volume * settings.take_profit_volume_fraction;
            let mut projection = recompute_volumes_after_partial_close(self.total_volume);
            projection.truncate(self.averaging_steps.len());
            self.volume_projection = projection;
        }

        Some(PositionEvent::TakeProfit {
            number: self.tp_count,
            target,
            price,
            final_target,
        })
    }

    fn check_averaging(&mut self, price: f64, settings: &LadderSettings) -> Option<PositionEvent> {
        let idx = self
            .averaging_steps
            .iter()
            .position(|step| self.side.reached_adverse(price, step.trigger_price))?;

        let step = self.averaging_steps.remove(idx);
        let fill_volume = if idx < self.volume_projection.len() {
            self.volume_projection.remove(idx).fill_volume
        } else {
            step.fill_volume
        };

        self.breakeven = compute_breakeven(self.side, step.average_price, settings.fee_rate);
        self.total_volume = ladder::round8(self.total_volume + fill_volume);
        self.averaging_count = step.number;

        let breakeven_mode_started = !self.breakeven_mode && step.number >= BREAKEVEN_MODE_FILL;
        if breakeven_mode_started {
            self.breakeven_mode = true;
        }

        Some(PositionEvent::Averaged {
            number: step.number,
            trigger_price: step.trigger_price,
            average_price: step.average_price,
            breakeven: self.breakeven,
            total_volume: self.total_volume,
            price,
            breakeven_mode_started,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `true` when `targets` move strictly away from entry in the trade direction
/// (increasing for longs, decreasing for shorts).
pub fn targets_are_monotonic(side: Side, targets: &[f64]) -> bool {
    targets.windows(2).all(|pair| match side {
        Side::Long => pair[1] > pair[0],
        Side::Short => pair[1] < pair[0],
    })
}

/// Format an opening timestamp the way alerts and the ledger show it.
pub fn format_opened_at(now: DateTime<Utc>, utc_offset_hours: i32) -> String {
    match FixedOffset::east_opt(utc_offset_hours * 3600) {
        Some(offset) => now.with_timezone(&offset).format("%d.%m, %H:%M").to_string(),
        None => now.format("%d.%m, %H:%M").to_string(),
    }
}
