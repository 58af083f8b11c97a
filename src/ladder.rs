// =============================================================================
// Ladder Math — DCA ladder, breakeven, and volume projections
// =============================================================================
//
// Pure, deterministic helpers shared by the position state machine.
//
// The averaging ladder is path dependent: every step is anchored to the
// running average price produced by the previous step, not to the original
// entry. Fill volumes grow geometrically (1.5x the running total), so each
// step more than doubles the exposure.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Number of steps in every averaging ladder.
pub const AVERAGING_STEPS: usize = 5;

/// Each averaging fill buys this multiple of the running total volume.
const VOLUME_GROWTH: f64 = 1.5;

/// Round to 8 decimal places (exchange price precision).
pub fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// One planned averaging fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AveragingStep {
    /// 1-based position of the step in the original ladder.
    pub number: u32,
    /// Price at which the fill is considered executed.
    pub trigger_price: f64,
    /// Volume added by this fill.
    pub fill_volume: f64,
    /// Average entry price once this fill is included.
    pub average_price: f64,
    /// Total position volume once this fill is included.
    pub cumulative_volume: f64,
}

/// Projected fill sizes regenerated after a take-profit shrinks exposure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeStep {
    pub fill_volume: f64,
    pub cumulative_volume: f64,
}

/// Build the five-step averaging ladder for a fresh position.
///
/// Step `i` triggers `percentages[i]` away from the *current* running average
/// (below it for longs, above it for shorts). After each step the running
/// average and cumulative volume are updated before the next trigger is
/// computed.
pub fn compute_averaging_ladder(
    side: Side,
    entry_price: f64,
    entry_volume: f64,
    percentages: &[f64; AVERAGING_STEPS],
) -> Vec<AveragingStep> {
    let mut average_price = entry_price;
    let mut notional = entry_price * entry_volume;
    let mut total_volume = entry_volume;

    let mut steps = Vec::with_capacity(AVERAGING_STEPS);
    for (i, pct) in percentages.iter().enumerate() {
        let trigger_price = match side {
            Side::Long => average_price - average_price * pct,
            Side::Short => average_price + average_price * pct,
        };
        let fill_volume = total_volume * VOLUME_GROWTH;

        notional += trigger_price * fill_volume;
        total_volume += fill_volume;
        average_price = notional / total_volume;

        steps.push(AveragingStep {
            number: i as u32 + 1,
            trigger_price: round8(trigger_price),
            fill_volume: round8(fill_volume),
            average_price: round8(average_price),
            cumulative_volume: round8(total_volume),
        });
    }
    steps
}

/// Price at which closing the position nets zero after fees.
pub fn compute_breakeven(side: Side, reference_price: f64, fee_rate: f64) -> f64 {
    let breakeven = match side {
        Side::Long => reference_price * (1.0 + fee_rate),
        Side::Short => reference_price * (1.0 - fee_rate),
    };
    round8(breakeven)
}

/// Regenerate the five-step fill projection from a new total volume.
pub fn recompute_volumes_after_partial_close(remaining_total_volume: f64) -> Vec<VolumeStep> {
    let mut total_volume = remaining_total_volume;
    (0..AVERAGING_STEPS)
        .map(|_| {
            let fill_volume = total_volume * VOLUME_GROWTH;
            total_volume += fill_volume;
            VolumeStep {
                fill_volume: round8(fill_volume),
                cumulative_volume: round8(total_volume),
            }
        })
        .collect()
}
