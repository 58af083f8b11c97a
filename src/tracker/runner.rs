use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::{messages, CloseReason, TrackerContext, TrackerLaunch, TrackerOutcome, TrackerState};
use crate::ledger::{LedgerWrite, NewPositionFields};
use crate::position::{format_opened_at, Position, PositionEvent};

/// Track one position until it closes.
pub async fn run_tracker(launch: TrackerLaunch, ctx: TrackerContext) -> TrackerOutcome {
    let settings = ctx.settings.clone();
    let exchange = ctx.feed.exchange();
    let mut ticker = interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (mut position, subscription) = match launch {
        TrackerLaunch::Resumed(resumed) => {
            let position = Position::resume(&resumed, exchange, &settings.ladder);
            if position.is_closed() {
                info!(
                    order = position.order_number,
                    row = position.row,
                    coin = %position.coin,
                    "resumed position has no targets left, closing"
                );
                ctx.ledger
                    .submit(LedgerWrite::CloseByTakeProfit {
                        row: position.row,
                        count: position.tp_count,
                    })
                    .await;
                return outcome(&position, CloseReason::ResumedClosed);
            }

            let subscription = ctx.feed.subscribe(&position.coin);
            info!(
                order = position.order_number,
                coin = %position.coin,
                side = %position.side,
                exchange = %exchange,
                targets_left = position.targets.len(),
                averaging_count = position.averaging_count,
                breakeven = position.breakeven,
                state = ?TrackerState::Active,
                "position resumed"
            );
            (position, subscription)
        }

        TrackerLaunch::New { signal, slot } => {
            let subscription = ctx.feed.subscribe(&signal.coin);
            debug!(
                order = slot.order_number,
                coin = %signal.coin,
                state = ?TrackerState::Initializing,
                "waiting for first price"
            );

            let entry_price = loop {
                ticker.tick().await;
                if let Some(price) = subscription.take_latest() {
                    break price;
                }
            };

            let opened_at = format_opened_at(Utc::now(), settings.utc_offset_hours);
            let position = Position::open(slot, &signal, exchange, entry_price, opened_at, &settings.ladder);

            ctx.ledger
                .submit(LedgerWrite::NewPosition {
                    row: position.row,
                    fields: NewPositionFields {
                        order_number: position.order_number,
                        coin: position.coin.clone(),
                        side: position.side,
                        opened_at: position.opened_at.clone(),
                        entry_price,
                        targets: signal.targets,
                        exchange,
                    },
                })
                .await;

            info!(
                order = position.order_number,
                row = position.row,
                coin = %position.coin,
                side = %position.side,
                exchange = %exchange,
                entry_price,
                breakeven = position.breakeven,
                state = ?TrackerState::Active,
                "position opened"
            );
            (position, subscription)
        }
    };

    let mut reason = CloseReason::FinalTakeProfit;
    while !position.is_closed() {
        ticker.tick().await;
        let Some(price) = subscription.take_latest() else {
            continue;
        };

        for event in position.evaluate(price, &settings.ladder) {
            if matches!(event, PositionEvent::Breakeven { .. }) {
                reason = CloseReason::Breakeven;
            }
            dispatch(&ctx, &position, &event).await;
        }
    }

    ctx.feed.unsubscribe(subscription);
    info!(
        order = position.order_number,
        coin = %position.coin,
        reason = ?reason,
        state = ?TrackerState::Closed,
        "position closed"
    );
    outcome(&position, reason)
}

/// Persist and announce one event.
async fn dispatch(ctx: &TrackerContext, position: &Position, event: &PositionEvent) {
    info!(
        order = position.order_number,
        coin = %position.coin,
        event = %messages::summary(event),
        "position event"
    );

    let row = position.row;
    let text = messages::render(position, event, ctx.settings.footer.as_deref());

    match event {
        PositionEvent::FivePercentAlert { .. } => {
            ctx.ledger.submit(LedgerWrite::FivePercentAlertSent { row }).await;
            ctx.alerts.main(text);
        }
        PositionEvent::TakeProfit {
            number,
            final_target,
            ..
        } => {
            let write = if *final_target {
                LedgerWrite::CloseByTakeProfit { row, count: *number }
            } else {
                LedgerWrite::TakeProfitCount { row, count: *number }
            };
            ctx.ledger.submit(write).await;
            ctx.alerts.main(text);
        }
        PositionEvent::Breakeven { .. } => {
            ctx.ledger.submit(LedgerWrite::CloseByBreakeven { row }).await;
            ctx.alerts.averaging(text);
        }
        PositionEvent::Averaged {
            number,
            trigger_price,
            ..
        } => {
            ctx.ledger
                .submit(LedgerWrite::Averaging {
                    row,
                    count: *number,
                    price: *trigger_price,
                })
                .await;
            ctx.alerts.averaging(text);
        }
    }
}

fn outcome(position: &Position, reason: CloseReason) -> TrackerOutcome {
    TrackerOutcome {
        order_number: position.order_number,
        row: position.row,
        coin: position.coin.clone(),
        reason,
    }
}
