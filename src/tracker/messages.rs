// =============================================================================
// Alert texts for position events
// =============================================================================

use crate::ladder::round8;
use crate::position::{Position, PositionEvent};

/// `BTCUSDT` -> `BTC/USDT` for display.
pub fn display_coin(coin: &str) -> String {
    match coin.strip_suffix("USDT") {
        Some(base) if !base.is_empty() => format!("{base}/USDT"),
        _ => coin.to_string(),
    }
}

fn headline(position: &Position) -> String {
    format!(
        "💰 <b>#{} [{}]</b>\n⏰ {} msk",
        display_coin(&position.coin),
        position.side,
        position.opened_at
    )
}

fn with_footer(body: String, footer: Option<&str>) -> String {
    match footer.filter(|f| !f.is_empty()) {
        Some(footer) => format!("{body}\n\n{footer}"),
        None => body,
    }
}

/// Render the alert for one event.
pub fn render(position: &Position, event: &PositionEvent, footer: Option<&str>) -> String {
    let body = match event {
        PositionEvent::FivePercentAlert { change_pct, .. } => format!(
            "{}\n\n❗️ Price moved {:.2}% against the position, consider requesting an averaging order.\n\
             ❗ Cancel the original stop-loss before averaging.",
            headline(position),
            change_pct
        ),
        PositionEvent::TakeProfit {
            number,
            target,
            final_target,
            ..
        } => {
            let title = if *final_target {
                format!("✅ Target {number} reached, all targets taken 🏁")
            } else {
                format!("✅ Target {number} reached 🔥")
            };
            format!("{title}\n{}\nPrice: {target}", headline(position))
        }
        PositionEvent::Breakeven { breakeven, .. } => format!(
            "✅ Breakeven reached 🔥\n{}\n\nPrice: {breakeven}",
            headline(position)
        ),
        PositionEvent::Averaged {
            number,
            trigger_price,
            average_price,
            breakeven,
            breakeven_mode_started,
            ..
        } => {
            let mut text = format!(
                "✔️ Averaged the position, order {number}\n{}\nPrice: {trigger_price}\n\
                 Average entry: {average_price}\nBreakeven: {breakeven}",
                headline(position)
            );
            if *breakeven_mode_started {
                text.push_str("\n\nTargets are paused, the position now closes at breakeven.");
            }
            text
        }
    };
    with_footer(body, footer)
}

/// One-line summary for logs.
pub fn summary(event: &PositionEvent) -> String {
    match event {
        PositionEvent::FivePercentAlert { price, change_pct } => {
            format!("five-percent alert at {price} ({change_pct:.2}%)")
        }
        PositionEvent::TakeProfit {
            number,
            target,
            price,
            final_target,
        } => format!("tp{number} {target} hit at {price} (final: {final_target})"),
        PositionEvent::Breakeven { breakeven, price } => {
            format!("breakeven {breakeven} hit at {price}")
        }
        PositionEvent::Averaged {
            number,
            trigger_price,
            total_volume,
            ..
        } => format!(
            "averaging {number} filled at {trigger_price}, volume {}",
            round8(*total_volume)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{LadderSettings, LedgerSlot};
    use crate::types::{Exchange, NormalizedSignal, Side};

    fn position() -> Position {
        let signal = NormalizedSignal {
            coin: "ETHUSDT".into(),
            side: Side::Short,
            targets: [98.0, 96.0, 94.0, 92.0, 90.0],
            stop_loss: 105.0,
            exchange: None,
        };
        Position::open(
            LedgerSlot {
                row: 2,
                order_number: 1,
            },
            &signal,
            Exchange::Bybit,
            100.0,
            "05.06, 12:00".into(),
            &LadderSettings::default(),
        )
    }

    #[test]
    fn take_profit_text() {
        let event = PositionEvent::TakeProfit {
            number: 2,
            target: 96.0,
            price: 95.9,
            final_target: false,
        };
        let text = render(&position(), &event, Some("🐋 footer"));
        assert!(text.starts_with("✅ Target 2 reached"));
        assert!(text.contains("#ETH/USDT [SHORT]"));
        assert!(text.contains("05.06, 12:00"));
        assert!(text.contains("Price: 96"));
        assert!(text.ends_with("🐋 footer"));
    }

    #[test]
    fn empty_footer_is_omitted() {
        let event = PositionEvent::Breakeven {
            breakeven: 99.92,
            price: 99.9,
        };
        let text = render(&position(), &event, Some(""));
        assert!(text.ends_with("Price: 99.92"));
    }

    #[test]
    fn coin_display() {
        assert_eq!(display_coin("BTCUSDT"), "BTC/USDT");
        assert_eq!(display_coin("USDT"), "USDT");
        assert_eq!(display_coin("BTCUSDC"), "BTCUSDC");
    }
}
