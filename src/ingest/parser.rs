// =============================================================================
// Signal Parser — channel post text -> NormalizedSignal
// =============================================================================
//
// Two post layouts are in circulation:
//
// Legacy (fixed line positions):
//
//   LONG: BTC/USDT
//   <any>
//   <any>
//   Targets: 102 >> 104 >> 106 >> 108 >> 110
//   Stop: 95.
//
// Current (labelled sections, Russian or English labels):
//
//   🟢 LONG: BTC/USDT
//   Стоп: 95
//   Цели:
//   1) 102 (+2%)
//   2) 104 (+4%)
//   ...
//
// Numbers may end with a dot. An optional `Exchange: BingX` / `Биржа: BingX`
// line selects the price feed.
// =============================================================================

use thiserror::Error;

use crate::position::targets_are_monotonic;
use crate::types::{Exchange, NormalizedSignal, Side};

const TARGET_COUNT: usize = 5;

#[derive(Debug, Error, PartialEq)]
pub enum SignalError {
    #[error("post is empty")]
    Empty,
    #[error("no LONG/SHORT marker on the first line")]
    MissingSide,
    #[error("no coin after the side marker")]
    MissingCoin,
    #[error("no stop-loss line")]
    MissingStop,
    #[error("no targets section")]
    MissingTargets,
    #[error("'{0}' is not a number")]
    BadNumber(String),
    #[error("expected {TARGET_COUNT} targets, found {0}")]
    TargetCount(usize),
    #[error("targets are not strictly moving away from entry for {0}")]
    NonMonotonic(Side),
    #[error("prices must be positive")]
    NonPositive,
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
}

/// Parse and validate a channel post.
pub fn parse_signal(text: &str) -> Result<NormalizedSignal, SignalError> {
    if text.trim().is_empty() {
        return Err(SignalError::Empty);
    }

    let raw = if text.contains(">>") {
        parse_legacy(text)?
    } else {
        parse_labelled(text)?
    };
    validate(raw)
}

struct RawSignal {
    coin: String,
    side: Side,
    targets: Vec<f64>,
    stop_loss: f64,
    exchange: Option<Exchange>,
}

fn parse_number(value: &str) -> Result<f64, SignalError> {
    let cleaned = value.trim().trim_end_matches('.').replace(',', ".");
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SignalError::BadNumber(value.trim().to_string()))
}

fn normalize_coin(coin: &str) -> Result<String, SignalError> {
    let coin: String = coin
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches('#')
        .chars()
        .filter(|c| *c != '/')
        .collect::<String>()
        .to_uppercase();
    if coin.is_empty() {
        return Err(SignalError::MissingCoin);
    }
    Ok(coin)
}

/// Side and coin from a line like `🟢 LONG: BTC/USDT`.
fn side_and_coin(line: &str) -> Result<(Side, String), SignalError> {
    for (marker, side) in [("LONG:", Side::Long), ("SHORT:", Side::Short)] {
        if let Some((_, coin)) = line.split_once(marker) {
            return Ok((side, normalize_coin(coin)?));
        }
    }
    Err(SignalError::MissingSide)
}

fn find_exchange(lines: &[&str]) -> Result<Option<Exchange>, SignalError> {
    for line in lines {
        for label in ["Exchange:", "Биржа:"] {
            if let Some((_, name)) = line.split_once(label) {
                let name = name.trim();
                return name
                    .parse::<Exchange>()
                    .map(Some)
                    .map_err(|_| SignalError::UnknownExchange(name.to_string()));
            }
        }
    }
    Ok(None)
}

fn parse_legacy(text: &str) -> Result<RawSignal, SignalError> {
    let lines: Vec<&str> = text.lines().collect();
    let (side, coin) = side_and_coin(lines[0])?;

    let targets_line = lines
        .get(3)
        .filter(|l| l.contains(">>"))
        .ok_or(SignalError::MissingTargets)?;
    let (_, list) = targets_line
        .split_once(':')
        .ok_or(SignalError::MissingTargets)?;
    let targets = list
        .split(">>")
        .map(|tp| parse_number(tp.split_whitespace().next().unwrap_or_default()))
        .collect::<Result<Vec<_>, _>>()?;

    let stop_line = lines.get(4).ok_or(SignalError::MissingStop)?;
    let (_, stop) = stop_line.split_once(':').ok_or(SignalError::MissingStop)?;

    Ok(RawSignal {
        coin,
        side,
        targets,
        stop_loss: parse_number(stop)?,
        exchange: find_exchange(&lines)?,
    })
}

fn parse_labelled(text: &str) -> Result<RawSignal, SignalError> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let (side, coin) = side_and_coin(lines[0])?;

    let stop = lines
        .iter()
        .find_map(|l| {
            ["Стоп:", "Stop:"]
                .iter()
                .find_map(|label| l.split_once(label).map(|(_, v)| v))
        })
        .ok_or(SignalError::MissingStop)?;

    let header = lines
        .iter()
        .position(|l| l.contains("Цели:") || l.contains("Targets:"))
        .ok_or(SignalError::MissingTargets)?;
    let targets = lines[header + 1..]
        .iter()
        .take_while(|l| l.starts_with(|c: char| c.is_ascii_digit()) && l.contains(')'))
        .map(|l| {
            let after = l.split_once(')').map(|(_, rest)| rest).unwrap_or_default();
            let price = after.split('(').next().unwrap_or_default();
            parse_number(price)
        })
        .collect::<Result<Vec<_>, _>>()?;
    if targets.is_empty() {
        return Err(SignalError::MissingTargets);
    }

    Ok(RawSignal {
        coin,
        side,
        targets,
        stop_loss: parse_number(stop)?,
        exchange: find_exchange(&lines)?,
    })
}

fn validate(raw: RawSignal) -> Result<NormalizedSignal, SignalError> {
    let targets: [f64; TARGET_COUNT] = raw
        .targets
        .as_slice()
        .try_into()
        .map_err(|_| SignalError::TargetCount(raw.targets.len()))?;

    if raw.stop_loss <= 0.0 || targets.iter().any(|t| *t <= 0.0) {
        return Err(SignalError::NonPositive);
    }
    if !targets_are_monotonic(raw.side, &targets) {
        return Err(SignalError::NonMonotonic(raw.side));
    }

    Ok(NormalizedSignal {
        coin: raw.coin,
        side: raw.side,
        targets,
        stop_loss: raw.stop_loss,
        exchange: raw.exchange,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = "LONG: BTC/USDT\n\
                          Leverage: 10x\n\
                          Entry: market\n\
                          Цели: 102 >> 104 >> 106 >> 108 >> 110.\n\
                          Stop: 95.";

    const LABELLED: &str = "🔴 SHORT: ETH/USDT\n\
                            \n\
                            Стоп: 2600\n\
                            Цели:\n\
                            1) 2450 (-2%)\n\
                            2) 2400. (-4%)\n\
                            3) 2350 (-6%)\n\
                            4) 2300 (-8%)\n\
                            5) 2250 (-10%)\n\
                            Good luck";

    #[test]
    fn legacy_format() {
        let signal = parse_signal(LEGACY).unwrap();
        assert_eq!(signal.coin, "BTCUSDT");
        assert_eq!(signal.side, Side::Long);
        assert_eq!(signal.targets, [102.0, 104.0, 106.0, 108.0, 110.0]);
        assert_eq!(signal.stop_loss, 95.0);
        assert_eq!(signal.exchange, None);
    }

    #[test]
    fn labelled_format() {
        let signal = parse_signal(LABELLED).unwrap();
        assert_eq!(signal.coin, "ETHUSDT");
        assert_eq!(signal.side, Side::Short);
        assert_eq!(signal.targets, [2450.0, 2400.0, 2350.0, 2300.0, 2250.0]);
        assert_eq!(signal.stop_loss, 2600.0);
    }

    #[test]
    fn english_labels_and_exchange() {
        let text = "LONG: SOL/USDT\nExchange: BingX\nStop: 90\nTargets:\n1) 101\n2) 102\n3) 103\n4) 104\n5) 105";
        let signal = parse_signal(text).unwrap();
        assert_eq!(signal.exchange, Some(Exchange::Bingx));
        assert_eq!(signal.targets[4], 105.0);
    }

    #[test]
    fn rejects_non_monotonic_targets() {
        let text = "LONG: BTC/USDT\n-\n-\nTargets: 102 >> 101 >> 106 >> 108 >> 110\nStop: 95";
        assert_eq!(parse_signal(text), Err(SignalError::NonMonotonic(Side::Long)));

        let text = LABELLED.replace("2) 2400.", "2) 2460");
        assert_eq!(parse_signal(&text), Err(SignalError::NonMonotonic(Side::Short)));
    }

    #[test]
    fn rejects_malformed_posts() {
        assert_eq!(parse_signal("   "), Err(SignalError::Empty));
        assert_eq!(parse_signal("hello\nworld"), Err(SignalError::MissingSide));
        assert_eq!(
            parse_signal("LONG: BTC/USDT\nStop: 90\nTargets:\n1) 101\n2) 102"),
            Err(SignalError::TargetCount(2))
        );
        assert_eq!(
            parse_signal("LONG: BTC/USDT\nTargets:\n1) 101"),
            Err(SignalError::MissingStop)
        );
        assert!(matches!(
            parse_signal("LONG: BTC/USDT\nStop: x\nTargets:\n1) 101"),
            Err(SignalError::BadNumber(_))
        ));
        assert!(matches!(
            parse_signal("LONG: BTC/USDT\nExchange: Kraken\nStop: 90\nTargets:\n1) 1\n2) 2\n3) 3\n4) 4\n5) 5"),
            Err(SignalError::UnknownExchange(_))
        ));
    }
}
