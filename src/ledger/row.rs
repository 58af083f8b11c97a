// =============================================================================
// Ledger Row Layout — sheet columns and resume parsing
// =============================================================================
//
// One position per row, row 1 is the header:
//
//   A order   B coin    C side     D opened   E entry   F..J tp1..tp5
//   K avg #   L avg px  M open     N b/e      O tp #    P stop
//   Q 5% flag R exchange
//
// Decimal cells written by hand may use a comma separator.
// =============================================================================

use thiserror::Error;

use crate::position::targets_are_monotonic;
use crate::types::{Exchange, Side};

pub const COL_ORDER: usize = 0;
pub const COL_COIN: usize = 1;
pub const COL_SIDE: usize = 2;
pub const COL_OPENED_AT: usize = 3;
pub const COL_ENTRY: usize = 4;
pub const COL_TP1: usize = 5;
pub const COL_AVERAGING_COUNT: usize = 10;
pub const COL_AVERAGING_PRICE: usize = 11;
pub const COL_OPEN: usize = 12;
pub const COL_BREAKEVEN: usize = 13;
pub const COL_TP_COUNT: usize = 14;
pub const COL_STOP: usize = 15;
pub const COL_FIVE_PERCENT: usize = 16;
pub const COL_EXCHANGE: usize = 17;

/// Total number of columns in a position row.
pub const ROW_WIDTH: usize = 18;

pub const FLAG_ON: &str = "➕";
pub const FLAG_OFF: &str = "➖";
pub const FLAG_BREAKEVEN: &str = "✅";

pub const HEADER: [&str; ROW_WIDTH] = [
    "order", "coin", "side", "opened_at", "entry", "tp1", "tp2", "tp3", "tp4", "tp5",
    "averaging_count", "averaging_price", "open", "breakeven", "tp_count", "stop",
    "five_percent_alert", "exchange",
];

/// A raw sheet row with its 1-based row number.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub row: u32,
    pub cells: Vec<String>,
}

/// Why a ledger row could not be turned into a tracked position.
#[derive(Debug, Error, PartialEq)]
pub enum ResumeError {
    #[error("row {row} has {len} cells, expected at least {min}")]
    TooShort { row: u32, len: usize, min: usize },
    #[error("row {row} column {column}: '{value}' is not a valid number")]
    BadNumber {
        row: u32,
        column: &'static str,
        value: String,
    },
    #[error("row {row}: {reason}")]
    Invalid { row: u32, reason: String },
}

/// Position state recovered from an open ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumedPosition {
    pub row: u32,
    pub order_number: u32,
    pub coin: String,
    pub side: Side,
    pub opened_at: String,
    pub entry_price: f64,
    pub targets: [f64; 5],
    pub averaging_count: u32,
    pub tp_count: u32,
    pub five_percent_alert_sent: bool,
    pub exchange: Option<Exchange>,
}

impl ResumedPosition {
    /// Parse and validate an open sheet row.
    pub fn from_sheet_row(sheet_row: &SheetRow) -> Result<Self, ResumeError> {
        let row = sheet_row.row;
        let cells = &sheet_row.cells;
        if cells.len() <= COL_FIVE_PERCENT {
            return Err(ResumeError::TooShort {
                row,
                len: cells.len(),
                min: COL_FIVE_PERCENT + 1,
            });
        }

        let order_number = parse_count(row, "order", &cells[COL_ORDER], false)?;
        let coin = cells[COL_COIN].trim().replace('/', "");
        if coin.is_empty() {
            return Err(ResumeError::Invalid {
                row,
                reason: "empty coin".into(),
            });
        }
        let side: Side = cells[COL_SIDE]
            .parse()
            .map_err(|reason| ResumeError::Invalid { row, reason })?;

        let entry_price = parse_decimal(row, "entry", &cells[COL_ENTRY])?;
        if entry_price <= 0.0 {
            return Err(ResumeError::Invalid {
                row,
                reason: format!("entry price {entry_price} is not positive"),
            });
        }

        const TARGET_COLUMNS: [&str; 5] = ["tp1", "tp2", "tp3", "tp4", "tp5"];
        let mut targets = [0.0; 5];
        for (i, column) in TARGET_COLUMNS.iter().enumerate() {
            targets[i] = parse_decimal(row, column, &cells[COL_TP1 + i])?;
        }
        if !targets_are_monotonic(side, &targets) {
            return Err(ResumeError::Invalid {
                row,
                reason: format!("targets {targets:?} are not monotonic for {side}"),
            });
        }

        let averaging_count = parse_count(row, "averaging_count", &cells[COL_AVERAGING_COUNT], true)?;
        let tp_count = parse_count(row, "tp_count", &cells[COL_TP_COUNT], true)?;
        if averaging_count > 5 || tp_count > 5 {
            return Err(ResumeError::Invalid {
                row,
                reason: format!("counts out of range (averaging {averaging_count}, tp {tp_count})"),
            });
        }

        let exchange = match cells.get(COL_EXCHANGE).map(|s| s.trim()) {
            None | Some("") => None,
            Some(name) => Some(
                name.parse::<Exchange>()
                    .map_err(|reason| ResumeError::Invalid { row, reason })?,
            ),
        };

        Ok(Self {
            row,
            order_number,
            coin,
            side,
            opened_at: cells[COL_OPENED_AT].trim().to_string(),
            entry_price,
            targets,
            averaging_count,
            tp_count,
            five_percent_alert_sent: cells[COL_FIVE_PERCENT].trim() == FLAG_ON,
            exchange,
        })
    }
}

/// Parse a price cell, accepting `1,25` as well as `1.25`.
pub fn parse_decimal(row: u32, column: &'static str, value: &str) -> Result<f64, ResumeError> {
    value
        .trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ResumeError::BadNumber {
            row,
            column,
            value: value.to_string(),
        })
}

fn parse_count(
    row: u32,
    column: &'static str,
    value: &str,
    empty_is_zero: bool,
) -> Result<u32, ResumeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() && empty_is_zero {
        return Ok(0);
    }
    trimmed.parse::<u32>().map_err(|_| ResumeError::BadNumber {
        row,
        column,
        value: value.to_string(),
    })
}

/// Format a price for a sheet cell without trailing noise.
pub fn format_decimal(value: f64) -> String {
    let s = format!("{:.8}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-" {
        "0".to_string()
    } else {
        s.to_string()
    }
}
