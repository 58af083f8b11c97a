// =============================================================================
// CSV Sheet Ledger — the position sheet kept as a CSV file on disk
// =============================================================================
//
// The whole sheet is held in memory and every mutation rewrites the file
// atomically (write tmp, then rename). Rows are 1-based like a spreadsheet;
// row 1 is the header and is never written through the position API.
// Writing past the end pads the sheet with empty rows, since slots may be
// allocated ahead of the first price of an earlier signal.
// =============================================================================

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::row::{
    format_decimal, SheetRow, COL_AVERAGING_COUNT, COL_AVERAGING_PRICE, COL_BREAKEVEN, COL_COIN,
    COL_ENTRY, COL_EXCHANGE, COL_FIVE_PERCENT, COL_OPEN, COL_OPENED_AT, COL_ORDER, COL_SIDE,
    COL_STOP, COL_TP1, COL_TP_COUNT, FLAG_BREAKEVEN, FLAG_OFF, FLAG_ON, HEADER, ROW_WIDTH,
};
use super::{Ledger, LedgerError, NewPositionFields};

pub struct CsvSheetLedger {
    path: PathBuf,
    rows: Mutex<Vec<Vec<String>>>,
}

impl CsvSheetLedger {
    /// Open the sheet at `path`, creating it with a header row if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let rows = if path.exists() {
            read_rows(&path)?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let rows = vec![HEADER.iter().map(|s| s.to_string()).collect()];
            write_rows(&path, &rows)?;
            info!(path = %path.display(), "created new ledger sheet");
            rows
        };
        debug!(path = %path.display(), rows = rows.len(), "ledger sheet loaded");
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `edit` to a position row and persist the sheet.
    ///
    /// `edit` returns whether it changed anything; unchanged rows are not
    /// rewritten.
    fn edit_row<F>(&self, row: u32, edit: F) -> Result<bool, LedgerError>
    where
        F: FnOnce(&mut Vec<String>) -> bool,
    {
        if row < 2 {
            return Err(LedgerError::BadRow(row));
        }
        let idx = row as usize - 1;

        let mut rows = self.rows.lock();
        let snapshot = rows.clone();
        if rows.len() <= idx {
            rows.resize_with(idx + 1, Vec::new);
        }
        let cells = &mut rows[idx];
        if cells.len() < ROW_WIDTH {
            cells.resize(ROW_WIDTH, String::new());
        }

        if !edit(cells) {
            *rows = snapshot;
            return Ok(false);
        }
        if let Err(e) = write_rows(&self.path, &rows) {
            *rows = snapshot;
            return Err(e);
        }
        Ok(true)
    }

    fn set_cells(&self, row: u32, cells: &[(usize, String)]) -> Result<(), LedgerError> {
        self.edit_row(row, |row_cells| {
            let mut changed = false;
            for (col, value) in cells {
                if row_cells[*col] != *value {
                    row_cells[*col] = value.clone();
                    changed = true;
                }
            }
            changed
        })?;
        Ok(())
    }
}

#[async_trait]
impl Ledger for CsvSheetLedger {
    async fn unclosed_positions(&self) -> Result<Vec<SheetRow>, LedgerError> {
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, cells)| cells.get(COL_OPEN).map(|c| c.trim()) == Some(FLAG_ON))
            .map(|(idx, cells)| SheetRow {
                row: idx as u32 + 1,
                cells: cells.clone(),
            })
            .collect())
    }

    async fn allocate_next_row_and_order_number(&self) -> Result<(u32, u32), LedgerError> {
        let rows = self.rows.lock();
        let next_row = rows.len().max(1) as u32 + 1;
        let last_order = rows
            .iter()
            .skip(1)
            .rev()
            .find_map(|cells| cells.get(COL_ORDER).and_then(|c| c.trim().parse::<u32>().ok()));
        Ok((next_row, last_order.map_or(1, |n| n + 1)))
    }

    async fn write_new_position(&self, row: u32, fields: &NewPositionFields) -> Result<(), LedgerError> {
        let mut cells = vec![
            (COL_ORDER, fields.order_number.to_string()),
            (COL_COIN, fields.coin.clone()),
            (COL_SIDE, fields.side.to_string()),
            (COL_OPENED_AT, fields.opened_at.clone()),
            (COL_ENTRY, format_decimal(fields.entry_price)),
            (COL_AVERAGING_COUNT, "0".to_string()),
            (COL_AVERAGING_PRICE, String::new()),
            (COL_OPEN, FLAG_ON.to_string()),
            (COL_BREAKEVEN, String::new()),
            (COL_TP_COUNT, "0".to_string()),
            (COL_STOP, String::new()),
            (COL_FIVE_PERCENT, FLAG_OFF.to_string()),
            (COL_EXCHANGE, fields.exchange.to_string().to_lowercase()),
        ];
        for (i, target) in fields.targets.iter().enumerate() {
            cells.push((COL_TP1 + i, format_decimal(*target)));
        }
        self.set_cells(row, &cells)?;
        info!(row, order = fields.order_number, coin = %fields.coin, "position row written");
        Ok(())
    }

    async fn update_take_profit_count(&self, row: u32, count: u32) -> Result<bool, LedgerError> {
        self.edit_row(row, |cells| {
            let stored = cells[COL_TP_COUNT].trim().parse::<u32>().ok();
            if stored.is_some_and(|stored| count <= stored) {
                return false;
            }
            cells[COL_TP_COUNT] = count.to_string();
            true
        })
    }

    async fn close_by_take_profit(&self, row: u32, count: u32) -> Result<(), LedgerError> {
        self.set_cells(
            row,
            &[(COL_TP_COUNT, count.to_string()), (COL_OPEN, FLAG_OFF.to_string())],
        )
    }

    async fn close_by_stop(&self, row: u32, price: f64) -> Result<(), LedgerError> {
        self.set_cells(
            row,
            &[(COL_OPEN, FLAG_OFF.to_string()), (COL_STOP, format_decimal(price))],
        )
    }

    async fn close_by_breakeven(&self, row: u32) -> Result<(), LedgerError> {
        self.set_cells(
            row,
            &[(COL_OPEN, FLAG_OFF.to_string()), (COL_BREAKEVEN, FLAG_BREAKEVEN.to_string())],
        )
    }

    async fn update_averaging(&self, row: u32, count: u32, price: f64) -> Result<(), LedgerError> {
        self.set_cells(
            row,
            &[
                (COL_AVERAGING_COUNT, count.to_string()),
                (COL_AVERAGING_PRICE, format_decimal(price)),
            ],
        )
    }

    async fn mark_five_percent_alert_sent(&self, row: u32) -> Result<(), LedgerError> {
        self.set_cells(row, &[(COL_FIVE_PERCENT, FLAG_ON.to_string())])
    }
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

fn read_rows(path: &Path) -> Result<Vec<Vec<String>>, LedgerError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(|s| s.to_string()).collect());
    }
    if rows.is_empty() {
        rows.push(HEADER.iter().map(|s| s.to_string()).collect());
    }
    Ok(rows)
}

fn write_rows(path: &Path, rows: &[Vec<String>]) -> Result<(), LedgerError> {
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&tmp)?;
        for row in rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ResumedPosition;
    use crate::types::{Exchange, Side};

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("ledger_test_{}.csv", uuid::Uuid::new_v4()))
    }

    fn fields(order_number: u32) -> NewPositionFields {
        NewPositionFields {
            order_number,
            coin: "BTCUSDT".into(),
            side: Side::Long,
            opened_at: "01.02, 10:00".into(),
            entry_price: 100.5,
            targets: [102.0, 104.0, 106.0, 108.0, 110.0],
            exchange: Exchange::Bingx,
        }
    }

    #[tokio::test]
    async fn new_sheet_allocates_first_row() {
        let path = temp_path();
        let ledger = CsvSheetLedger::open(&path).unwrap();
        assert_eq!(ledger.allocate_next_row_and_order_number().await.unwrap(), (2, 1));
        assert!(ledger.unclosed_positions().await.unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn written_rows_survive_reopen_and_resume() {
        let path = temp_path();
        {
            let ledger = CsvSheetLedger::open(&path).unwrap();
            ledger.write_new_position(2, &fields(1)).await.unwrap();
            ledger.write_new_position(3, &fields(2)).await.unwrap();
            ledger.update_averaging(2, 1, 90.0).await.unwrap();
            ledger.mark_five_percent_alert_sent(2).await.unwrap();
            ledger.close_by_breakeven(3).await.unwrap();
        }

        let ledger = CsvSheetLedger::open(&path).unwrap();
        assert_eq!(ledger.allocate_next_row_and_order_number().await.unwrap(), (4, 3));

        let open = ledger.unclosed_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        let resumed = ResumedPosition::from_sheet_row(&open[0]).unwrap();
        assert_eq!(resumed.row, 2);
        assert_eq!(resumed.order_number, 1);
        assert_eq!(resumed.averaging_count, 1);
        assert!(resumed.five_percent_alert_sent);
        assert_eq!(resumed.exchange, Some(Exchange::Bingx));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn take_profit_count_only_grows() {
        let path = temp_path();
        let ledger = CsvSheetLedger::open(&path).unwrap();
        ledger.write_new_position(2, &fields(1)).await.unwrap();

        assert!(ledger.update_take_profit_count(2, 2).await.unwrap());
        let before = std::fs::read_to_string(&path).unwrap();

        assert!(!ledger.update_take_profit_count(2, 2).await.unwrap());
        assert!(!ledger.update_take_profit_count(2, 1).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);

        assert!(ledger.update_take_profit_count(2, 3).await.unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn out_of_order_rows_are_padded() {
        let path = temp_path();
        let ledger = CsvSheetLedger::open(&path).unwrap();
        ledger.write_new_position(3, &fields(2)).await.unwrap();
        ledger.write_new_position(2, &fields(1)).await.unwrap();

        let open = ledger.unclosed_positions().await.unwrap();
        assert_eq!(open.iter().map(|r| r.row).collect::<Vec<_>>(), vec![2, 3]);
        assert!(matches!(
            ledger.close_by_breakeven(1).await,
            Err(LedgerError::BadRow(1))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn closes_clear_open_flag() {
        let path = temp_path();
        let ledger = CsvSheetLedger::open(&path).unwrap();
        ledger.write_new_position(2, &fields(1)).await.unwrap();
        ledger.write_new_position(3, &fields(2)).await.unwrap();

        ledger.close_by_take_profit(2, 5).await.unwrap();
        ledger.close_by_stop(3, 95.5).await.unwrap();
        assert!(ledger.unclosed_positions().await.unwrap().is_empty());

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("95.5"));
        let _ = std::fs::remove_file(&path);
    }
}
