//! Order history (audit trail of bot-initiated liquidations)
//!
//! One row per flattening order. The CSV sink appends to
//! `<dir>/<exchange>_<bot>_order_history.csv` across runs and keeps the row
//! sequence monotonic.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::domain::OrderSide;
use crate::error::{PosguardError, Result};

pub const LIQUIDATION_KIND: &str = "Liquidation";

/// One audit row. Field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub price: Decimal,
    pub resulting_position: Decimal,
}

impl AuditRecord {
    /// Shutdown flattening row; the sink assigns the sequence.
    pub fn liquidation(order_id: impl Into<String>, side: OrderSide, size: Decimal) -> Self {
        Self {
            sequence: 0,
            order_id: order_id.into(),
            timestamp: Utc::now(),
            kind: LIQUIDATION_KIND.to_string(),
            side,
            size,
            price: Decimal::ZERO,
            resulting_position: Decimal::ZERO,
        }
    }
}

/// Append-only audit sink
pub trait OrderHistory: Send + Sync {
    /// Append a row and return it with its assigned sequence
    fn append(&self, record: AuditRecord) -> Result<AuditRecord>;

    /// Flush and refuse further appends
    fn close(&self) -> Result<()>;
}

struct CsvState {
    writer: Option<csv::Writer<File>>,
    next_sequence: u64,
}

/// CSV file sink
pub struct CsvOrderHistory {
    path: PathBuf,
    state: Mutex<CsvState>,
}

impl CsvOrderHistory {
    /// Open (or create) `<dir>/<stem>_order_history.csv`
    pub fn open(dir: impl AsRef<Path>, stem: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_order_history.csv", stem));

        let existing_rows = if path.exists() {
            count_rows(&path)?
        } else {
            0
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        // The header goes out with the first row of a new file
        let needs_header = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);

        info!("Order history at {}", path.display());

        Ok(Self {
            path,
            state: Mutex::new(CsvState {
                writer: Some(writer),
                next_sequence: existing_rows + 1,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn count_rows(path: &Path) -> Result<u64> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = 0;
    for record in reader.records() {
        record?;
        rows += 1;
    }
    Ok(rows)
}

fn poisoned() -> PosguardError {
    PosguardError::Internal("order history lock poisoned".to_string())
}

impl OrderHistory for CsvOrderHistory {
    fn append(&self, mut record: AuditRecord) -> Result<AuditRecord> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let sequence = state.next_sequence;
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| PosguardError::InvalidState("order history is closed".to_string()))?;

        record.sequence = sequence;
        writer.serialize(&record)?;
        writer.flush()?;

        state.next_sequence += 1;
        debug!(sequence, order = %record.order_id, "Order history row written");
        Ok(record)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(mut writer) = state.writer.take() {
            writer.flush()?;
            debug!("Order history closed: {}", self.path.display());
        }
        Ok(())
    }
}

/// In-memory sink, for dry runs and tests
#[derive(Default)]
pub struct MemoryOrderHistory {
    records: Mutex<Vec<AuditRecord>>,
    closed: Mutex<bool>,
}

impl MemoryOrderHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().map(|c| *c).unwrap_or(false)
    }
}

impl OrderHistory for MemoryOrderHistory {
    fn append(&self, mut record: AuditRecord) -> Result<AuditRecord> {
        if self.is_closed() {
            return Err(PosguardError::InvalidState(
                "order history is closed".to_string(),
            ));
        }
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        record.sequence = records.len() as u64 + 1;
        records.push(record.clone());
        Ok(record)
    }

    fn close(&self) -> Result<()> {
        *self.closed.lock().map_err(|_| poisoned())? = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const HEADER: [&str; 8] = [
        "sequence",
        "order_id",
        "timestamp",
        "kind",
        "side",
        "size",
        "price",
        "resulting_position",
    ];

    fn read_rows(path: &Path) -> Vec<csv::StringRecord> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader.records().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_csv_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let history = CsvOrderHistory::open(dir.path(), "bitflyer_bot").unwrap();

        let record = history
            .append(AuditRecord::liquidation("JRF-1", OrderSide::Sell, dec!(0.5)))
            .unwrap();
        assert_eq!(record.sequence, 1);
        history.close().unwrap();

        let path = dir.path().join("bitflyer_bot_order_history.csv");
        assert_eq!(history.path(), path.as_path());

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap(), &csv::StringRecord::from(HEADER.to_vec()));

        let rows = read_rows(&path);
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1], "JRF-1");
        assert_eq!(&rows[0][3], "Liquidation");
        assert_eq!(&rows[0][4], "SELL");
        assert_eq!(&rows[0][5], "0.5");
        assert_eq!(&rows[0][6], "0");
    }

    #[test]
    fn test_csv_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();

        let first = CsvOrderHistory::open(dir.path(), "gmo_bot").unwrap();
        first
            .append(AuditRecord::liquidation("1", OrderSide::Buy, dec!(1)))
            .unwrap();
        first.close().unwrap();

        let second = CsvOrderHistory::open(dir.path(), "gmo_bot").unwrap();
        let record = second
            .append(AuditRecord::liquidation("2", OrderSide::Sell, dec!(2)))
            .unwrap();
        second.close().unwrap();

        assert_eq!(record.sequence, 2);
        let rows = read_rows(second.path());
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][0], "2");
    }

    #[test]
    fn test_csv_rows_read_back_as_records() {
        let dir = tempfile::tempdir().unwrap();
        let history = CsvOrderHistory::open(dir.path(), "bitflyer_bot").unwrap();
        let written = vec![
            history
                .append(AuditRecord::liquidation("JRF-1", OrderSide::Sell, dec!(1.5)))
                .unwrap(),
            history
                .append(AuditRecord::liquidation("JRF-2", OrderSide::Buy, dec!(0.4)))
                .unwrap(),
        ];
        history.close().unwrap();

        let mut reader = csv::Reader::from_path(history.path()).unwrap();
        let read: Vec<AuditRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(read, written);
    }

    #[test]
    fn test_open_without_rows_writes_single_header() {
        let dir = tempfile::tempdir().unwrap();
        CsvOrderHistory::open(dir.path(), "gmo_bot").unwrap().close().unwrap();

        let history = CsvOrderHistory::open(dir.path(), "gmo_bot").unwrap();
        history
            .append(AuditRecord::liquidation("1", OrderSide::Buy, dec!(1)))
            .unwrap();
        history.close().unwrap();

        let contents = std::fs::read_to_string(history.path()).unwrap();
        assert_eq!(contents.matches("sequence,order_id").count(), 1);
        assert_eq!(read_rows(history.path()).len(), 1);
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let history = CsvOrderHistory::open(dir.path(), "x").unwrap();
        history.close().unwrap();
        assert!(matches!(
            history.append(AuditRecord::liquidation("1", OrderSide::Buy, dec!(1))),
            Err(PosguardError::InvalidState(_))
        ));

        let memory = MemoryOrderHistory::new();
        memory.close().unwrap();
        assert!(memory.is_closed());
        assert!(memory
            .append(AuditRecord::liquidation("1", OrderSide::Buy, dec!(1)))
            .is_err());
    }
}
