//! Append-only CSV journal of acknowledged orders

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::order::OrderSide;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub timestamp: DateTime<Utc>,
    pub instance: String,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub order_id: String,
    pub price: Option<f64>,
    pub position_after: i64,
}

/// CSV file writer shared by every instance logging to the same path.
///
/// The header is written by whichever record first finds the file empty.
pub struct FillJournal {
    path: PathBuf,
    writer: Mutex<Option<csv::Writer<File>>>,
}

impl FillJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // Fail early on an unwritable path
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open journal {}", path.display()))?;

        Ok(Self {
            path,
            writer: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_writer(&self) -> Result<csv::Writer<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open journal {}", self.path.display()))?;
        let is_new = file.metadata()?.len() == 0;
        Ok(csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file))
    }

    pub fn record(&self, fill: &FillRecord) -> Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = match guard.take() {
            Some(writer) => writer,
            None => self.open_writer()?,
        };
        let writer = guard.insert(writer);
        writer.serialize(fill)?;
        writer.flush()?;
        Ok(())
    }
}
