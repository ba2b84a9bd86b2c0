use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::NaiveDate;
use ndarray::Array1;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, MonitorResult};

/// One observed used-car sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarRecord {
    /// Region code where the car was sold.
    pub state: String,
    /// Manufacturer.
    pub make: String,
    /// Model name.
    pub model: String,
    /// Model year.
    pub year: i32,
    /// Odometer reading.
    pub mileage: f64,
    /// Sale price (the regression target).
    pub price: f64,
    /// Date the record entered the store.
    pub date_added: NaiveDate,
}

impl CarRecord {
    /// Checks the record against the data model.
    pub fn validate(&self) -> MonitorResult<()> {
        CarFeatures::from(self).validate()?;
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(MonitorError::InvalidRecord(format!(
                "price {} must be positive",
                self.price
            )));
        }
        Ok(())
    }
}

/// Fields a price is predicted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarFeatures {
    /// Region code.
    pub state: String,
    /// Manufacturer.
    pub make: String,
    /// Model name.
    pub model: String,
    /// Model year.
    pub year: i32,
    /// Odometer reading.
    pub mileage: f64,
}

impl CarFeatures {
    /// Rejects blank categories and negative or non-finite mileage.
    pub fn validate(&self) -> MonitorResult<()> {
        for (field, value) in [("state", &self.state), ("make", &self.make), ("model", &self.model)] {
            if value.trim().is_empty() {
                return Err(MonitorError::InvalidRecord(format!("{field} is blank")));
            }
        }
        if !self.mileage.is_finite() || self.mileage < 0.0 {
            return Err(MonitorError::InvalidRecord(format!(
                "mileage {} must be a non-negative number",
                self.mileage
            )));
        }
        Ok(())
    }
}

impl From<&CarRecord> for CarFeatures {
    fn from(record: &CarRecord) -> Self {
        Self {
            state: record.state.clone(),
            make: record.make.clone(),
            model: record.model.clone(),
            year: record.year,
            mileage: record.mileage,
        }
    }
}

/// Extracts sale prices as the target vector.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn targets(records: &[CarRecord]) -> Array1<f32> {
    records.iter().map(|record| record.price as f32).collect()
}

/// Source of car-sale records.
pub trait RecordStore: Send + Sync {
    /// Returns every record, or only those with `date_added > since`.
    fn fetch_records(&self, since: Option<NaiveDate>) -> MonitorResult<Vec<CarRecord>>;
}

fn added_after(record: &CarRecord, since: Option<NaiveDate>) -> bool {
    since.map_or(true, |date| record.date_added > date)
}

/// Record store backed by an append-only JSON-lines file.
#[derive(Debug)]
pub struct JsonlRecordStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonlRecordStore {
    /// Opens a store at `path`; the file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    /// Appends validated records.
    pub fn append(&self, records: &[CarRecord]) -> MonitorResult<()> {
        for record in records {
            record.validate()?;
        }
        let _guard = self.writer.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| MonitorError::record_store("append", err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| MonitorError::record_store("append", err))?;
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }
        file.write_all(&buffer)
            .and_then(|()| file.flush())
            .map_err(|err| MonitorError::record_store("append", err))
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordStore for JsonlRecordStore {
    fn fetch_records(&self, since: Option<NaiveDate>) -> MonitorResult<Vec<CarRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|err| MonitorError::record_store("open", err))?;
        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| MonitorError::record_store("read", err))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: CarRecord = serde_json::from_str(&line).map_err(|err| {
                MonitorError::record_store("decode", format!("line {}: {err}", line_no + 1))
            })?;
            if added_after(&record, since) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// In-process record store.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<Vec<CarRecord>>>,
}

impl MemoryRecordStore {
    /// Creates a store pre-filled with `records`.
    #[must_use]
    pub fn with_records(records: Vec<CarRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    /// Adds records.
    pub fn extend(&self, records: impl IntoIterator<Item = CarRecord>) {
        self.records.write().extend(records);
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl RecordStore for MemoryRecordStore {
    fn fetch_records(&self, since: Option<NaiveDate>) -> MonitorResult<Vec<CarRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|record| added_after(record, since))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub fn record(state: &str, make: &str, model: &str, year: i32, mileage: f64, price: f64) -> CarRecord {
        CarRecord {
            state: state.into(),
            make: make.into(),
            model: model.into(),
            year,
            mileage,
            price,
            date_added: date(2024, 1, 1),
        }
    }

    /// Deterministic synthetic market: price depends on make, age, and mileage.
    pub fn market(count: usize, date_added: NaiveDate) -> Vec<CarRecord> {
        let states = ["CA", "TX", "NY", "FL"];
        let makes = [("Toyota", "Camry", 24_000.0), ("Honda", "Civic", 21_000.0), ("Ford", "F-150", 32_000.0)];
        (0..count)
            .map(|idx| {
                let (make, model, base) = makes[idx % makes.len()];
                let age = (idx % 8) as i32;
                let mileage = 8_000.0 + (idx % 11) as f64 * 9_500.0;
                let price = base * (1.0 - 0.05 * f64::from(age)) - mileage * 0.04;
                CarRecord {
                    state: states[idx % states.len()].into(),
                    make: make.into(),
                    model: model.into(),
                    year: 2020 - age,
                    mileage,
                    price,
                    date_added,
                }
            })
            .collect()
    }
}
