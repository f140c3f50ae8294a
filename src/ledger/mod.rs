mod blobs;
mod log;
mod record;

pub use blobs::*;
pub use log::*;
pub use record::*;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::error::LedgerError;

/// Hash-chained key/value journal. The in-memory view is the result of
/// replaying every record in order; each record is a JSON object whose
/// entries overwrite the replayed keys (a `null` entry removes the key).
pub struct Ledger {
    log: Box<dyn AppendLog>,
    data: Map<String, Value>,
    last_hash: Option<String>,
    seq: u64,
}

impl Ledger {
    pub fn open(mut log: Box<dyn AppendLog>) -> Result<Self, LedgerError> {
        let records = log.load()?;

        let last_hash = verify_chain(&records).map_err(|e| {
            error!("Ledger replay failed: {}", e);
            e
        })?;

        let mut data = Map::new();
        for record in &records {
            merge(&mut data, record)?;
        }

        info!("Ledger replayed {} records", records.len());

        Ok(Self {
            log,
            data,
            last_hash,
            seq: records.len() as u64,
        })
    }

    /// Appends one record and only then updates the in-memory view, so a
    /// failed write leaves the view matching what is on disk.
    pub fn append(&mut self, key: &str, value: Value) -> Result<LedgerRecord, LedgerError> {
        if !value.is_object() {
            return Err(LedgerError::Corruption(format!(
                "ledger record '{}' must be an object",
                key
            )));
        }

        let record = LedgerRecord::new(self.seq + 1, key.to_string(), value, self.last_hash.clone());
        self.log.append(&record)?;

        merge(&mut self.data, &record)?;
        self.seq = record.seq;
        self.last_hash = Some(record.hash.clone());
        Ok(record)
    }

    pub fn read(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn read_u64(&self, key: &str) -> Option<u64> {
        self.read(key).and_then(Value::as_u64)
    }

    pub fn read_string(&self, key: &str) -> Option<String> {
        self.read(key).and_then(Value::as_str).map(str::to_string)
    }

    pub fn read_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, LedgerError> {
        match self.read(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| LedgerError::Corruption(format!("unreadable entry '{}': {}", key, e))),
        }
    }

    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.data
            .keys()
            .filter(move |k| k.starts_with(prefix))
            .map(String::as_str)
    }

    pub fn record_count(&self) -> u64 {
        self.seq
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }
}

fn merge(data: &mut Map<String, Value>, record: &LedgerRecord) -> Result<(), LedgerError> {
    let entries = record.value.as_object().ok_or_else(|| {
        LedgerError::Corruption(format!("record {} does not hold an object", record.seq))
    })?;

    for (key, value) in entries {
        if value.is_null() {
            data.remove(key);
        } else {
            data.insert(key.clone(), value.clone());
        }
    }
    Ok(())
}
