use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LedgerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub key: String,
    pub value: serde_json::Value,
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl LedgerRecord {
    pub fn new(
        seq: u64,
        key: String,
        value: serde_json::Value,
        previous_hash: Option<String>,
    ) -> Self {
        let timestamp = Utc::now();
        let hash = compute_hash(seq, &timestamp, &key, &value, previous_hash.as_deref());
        Self {
            seq,
            timestamp,
            key,
            value,
            previous_hash,
            hash,
        }
    }

    /// Checks the record against the hash of the record that precedes it in the log.
    pub fn verify(&self, expected_seq: u64, expected_previous: Option<&str>) -> Result<(), LedgerError> {
        if self.seq != expected_seq {
            return Err(LedgerError::Corruption(format!(
                "record out of order: expected seq {} but found {}",
                expected_seq, self.seq
            )));
        }

        if self.previous_hash.as_deref() != expected_previous {
            return Err(LedgerError::Corruption(format!(
                "broken hash chain at seq {}: declared previous hash {:?}, actual {:?}",
                self.seq, self.previous_hash, expected_previous
            )));
        }

        let actual = compute_hash(
            self.seq,
            &self.timestamp,
            &self.key,
            &self.value,
            self.previous_hash.as_deref(),
        );
        if actual != self.hash {
            return Err(LedgerError::Corruption(format!(
                "hash mismatch at seq {}: stored {}, computed {}",
                self.seq, self.hash, actual
            )));
        }

        Ok(())
    }
}

pub fn compute_hash(
    seq: u64,
    timestamp: &DateTime<Utc>,
    key: &str,
    value: &serde_json::Value,
    previous_hash: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    if let Some(previous) = previous_hash {
        hasher.update(previous.as_bytes());
    }
    hasher.update(b"\n");
    hasher.update(seq.to_be_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(b"\n");
    hasher.update(key.as_bytes());
    hasher.update(b"\n");
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Walks a sequence of records in order, failing on the first one that does not
/// chain onto its predecessor.
pub fn verify_chain(records: &[LedgerRecord]) -> Result<Option<String>, LedgerError> {
    let mut previous: Option<String> = None;
    for (idx, record) in records.iter().enumerate() {
        record.verify(idx as u64 + 1, previous.as_deref())?;
        previous = Some(record.hash.clone());
    }
    Ok(previous)
}
