use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::LedgerError;
use crate::ledger::record::LedgerRecord;

pub const APPEND_LOG_FILE: &str = "append.log";
pub const LOCK_FILE: &str = "ledger.lock";

/// Durable, append-only storage for ledger records. Implementations only store
/// and return records; chain verification happens in [`crate::ledger::Ledger`].
pub trait AppendLog: Send {
    fn load(&mut self) -> Result<Vec<LedgerRecord>, LedgerError>;

    /// Must not return before the record is durable.
    fn append(&mut self, record: &LedgerRecord) -> Result<(), LedgerError>;
}

/// One JSON record per line in `append.log`. The exclusive lock on
/// `ledger.lock` is held for as long as the value lives.
///
/// `durable_len` is the end of the last record known to be synced. Bytes past
/// it come from a failed write and are cut off before the next append.
pub struct FileLog {
    dir: PathBuf,
    file: File,
    lock: File,
    durable_len: u64,
}

impl FileLog {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, LedgerError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|source| LedgerError::Locked {
                path: lock_path.clone(),
                source,
            })?;
        info!("Acquired ledger lock {:?}", lock_path);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(dir.join(APPEND_LOG_FILE))?;
        let durable_len = file.metadata()?.len();

        Ok(Self {
            dir,
            file,
            lock,
            durable_len,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(APPEND_LOG_FILE)
    }

    fn write_synced(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line)?;
        self.file.sync_data()
    }
}

impl AppendLog for FileLog {
    fn load(&mut self) -> Result<Vec<LedgerRecord>, LedgerError> {
        let reader = BufReader::new(File::open(self.path())?);
        let mut records = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LedgerRecord = serde_json::from_str(&line).map_err(|e| {
                LedgerError::Corruption(format!("unreadable record on line {}: {}", idx + 1, e))
            })?;
            records.push(record);
        }

        debug!("Loaded {} ledger records from {:?}", records.len(), self.path());
        Ok(records)
    }

    fn append(&mut self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let actual_len = self.file.metadata()?.len();
        if actual_len != self.durable_len {
            warn!(
                "Discarding {} torn bytes at the end of {:?}",
                actual_len.saturating_sub(self.durable_len),
                self.path()
            );
            self.file.set_len(self.durable_len)?;
        }

        if let Err(e) = self.write_synced(&line) {
            error!("Ledger append failed, truncating to last durable record: {}", e);
            let _ = self.file.set_len(self.durable_len);
            return Err(e.into());
        }

        self.durable_len += line.len() as u64;
        Ok(())
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock);
    }
}

/// In-memory log. Clones share the same records, so a test can reopen a
/// ledger over the records a previous instance wrote.
#[derive(Clone, Default)]
pub struct MemoryLog {
    records: Arc<Mutex<Vec<LedgerRecord>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LedgerRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Gives tests direct access to stored records, e.g. to corrupt them.
    pub fn with_records<F: FnOnce(&mut Vec<LedgerRecord>)>(&self, f: F) {
        f(&mut self.records.lock().unwrap());
    }
}

impl AppendLog for MemoryLog {
    fn load(&mut self) -> Result<Vec<LedgerRecord>, LedgerError> {
        Ok(self.records.lock().unwrap().clone())
    }

    fn append(&mut self, record: &LedgerRecord) -> Result<(), LedgerError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
