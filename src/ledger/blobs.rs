use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::LedgerError;
use crate::types::{Configuration, Version};

pub const CONFIG_DIR: &str = "config";

/// Versioned storage for materialized configurations, kept apart from the
/// append log and cross-checked through [`config_hash`].
pub trait ConfigStore: Send {
    fn save(&mut self, version: Version, config: &Configuration) -> Result<(), LedgerError>;
    fn load(&self, version: Version) -> Result<Option<Configuration>, LedgerError>;
    fn discard(&mut self, version: Version) -> Result<(), LedgerError>;
}

pub fn config_hash(config: &Configuration) -> Result<String, LedgerError> {
    let bytes = serde_json::to_vec(config)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Loads the blob for `version` and fails with a corruption error unless its
/// content hash equals `expected_hash`.
pub fn load_verified(
    store: &dyn ConfigStore,
    version: Version,
    expected_hash: &str,
) -> Result<Configuration, LedgerError> {
    let config = store.load(version)?.ok_or_else(|| {
        LedgerError::Corruption(format!("configuration blob for version {} is missing", version))
    })?;

    let actual = config_hash(&config)?;
    if actual != expected_hash {
        return Err(LedgerError::Corruption(format!(
            "bad hash for configuration version {}: stored {}, computed {}",
            version, expected_hash, actual
        )));
    }
    Ok(config)
}

pub struct FileConfigStore {
    root: PathBuf,
}

impl FileConfigStore {
    pub fn open<P: AsRef<Path>>(ledger_dir: P) -> Result<Self, LedgerError> {
        let root = ledger_dir.as_ref().join(CONFIG_DIR);
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path_for(&self, version: Version) -> PathBuf {
        self.root.join(format!("{}.json", version))
    }
}

impl ConfigStore for FileConfigStore {
    fn save(&mut self, version: Version, config: &Configuration) -> Result<(), LedgerError> {
        let path = self.path_for(version);
        let bytes = serde_json::to_vec_pretty(config)?;

        let mut temp = NamedTempFile::new_in(&self.root)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;

        debug!("Saved configuration version {} to {:?}", version, path);
        Ok(())
    }

    fn load(&self, version: Version) -> Result<Option<Configuration>, LedgerError> {
        let path = self.path_for(version);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let config = serde_json::from_slice(&bytes).map_err(|e| {
            LedgerError::Corruption(format!("unreadable configuration {:?}: {}", path, e))
        })?;
        Ok(Some(config))
    }

    fn discard(&mut self, version: Version) -> Result<(), LedgerError> {
        let path = self.path_for(version);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryConfigStore {
    blobs: Arc<Mutex<HashMap<Version, Configuration>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versions(&self) -> Vec<Version> {
        let mut versions: Vec<_> = self.blobs.lock().unwrap().keys().copied().collect();
        versions.sort_unstable();
        versions
    }

    /// Overwrites a stored blob without going through the protocol.
    pub fn tamper(&self, version: Version, config: Configuration) {
        self.blobs.lock().unwrap().insert(version, config);
    }
}

impl ConfigStore for MemoryConfigStore {
    fn save(&mut self, version: Version, config: &Configuration) -> Result<(), LedgerError> {
        self.blobs.lock().unwrap().insert(version, config.clone());
        Ok(())
    }

    fn load(&self, version: Version) -> Result<Option<Configuration>, LedgerError> {
        Ok(self.blobs.lock().unwrap().get(&version).cloned())
    }

    fn discard(&mut self, version: Version) -> Result<(), LedgerError> {
        self.blobs.lock().unwrap().remove(&version);
        Ok(())
    }
}
