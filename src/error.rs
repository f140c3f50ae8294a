use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger at {path:?} is locked by another process: {source}")]
    Locked {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger corruption: {0}")]
    Corruption(String),

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, LedgerError::Corruption(_))
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("node refuses mutations after detecting corruption: {0}")]
    Corrupted(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("change applicator failed: {0}")]
    Applicator(String),

    #[error("node is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("server {server} reported a contract violation: {message}")]
    ContractViolation { server: String, message: String },

    #[error("no target servers were given")]
    NoTargets,
}
