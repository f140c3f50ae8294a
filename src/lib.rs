pub mod api;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ledger;
pub mod server;
pub mod types;

pub use api::create_router;
pub use client::{
    ChangeCoordinator, ChangeOutcome, ConsistencyAnalyzer, CoordinatorOptions, GlobalState,
    HttpEndpoint, LocalEndpoint, NomadEndpoint, RecoveryOutcome,
};
pub use config::{CoordinatorSettings, NodeConfig};
pub use daemon::NodeDaemon;
pub use error::{CoordinatorError, LedgerError, ServerError};
pub use ledger::Ledger;
pub use server::{spawn_node, ChangeApplicator, ConfigServer, NodeHandle, SettingsApplicator};
pub use types::*;
