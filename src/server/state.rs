use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{LedgerError, ServerError};
use crate::ledger::{load_verified, ConfigStore, Ledger};
use crate::types::*;

const KEY_INITIALIZED: &str = "initialized";
const KEY_MODE: &str = "mode";
const KEY_MUTATIVE_MESSAGE_COUNT: &str = "mutative_message_count";
const KEY_LAST_MUTATION_HOST: &str = "last_mutation_host";
const KEY_LAST_MUTATION_USER: &str = "last_mutation_user";
const KEY_LAST_MUTATION_TIMESTAMP: &str = "last_mutation_timestamp";
const KEY_LATEST_CHANGE_UUID: &str = "latest_change_uuid";
const KEY_LATEST_COMMITTED_UUID: &str = "latest_committed_change_uuid";
const KEY_CURRENT_VERSION: &str = "current_version";
const KEY_HIGHEST_VERSION: &str = "highest_version";
const CHANGE_PREFIX: &str = "change:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRequest {
    Init,
    Prepare,
    Commit,
    Rollback,
    Takeover,
}

impl ServerRequest {
    fn label(&self) -> &'static str {
        match self {
            ServerRequest::Init => "init",
            ServerRequest::Prepare => "prepare",
            ServerRequest::Commit => "commit",
            ServerRequest::Rollback => "rollback",
            ServerRequest::Takeover => "takeover",
        }
    }
}

fn change_key(uuid: &ChangeId) -> String {
    format!("{}{}", CHANGE_PREFIX, uuid)
}

/// A pending transition, written to the ledger as exactly one record. The
/// first entry that fails to serialize is kept and reported by the write.
pub struct StateChange {
    request: ServerRequest,
    entries: Map<String, Value>,
    save_config: Option<(Version, Configuration)>,
    discard_config: Option<Version>,
    error: Option<serde_json::Error>,
}

impl StateChange {
    fn new(request: ServerRequest) -> Self {
        Self {
            request,
            entries: Map::new(),
            save_config: None,
            discard_config: None,
            error: None,
        }
    }

    fn set<T: Serialize>(mut self, key: &str, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.entries.insert(key.to_string(), value);
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn mode(self, mode: ServerMode) -> Self {
        self.set(KEY_MODE, mode)
    }

    pub fn latest_change_uuid(self, uuid: ChangeId) -> Self {
        self.set(KEY_LATEST_CHANGE_UUID, uuid)
    }

    pub fn latest_committed_uuid(self, uuid: ChangeId) -> Self {
        self.set(KEY_LATEST_COMMITTED_UUID, uuid)
    }

    pub fn current_version(self, version: Version) -> Self {
        self.set(KEY_CURRENT_VERSION, version)
    }

    pub fn highest_version(self, version: Version) -> Self {
        self.set(KEY_HIGHEST_VERSION, version)
    }

    pub fn mutation(self, header: &MutationHeader) -> Self {
        self.set(KEY_LAST_MUTATION_HOST, &header.mutation_host)
            .set(KEY_LAST_MUTATION_USER, &header.mutation_user)
            .set(KEY_LAST_MUTATION_TIMESTAMP, header.mutation_timestamp)
    }

    pub fn create_change(self, uuid: ChangeId, record: &ChangeRecord, result: Configuration) -> Self {
        let mut change = self.set(&change_key(&uuid), record);
        change.save_config = Some((record.version, result));
        change
    }

    pub fn update_change(self, uuid: ChangeId, record: &ChangeRecord) -> Self {
        self.set(&change_key(&uuid), record)
    }

    pub fn discard_config(mut self, version: Version) -> Self {
        self.discard_config = Some(version);
        self
    }
}

/// Typed view of the persistent server state over a [`Ledger`] and a
/// [`ConfigStore`].
pub struct ServerState {
    ledger: Ledger,
    configs: Box<dyn ConfigStore>,
}

impl ServerState {
    pub fn new(ledger: Ledger, configs: Box<dyn ConfigStore>) -> Self {
        Self { ledger, configs }
    }

    pub fn is_initialized(&self) -> bool {
        self.ledger.read(KEY_INITIALIZED).is_some()
    }

    pub fn initialize(&mut self) -> Result<(), ServerError> {
        let change = StateChange::new(ServerRequest::Init)
            .set(KEY_INITIALIZED, true)
            .mode(ServerMode::Accepting)
            .set(KEY_MUTATIVE_MESSAGE_COUNT, 0u64)
            .current_version(0)
            .highest_version(0);
        self.write(change)
    }

    pub fn mode(&self) -> Result<ServerMode, ServerError> {
        Ok(self
            .ledger
            .read_object::<ServerMode>(KEY_MODE)?
            .unwrap_or(ServerMode::Accepting))
    }

    pub fn mutative_message_count(&self) -> u64 {
        self.ledger.read_u64(KEY_MUTATIVE_MESSAGE_COUNT).unwrap_or(0)
    }

    pub fn last_mutation_host(&self) -> Option<String> {
        self.ledger.read_string(KEY_LAST_MUTATION_HOST)
    }

    pub fn last_mutation_user(&self) -> Option<String> {
        self.ledger.read_string(KEY_LAST_MUTATION_USER)
    }

    pub fn last_mutation_timestamp(&self) -> Result<Option<DateTime<Utc>>, ServerError> {
        Ok(self.ledger.read_object(KEY_LAST_MUTATION_TIMESTAMP)?)
    }

    pub fn latest_change_uuid(&self) -> Result<Option<ChangeId>, ServerError> {
        Ok(self.ledger.read_object(KEY_LATEST_CHANGE_UUID)?)
    }

    pub fn latest_committed_uuid(&self) -> Result<Option<ChangeId>, ServerError> {
        Ok(self.ledger.read_object(KEY_LATEST_COMMITTED_UUID)?)
    }

    pub fn current_version(&self) -> Version {
        self.ledger.read_u64(KEY_CURRENT_VERSION).unwrap_or(0)
    }

    pub fn highest_version(&self) -> Version {
        self.ledger.read_u64(KEY_HIGHEST_VERSION).unwrap_or(0)
    }

    pub fn change_record(&self, uuid: &ChangeId) -> Result<Option<ChangeRecord>, ServerError> {
        Ok(self.ledger.read_object(&change_key(uuid))?)
    }

    pub fn change_count(&self) -> usize {
        self.ledger.keys_with_prefix(CHANGE_PREFIX).count()
    }

    /// Rolled-back changes carry no configuration: their blob was discarded and
    /// the version may since have been reused.
    pub fn change_details(&self, uuid: &ChangeId) -> Result<Option<ChangeDetails>, ServerError> {
        let Some(record) = self.change_record(uuid)? else {
            return Ok(None);
        };

        let result = match record.state {
            ChangeRequestState::Prepared | ChangeRequestState::Committed => Some(load_verified(
                self.configs.as_ref(),
                record.version,
                &record.result_hash,
            )?),
            ChangeRequestState::RolledBack => None,
        };

        Ok(Some(ChangeDetails {
            change_uuid: *uuid,
            state: record.state,
            version: record.version,
            change: record.change,
            result,
            result_hash: record.result_hash,
            creation_host: record.creation_host,
            creation_user: record.creation_user,
            creation_timestamp: record.creation_timestamp,
        }))
    }

    pub fn current_committed_config(&self) -> Result<Option<Configuration>, ServerError> {
        let Some(uuid) = self.latest_committed_uuid()? else {
            return Ok(None);
        };
        let record = self.change_record(&uuid)?.ok_or_else(|| {
            LedgerError::Corruption(format!("committed change {} has no record", uuid))
        })?;
        if record.version != self.current_version() {
            return Err(LedgerError::Corruption(format!(
                "committed change {} has version {} but current version is {}",
                uuid,
                record.version,
                self.current_version()
            ))
            .into());
        }
        Ok(Some(load_verified(
            self.configs.as_ref(),
            record.version,
            &record.result_hash,
        )?))
    }

    pub fn new_change(&self, request: ServerRequest) -> StateChange {
        StateChange::new(request)
    }

    /// Persists a transition with exactly one ledger append, bumping the
    /// mutative message count.
    pub fn apply(&mut self, change: StateChange) -> Result<(), ServerError> {
        let next = self.mutative_message_count() + 1;
        self.write(change.set(KEY_MUTATIVE_MESSAGE_COUNT, next))
    }

    fn write(&mut self, change: StateChange) -> Result<(), ServerError> {
        let StateChange {
            request,
            entries,
            save_config,
            discard_config,
            error,
        } = change;

        if let Some(e) = error {
            return Err(LedgerError::Serialization(e).into());
        }

        if let Some((version, config)) = &save_config {
            self.configs.save(*version, config)?;
        }

        let record = self.ledger.append(request.label(), Value::Object(entries))?;
        debug!("Appended ledger record {} ({})", record.seq, request.label());

        if let Some(version) = discard_config {
            self.configs.discard(version)?;
        }
        Ok(())
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}
