mod applicator;
mod node;
mod state;

pub use applicator::*;
pub use node::*;
pub use state::*;

use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::ledger::{config_hash, FileConfigStore, FileLog, Ledger};
use crate::types::*;

/// Server side of the change protocol for one node. Handlers never fail for
/// expected conditions: those come back as a [`Rejection`]. `Err` is reserved
/// for corruption and contract violations.
pub struct ConfigServer<A: ChangeApplicator> {
    state: ServerState,
    applicator: A,
    corrupted: Option<String>,
}

impl<A: ChangeApplicator> ConfigServer<A> {
    pub fn new(mut state: ServerState, mut applicator: A) -> Result<Self, ServerError> {
        if !state.is_initialized() {
            info!("Initializing new server state");
            state.initialize()?;
        }

        applicator.restore(state.current_committed_config()?.as_ref());

        Ok(Self {
            state,
            applicator,
            corrupted: None,
        })
    }

    /// Opens the on-disk ledger under `dir`. Fails if another process holds it.
    pub fn open<P: AsRef<Path>>(dir: P, applicator: A) -> Result<Self, ServerError> {
        let log = FileLog::open(dir.as_ref())?;
        let configs = FileConfigStore::open(dir.as_ref())?;
        let ledger = Ledger::open(Box::new(log))?;
        Self::new(ServerState::new(ledger, Box::new(configs)), applicator)
    }

    pub fn applicator(&self) -> &A {
        &self.applicator
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn discover(&mut self) -> Result<DiscoverResponse, ServerError> {
        let result = self.build_discovery();
        self.track(result)
    }

    pub fn prepare(&mut self, message: &PrepareMessage) -> Result<MutationResult, ServerError> {
        self.check_usable()?;
        let result = self.do_prepare(message);
        self.track(result)
    }

    pub fn commit(&mut self, message: &CommitMessage) -> Result<MutationResult, ServerError> {
        self.check_usable()?;
        let result = self.do_commit(message);
        self.track(result)
    }

    pub fn rollback(&mut self, message: &RollbackMessage) -> Result<MutationResult, ServerError> {
        self.check_usable()?;
        let result = self.do_rollback(message);
        self.track(result)
    }

    pub fn takeover(&mut self, message: &TakeoverMessage) -> Result<MutationResult, ServerError> {
        self.check_usable()?;
        let result = self.do_takeover(message);
        self.track(result)
    }

    pub fn has_incomplete_change(&self) -> Result<bool, ServerError> {
        Ok(self.state.mode()? == ServerMode::Prepared)
    }

    pub fn change_state(&mut self, uuid: &ChangeId) -> Result<Option<ChangeDetails>, ServerError> {
        let result = self.state.change_details(uuid);
        self.track(result)
    }

    pub fn current_committed_config(&mut self) -> Result<Option<Configuration>, ServerError> {
        let result = self.state.current_committed_config();
        self.track(result)
    }

    /// All recorded changes, oldest first.
    pub fn change_history(&mut self) -> Result<Vec<ChangeDetails>, ServerError> {
        let result = self.collect_history();
        self.track(result)
    }

    fn collect_history(&self) -> Result<Vec<ChangeDetails>, ServerError> {
        let mut history = Vec::new();
        let mut next = self.state.latest_change_uuid()?;
        while let Some(uuid) = next {
            let record = self.state.change_record(&uuid)?.ok_or_else(|| {
                ServerError::Corrupted(format!("change chain references missing change {}", uuid))
            })?;
            if history.len() > self.state.change_count() {
                return Err(ServerError::Corrupted("change chain contains a cycle".to_string()));
            }
            next = record.prev_change_uuid;
            if let Some(details) = self.state.change_details(&uuid)? {
                history.push(details);
            }
        }
        history.reverse();
        Ok(history)
    }

    fn build_discovery(&self) -> Result<DiscoverResponse, ServerError> {
        let latest_change = match self.state.latest_change_uuid()? {
            Some(uuid) => self.state.change_details(&uuid)?,
            None => None,
        };
        let latest_committed_change = match self.state.latest_committed_uuid()? {
            Some(uuid) => self.state.change_details(&uuid)?,
            None => None,
        };

        Ok(DiscoverResponse {
            mode: self.state.mode()?,
            mutative_message_count: self.state.mutative_message_count(),
            last_mutation_host: self.state.last_mutation_host(),
            last_mutation_user: self.state.last_mutation_user(),
            last_mutation_timestamp: self.state.last_mutation_timestamp()?,
            current_version: self.state.current_version(),
            highest_version: self.state.highest_version(),
            latest_change,
            latest_committed_change,
        })
    }

    fn do_prepare(&mut self, message: &PrepareMessage) -> Result<MutationResult, ServerError> {
        if let Some(rejection) = self.check_header(&message.header) {
            return Ok(Err(rejection));
        }

        let mode = self.state.mode()?;
        if mode != ServerMode::Accepting {
            return Ok(Err(self.reject(
                RejectionReason::Bad,
                format!("Expected mode: {}. Was: {}", ServerMode::Accepting, mode),
            )));
        }

        let expected_version = self.state.current_version() + 1;
        if message.version != expected_version {
            return Ok(Err(self.reject(
                RejectionReason::Bad,
                format!(
                    "Wrong change version number: expected {}, got {}",
                    expected_version, message.version
                ),
            )));
        }

        if self.state.change_record(&message.change_uuid)?.is_some() {
            return Ok(Err(self.reject(
                RejectionReason::Bad,
                format!(
                    "Received a prepare for a change that already exists: {}",
                    message.change_uuid
                ),
            )));
        }

        let existing = self.state.current_committed_config()?;
        let new_config = match self.applicator.try_apply(existing.as_ref(), &message.change) {
            PotentialApplication::Allowed(config) => config,
            PotentialApplication::Rejected(reason) => {
                info!("Change {} refused: {}", message.change_uuid, reason);
                return Ok(Err(self.reject(RejectionReason::Unacceptable, reason)));
            }
        };

        let record = ChangeRecord {
            state: ChangeRequestState::Prepared,
            version: message.version,
            prev_change_uuid: self.state.latest_change_uuid()?,
            change: message.change.clone(),
            result_hash: config_hash(&new_config)?,
            creation_host: message.header.mutation_host.clone(),
            creation_user: message.header.mutation_user.clone(),
            creation_timestamp: message.header.mutation_timestamp,
        };

        let change = self
            .state
            .new_change(ServerRequest::Prepare)
            .mode(ServerMode::Prepared)
            .latest_change_uuid(message.change_uuid)
            .highest_version(message.version)
            .mutation(&message.header)
            .create_change(message.change_uuid, &record, new_config);
        self.apply_state_change(change)?;

        info!(
            "Prepared change {} for version {}: {}",
            message.change_uuid,
            message.version,
            message.change.summary()
        );
        Ok(Ok(()))
    }

    fn do_commit(&mut self, message: &CommitMessage) -> Result<MutationResult, ServerError> {
        let mut record = match self.check_prepared(&message.header, &message.change_uuid, "commit")? {
            Ok(record) => record,
            Err(rejection) => return Ok(Err(rejection)),
        };

        let details = self
            .state
            .change_details(&message.change_uuid)?
            .ok_or_else(|| ServerError::ContractViolation("prepared change vanished".to_string()))?;
        let new_config = details.result.ok_or_else(|| {
            ServerError::ContractViolation("prepared change has no configuration".to_string())
        })?;

        self.applicator
            .apply(&record.change, &new_config)
            .map_err(|e| ServerError::Applicator(e.to_string()))?;

        record.state = ChangeRequestState::Committed;
        let change = self
            .state
            .new_change(ServerRequest::Commit)
            .mode(ServerMode::Accepting)
            .latest_change_uuid(message.change_uuid)
            .latest_committed_uuid(message.change_uuid)
            .current_version(record.version)
            .mutation(&message.header)
            .update_change(message.change_uuid, &record);
        self.apply_state_change(change)?;

        info!("Committed change {} at version {}", message.change_uuid, record.version);
        Ok(Ok(()))
    }

    fn do_rollback(&mut self, message: &RollbackMessage) -> Result<MutationResult, ServerError> {
        let mut record = match self.check_prepared(&message.header, &message.change_uuid, "rollback")? {
            Ok(record) => record,
            Err(rejection) => return Ok(Err(rejection)),
        };

        record.state = ChangeRequestState::RolledBack;
        let change = self
            .state
            .new_change(ServerRequest::Rollback)
            .mode(ServerMode::Accepting)
            .mutation(&message.header)
            .update_change(message.change_uuid, &record)
            .discard_config(record.version);
        self.apply_state_change(change)?;

        info!("Rolled back change {}", message.change_uuid);
        Ok(Ok(()))
    }

    fn do_takeover(&mut self, message: &TakeoverMessage) -> Result<MutationResult, ServerError> {
        if let Err(rejection) = self.check_prepared(&message.header, &message.change_uuid, "takeover")? {
            return Ok(Err(rejection));
        }

        let change = self
            .state
            .new_change(ServerRequest::Takeover)
            .mutation(&message.header);
        self.apply_state_change(change)?;

        info!(
            "Change {} taken over by {}@{}",
            message.change_uuid, message.header.mutation_user, message.header.mutation_host
        );
        Ok(Ok(()))
    }

    /// Shared checks for messages that act on the currently prepared change.
    fn check_prepared(
        &self,
        header: &MutationHeader,
        change_uuid: &ChangeId,
        what: &str,
    ) -> Result<Result<ChangeRecord, Rejection>, ServerError> {
        if let Some(rejection) = self.check_header(header) {
            return Ok(Err(rejection));
        }

        let mode = self.state.mode()?;
        if mode != ServerMode::Prepared {
            return Ok(Err(self.reject(
                RejectionReason::Bad,
                format!("Expected mode: {}. Was: {}", ServerMode::Prepared, mode),
            )));
        }

        let prepared = self.state.latest_change_uuid()?;
        let record = match self.state.change_record(change_uuid)? {
            Some(record)
                if prepared == Some(*change_uuid) && record.state == ChangeRequestState::Prepared =>
            {
                record
            }
            _ => {
                return Ok(Err(self.reject(
                    RejectionReason::Bad,
                    format!("Received a {} for a change that is not prepared: {}", what, change_uuid),
                )));
            }
        };

        if record.version != self.state.highest_version()
            || record.version != self.state.current_version() + 1
        {
            return Err(ServerError::Corrupted(format!(
                "prepared change {} has version {} (current {}, highest {})",
                change_uuid,
                record.version,
                self.state.current_version(),
                self.state.highest_version()
            )));
        }

        Ok(Ok(record))
    }

    fn check_header(&self, header: &MutationHeader) -> Option<Rejection> {
        let actual = self.state.mutative_message_count();
        if header.expected_mutative_message_count != actual {
            debug!(
                "Dead message: expected count {} but server is at {}",
                header.expected_mutative_message_count, actual
            );
            return Some(self.reject(
                RejectionReason::Dead,
                format!(
                    "expectedMutativeMessageCount ({}) != actualMutativeMessageCount ({})",
                    header.expected_mutative_message_count, actual
                ),
            ));
        }
        None
    }

    fn apply_state_change(&mut self, change: StateChange) -> Result<(), ServerError> {
        let before = self.state.mutative_message_count();
        self.state.apply(change)?;
        let after = self.state.mutative_message_count();
        if after != before + 1 {
            return Err(ServerError::ContractViolation(format!(
                "Expected increment in mutative message count. Expected: {} found: {}",
                before + 1,
                after
            )));
        }
        Ok(())
    }

    fn reject(&self, reason: RejectionReason, message: String) -> Rejection {
        Rejection {
            reason,
            message,
            last_mutation_host: self.state.last_mutation_host(),
            last_mutation_user: self.state.last_mutation_user(),
        }
    }

    fn check_usable(&self) -> Result<(), ServerError> {
        match &self.corrupted {
            Some(reason) => {
                warn!("Refusing mutation on corrupted node: {}", reason);
                Err(ServerError::Corrupted(reason.clone()))
            }
            None => Ok(()),
        }
    }

    /// Latches corruption so the node refuses every later mutation.
    fn track<T>(&mut self, result: Result<T, ServerError>) -> Result<T, ServerError> {
        if let Err(e) = &result {
            let corrupted = match e {
                ServerError::Ledger(inner) => inner.is_corruption(),
                ServerError::Corrupted(_) => true,
                _ => false,
            };
            if corrupted && self.corrupted.is_none() {
                error!("Corruption detected, node will refuse further mutations: {}", e);
                self.corrupted = Some(e.to_string());
            }
        }
        result
    }
}
