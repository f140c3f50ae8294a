use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type ChangeId = Uuid;
pub type Version = u64;
pub type ServerAddr = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ServerMode {
    Accepting,
    Prepared,
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMode::Accepting => write!(f, "ACCEPTING"),
            ServerMode::Prepared => write!(f, "PREPARED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeRequestState {
    Prepared,
    Committed,
    RolledBack,
}

impl fmt::Display for ChangeRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeRequestState::Prepared => write!(f, "PREPARED"),
            ChangeRequestState::Committed => write!(f, "COMMITTED"),
            ChangeRequestState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// A flat `setting -> value` configuration. `BTreeMap` keeps the serialized
/// form canonical, which the content hash depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Configuration {
    pub settings: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, setting: &str) -> Option<&str> {
        self.settings.get(setting).map(String::as_str)
    }

    pub fn with(mut self, setting: &str, value: &str) -> Self {
        self.settings.insert(setting.to_string(), value.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigChange {
    Set { setting: String, value: String },
    Unset { setting: String },
    Batch { changes: Vec<ConfigChange> },
}

impl ConfigChange {
    pub fn set(setting: &str, value: &str) -> Self {
        ConfigChange::Set {
            setting: setting.to_string(),
            value: value.to_string(),
        }
    }

    pub fn unset(setting: &str) -> Self {
        ConfigChange::Unset {
            setting: setting.to_string(),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            ConfigChange::Set { setting, value } => format!("set {}={}", setting, value),
            ConfigChange::Unset { setting } => format!("unset {}", setting),
            ConfigChange::Batch { changes } => changes
                .iter()
                .map(|c| c.summary())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// The durable per-change record kept in the ledger under `change:<uuid>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    pub state: ChangeRequestState,
    pub version: Version,
    pub prev_change_uuid: Option<ChangeId>,
    pub change: ConfigChange,
    pub result_hash: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeDetails {
    pub change_uuid: ChangeId,
    pub state: ChangeRequestState,
    pub version: Version,
    pub change: ConfigChange,
    pub result: Option<Configuration>,
    pub result_hash: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoverResponse {
    pub mode: ServerMode,
    pub mutative_message_count: u64,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
    pub last_mutation_timestamp: Option<DateTime<Utc>>,
    pub current_version: Version,
    pub highest_version: Version,
    pub latest_change: Option<ChangeDetails>,
    pub latest_committed_change: Option<ChangeDetails>,
}

impl DiscoverResponse {
    pub fn latest_change_uuid(&self) -> Option<ChangeId> {
        self.latest_change.as_ref().map(|c| c.change_uuid)
    }

    pub fn latest_committed_uuid(&self) -> Option<ChangeId> {
        self.latest_committed_change.as_ref().map(|c| c.change_uuid)
    }

    pub fn prepared_change(&self) -> Option<&ChangeDetails> {
        match self.mode {
            ServerMode::Prepared => self
                .latest_change
                .as_ref()
                .filter(|c| c.state == ChangeRequestState::Prepared),
            ServerMode::Accepting => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationHeader {
    pub expected_mutative_message_count: u64,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrepareMessage {
    pub header: MutationHeader,
    pub change_uuid: ChangeId,
    pub version: Version,
    pub change: ConfigChange,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitMessage {
    pub header: MutationHeader,
    pub change_uuid: ChangeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackMessage {
    pub header: MutationHeader,
    pub change_uuid: ChangeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TakeoverMessage {
    pub header: MutationHeader,
    pub change_uuid: ChangeId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    /// The expected mutative message count did not match: stale or duplicate message.
    Dead,
    /// The message does not fit the server state (mode, version, change uuid).
    Bad,
    /// The change applicator refused the change.
    Unacceptable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub message: String,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.reason, self.message)?;
        if let (Some(host), Some(user)) = (&self.last_mutation_host, &self.last_mutation_user) {
            write!(f, " (last mutation by {}@{})", user, host)?;
        }
        Ok(())
    }
}

/// Outcome of every mutating message. Serialized as-is on the wire.
pub type MutationResult = Result<(), Rejection>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptRejectResponse {
    pub accepted: bool,
    pub rejection: Option<Rejection>,
}

impl From<MutationResult> for AcceptRejectResponse {
    fn from(result: MutationResult) -> Self {
        match result {
            Ok(()) => Self {
                accepted: true,
                rejection: None,
            },
            Err(rejection) => Self {
                accepted: false,
                rejection: Some(rejection),
            },
        }
    }
}

impl From<AcceptRejectResponse> for MutationResult {
    fn from(response: AcceptRejectResponse) -> Self {
        match (response.accepted, response.rejection) {
            (true, _) => Ok(()),
            (false, Some(rejection)) => Err(rejection),
            (false, None) => Err(Rejection {
                reason: RejectionReason::Bad,
                message: "rejected without a reason".to_string(),
                last_mutation_host: None,
                last_mutation_user: None,
            }),
        }
    }
}
