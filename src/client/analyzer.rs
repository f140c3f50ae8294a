use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::types::*;

/// Cluster-wide reading of a set of discovery responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum GlobalState {
    Accepting,
    Prepared,
    MaybePrepared,
    PartiallyPrepared,
    PartiallyCommitted,
    MaybePartiallyCommitted,
    PartiallyRolledBack,
    MaybePartiallyRolledBack,
    Inconsistent,
    DiscoveryFailure,
    Unknown,
    MaybeUnknown,
}

impl fmt::Display for GlobalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GlobalState::Accepting => "ACCEPTING",
            GlobalState::Prepared => "PREPARED",
            GlobalState::MaybePrepared => "MAYBE_PREPARED",
            GlobalState::PartiallyPrepared => "PARTIALLY_PREPARED",
            GlobalState::PartiallyCommitted => "PARTIALLY_COMMITTED",
            GlobalState::MaybePartiallyCommitted => "MAYBE_PARTIALLY_COMMITTED",
            GlobalState::PartiallyRolledBack => "PARTIALLY_ROLLED_BACK",
            GlobalState::MaybePartiallyRolledBack => "MAYBE_PARTIALLY_ROLLED_BACK",
            GlobalState::Inconsistent => "INCONSISTENT",
            GlobalState::DiscoveryFailure => "DISCOVERY_FAILURE",
            GlobalState::Unknown => "UNKNOWN",
            GlobalState::MaybeUnknown => "MAYBE_UNKNOWN",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    Commit,
    Rollback,
}

/// A change left prepared by some earlier coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChange {
    pub change_uuid: ChangeId,
    pub version: Version,
    pub prepared_on: Vec<ServerAddr>,
    pub committed_on: Vec<ServerAddr>,
    pub rolled_back_on: Vec<ServerAddr>,
}

impl PreparedChange {
    /// Commit as soon as one server committed the change, otherwise roll back.
    pub fn decision(&self) -> RecoveryAction {
        if self.committed_on.is_empty() {
            RecoveryAction::Rollback
        } else {
            RecoveryAction::Commit
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsistencyAnalyzer {
    responses: BTreeMap<ServerAddr, DiscoverResponse>,
    failures: BTreeMap<ServerAddr, String>,
}

impl ConsistencyAnalyzer {
    pub fn new<I>(results: I) -> Self
    where
        I: IntoIterator<Item = (ServerAddr, Result<DiscoverResponse, String>)>,
    {
        let mut analyzer = Self::default();
        for (addr, result) in results {
            match result {
                Ok(response) => {
                    analyzer.responses.insert(addr, response);
                }
                Err(reason) => {
                    analyzer.failures.insert(addr, reason);
                }
            }
        }
        analyzer
    }

    pub fn responses(&self) -> &BTreeMap<ServerAddr, DiscoverResponse> {
        &self.responses
    }

    pub fn response(&self, server: &str) -> Option<&DiscoverResponse> {
        self.responses.get(server)
    }

    pub fn failures(&self) -> &BTreeMap<ServerAddr, String> {
        &self.failures
    }

    pub fn has_unreachable(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.responses.len() + self.failures.len()
    }

    pub fn max_current_version(&self) -> Version {
        self.responses
            .values()
            .map(|r| r.current_version)
            .max()
            .unwrap_or(0)
    }

    pub fn next_version(&self) -> Version {
        self.max_current_version() + 1
    }

    /// Describes the first divergence in committed history, if any. Such a
    /// cluster is never repaired automatically.
    pub fn inconsistency(&self) -> Option<String> {
        if let Some(details) = self.committed_and_rolled_back() {
            return Some(details);
        }

        let max_version = self.max_current_version();
        let committed_at_max: BTreeSet<Option<ChangeId>> = self
            .responses
            .values()
            .filter(|r| r.current_version == max_version)
            .map(|r| r.latest_committed_uuid())
            .collect();

        if committed_at_max.len() > 1 {
            return Some(format!(
                "servers at version {} committed different changes: {}",
                max_version,
                committed_at_max
                    .iter()
                    .map(|u| u.map(|u| u.to_string()).unwrap_or_else(|| "none".to_string()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        let head = committed_at_max.into_iter().next().flatten();

        for (addr, response) in &self.responses {
            if response.current_version == max_version {
                continue;
            }
            let catching_up = response.current_version + 1 == max_version
                && response.prepared_change().map(|c| c.change_uuid) == head
                && head.is_some();
            if !catching_up {
                return Some(format!(
                    "{} is at version {} while other servers are at version {}",
                    addr, response.current_version, max_version
                ));
            }
        }

        None
    }

    fn committed_and_rolled_back(&self) -> Option<String> {
        let mut committed: BTreeMap<ChangeId, Vec<&str>> = BTreeMap::new();
        let mut rolled_back: BTreeMap<ChangeId, Vec<&str>> = BTreeMap::new();

        for (addr, response) in &self.responses {
            if let Some(uuid) = response.latest_committed_uuid() {
                committed.entry(uuid).or_default().push(addr.as_str());
            }
            if let Some(change) = &response.latest_change {
                if change.state == ChangeRequestState::RolledBack {
                    rolled_back.entry(change.change_uuid).or_default().push(addr.as_str());
                }
            }
        }

        rolled_back.iter().find_map(|(uuid, rolled)| {
            committed.get(uuid).map(|committed| {
                format!(
                    "change {} is committed on [{}] but rolled back on [{}]",
                    uuid,
                    committed.join(", "),
                    rolled.join(", ")
                )
            })
        })
    }

    /// Every change a server still holds prepared, with its fate elsewhere.
    pub fn prepared_changes(&self) -> Vec<PreparedChange> {
        let mut changes: BTreeMap<ChangeId, PreparedChange> = BTreeMap::new();

        for (addr, response) in &self.responses {
            if let Some(prepared) = response.prepared_change() {
                changes
                    .entry(prepared.change_uuid)
                    .or_insert_with(|| PreparedChange {
                        change_uuid: prepared.change_uuid,
                        version: prepared.version,
                        prepared_on: Vec::new(),
                        committed_on: Vec::new(),
                        rolled_back_on: Vec::new(),
                    })
                    .prepared_on
                    .push(addr.clone());
            }
        }

        for change in changes.values_mut() {
            for (addr, response) in &self.responses {
                if response.latest_committed_uuid() == Some(change.change_uuid) {
                    change.committed_on.push(addr.clone());
                } else if let Some(latest) = &response.latest_change {
                    if latest.change_uuid == change.change_uuid
                        && latest.state == ChangeRequestState::RolledBack
                    {
                        change.rolled_back_on.push(addr.clone());
                    }
                }
            }
        }

        changes.into_values().collect()
    }

    pub fn global_state(&self) -> GlobalState {
        if self.responses.is_empty() {
            return GlobalState::DiscoveryFailure;
        }

        if self.inconsistency().is_some() {
            return GlobalState::Inconsistent;
        }

        if self
            .responses
            .values()
            .all(|r| r.mode == ServerMode::Accepting)
        {
            return GlobalState::Accepting;
        }

        let latest: Vec<&ChangeDetails> = self
            .responses
            .values()
            .filter_map(|r| r.latest_change.as_ref())
            .collect();

        let uuids: BTreeSet<ChangeId> = latest.iter().map(|c| c.change_uuid).collect();
        let count = |state: ChangeRequestState| latest.iter().filter(|c| c.state == state).count();
        let prepared = count(ChangeRequestState::Prepared);
        let committed = count(ChangeRequestState::Committed);
        let rolled_back = count(ChangeRequestState::RolledBack);
        let nodes = self.node_count();

        if uuids.len() > 1 && prepared > 0 {
            return GlobalState::PartiallyPrepared;
        }
        if uuids.len() != 1 || prepared == 0 {
            return self.unknown();
        }

        match (committed > 0, rolled_back > 0) {
            (false, false) if prepared >= nodes => GlobalState::Prepared,
            (false, false) => GlobalState::MaybePrepared,
            (true, false) if prepared + committed >= nodes => GlobalState::PartiallyCommitted,
            (true, false) => GlobalState::MaybePartiallyCommitted,
            (false, true) if prepared + rolled_back >= nodes => GlobalState::PartiallyRolledBack,
            (false, true) => GlobalState::MaybePartiallyRolledBack,
            (true, true) => GlobalState::Inconsistent,
        }
    }

    fn unknown(&self) -> GlobalState {
        if self.has_unreachable() {
            GlobalState::MaybeUnknown
        } else {
            GlobalState::Unknown
        }
    }
}
