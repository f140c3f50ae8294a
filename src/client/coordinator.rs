use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::analyzer::{ConsistencyAnalyzer, PreparedChange, RecoveryAction};
use super::endpoint::NomadEndpoint;
use super::results::{LoggingReceiver, Phase, ResultReceiver, ServerStatus};
use crate::error::CoordinatorError;
use crate::types::*;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub host: String,
    pub user: String,
    pub request_timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            user: "unknown".to_string(),
            request_timeout: Duration::from_secs(10),
            max_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeOutcome {
    Applied {
        change_uuid: ChangeId,
        version: Version,
        servers: Vec<ServerAddr>,
    },
    Rejected {
        reasons: BTreeMap<ServerAddr, String>,
    },
    PartiallyApplied {
        change_uuid: ChangeId,
        version: Version,
        statuses: BTreeMap<ServerAddr, ServerStatus>,
    },
    Inconsistent {
        details: String,
    },
}

impl ChangeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ChangeOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No server held a prepared change.
    Clean,
    Recovered {
        committed: Vec<ChangeId>,
        rolled_back: Vec<ChangeId>,
    },
    Incomplete {
        statuses: BTreeMap<ServerAddr, ServerStatus>,
    },
    Inconsistent {
        details: String,
    },
    DiscoveryFailed {
        failures: BTreeMap<ServerAddr, String>,
    },
}

impl RecoveryOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, RecoveryOutcome::Clean | RecoveryOutcome::Recovered { .. })
    }
}

/// A mutating message before its per-server header is attached.
#[derive(Debug, Clone)]
enum Outgoing {
    Prepare {
        change_uuid: ChangeId,
        version: Version,
        change: ConfigChange,
    },
    Commit(ChangeId),
    Rollback(ChangeId),
    Takeover(ChangeId),
}

impl Outgoing {
    fn phase(&self) -> Phase {
        match self {
            Outgoing::Prepare { .. } => Phase::Prepare,
            Outgoing::Commit(_) => Phase::Commit,
            Outgoing::Rollback(_) => Phase::Rollback,
            Outgoing::Takeover(_) => Phase::Takeover,
        }
    }

    async fn send(self, endpoint: &dyn NomadEndpoint, header: MutationHeader) -> anyhow::Result<MutationResult> {
        match self {
            Outgoing::Prepare {
                change_uuid,
                version,
                change,
            } => {
                endpoint
                    .prepare(PrepareMessage {
                        header,
                        change_uuid,
                        version,
                        change,
                    })
                    .await
            }
            Outgoing::Commit(change_uuid) => endpoint.commit(CommitMessage { header, change_uuid }).await,
            Outgoing::Rollback(change_uuid) => {
                endpoint.rollback(RollbackMessage { header, change_uuid }).await
            }
            Outgoing::Takeover(change_uuid) => {
                endpoint.takeover(TakeoverMessage { header, change_uuid }).await
            }
        }
    }
}

/// Expected mutative message count per server, advanced on every accepted
/// mutation so later phases need no second discovery.
struct Session {
    counts: HashMap<ServerAddr, u64>,
}

impl Session {
    fn from_discovery(analyzer: &ConsistencyAnalyzer) -> Self {
        Self {
            counts: analyzer
                .responses()
                .iter()
                .map(|(addr, r)| (addr.clone(), r.mutative_message_count))
                .collect(),
        }
    }

    fn count(&self, server: &str) -> u64 {
        self.counts.get(server).copied().unwrap_or(0)
    }

    fn accepted(&mut self, server: &str) {
        *self.counts.entry(server.to_string()).or_insert(0) += 1;
    }
}

pub struct ChangeCoordinator {
    options: CoordinatorOptions,
    receiver: Arc<dyn ResultReceiver>,
}

impl ChangeCoordinator {
    pub fn new(options: CoordinatorOptions) -> Self {
        Self::with_receiver(options, Arc::new(LoggingReceiver))
    }

    pub fn with_receiver(options: CoordinatorOptions, receiver: Arc<dyn ResultReceiver>) -> Self {
        Self { options, receiver }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Read-only status of the targets.
    pub async fn discover(
        &self,
        targets: &[Arc<dyn NomadEndpoint>],
    ) -> Result<ConsistencyAnalyzer, CoordinatorError> {
        if targets.is_empty() {
            return Err(CoordinatorError::NoTargets);
        }
        Ok(self.discover_all(targets).await)
    }

    /// Resolves changes left prepared by a dead coordinator, without
    /// submitting anything new.
    pub async fn recover(
        &self,
        targets: &[Arc<dyn NomadEndpoint>],
    ) -> Result<RecoveryOutcome, CoordinatorError> {
        if targets.is_empty() {
            return Err(CoordinatorError::NoTargets);
        }

        let analyzer = self.discover_all(targets).await;
        if analyzer.has_unreachable() {
            return Ok(RecoveryOutcome::DiscoveryFailed {
                failures: analyzer.failures().clone(),
            });
        }
        if let Some(details) = analyzer.inconsistency() {
            self.receiver.inconsistent(&details);
            return Ok(RecoveryOutcome::Inconsistent { details });
        }

        let mut session = Session::from_discovery(&analyzer);
        self.recover_prepared(targets, &analyzer, &mut session).await
    }

    /// Applies `change` to every target or to none.
    pub async fn submit_change(
        &self,
        targets: &[Arc<dyn NomadEndpoint>],
        change: ConfigChange,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        if targets.is_empty() {
            return Err(CoordinatorError::NoTargets);
        }

        info!("Submitting change to {} server(s): {}", targets.len(), change.summary());

        let mut analyzer = self.discover_all(targets).await;
        if let Some(outcome) = self.check_discovery(&analyzer) {
            return Ok(outcome);
        }

        if !analyzer.prepared_changes().is_empty() {
            let mut session = Session::from_discovery(&analyzer);
            let recovery = self.recover_prepared(targets, &analyzer, &mut session).await?;
            if let RecoveryOutcome::Incomplete { statuses } = recovery {
                warn!("Recovery of a previous change did not complete, not preparing");
                let reasons = statuses
                    .into_iter()
                    .filter(|(_, s)| !s.is_accepted())
                    .map(|(addr, s)| (addr, format!("recovery failed: {}", s.describe())))
                    .collect();
                return Ok(ChangeOutcome::Rejected { reasons });
            }

            analyzer = self.discover_all(targets).await;
            if let Some(outcome) = self.check_discovery(&analyzer) {
                return Ok(outcome);
            }
        }

        let mut session = Session::from_discovery(&analyzer);
        let change_uuid = Uuid::new_v4();
        let version = analyzer.next_version();
        info!("Preparing change {} as version {}", change_uuid, version);

        let prepared = self
            .run_phase(
                targets,
                &mut session,
                Outgoing::Prepare {
                    change_uuid,
                    version,
                    change,
                },
            )
            .await?;

        let accepted: Vec<Arc<dyn NomadEndpoint>> = targets
            .iter()
            .filter(|t| prepared.get(t.address()).is_some_and(ServerStatus::is_accepted))
            .cloned()
            .collect();

        if accepted.len() == targets.len() {
            let committed = self
                .run_phase(&accepted, &mut session, Outgoing::Commit(change_uuid))
                .await?;

            if committed.values().all(ServerStatus::is_accepted) {
                info!("Change {} applied at version {}", change_uuid, version);
                return Ok(ChangeOutcome::Applied {
                    change_uuid,
                    version,
                    servers: committed.into_keys().collect(),
                });
            }

            warn!(
                "Change {} was only partially committed, the next attempt will recover it",
                change_uuid
            );
            return Ok(ChangeOutcome::PartiallyApplied {
                change_uuid,
                version,
                statuses: committed,
            });
        }

        let mut reasons: BTreeMap<ServerAddr, String> = prepared
            .iter()
            .filter(|(_, s)| !s.is_accepted())
            .map(|(addr, s)| (addr.clone(), s.describe()))
            .collect();

        if !accepted.is_empty() {
            info!(
                "Rolling back change {} on {} server(s) that accepted it",
                change_uuid,
                accepted.len()
            );
            let rolled_back = self
                .run_phase(&accepted, &mut session, Outgoing::Rollback(change_uuid))
                .await?;
            for (addr, status) in rolled_back {
                if !status.is_accepted() {
                    reasons.insert(addr, format!("rollback failed: {}", status.describe()));
                }
            }
        }

        Ok(ChangeOutcome::Rejected { reasons })
    }

    fn check_discovery(&self, analyzer: &ConsistencyAnalyzer) -> Option<ChangeOutcome> {
        if analyzer.has_unreachable() {
            return Some(ChangeOutcome::Rejected {
                reasons: analyzer
                    .failures()
                    .iter()
                    .map(|(addr, reason)| (addr.clone(), format!("discovery failed: {}", reason)))
                    .collect(),
            });
        }

        analyzer.inconsistency().map(|details| {
            self.receiver.inconsistent(&details);
            ChangeOutcome::Inconsistent { details }
        })
    }

    async fn recover_prepared(
        &self,
        targets: &[Arc<dyn NomadEndpoint>],
        analyzer: &ConsistencyAnalyzer,
        session: &mut Session,
    ) -> Result<RecoveryOutcome, CoordinatorError> {
        let changes = analyzer.prepared_changes();
        if changes.is_empty() {
            return Ok(RecoveryOutcome::Clean);
        }

        let mut committed = Vec::new();
        let mut rolled_back = Vec::new();
        let mut failed = BTreeMap::new();

        for change in changes {
            let statuses = self.recover_change(targets, &change, session).await?;
            if statuses.values().all(ServerStatus::is_accepted) {
                match change.decision() {
                    RecoveryAction::Commit => committed.push(change.change_uuid),
                    RecoveryAction::Rollback => rolled_back.push(change.change_uuid),
                }
            } else {
                failed.extend(statuses);
            }
        }

        if failed.is_empty() {
            Ok(RecoveryOutcome::Recovered {
                committed,
                rolled_back,
            })
        } else {
            Ok(RecoveryOutcome::Incomplete { statuses: failed })
        }
    }

    async fn recover_change(
        &self,
        targets: &[Arc<dyn NomadEndpoint>],
        change: &PreparedChange,
        session: &mut Session,
    ) -> Result<BTreeMap<ServerAddr, ServerStatus>, CoordinatorError> {
        let stragglers: Vec<Arc<dyn NomadEndpoint>> = targets
            .iter()
            .filter(|t| change.prepared_on.iter().any(|a| a == t.address()))
            .cloned()
            .collect();

        let action = change.decision();
        info!(
            "Taking over change {} (version {}) on {} server(s), decision: {:?}",
            change.change_uuid,
            change.version,
            stragglers.len(),
            action
        );

        let mut statuses = self
            .run_phase(&stragglers, session, Outgoing::Takeover(change.change_uuid))
            .await?;

        let taken: Vec<Arc<dyn NomadEndpoint>> = stragglers
            .into_iter()
            .filter(|t| statuses.get(t.address()).is_some_and(ServerStatus::is_accepted))
            .collect();

        let outgoing = match action {
            RecoveryAction::Commit => Outgoing::Commit(change.change_uuid),
            RecoveryAction::Rollback => Outgoing::Rollback(change.change_uuid),
        };
        statuses.extend(self.run_phase(&taken, session, outgoing).await?);
        Ok(statuses)
    }

    async fn discover_all(&self, targets: &[Arc<dyn NomadEndpoint>]) -> ConsistencyAnalyzer {
        let addrs: Vec<ServerAddr> = targets.iter().map(|t| t.address().to_string()).collect();
        self.receiver.phase_started(Phase::Discover, &addrs);

        let timeout = self.options.request_timeout;
        let results: Vec<(ServerAddr, Result<DiscoverResponse, String>)> = stream::iter(targets.iter().cloned())
            .map(|endpoint| async move {
                let addr = endpoint.address().to_string();
                let result = match tokio::time::timeout(timeout, endpoint.discover()).await {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("no response within {:?}", timeout)),
                };
                (addr, result)
            })
            .buffer_unordered(self.concurrency(targets.len()))
            .collect()
            .await;

        for (addr, result) in &results {
            match result {
                Ok(response) => self.receiver.discovered(addr, response),
                Err(reason) => self.receiver.discover_failed(addr, reason),
            }
        }
        self.receiver.phase_finished(Phase::Discover);

        ConsistencyAnalyzer::new(results)
    }

    /// Sends one message to every target concurrently and waits for all of
    /// them. A `Bad` rejection outside Prepare means this coordinator and the
    /// server disagree about the protocol and aborts the run.
    async fn run_phase(
        &self,
        targets: &[Arc<dyn NomadEndpoint>],
        session: &mut Session,
        outgoing: Outgoing,
    ) -> Result<BTreeMap<ServerAddr, ServerStatus>, CoordinatorError> {
        let phase = outgoing.phase();
        let addrs: Vec<ServerAddr> = targets.iter().map(|t| t.address().to_string()).collect();
        self.receiver.phase_started(phase, &addrs);

        let timeout = self.options.request_timeout;
        let now = Utc::now();
        let headers: Vec<MutationHeader> = addrs
            .iter()
            .map(|addr| MutationHeader {
                expected_mutative_message_count: session.count(addr),
                mutation_host: self.options.host.clone(),
                mutation_user: self.options.user.clone(),
                mutation_timestamp: now,
            })
            .collect();

        let results: Vec<(ServerAddr, ServerStatus)> = stream::iter(targets.iter().cloned().zip(headers))
            .map(|(endpoint, header)| {
                let outgoing = outgoing.clone();
                async move {
                    let addr = endpoint.address().to_string();
                    let status =
                        match tokio::time::timeout(timeout, outgoing.send(endpoint.as_ref(), header)).await {
                            Ok(Ok(Ok(()))) => ServerStatus::Accepted,
                            Ok(Ok(Err(rejection))) => ServerStatus::Rejected(rejection),
                            Ok(Err(e)) => ServerStatus::Unreachable(e.to_string()),
                            Err(_) => ServerStatus::TimedOut,
                        };
                    (addr, status)
                }
            })
            .buffer_unordered(self.concurrency(targets.len()))
            .collect()
            .await;

        let mut violation = None;
        let mut statuses = BTreeMap::new();
        for (addr, status) in results {
            self.receiver.server_result(phase, &addr, &status);
            match &status {
                ServerStatus::Accepted => session.accepted(&addr),
                ServerStatus::Rejected(rejection)
                    if rejection.reason == RejectionReason::Bad && phase != Phase::Prepare =>
                {
                    violation.get_or_insert_with(|| CoordinatorError::ContractViolation {
                        server: addr.clone(),
                        message: rejection.message.clone(),
                    });
                }
                _ => {}
            }
            statuses.insert(addr, status);
        }
        self.receiver.phase_finished(phase);

        match violation {
            Some(e) => Err(e),
            None => Ok(statuses),
        }
    }

    fn concurrency(&self, targets: usize) -> usize {
        targets.min(self.options.max_concurrency).max(1)
    }
}
