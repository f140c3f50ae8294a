use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::types::*;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    Discover,
    Takeover,
    Prepare,
    Commit,
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Discover => write!(f, "discover"),
            Phase::Takeover => write!(f, "takeover"),
            Phase::Prepare => write!(f, "prepare"),
            Phase::Commit => write!(f, "commit"),
            Phase::Rollback => write!(f, "rollback"),
        }
    }
}

/// What happened to one mutating message sent to one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerStatus {
    Accepted,
    Rejected(Rejection),
    Unreachable(String),
    TimedOut,
}

impl ServerStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ServerStatus::Accepted)
    }

    pub fn describe(&self) -> String {
        match self {
            ServerStatus::Accepted => "accepted".to_string(),
            ServerStatus::Rejected(rejection) => format!("rejected: {}", rejection),
            ServerStatus::Unreachable(reason) => format!("unreachable: {}", reason),
            ServerStatus::TimedOut => "timed out".to_string(),
        }
    }
}

/// Receives progress of a coordination run. Every callback defaults to a no-op.
pub trait ResultReceiver: Send + Sync {
    fn phase_started(&self, _phase: Phase, _servers: &[ServerAddr]) {}

    fn discovered(&self, _server: &str, _response: &DiscoverResponse) {}

    fn discover_failed(&self, _server: &str, _reason: &str) {}

    fn server_result(&self, _phase: Phase, _server: &str, _status: &ServerStatus) {}

    fn phase_finished(&self, _phase: Phase) {}

    fn inconsistent(&self, _details: &str) {}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseReport {
    pub servers: BTreeMap<ServerAddr, ServerStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub discovered: BTreeMap<ServerAddr, DiscoverResponse>,
    pub discovery_failures: BTreeMap<ServerAddr, String>,
    pub phases: Vec<(Phase, PhaseReport)>,
    pub inconsistencies: Vec<String>,
}

impl RunReport {
    /// Results of the most recent run of `phase`.
    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().rev().find(|(p, _)| *p == phase).map(|(_, r)| r)
    }

    pub fn accepted(&self, phase: Phase) -> Vec<ServerAddr> {
        self.phase(phase)
            .map(|r| {
                r.servers
                    .iter()
                    .filter(|(_, s)| s.is_accepted())
                    .map(|(addr, _)| addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn failures(&self, phase: Phase) -> BTreeMap<ServerAddr, ServerStatus> {
        self.phase(phase)
            .map(|r| {
                r.servers
                    .iter()
                    .filter(|(_, s)| !s.is_accepted())
                    .map(|(addr, s)| (addr.clone(), s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Accumulates every callback into a [`RunReport`].
#[derive(Clone, Default)]
pub struct ReportCollector {
    report: Arc<RwLock<RunReport>>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> RunReport {
        self.report.read().unwrap().clone()
    }
}

impl ResultReceiver for ReportCollector {
    fn phase_started(&self, phase: Phase, _servers: &[ServerAddr]) {
        if phase != Phase::Discover {
            self.report
                .write()
                .unwrap()
                .phases
                .push((phase, PhaseReport::default()));
        }
    }

    fn discovered(&self, server: &str, response: &DiscoverResponse) {
        let mut report = self.report.write().unwrap();
        report.discovery_failures.remove(server);
        report.discovered.insert(server.to_string(), response.clone());
    }

    fn discover_failed(&self, server: &str, reason: &str) {
        let mut report = self.report.write().unwrap();
        report.discovered.remove(server);
        report
            .discovery_failures
            .insert(server.to_string(), reason.to_string());
    }

    fn server_result(&self, phase: Phase, server: &str, status: &ServerStatus) {
        let mut report = self.report.write().unwrap();
        if let Some((_, phase_report)) = report.phases.iter_mut().rev().find(|(p, _)| *p == phase) {
            phase_report.servers.insert(server.to_string(), status.clone());
        }
    }

    fn inconsistent(&self, details: &str) {
        self.report
            .write()
            .unwrap()
            .inconsistencies
            .push(details.to_string());
    }
}

pub struct LoggingReceiver;

impl ResultReceiver for LoggingReceiver {
    fn phase_started(&self, phase: Phase, servers: &[ServerAddr]) {
        info!("Starting {} on {} server(s)", phase, servers.len());
    }

    fn discovered(&self, server: &str, response: &DiscoverResponse) {
        debug!(
            "Discovered {}: mode={} version={} count={}",
            server, response.mode, response.current_version, response.mutative_message_count
        );
    }

    fn discover_failed(&self, server: &str, reason: &str) {
        warn!("Discovery of {} failed: {}", server, reason);
    }

    fn server_result(&self, phase: Phase, server: &str, status: &ServerStatus) {
        if status.is_accepted() {
            info!("{} {}: {}", phase, server, status.describe());
        } else {
            warn!("{} {}: {}", phase, server, status.describe());
        }
    }

    fn phase_finished(&self, phase: Phase) {
        debug!("Finished {}", phase);
    }

    fn inconsistent(&self, details: &str) {
        warn!("Cluster is inconsistent: {}", details);
    }
}

/// Forwards every callback to each wrapped receiver, in order.
#[derive(Clone, Default)]
pub struct MuxReceiver {
    receivers: Vec<Arc<dyn ResultReceiver>>,
}

impl MuxReceiver {
    pub fn new(receivers: Vec<Arc<dyn ResultReceiver>>) -> Self {
        Self { receivers }
    }

    pub fn push(&mut self, receiver: Arc<dyn ResultReceiver>) {
        self.receivers.push(receiver);
    }
}

impl ResultReceiver for MuxReceiver {
    fn phase_started(&self, phase: Phase, servers: &[ServerAddr]) {
        self.receivers.iter().for_each(|r| r.phase_started(phase, servers));
    }

    fn discovered(&self, server: &str, response: &DiscoverResponse) {
        self.receivers.iter().for_each(|r| r.discovered(server, response));
    }

    fn discover_failed(&self, server: &str, reason: &str) {
        self.receivers.iter().for_each(|r| r.discover_failed(server, reason));
    }

    fn server_result(&self, phase: Phase, server: &str, status: &ServerStatus) {
        self.receivers.iter().for_each(|r| r.server_result(phase, server, status));
    }

    fn phase_finished(&self, phase: Phase) {
        self.receivers.iter().for_each(|r| r.phase_finished(phase));
    }

    fn inconsistent(&self, details: &str) {
        self.receivers.iter().for_each(|r| r.inconsistent(details));
    }
}
