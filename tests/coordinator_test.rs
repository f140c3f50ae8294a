use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use flockconf::client::*;
use flockconf::ledger::*;
use flockconf::server::*;
use flockconf::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct RefusingApplicator;

impl ChangeApplicator for RefusingApplicator {
    fn try_apply(&self, _existing: Option<&Configuration>, _change: &ConfigChange) -> PotentialApplication {
        PotentialApplication::Rejected("semantic refusal".to_string())
    }

    fn apply(&mut self, _change: &ConfigChange, _new_config: &Configuration) -> anyhow::Result<()> {
        Ok(())
    }
}

fn spawn_with<A: ChangeApplicator + 'static>(applicator: A) -> NodeHandle {
    let ledger = Ledger::open(Box::new(MemoryLog::new())).unwrap();
    let state = ServerState::new(ledger, Box::new(MemoryConfigStore::new()));
    spawn_node(ConfigServer::new(state, applicator).unwrap())
}

fn memory_node() -> NodeHandle {
    spawn_with(SettingsApplicator::new(ApplicatorPolicy::default()))
}

fn local(addr: &str, node: &NodeHandle) -> Arc<dyn NomadEndpoint> {
    Arc::new(LocalEndpoint::new(addr, node.clone()))
}

#[derive(Clone, Copy, PartialEq)]
enum Fault {
    FailCommit,
    HangPrepare,
    HangCommit,
    FailDiscover,
}

/// Forwards to a local node, except for the injected fault.
struct FaultyEndpoint {
    inner: LocalEndpoint,
    fault: Fault,
}

impl FaultyEndpoint {
    fn new(addr: &str, node: &NodeHandle, fault: Fault) -> Arc<dyn NomadEndpoint> {
        Arc::new(Self {
            inner: LocalEndpoint::new(addr, node.clone()),
            fault,
        })
    }
}

#[async_trait]
impl NomadEndpoint for FaultyEndpoint {
    fn address(&self) -> &str {
        self.inner.address()
    }

    async fn discover(&self) -> anyhow::Result<DiscoverResponse> {
        if self.fault == Fault::FailDiscover {
            return Err(anyhow!("connection refused"));
        }
        self.inner.discover().await
    }

    async fn prepare(&self, message: PrepareMessage) -> anyhow::Result<MutationResult> {
        if self.fault == Fault::HangPrepare {
            futures::future::pending::<()>().await;
        }
        self.inner.prepare(message).await
    }

    async fn commit(&self, message: CommitMessage) -> anyhow::Result<MutationResult> {
        match self.fault {
            Fault::FailCommit => Err(anyhow!("connection reset")),
            Fault::HangCommit => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            _ => self.inner.commit(message).await,
        }
    }

    async fn rollback(&self, message: RollbackMessage) -> anyhow::Result<MutationResult> {
        self.inner.rollback(message).await
    }

    async fn takeover(&self, message: TakeoverMessage) -> anyhow::Result<MutationResult> {
        self.inner.takeover(message).await
    }
}

fn coordinator() -> ChangeCoordinator {
    ChangeCoordinator::new(CoordinatorOptions {
        host: "ops-host".to_string(),
        user: "operator".to_string(),
        request_timeout: Duration::from_millis(300),
        max_concurrency: 4,
    })
}

fn header(count: u64) -> MutationHeader {
    MutationHeader {
        expected_mutative_message_count: count,
        mutation_host: "crashed-host".to_string(),
        mutation_user: "ghost".to_string(),
        mutation_timestamp: Utc::now(),
    }
}

/// Prepares a change directly, as a coordinator that then dies would.
async fn prepare_directly(node: &NodeHandle, uuid: ChangeId, change: ConfigChange) {
    let discovery = node.discover().await.unwrap();
    node.prepare(PrepareMessage {
        header: header(discovery.mutative_message_count),
        change_uuid: uuid,
        version: discovery.current_version + 1,
        change,
    })
    .await
    .unwrap()
    .unwrap();
}

async fn commit_directly(node: &NodeHandle, uuid: ChangeId) {
    let discovery = node.discover().await.unwrap();
    node.commit(CommitMessage {
        header: header(discovery.mutative_message_count),
        change_uuid: uuid,
    })
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_change_applied_when_all_accept() {
    let nodes = [memory_node(), memory_node(), memory_node()];
    let targets: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| local(&format!("node-{}", i), n))
        .collect();

    let outcome = coordinator()
        .submit_change(&targets, ConfigChange::set("offheap", "512MB"))
        .await
        .unwrap();

    let ChangeOutcome::Applied { version, servers, .. } = outcome.clone() else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert_eq!(version, 1);
    assert_eq!(servers.len(), 3);

    let mut hashes = Vec::new();
    for node in &nodes {
        let discovery = node.discover().await.unwrap();
        assert_eq!(discovery.mode, ServerMode::Accepting);
        assert_eq!(discovery.current_version, 1);
        hashes.push(discovery.latest_committed_change.unwrap().result_hash);
    }
    hashes.dedup();
    assert_eq!(hashes.len(), 1);
}

#[tokio::test]
async fn test_one_refusal_rolls_back_the_others() {
    let n1 = memory_node();
    let n2 = spawn_with(RefusingApplicator);
    let targets = vec![local("n1", &n1), local("n2", &n2)];

    let collector = Arc::new(ReportCollector::new());
    let mut receivers = MuxReceiver::new(vec![Arc::new(LoggingReceiver) as Arc<dyn ResultReceiver>]);
    receivers.push(collector.clone());
    let coordinator = ChangeCoordinator::with_receiver(CoordinatorOptions::default(), Arc::new(receivers));

    let outcome = coordinator
        .submit_change(&targets, ConfigChange::set("offheap", "512MB"))
        .await
        .unwrap();

    let ChangeOutcome::Rejected { reasons } = outcome.clone() else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert_eq!(reasons.len(), 1);
    assert!(reasons["n2"].contains("semantic refusal"));

    let report = collector.report();
    assert_eq!(report.accepted(Phase::Rollback), vec!["n1".to_string()]);
    assert!(report.phase(Phase::Commit).is_none());

    for node in [&n1, &n2] {
        let discovery = node.discover().await.unwrap();
        assert_eq!(discovery.mode, ServerMode::Accepting);
        assert_eq!(discovery.current_version, 0);
    }
}

#[tokio::test]
async fn test_recover_rolls_back_foreign_prepared_change() {
    let node = memory_node();
    let foreign = Uuid::new_v4();
    prepare_directly(&node, foreign, ConfigChange::set("a", "1")).await;

    let outcome = coordinator().recover(&[local("n1", &node)]).await.unwrap();
    assert_eq!(
        outcome,
        RecoveryOutcome::Recovered {
            committed: vec![],
            rolled_back: vec![foreign],
        }
    );

    let discovery = node.discover().await.unwrap();
    assert_eq!(discovery.mode, ServerMode::Accepting);
    assert_eq!(discovery.current_version, 0);
    assert_eq!(discovery.last_mutation_user.as_deref(), Some("operator"));

    let again = coordinator().recover(&[local("n1", &node)]).await.unwrap();
    assert_eq!(again, RecoveryOutcome::Clean);
}

#[tokio::test]
async fn test_submit_recovers_before_preparing() {
    let n1 = memory_node();
    let n2 = memory_node();
    let foreign = Uuid::new_v4();
    prepare_directly(&n1, foreign, ConfigChange::set("a", "1")).await;
    prepare_directly(&n2, foreign, ConfigChange::set("a", "1")).await;

    let outcome = coordinator()
        .submit_change(&[local("n1", &n1), local("n2", &n2)], ConfigChange::set("b", "2"))
        .await
        .unwrap();
    assert!(outcome.is_applied(), "unexpected outcome {:?}", outcome);

    for node in [&n1, &n2] {
        let config = node.current_config().await.unwrap().unwrap();
        assert!(config.get("a").is_none());
        assert_eq!(config.get("b"), Some("2"));
        assert_eq!(node.discover().await.unwrap().current_version, 1);
    }
}

#[tokio::test]
async fn test_partial_commit_is_finished_by_next_attempt() {
    let n1 = memory_node();
    let n2 = memory_node();

    let outcome = coordinator()
        .submit_change(
            &[local("n1", &n1), FaultyEndpoint::new("n2", &n2, Fault::FailCommit)],
            ConfigChange::set("a", "1"),
        )
        .await
        .unwrap();

    let ChangeOutcome::PartiallyApplied { change_uuid, statuses, .. } = outcome.clone() else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert!(statuses["n1"].is_accepted());
    assert!(matches!(statuses["n2"], ServerStatus::Unreachable(_)));

    let stuck = n2.discover().await.unwrap();
    assert_eq!(stuck.mode, ServerMode::Prepared);
    assert_eq!(stuck.prepared_change().map(|c| c.change_uuid), Some(change_uuid));

    let analyzer = coordinator()
        .discover(&[local("n1", &n1), local("n2", &n2)])
        .await
        .unwrap();
    assert_eq!(analyzer.global_state(), GlobalState::PartiallyCommitted);
    assert!(analyzer.inconsistency().is_none());

    let outcome = coordinator()
        .submit_change(&[local("n1", &n1), local("n2", &n2)], ConfigChange::set("b", "2"))
        .await
        .unwrap();
    let ChangeOutcome::Applied { version, .. } = outcome.clone() else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert_eq!(version, 2);

    for node in [&n1, &n2] {
        let config = node.current_config().await.unwrap().unwrap();
        assert_eq!(config.get("a"), Some("1"));
        assert_eq!(config.get("b"), Some("2"));
    }
}

#[tokio::test]
async fn test_commit_timeout_is_partial() {
    let n1 = memory_node();
    let n2 = memory_node();

    let outcome = coordinator()
        .submit_change(
            &[local("n1", &n1), FaultyEndpoint::new("n2", &n2, Fault::HangCommit)],
            ConfigChange::set("a", "1"),
        )
        .await
        .unwrap();

    let ChangeOutcome::PartiallyApplied { statuses, .. } = outcome.clone() else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert_eq!(statuses["n2"], ServerStatus::TimedOut);
}

#[tokio::test]
async fn test_prepare_timeout_counts_as_rejection() {
    let n1 = memory_node();
    let n2 = memory_node();

    let outcome = coordinator()
        .submit_change(
            &[local("n1", &n1), FaultyEndpoint::new("n2", &n2, Fault::HangPrepare)],
            ConfigChange::set("a", "1"),
        )
        .await
        .unwrap();

    let ChangeOutcome::Rejected { reasons } = outcome.clone() else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert_eq!(reasons["n2"], "timed out");

    let discovery = n1.discover().await.unwrap();
    assert_eq!(discovery.mode, ServerMode::Accepting);
    assert_eq!(discovery.current_version, 0);
}

#[tokio::test]
async fn test_unreachable_target_aborts_before_prepare() {
    let n1 = memory_node();
    let n2 = memory_node();

    let outcome = coordinator()
        .submit_change(
            &[local("n1", &n1), FaultyEndpoint::new("n2", &n2, Fault::FailDiscover)],
            ConfigChange::set("a", "1"),
        )
        .await
        .unwrap();

    let ChangeOutcome::Rejected { reasons } = outcome.clone() else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert!(reasons["n2"].contains("discovery failed"));
    assert_eq!(n1.discover().await.unwrap().mutative_message_count, 0);
}

#[tokio::test]
async fn test_divergent_history_is_inconsistent() {
    let n1 = memory_node();
    let n2 = memory_node();

    let a = Uuid::new_v4();
    prepare_directly(&n1, a, ConfigChange::set("a", "1")).await;
    commit_directly(&n1, a).await;

    let b = Uuid::new_v4();
    prepare_directly(&n2, b, ConfigChange::set("b", "1")).await;
    commit_directly(&n2, b).await;

    let outcome = coordinator()
        .submit_change(&[local("n1", &n1), local("n2", &n2)], ConfigChange::set("c", "1"))
        .await
        .unwrap();
    assert!(matches!(outcome, ChangeOutcome::Inconsistent { .. }));

    for node in [&n1, &n2] {
        assert_eq!(node.discover().await.unwrap().mutative_message_count, 2);
    }
}

#[tokio::test]
async fn test_version_gap_is_inconsistent() {
    let n1 = memory_node();
    let n2 = memory_node();

    for _ in 0..2 {
        let uuid = Uuid::new_v4();
        prepare_directly(&n1, uuid, ConfigChange::set("a", &uuid.to_string())).await;
        commit_directly(&n1, uuid).await;
    }

    let outcome = coordinator()
        .submit_change(&[local("n1", &n1), local("n2", &n2)], ConfigChange::set("c", "1"))
        .await
        .unwrap();
    assert!(matches!(outcome, ChangeOutcome::Inconsistent { .. }));
}

#[tokio::test]
async fn test_no_targets_is_an_error() {
    let err = coordinator()
        .submit_change(&[], ConfigChange::set("a", "1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoTargets));
}
