use chrono::Utc;
use flockconf::ledger::*;
use flockconf::server::*;
use flockconf::*;
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    log: MemoryLog,
    store: MemoryConfigStore,
}

impl Harness {
    fn new() -> Self {
        Self {
            log: MemoryLog::new(),
            store: MemoryConfigStore::new(),
        }
    }

    fn open(&self) -> Result<ConfigServer<SettingsApplicator>, ServerError> {
        let ledger = Ledger::open(Box::new(self.log.clone()))?;
        let state = ServerState::new(ledger, Box::new(self.store.clone()));
        ConfigServer::new(state, SettingsApplicator::new(ApplicatorPolicy::default()))
    }
}

fn header(count: u64) -> MutationHeader {
    MutationHeader {
        expected_mutative_message_count: count,
        mutation_host: "host-a".to_string(),
        mutation_user: "alice".to_string(),
        mutation_timestamp: Utc::now(),
    }
}

fn prepare(count: u64, uuid: ChangeId, version: Version, change: ConfigChange) -> PrepareMessage {
    PrepareMessage {
        header: header(count),
        change_uuid: uuid,
        version,
        change,
    }
}

fn commit(count: u64, uuid: ChangeId) -> CommitMessage {
    CommitMessage {
        header: header(count),
        change_uuid: uuid,
    }
}

fn rollback(count: u64, uuid: ChangeId) -> RollbackMessage {
    RollbackMessage {
        header: header(count),
        change_uuid: uuid,
    }
}

fn takeover(count: u64, uuid: ChangeId) -> TakeoverMessage {
    TakeoverMessage {
        header: MutationHeader {
            mutation_host: "host-b".to_string(),
            mutation_user: "bob".to_string(),
            ..header(count)
        },
        change_uuid: uuid,
    }
}

fn rejection_reason(result: MutationResult) -> RejectionReason {
    result.expect_err("message should have been rejected").reason
}

#[test]
fn test_fresh_node_is_accepting_at_version_zero() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();

    let discovery = server.discover().unwrap();
    assert_eq!(discovery.mode, ServerMode::Accepting);
    assert_eq!(discovery.current_version, 0);
    assert_eq!(discovery.highest_version, 0);
    assert_eq!(discovery.mutative_message_count, 0);
    assert!(discovery.latest_change.is_none());
    assert!(discovery.last_mutation_host.is_none());
    assert!(!server.has_incomplete_change().unwrap());
}

#[test]
fn test_prepare_then_commit() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();
    let uuid = Uuid::new_v4();

    server
        .prepare(&prepare(0, uuid, 1, ConfigChange::set("offheap", "512MB")))
        .unwrap()
        .unwrap();

    let prepared = server.discover().unwrap();
    assert_eq!(prepared.mode, ServerMode::Prepared);
    assert_eq!(prepared.current_version, 0);
    assert_eq!(prepared.highest_version, 1);
    assert_eq!(prepared.mutative_message_count, 1);
    assert_eq!(prepared.prepared_change().map(|c| c.change_uuid), Some(uuid));
    assert!(server.has_incomplete_change().unwrap());

    server.commit(&commit(1, uuid)).unwrap().unwrap();

    let committed = server.discover().unwrap();
    assert_eq!(committed.mode, ServerMode::Accepting);
    assert_eq!(committed.current_version, 1);
    assert_eq!(committed.mutative_message_count, 2);
    assert_eq!(committed.latest_committed_uuid(), Some(uuid));
    assert_eq!(committed.last_mutation_user.as_deref(), Some("alice"));
    assert!(committed.last_mutation_timestamp.is_some());

    let config = server.current_committed_config().unwrap().unwrap();
    assert_eq!(config.get("offheap"), Some("512MB"));
    assert_eq!(
        server.applicator().live_config().and_then(|c| c.get("offheap").map(str::to_string)),
        Some("512MB".to_string())
    );

    let details = server.change_state(&uuid).unwrap().unwrap();
    assert_eq!(details.state, ChangeRequestState::Committed);
    assert_eq!(details.version, 1);
    assert_eq!(details.creation_host, "host-a");
}

#[test]
fn test_retransmitted_prepare_is_dead() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();
    let message = prepare(0, Uuid::new_v4(), 1, ConfigChange::set("a", "1"));

    server.prepare(&message).unwrap().unwrap();
    let records = harness.log.records().len();

    let second = server.prepare(&message).unwrap();
    assert_eq!(rejection_reason(second.clone()), RejectionReason::Dead);
    let rejection = second.unwrap_err();
    assert_eq!(rejection.last_mutation_host.as_deref(), Some("host-a"));
    assert_eq!(rejection.last_mutation_user.as_deref(), Some("alice"));

    assert_eq!(harness.log.records().len(), records);
    assert_eq!(server.discover().unwrap().mutative_message_count, 1);
}

#[test]
fn test_prepare_rejected_while_prepared() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();

    server
        .prepare(&prepare(0, Uuid::new_v4(), 1, ConfigChange::set("a", "1")))
        .unwrap()
        .unwrap();

    let result = server
        .prepare(&prepare(1, Uuid::new_v4(), 1, ConfigChange::set("b", "2")))
        .unwrap();
    assert_eq!(rejection_reason(result), RejectionReason::Bad);
}

#[test]
fn test_prepare_rejected_for_wrong_version() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();

    for version in [0, 2, 7] {
        let result = server
            .prepare(&prepare(0, Uuid::new_v4(), version, ConfigChange::set("a", "1")))
            .unwrap();
        assert_eq!(rejection_reason(result), RejectionReason::Bad);
    }
    assert_eq!(server.discover().unwrap().mutative_message_count, 0);
}

#[test]
fn test_applicator_refusal_is_unacceptable_and_not_recorded() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();
    let records = harness.log.records().len();

    let result = server
        .prepare(&prepare(0, Uuid::new_v4(), 1, ConfigChange::unset("never-set")))
        .unwrap();
    assert_eq!(rejection_reason(result), RejectionReason::Unacceptable);

    assert_eq!(harness.log.records().len(), records);
    let discovery = server.discover().unwrap();
    assert_eq!(discovery.mode, ServerMode::Accepting);
    assert_eq!(discovery.mutative_message_count, 0);
}

#[test]
fn test_commit_and_rollback_need_the_prepared_change() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();
    let uuid = Uuid::new_v4();

    assert_eq!(
        rejection_reason(server.commit(&commit(0, uuid)).unwrap()),
        RejectionReason::Bad
    );
    assert_eq!(
        rejection_reason(server.rollback(&rollback(0, uuid)).unwrap()),
        RejectionReason::Bad
    );

    server
        .prepare(&prepare(0, uuid, 1, ConfigChange::set("a", "1")))
        .unwrap()
        .unwrap();

    let other = Uuid::new_v4();
    assert_eq!(
        rejection_reason(server.commit(&commit(1, other)).unwrap()),
        RejectionReason::Bad
    );
    assert_eq!(
        rejection_reason(server.rollback(&rollback(1, other)).unwrap()),
        RejectionReason::Bad
    );
    assert_eq!(
        rejection_reason(server.commit(&commit(0, uuid)).unwrap()),
        RejectionReason::Dead
    );

    let discovery = server.discover().unwrap();
    assert_eq!(discovery.mode, ServerMode::Prepared);
    assert_eq!(discovery.mutative_message_count, 1);
}

#[test]
fn test_rollback_keeps_version_and_discards_blob() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();
    let uuid = Uuid::new_v4();

    server
        .prepare(&prepare(0, uuid, 1, ConfigChange::set("a", "1")))
        .unwrap()
        .unwrap();
    assert_eq!(harness.store.versions(), vec![1]);

    server.rollback(&rollback(1, uuid)).unwrap().unwrap();

    let discovery = server.discover().unwrap();
    assert_eq!(discovery.mode, ServerMode::Accepting);
    assert_eq!(discovery.current_version, 0);
    assert_eq!(discovery.highest_version, 1);
    assert_eq!(discovery.mutative_message_count, 2);
    assert!(harness.store.versions().is_empty());

    let details = server.change_state(&uuid).unwrap().unwrap();
    assert_eq!(details.state, ChangeRequestState::RolledBack);
    assert!(details.result.is_none());
    assert!(server.current_committed_config().unwrap().is_none());

    server
        .prepare(&prepare(2, Uuid::new_v4(), 1, ConfigChange::set("a", "2")))
        .unwrap()
        .unwrap();
}

#[test]
fn test_prepare_rejects_reused_change_uuid() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();
    let uuid = Uuid::new_v4();

    server
        .prepare(&prepare(0, uuid, 1, ConfigChange::set("a", "1")))
        .unwrap()
        .unwrap();
    server.rollback(&rollback(1, uuid)).unwrap().unwrap();

    let result = server
        .prepare(&prepare(2, uuid, 1, ConfigChange::set("a", "1")))
        .unwrap();
    assert_eq!(rejection_reason(result), RejectionReason::Bad);
}

#[test]
fn test_takeover_records_new_owner_without_changing_state() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();
    let uuid = Uuid::new_v4();

    server
        .prepare(&prepare(0, uuid, 1, ConfigChange::set("a", "1")))
        .unwrap()
        .unwrap();

    server.takeover(&takeover(1, uuid)).unwrap().unwrap();

    let discovery = server.discover().unwrap();
    assert_eq!(discovery.mode, ServerMode::Prepared);
    assert_eq!(discovery.mutative_message_count, 2);
    assert_eq!(discovery.last_mutation_host.as_deref(), Some("host-b"));
    assert_eq!(discovery.last_mutation_user.as_deref(), Some("bob"));
    assert_eq!(discovery.prepared_change().map(|c| c.change_uuid), Some(uuid));

    server.rollback(&rollback(2, uuid)).unwrap().unwrap();
    assert_eq!(server.discover().unwrap().mode, ServerMode::Accepting);
}

#[test]
fn test_takeover_rejected_when_not_prepared() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();

    assert_eq!(
        rejection_reason(server.takeover(&takeover(0, Uuid::new_v4())).unwrap()),
        RejectionReason::Bad
    );
    assert_eq!(
        rejection_reason(server.takeover(&takeover(5, Uuid::new_v4())).unwrap()),
        RejectionReason::Dead
    );
}

#[test]
fn test_replay_matches_live_state() {
    let harness = Harness::new();
    let live = {
        let mut server = harness.open().unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        server
            .prepare(&prepare(0, first, 1, ConfigChange::set("a", "1")))
            .unwrap()
            .unwrap();
        server.commit(&commit(1, first)).unwrap().unwrap();
        server
            .prepare(&prepare(2, second, 2, ConfigChange::set("b", "2")))
            .unwrap()
            .unwrap();
        server.rollback(&rollback(3, second)).unwrap().unwrap();
        server
            .prepare(&prepare(4, third, 2, ConfigChange::set("c", "3")))
            .unwrap()
            .unwrap();
        server.takeover(&takeover(5, third)).unwrap().unwrap();
        server.discover().unwrap()
    };

    let mut replayed = harness.open().unwrap();
    assert_eq!(replayed.discover().unwrap(), live);
    assert_eq!(
        replayed
            .change_history()
            .unwrap()
            .iter()
            .map(|c| c.version)
            .collect::<Vec<_>>(),
        vec![1, 2, 2]
    );
}

#[test]
fn test_restart_restores_live_configuration() {
    let harness = Harness::new();
    {
        let mut server = harness.open().unwrap();
        let uuid = Uuid::new_v4();
        server
            .prepare(&prepare(0, uuid, 1, ConfigChange::set("cluster-name", "tc1")))
            .unwrap()
            .unwrap();
        server.commit(&commit(1, uuid)).unwrap().unwrap();
    }

    let server = harness.open().unwrap();
    let live = server.applicator().live_config().unwrap();
    assert_eq!(live.get("cluster-name"), Some("tc1"));
}

#[test]
fn test_tampered_blob_poisons_the_node() {
    let harness = Harness::new();
    let mut server = harness.open().unwrap();
    let uuid = Uuid::new_v4();

    server
        .prepare(&prepare(0, uuid, 1, ConfigChange::set("a", "1")))
        .unwrap()
        .unwrap();
    server.commit(&commit(1, uuid)).unwrap().unwrap();

    harness
        .store
        .tamper(1, Configuration::new().with("a", "tampered"));

    assert!(server.discover().is_err());

    let err = server
        .prepare(&prepare(2, Uuid::new_v4(), 2, ConfigChange::set("b", "2")))
        .unwrap_err();
    assert!(matches!(err, ServerError::Corrupted(_)));
}

#[test]
fn test_tampered_ledger_refuses_to_start() {
    let harness = Harness::new();
    {
        let mut server = harness.open().unwrap();
        server
            .prepare(&prepare(0, Uuid::new_v4(), 1, ConfigChange::set("a", "1")))
            .unwrap()
            .unwrap();
    }

    harness.log.with_records(|records| {
        records[0].value = serde_json::json!({ "mutative_message_count": 40 });
    });

    match harness.open() {
        Err(ServerError::Ledger(e)) => assert!(e.is_corruption()),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("tampered ledger was accepted"),
    }
}

#[test]
fn test_on_disk_node_survives_restart_and_holds_lock() {
    let temp = TempDir::new().unwrap();
    let uuid = Uuid::new_v4();

    {
        let mut server =
            ConfigServer::open(temp.path(), SettingsApplicator::new(ApplicatorPolicy::default())).unwrap();
        server
            .prepare(&prepare(0, uuid, 1, ConfigChange::set("offheap", "1GB")))
            .unwrap()
            .unwrap();

        let second = ConfigServer::open(temp.path(), SettingsApplicator::new(ApplicatorPolicy::default()));
        assert!(matches!(
            second,
            Err(ServerError::Ledger(LedgerError::Locked { .. }))
        ));
    }

    let mut server =
        ConfigServer::open(temp.path(), SettingsApplicator::new(ApplicatorPolicy::default())).unwrap();
    assert!(server.has_incomplete_change().unwrap());
    server.commit(&commit(1, uuid)).unwrap().unwrap();

    assert!(temp.path().join(CONFIG_DIR).join("1.json").exists());
    assert_eq!(server.discover().unwrap().current_version, 1);
}
