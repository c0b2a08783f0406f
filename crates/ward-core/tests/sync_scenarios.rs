//! End-to-end sync scenarios against the in-process backend.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::tempdir;
use ward_core::models::Operation;
use ward_core::remote::{RejectCode, SaveOutcome};
use ward_core::{
    Aggregate, Data, EngineConfig, LocalStore, MemoryBackend, MemoryRemote, MutationStatus,
    Patient, PullOutcome, Record, RecordId, RecordKind, RemoteError, SaveOptions, Task,
};

const USER: &str = "ward-7";

async fn open_at(path: &Path, remote: Option<MemoryRemote>) -> Data<MemoryRemote> {
    let local = LocalStore::open_path(path).await.unwrap();
    Data::open(local, remote, EngineConfig::default())
        .await
        .unwrap()
}

async fn open_online(backend: &Arc<MemoryBackend>) -> Data<MemoryRemote> {
    let local = LocalStore::open_in_memory().await.unwrap();
    Data::open(local, Some(backend.client(USER)), EngineConfig::default())
        .await
        .unwrap()
}

/// Flush until nothing is pending (background drains may interleave).
async fn drain(data: &Data<MemoryRemote>) {
    for _ in 0..5 {
        data.flush().await.unwrap();
        if data.queue_counts().await.unwrap().pending == 0 {
            return;
        }
    }
    panic!("outbox did not drain");
}

fn patient_names(data: &Data<MemoryRemote>) -> Vec<String> {
    data.store()
        .all(RecordKind::Patient)
        .into_iter()
        .filter_map(|record| match record {
            Record::Patient(patient) => Some(patient.name),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_writes_survive_restart_and_drain_in_order() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("ward.db");
    let backend = MemoryBackend::new();

    let patient = Patient::new("Ada");
    {
        let data = open_at(&path, None).await;
        data.add(patient.clone()).await.unwrap();
        let mut edited = patient.clone();
        edited.bed = Some("12".to_string());
        data.update(edited).await.unwrap();
        data.add(Patient::new("Grace")).await.unwrap();
        assert!(data.flush().await.unwrap().offline);
    }

    let data = open_at(&path, Some(backend.client(USER))).await;
    assert_eq!(data.queue_counts().await.unwrap().pending, 3);
    assert_eq!(patient_names(&data), vec!["Ada", "Grace"]);

    let report = data.flush().await.unwrap();
    assert_eq!(report.synced, 3);

    let log: Vec<(Operation, String)> = backend
        .push_log()
        .into_iter()
        .map(|push| (push.operation, push.doc_id.to_string()))
        .collect();
    assert_eq!(log[0], (Operation::Add, patient.id.to_string()));
    assert_eq!(log[1], (Operation::Update, patient.id.to_string()));
    assert_eq!(log[2].0, Operation::Add);

    let server = backend.data(USER);
    assert_eq!(server.patients.len(), 2);
    assert_eq!(server.patients[0].bed.as_deref(), Some("12"));
    assert_eq!(data.client_rev().await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn same_record_writes_reach_remote_in_queue_order_across_drains() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("ward.db");
    let backend = MemoryBackend::new();

    let patient = Patient::new("Ada");
    {
        let data = open_at(&path, None).await;
        data.add(patient.clone()).await.unwrap();
        for bed in ["12", "14"] {
            let mut moved = patient.clone();
            moved.bed = Some(bed.to_string());
            data.update(moved).await.unwrap();
        }
    }

    let data = open_at(&path, Some(backend.client(USER))).await;
    let queued: Vec<String> = data
        .pending_mutations()
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.idempotency_key)
        .collect();
    assert_eq!(queued.len(), 3);

    // applied remotely but the ack is lost, then the replay times out
    backend.lose_next_ack();
    let first = data.flush().await.unwrap();
    assert_eq!((first.retried, first.deferred), (1, 2));
    backend.fail_next(RemoteError::Timeout);
    let second = data.flush().await.unwrap();
    assert_eq!((second.retried, second.deferred), (1, 2));

    let third = data.flush().await.unwrap();
    assert_eq!(third.synced, 3);

    let pushed: Vec<String> = backend
        .push_log()
        .into_iter()
        .map(|push| push.idempotency_key)
        .collect();
    assert_eq!(
        pushed,
        vec![
            queued[0].clone(),
            queued[0].clone(),
            queued[1].clone(),
            queued[2].clone(),
        ]
    );
    assert_eq!(backend.rev(USER), 3);
    assert_eq!(backend.data(USER).patients[0].bed.as_deref(), Some("14"));
}

#[tokio::test(flavor = "multi_thread")]
async fn update_queued_while_rejected_add_is_in_flight_is_dropped() {
    let backend = MemoryBackend::new();
    let data = open_online(&backend).await;
    let held = backend.hold_next_push();
    backend.fail_next(RemoteError::rejected(
        RejectCode::PermissionDenied,
        "unit closed",
    ));

    let patient = Patient::new("Ada");
    data.add(patient.clone()).await.unwrap();
    held.arrived().await;

    let mut edited = patient.clone();
    edited.bed = Some("12".to_string());
    data.update(edited).await.unwrap();
    held.release();
    drain(&data).await;

    assert!(data
        .store()
        .get_clone(RecordKind::Patient, &patient.id)
        .is_none());
    assert!(data
        .local()
        .get_record(RecordKind::Patient, &patient.id)
        .await
        .unwrap()
        .is_none());
    assert!(backend.data(USER).patients.is_empty());
    assert!(backend.push_log().is_empty());

    let failed = data.failed_mutations().await.unwrap();
    assert_eq!(failed.len(), 2);
    assert_eq!(failed[1].operation(), Operation::Update);
    assert!(failed[1]
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("earlier change")));
}

#[tokio::test(flavor = "multi_thread")]
async fn going_online_triggers_a_drain() {
    let backend = MemoryBackend::new();
    let data = open_online(&backend).await;
    data.engine().set_online(false);

    data.add(Patient::new("Ada")).await.unwrap();
    assert_eq!(data.queue_counts().await.unwrap().pending, 1);
    assert!(backend.push_log().is_empty());

    data.engine().set_online(true);
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.data(USER).patients.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    drain(&data).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_ack_is_replayed_without_double_apply() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("ward.db");
    let backend = MemoryBackend::new();

    {
        let data = open_at(&path, None).await;
        data.add(Patient::new("Ada")).await.unwrap();
    }

    let data = open_at(&path, Some(backend.client(USER))).await;
    backend.lose_next_ack();
    let first = data.flush().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(backend.rev(USER), 1);

    let second = data.flush().await.unwrap();
    assert_eq!(second.synced, 1);

    let log = backend.push_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].idempotency_key, log[1].idempotency_key);
    assert_eq!(backend.rev(USER), 1);
    assert_eq!(backend.data(USER).patients.len(), 1);

    // The duplicate ack does not move client_rev; a pull catches up
    assert_eq!(data.client_rev().await.unwrap(), 0);
    assert_eq!(
        data.pull().await.unwrap(),
        PullOutcome::Updated { rev: 1, records: 1 }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn rejection_after_restart_restores_exact_previous_value() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("ward.db");
    let backend = MemoryBackend::new();
    let patient = Patient::new("Ada").with_bed("3");

    let original = {
        let data = open_at(&path, Some(backend.client(USER))).await;
        data.add(patient.clone()).await.unwrap();
        drain(&data).await;
        data.store().get_clone(RecordKind::Patient, &patient.id)
    };
    assert!(original.is_some());

    {
        let data = open_at(&path, None).await;
        let mut edited = patient.clone();
        edited.name = "Ada Byron".to_string();
        edited.diagnosis = Some("Fracture".to_string());
        data.update(edited.clone()).await.unwrap();
        let mut again = edited;
        again.bed = Some("4".to_string());
        data.update(again).await.unwrap();
    }

    backend.set_read_only(USER, true);
    let data = open_at(&path, Some(backend.client(USER))).await;
    assert_eq!(patient_names(&data), vec!["Ada Byron"]);

    let report = data.flush().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(
        data.store().get_clone(RecordKind::Patient, &patient.id),
        original
    );
    assert_eq!(
        data.local()
            .get_record(RecordKind::Patient, &patient.id)
            .await
            .unwrap(),
        original
    );

    let failed = data.failed_mutations().await.unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed
        .iter()
        .all(|entry| entry.status == MutationStatus::FailedFatal));
    assert_eq!(data.queue_counts().await.unwrap().pending, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_remote_exhausts_retries() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("ward.db");
    let backend = MemoryBackend::new();
    let patient = Patient::new("Ada");

    {
        let data = open_at(&path, None).await;
        data.add(patient.clone()).await.unwrap();
    }

    let local = LocalStore::open_path(&path).await.unwrap();
    let config = EngineConfig {
        max_retry_count: 3,
        ..EngineConfig::default()
    };
    let data = Data::open(local, Some(backend.client(USER)), config)
        .await
        .unwrap();
    backend.set_reachable(false);

    assert_eq!(data.flush().await.unwrap().retried, 1);
    assert_eq!(data.flush().await.unwrap().retried, 1);
    assert!(data
        .store()
        .get_clone(RecordKind::Patient, &patient.id)
        .is_some());

    let last = data.flush().await.unwrap();
    assert_eq!(last.failed, 1);
    assert!(data
        .store()
        .get_clone(RecordKind::Patient, &patient.id)
        .is_none());

    let failed = data.failed_mutations().await.unwrap();
    assert_eq!(failed[0].retry_count, 3);
    assert!(failed[0]
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("gave up")));
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_replaces_pending_local_edits() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("ward.db");
    let backend = MemoryBackend::new();

    {
        let data = open_at(&path, None).await;
        data.add(Patient::new("Local")).await.unwrap();
    }

    let other = open_online(&backend).await;
    other.add(Patient::new("Server")).await.unwrap();
    drain(&other).await;

    // Last pull wins: the queued local add is not merged into the snapshot
    let data = open_at(&path, Some(backend.client(USER))).await;
    assert_eq!(
        data.pull().await.unwrap(),
        PullOutcome::Updated { rev: 1, records: 1 }
    );
    assert_eq!(patient_names(&data), vec!["Server"]);
    assert_eq!(data.queue_counts().await.unwrap().pending, 1);

    drain(&data).await;
    assert_eq!(backend.data(USER).patients.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_devices_stale_save_conflicts() {
    let backend = MemoryBackend::new();
    let shared = Patient::new("Ada");
    backend.seed(
        USER,
        5,
        Aggregate {
            patients: vec![shared.clone()],
            ..Aggregate::default()
        },
    );

    let first = open_online(&backend).await;
    let second = open_online(&backend).await;
    first.pull().await.unwrap();
    second.pull().await.unwrap();
    assert_eq!(second.client_rev().await.unwrap(), 5);

    let mut edited = shared.clone();
    edited.bed = Some("7".to_string());
    first.update(edited).await.unwrap();
    drain(&first).await;
    assert_eq!(backend.rev(USER), 6);
    assert_eq!(first.client_rev().await.unwrap(), 6);

    let before = backend.data(USER);
    let outcome = second.save_all(SaveOptions::default()).await.unwrap();
    let SaveOutcome::Conflict {
        server_rev,
        server_data,
    } = outcome
    else {
        panic!("expected conflict, got {outcome:?}");
    };
    assert_eq!(server_rev, 6);
    assert_eq!(server_data, before);
    assert_eq!(backend.rev(USER), 6);
    assert_eq!(backend.data(USER), before);

    second
        .adopt_server_state(server_rev, &server_data)
        .await
        .unwrap();
    assert_eq!(
        second.save_all(SaveOptions::default()).await.unwrap(),
        SaveOutcome::Saved { rev: 7 }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_save_overwrites_newer_server_state() {
    let backend = MemoryBackend::new();
    backend.seed(
        USER,
        2,
        Aggregate {
            patients: vec![Patient::new("Server")],
            ..Aggregate::default()
        },
    );
    let data = open_online(&backend).await;
    data.engine().set_online(false);
    data.add(Patient::new("Mine")).await.unwrap();
    data.engine().set_online(true);
    drain(&data).await;

    // Push landed at rev 3 on top of rev 2 we never saw
    assert_eq!(data.client_rev().await.unwrap(), 0);
    let outcome = data
        .save_all(SaveOptions {
            force: true,
            ..SaveOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::Saved { rev: 4 });
    let names: Vec<String> = backend
        .data(USER)
        .patients
        .into_iter()
        .map(|patient| patient.name)
        .collect();
    assert_eq!(names, vec!["Mine"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_applies_remote_snapshots() {
    let backend = MemoryBackend::new();
    let watcher = open_online(&backend).await;
    let writer = open_online(&backend).await;
    watcher.listen_all().await.unwrap();

    writer.add(Patient::new("Ada")).await.unwrap();
    drain(&writer).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while watcher.store().len(RecordKind::Patient) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(patient_names(&watcher), vec!["Ada"]);

    watcher.engine().stop();
    watcher.engine().stop();
    assert_eq!(watcher.engine().task_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn collection_listener_leaves_other_collections_to_pull() {
    let backend = MemoryBackend::new();
    let watcher = open_online(&backend).await;
    let writer = open_online(&backend).await;
    watcher.engine().listen(RecordKind::Patient).await.unwrap();

    writer
        .add(Task::new(RecordId::from("p-elsewhere"), "Obs every 4h"))
        .await
        .unwrap();
    writer.add(Patient::new("Ada")).await.unwrap();
    drain(&writer).await;
    assert_eq!(backend.rev(USER), 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        while watcher.store().len(RecordKind::Patient) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(watcher.store().len(RecordKind::Task), 0);
    assert_eq!(watcher.client_rev().await.unwrap(), 0);

    assert_eq!(
        watcher.pull().await.unwrap(),
        PullOutcome::Updated { rev: 2, records: 2 }
    );
    assert_eq!(watcher.store().len(RecordKind::Task), 1);
    assert_eq!(watcher.client_rev().await.unwrap(), 2);
    watcher.engine().stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_stop_are_idempotent() {
    let backend = MemoryBackend::new();
    let data = open_online(&backend).await;

    data.engine().start();
    data.engine().start();
    assert!(data.engine().is_running());
    assert_eq!(data.engine().task_count(), 2);

    data.engine().stop();
    data.engine().stop();
    assert!(!data.engine().is_running());
    assert_eq!(data.engine().task_count(), 0);
}
