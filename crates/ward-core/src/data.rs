//! Mutation coordinator: the single entry point for writes.
//!
//! Every local write goes through [`Data::mutate`]: capture the rollback
//! anchor, apply optimistically to the [`Store`], append to the durable
//! outbox, mirror the new value, then wake the sync engine. Remote-only
//! operations (whole-aggregate save, trash, handover inbox) go straight to
//! the remote and touch local state only after it confirms.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::QueueCounts;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::models::{
    Aggregate, Change, InboxItem, InboxStatus, Mutation, MutationStatus, Patient, Record,
    RecordId, RecordKind, TrashItem,
};
use crate::remote::{
    EmptyTrashRequest, InboxActionRequest, MoveToTrashRequest, RemoteApi,
    RestoreFromTrashRequest, SaveOutcome, SaveRequest, SendPatientRequest,
};
use crate::services::LocalStore;
use crate::store::Store;
use crate::sync::{FlushReport, PullOutcome, SyncEngine};
use crate::util::now_ms;

/// Flags for a whole-aggregate save
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Overwrite even when the local base revision is stale
    pub force: bool,
    /// Allow replacing a populated patient list with an empty one
    pub confirm_wipe: bool,
}

pub struct Data<R> {
    store: Arc<Store>,
    local: LocalStore,
    engine: SyncEngine<R>,
    events: EventBus,
    config: EngineConfig,
    device_id: String,
    last_timestamp: AtomicI64,
}

impl<R> std::fmt::Debug for Data<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("device_id", &self.device_id)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteApi> Data<R> {
    /// Open the coordinator over a local store, hydrating the in-memory
    /// store from the mirror.
    ///
    /// Pass `None` as the remote to run offline-only: writes still queue and
    /// drain once a remote is attached on a later open.
    pub async fn open(local: LocalStore, remote: Option<R>, config: EngineConfig) -> Result<Self> {
        let events = EventBus::default();
        let store = Arc::new(Store::new(events.clone()));
        let device_id = local.device_id().await?;

        for kind in RecordKind::ALL {
            store.replace_collection(kind, local.records(kind).await?);
        }
        let expired = local.purge_expired_trash(now_ms()).await?;
        if expired > 0 {
            tracing::debug!(expired, "Dropped expired trash items");
        }

        let engine = SyncEngine::new(
            Arc::clone(&store),
            local.clone(),
            remote,
            events.clone(),
            config.clone(),
            device_id.clone(),
        );

        tracing::info!(
            device_id = %device_id,
            remote = config.is_remote_configured(),
            "Opened ward data"
        );
        Ok(Self {
            store,
            local,
            engine,
            events,
            config,
            device_id,
            last_timestamp: AtomicI64::new(0),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub const fn engine(&self) -> &SyncEngine<R> {
        &self.engine
    }

    pub const fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Millisecond timestamp strictly greater than any previously issued one
    fn next_timestamp(&self) -> i64 {
        let now = now_ms();
        let last = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(last + 1)
    }

    pub async fn add(&self, record: impl Into<Record>) -> Result<Mutation> {
        let record = record.into();
        let kind = record.kind();
        let doc_id = record.id().clone();
        self.mutate(kind, doc_id, Change::Add(record)).await
    }

    pub async fn update(&self, record: impl Into<Record>) -> Result<Mutation> {
        let record = record.into();
        let kind = record.kind();
        let doc_id = record.id().clone();
        self.mutate(kind, doc_id, Change::Update(record)).await
    }

    pub async fn delete(&self, kind: RecordKind, doc_id: &RecordId) -> Result<Mutation> {
        self.mutate(kind, doc_id.clone(), Change::Delete).await
    }

    /// Apply a write locally and queue it for the remote.
    ///
    /// Returns the stored outbox entry. If the entry cannot be persisted the
    /// optimistic change is undone and [`Error::Storage`] is returned.
    pub async fn mutate(
        &self,
        kind: RecordKind,
        doc_id: RecordId,
        change: Change,
    ) -> Result<Mutation> {
        let mutation = {
            let _writes = self.engine.lock_writes().await;
            self.apply_and_queue(kind, doc_id, change).await?
        };
        self.engine.spawn_flush();
        Ok(mutation)
    }

    async fn apply_and_queue(
        &self,
        kind: RecordKind,
        doc_id: RecordId,
        change: Change,
    ) -> Result<Mutation> {
        let previous = self.store.get_clone(kind, &doc_id);
        match (&change, &previous) {
            (Change::Add(_), Some(_)) => {
                return Err(Error::InvalidInput(format!(
                    "{} {doc_id} already exists",
                    kind.as_str()
                )));
            }
            (Change::Update(_) | Change::Delete, None) => {
                return Err(Error::NotFound(format!("{} {doc_id}", kind.as_str())));
            }
            _ => {}
        }

        let timestamp = self.next_timestamp();
        let change = match change {
            Change::Add(mut record) => {
                record.touch(timestamp);
                Change::Add(record)
            }
            Change::Update(mut record) => {
                record.touch(timestamp);
                Change::Update(record)
            }
            Change::Delete => Change::Delete,
        };

        self.store.apply(kind, &doc_id, &change)?;

        let entry = Mutation::at(kind, doc_id.clone(), change, previous.clone(), timestamp);
        let mutation = match self.local.append(&entry).await {
            Ok(mutation) => mutation,
            Err(error) => {
                self.store.restore(kind, &doc_id, previous);
                tracing::error!(
                    collection = %kind,
                    doc_id = %doc_id,
                    %error,
                    "Could not queue mutation; change undone"
                );
                return Err(Error::Storage(error.to_string()));
            }
        };

        let mirrored = match mutation.payload() {
            Some(record) => self.local.upsert_record(record).await,
            None => self
                .local
                .soft_delete_record(kind, &doc_id, timestamp)
                .await
                .map(|_| ()),
        };
        if let Err(error) = mirrored {
            tracing::warn!(collection = %kind, doc_id = %doc_id, %error, "Mirror write failed");
        }

        tracing::debug!(
            mutation_id = %mutation.id,
            collection = %kind,
            doc_id = %doc_id,
            operation = %mutation.operation(),
            "Queued mutation"
        );
        Ok(mutation)
    }

    // Queue

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        self.local.queue_counts().await
    }

    pub async fn pending_mutations(&self) -> Result<Vec<Mutation>> {
        self.local.list_pending().await
    }

    pub async fn failed_mutations(&self) -> Result<Vec<Mutation>> {
        self.local.list_mutations(MutationStatus::FailedFatal).await
    }

    pub async fn flush(&self) -> Result<FlushReport> {
        self.engine.flush().await
    }

    pub async fn pull(&self) -> Result<PullOutcome> {
        self.engine.pull().await
    }

    /// Subscribe to remote changes of every collection.
    pub async fn listen_all(&self) -> Result<()> {
        for kind in RecordKind::ALL {
            self.engine.listen(kind).await?;
        }
        Ok(())
    }

    pub async fn client_rev(&self) -> Result<u64> {
        self.local.client_rev().await
    }

    // Whole-aggregate save

    /// Replace the remote aggregate with the local snapshot.
    ///
    /// A conflict or safeguard leaves both sides untouched and is published
    /// as an event; resolving it is up to the caller (retry with
    /// [`SaveOptions`] or [`Data::adopt_server_state`]).
    pub async fn save_all(&self, options: SaveOptions) -> Result<SaveOutcome> {
        let remote = self.engine.remote()?;
        let base_rev = self.local.client_rev().await?;
        let outcome = remote
            .save_data(SaveRequest {
                payload: self.store.snapshot(),
                base_rev,
                force: options.force,
                confirm_wipe: options.confirm_wipe,
                device_id: self.device_id.clone(),
            })
            .await?;

        match &outcome {
            SaveOutcome::Saved { rev } => {
                self.local.set_client_rev(*rev).await?;
                tracing::info!(rev, "Saved aggregate");
            }
            SaveOutcome::Conflict {
                server_rev,
                server_data,
            } => {
                tracing::warn!(base_rev, server_rev, "Save conflict; server state returned");
                self.events.publish(Event::Conflict {
                    server_rev: *server_rev,
                    server_data: server_data.clone(),
                });
            }
            SaveOutcome::Safeguard {
                server_patient_count,
            } => {
                tracing::warn!(
                    server_patient_count,
                    "Save blocked: it would remove every patient"
                );
                self.events.publish(Event::Safeguard {
                    server_patient_count: *server_patient_count,
                });
            }
        }
        Ok(outcome)
    }

    /// Discard local state in favour of the server copy at `rev`.
    pub async fn adopt_server_state(&self, rev: u64, aggregate: &Aggregate) -> Result<()> {
        self.engine.adopt(rev, aggregate).await?;
        tracing::info!(rev, "Adopted server state");
        Ok(())
    }

    // Trash

    /// Move records to the remote trash, then drop them locally.
    ///
    /// No drain runs meanwhile. Queued writes to a trashed record are
    /// terminated so they cannot bring it back on the remote.
    pub async fn move_to_trash(&self, kind: RecordKind, ids: &[RecordId]) -> Result<usize> {
        let remote = self.engine.remote()?;
        let _drain = self.engine.lock_drain().await;
        let response = remote
            .move_to_trash(MoveToTrashRequest {
                item_ids: ids.to_vec(),
                item_type: kind,
            })
            .await?;

        let _writes = self.engine.lock_writes().await;
        let now = now_ms();
        for id in ids {
            let dropped = self
                .engine
                .terminate_pending(kind, id, None, "the record was moved to trash")
                .await?;
            if dropped > 0 {
                tracing::info!(
                    collection = %kind,
                    doc_id = %id,
                    dropped,
                    "Dropped queued changes to trashed record"
                );
            }
            let Some(mut record) = self.store.get_clone(kind, id) else {
                continue;
            };
            self.store.apply(kind, id, &Change::Delete)?;
            self.local.soft_delete_record(kind, id, now).await?;
            record.mark_deleted(now);
            self.local
                .insert_trash(&TrashItem::new(record, self.config.user.clone(), now))
                .await?;
        }

        self.publish_trash_count().await?;
        tracing::info!(collection = %kind, trashed = response.trashed_count, "Moved to trash");
        Ok(response.trashed_count)
    }

    pub async fn restore_from_trash(&self, ids: &[RecordId]) -> Result<usize> {
        let remote = self.engine.remote()?;
        let response = remote
            .restore_from_trash(RestoreFromTrashRequest {
                item_ids: ids.to_vec(),
            })
            .await?;

        let now = now_ms();
        for item in self.local.list_trash().await? {
            if !ids.contains(&item.id) {
                continue;
            }
            let mut record = item.record;
            record.clear_deleted(now);
            self.store
                .apply(item.item_type, &item.id, &Change::Add(record.clone()))?;
            if !self.local.restore_record(item.item_type, &item.id, now).await? {
                self.local.upsert_record(&record).await?;
            }
            self.local.remove_trash(&item.id).await?;
        }

        self.publish_trash_count().await?;
        tracing::info!(restored = response.restored_count, "Restored from trash");
        Ok(response.restored_count)
    }

    /// Permanently delete trash items; `None` empties the whole trash.
    pub async fn empty_trash(&self, ids: Option<Vec<RecordId>>) -> Result<usize> {
        let remote = self.engine.remote()?;
        let response = remote
            .empty_trash(EmptyTrashRequest {
                item_ids: ids.clone(),
            })
            .await?;

        for item in self.local.list_trash().await? {
            let selected = ids.as_ref().is_none_or(|ids| ids.contains(&item.id));
            if selected {
                self.local.remove_record(item.item_type, &item.id).await?;
                self.local.remove_trash(&item.id).await?;
            }
        }

        self.publish_trash_count().await?;
        Ok(response.deleted_count)
    }

    /// Local trash, newest first, after dropping expired items
    pub async fn list_trash(&self) -> Result<Vec<TrashItem>> {
        self.local.purge_expired_trash(now_ms()).await?;
        self.local.list_trash().await
    }

    async fn publish_trash_count(&self) -> Result<()> {
        let count = self.local.list_trash().await?.len();
        self.events.publish(Event::TrashUpdated { count });
        Ok(())
    }

    // Handover inbox

    /// Hand a copy of one of our patients to another account.
    pub async fn send_patient(
        &self,
        to_user: &str,
        patient_id: &RecordId,
        note: Option<String>,
    ) -> Result<RecordId> {
        let patient = match self.store.get_clone(RecordKind::Patient, patient_id) {
            Some(Record::Patient(patient)) => patient,
            _ => return Err(Error::NotFound(format!("patient {patient_id}"))),
        };
        let remote = self.engine.remote()?;
        let response = remote
            .send_patient(SendPatientRequest {
                to_user: to_user.to_string(),
                patient,
                note,
            })
            .await?;
        tracing::info!(to_user, inbox_id = %response.inbox_id, "Sent patient");
        Ok(response.inbox_id)
    }

    /// Fetch pending handovers and keep them locally.
    pub async fn check_inbox(&self) -> Result<Vec<InboxItem>> {
        let remote = self.engine.remote()?;
        let response = remote.check_inbox().await?;
        for item in &response.items {
            self.local.upsert_inbox(item).await?;
        }
        self.publish_inbox_count().await?;
        Ok(response.items)
    }

    pub async fn inbox(&self, status: Option<InboxStatus>) -> Result<Vec<InboxItem>> {
        self.local.list_inbox(status).await
    }

    /// Accept a handover; the server has already added the patient to our
    /// aggregate, so it goes straight into the store without queueing.
    pub async fn accept_inbox_patient(&self, inbox_id: &RecordId) -> Result<Patient> {
        let remote = self.engine.remote()?;
        let response = remote
            .accept_inbox_patient(InboxActionRequest {
                inbox_id: inbox_id.clone(),
            })
            .await?;

        let record = Record::from(response.patient.clone());
        self.store
            .apply(RecordKind::Patient, &response.patient.id, &Change::Add(record.clone()))?;
        self.local.upsert_record(&record).await?;
        self.local
            .set_inbox_status(inbox_id, InboxStatus::Accepted)
            .await?;
        self.engine.note_remote_write(response.rev).await?;

        self.publish_inbox_count().await?;
        tracing::info!(inbox_id = %inbox_id, patient_id = %response.patient.id, "Accepted handover");
        Ok(response.patient)
    }

    pub async fn decline_inbox_patient(&self, inbox_id: &RecordId) -> Result<()> {
        let remote = self.engine.remote()?;
        remote
            .decline_inbox_patient(InboxActionRequest {
                inbox_id: inbox_id.clone(),
            })
            .await?;
        self.local
            .set_inbox_status(inbox_id, InboxStatus::Declined)
            .await?;
        self.publish_inbox_count().await?;
        Ok(())
    }

    async fn publish_inbox_count(&self) -> Result<()> {
        let pending = self.local.list_inbox(Some(InboxStatus::Pending)).await?.len();
        self.events.publish(Event::InboxUpdated { pending });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, Ward};
    use crate::remote::{MemoryBackend, MemoryRemote};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    const USER: &str = "ward-7";

    async fn offline() -> Data<MemoryRemote> {
        let local = LocalStore::open_in_memory().await.unwrap();
        Data::open(local, None, EngineConfig::default()).await.unwrap()
    }

    async fn online(backend: &Arc<MemoryBackend>, user: &str) -> Data<MemoryRemote> {
        let local = LocalStore::open_in_memory().await.unwrap();
        let config = EngineConfig {
            user: user.to_string(),
            ..EngineConfig::default()
        };
        Data::open(local, Some(backend.client(user)), config)
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_applies_optimistically_and_queues() {
        let data = offline().await;
        let ward = Ward::new("North");
        let patient = Patient::new("Ada").in_unit(ward.id.clone());

        data.add(ward).await.unwrap();
        let mutation = data.add(patient.clone()).await.unwrap();

        assert!(mutation.is_pending());
        assert!(mutation.previous.is_none());
        assert!(mutation.seq > 0);
        assert!(data
            .store()
            .get_clone(RecordKind::Patient, &patient.id)
            .is_some());
        assert_eq!(data.queue_counts().await.unwrap().pending, 2);

        let mirrored = data
            .local()
            .get_record(RecordKind::Patient, &patient.id)
            .await
            .unwrap();
        assert!(mirrored.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_captures_previous_value() {
        let data = offline().await;
        let patient = Patient::new("Ada");
        data.add(patient.clone()).await.unwrap();
        let before = data.store().get_clone(RecordKind::Patient, &patient.id);

        let mut edited = patient.clone();
        edited.diagnosis = Some("Sepsis".to_string());
        let mutation = data.update(edited).await.unwrap();
        assert_eq!(mutation.previous, before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_targets_are_rejected_without_queueing() {
        let data = offline().await;
        let patient = Patient::new("Ada");
        data.add(patient.clone()).await.unwrap();

        assert!(matches!(
            data.add(patient.clone()).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            data.update(Patient::new("Ghost")).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            data.delete(RecordKind::Task, &RecordId::from("missing")).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(data.queue_counts().await.unwrap().pending, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_soft_deletes_in_mirror() {
        let data = offline().await;
        let patient = Patient::new("Ada");
        data.add(patient.clone()).await.unwrap();
        data.delete(RecordKind::Patient, &patient.id).await.unwrap();

        assert!(data
            .store()
            .get_clone(RecordKind::Patient, &patient.id)
            .is_none());
        let mirrored = data
            .local()
            .get_record(RecordKind::Patient, &patient.id)
            .await
            .unwrap()
            .unwrap();
        assert!(mirrored.is_deleted());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn storage_failure_undoes_optimistic_change() {
        let data = offline().await;
        data.local().execute_raw("DROP TABLE wal").await.unwrap();

        let patient = Patient::new("Ada");
        let result = data.add(patient.clone()).await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(data
            .store()
            .get_clone(RecordKind::Patient, &patient.id)
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rapid_writes_get_distinct_idempotency_keys() {
        let data = offline().await;
        let task = Task::new(RecordId::from("p-1"), "Obs");
        data.add(task.clone()).await.unwrap();

        let mut keys = Vec::new();
        for title in ["Obs 1", "Obs 2", "Obs 3"] {
            let mut edited = task.clone();
            edited.title = title.to_string();
            keys.push(data.update(edited).await.unwrap().idempotency_key);
        }
        keys.dedup();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reopen_hydrates_store_from_mirror() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ward.db");
        let patient = Patient::new("Ada");
        let gone = Patient::new("Gone");
        {
            let local = LocalStore::open_path(&path).await.unwrap();
            let data: Data<MemoryRemote> = Data::open(local, None, EngineConfig::default())
                .await
                .unwrap();
            data.add(patient.clone()).await.unwrap();
            data.add(gone.clone()).await.unwrap();
            data.delete(RecordKind::Patient, &gone.id).await.unwrap();
        }

        let local = LocalStore::open_path(&path).await.unwrap();
        let data: Data<MemoryRemote> = Data::open(local, None, EngineConfig::default())
            .await
            .unwrap();
        let ids: Vec<RecordId> = data
            .store()
            .all(RecordKind::Patient)
            .iter()
            .map(|record| record.id().clone())
            .collect();
        assert_eq!(ids, vec![patient.id]);
        assert_eq!(data.queue_counts().await.unwrap().pending, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_operations_need_a_remote() {
        let data = offline().await;
        assert!(matches!(
            data.save_all(SaveOptions::default()).await,
            Err(Error::Offline(_))
        ));
        assert!(matches!(data.check_inbox().await, Err(Error::Offline(_))));
        assert!(matches!(
            data.move_to_trash(RecordKind::Patient, &[RecordId::from("p")])
                .await,
            Err(Error::Offline(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_save_conflicts_then_adopt_and_resave() {
        let backend = MemoryBackend::new();
        let server_patient = Patient::new("Server");
        backend.seed(
            USER,
            5,
            Aggregate {
                patients: vec![server_patient.clone()],
                ..Aggregate::default()
            },
        );
        let data = online(&backend, USER).await;
        let mut events = data.events().subscribe();

        let outcome = data.save_all(SaveOptions::default()).await.unwrap();
        let SaveOutcome::Conflict {
            server_rev,
            server_data,
        } = outcome
        else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(server_rev, 5);
        assert_eq!(backend.rev(USER), 5);

        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            saw_conflict |= matches!(event, Event::Conflict { server_rev: 5, .. });
        }
        assert!(saw_conflict);

        data.adopt_server_state(server_rev, &server_data)
            .await
            .unwrap();
        assert_eq!(data.client_rev().await.unwrap(), 5);
        assert_eq!(data.store().len(RecordKind::Patient), 1);

        assert_eq!(
            data.save_all(SaveOptions::default()).await.unwrap(),
            SaveOutcome::Saved { rev: 6 }
        );
        assert_eq!(data.client_rev().await.unwrap(), 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_save_over_populated_server_needs_confirmation() {
        let backend = MemoryBackend::new();
        backend.seed(
            USER,
            3,
            Aggregate {
                patients: vec![Patient::new("Ada"), Patient::new("Grace")],
                ..Aggregate::default()
            },
        );
        let data = online(&backend, USER).await;
        data.adopt_server_state(3, &Aggregate::default())
            .await
            .unwrap();

        assert_eq!(
            data.save_all(SaveOptions::default()).await.unwrap(),
            SaveOutcome::Safeguard {
                server_patient_count: 2
            }
        );
        assert_eq!(backend.data(USER).patients.len(), 2);

        let confirmed = SaveOptions {
            confirm_wipe: true,
            ..SaveOptions::default()
        };
        assert_eq!(
            data.save_all(confirmed).await.unwrap(),
            SaveOutcome::Saved { rev: 4 }
        );
        assert!(backend.data(USER).patients.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trash_lifecycle() {
        let backend = MemoryBackend::new();
        let data = online(&backend, USER).await;
        let patient = Patient::new("Ada");
        data.add(patient.clone()).await.unwrap();
        data.flush().await.unwrap();

        let ids = vec![patient.id.clone()];
        assert_eq!(
            data.move_to_trash(RecordKind::Patient, &ids).await.unwrap(),
            1
        );
        assert!(data
            .store()
            .get_clone(RecordKind::Patient, &patient.id)
            .is_none());
        let trash = data.list_trash().await.unwrap();
        assert_eq!(trash.len(), 1);
        assert_eq!(trash[0].deleted_by, USER);

        assert_eq!(data.restore_from_trash(&ids).await.unwrap(), 1);
        assert!(data
            .store()
            .get_clone(RecordKind::Patient, &patient.id)
            .is_some());
        assert!(data.list_trash().await.unwrap().is_empty());
        let mirrored = data.local().records(RecordKind::Patient).await.unwrap();
        assert_eq!(mirrored.len(), 1);
        assert!(!mirrored[0].is_deleted());

        data.move_to_trash(RecordKind::Patient, &ids).await.unwrap();
        assert_eq!(data.empty_trash(None).await.unwrap(), 1);
        assert!(data.list_trash().await.unwrap().is_empty());
        assert!(data
            .local()
            .get_record(RecordKind::Patient, &patient.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trash_drops_queued_writes_to_trashed_record() {
        let backend = MemoryBackend::new();
        let patient = Patient::new("Ada");
        backend.seed(
            USER,
            1,
            Aggregate {
                patients: vec![patient.clone()],
                ..Aggregate::default()
            },
        );
        let local = LocalStore::open_in_memory().await.unwrap();
        let config = EngineConfig {
            user: USER.to_string(),
            ..EngineConfig::default()
        };
        {
            let offline: Data<MemoryRemote> = Data::open(local.clone(), None, config.clone())
                .await
                .unwrap();
            offline
                .adopt_server_state(1, &backend.data(USER))
                .await
                .unwrap();
            let mut edited = patient.clone();
            edited.bed = Some("9".to_string());
            offline.update(edited).await.unwrap();
        }

        let data = Data::open(local, Some(backend.client(USER)), config)
            .await
            .unwrap();
        assert_eq!(data.queue_counts().await.unwrap().pending, 1);
        assert_eq!(
            data.move_to_trash(RecordKind::Patient, &[patient.id.clone()])
                .await
                .unwrap(),
            1
        );

        let failed = data.failed_mutations().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0]
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("trash")));
        assert_eq!(data.flush().await.unwrap(), FlushReport::default());

        assert!(backend.push_log().is_empty());
        assert!(backend.data(USER).patients.is_empty());
        assert_eq!(backend.trash(USER).len(), 1);
        assert!(data
            .store()
            .get_clone(RecordKind::Patient, &patient.id)
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handover_between_accounts() {
        let backend = MemoryBackend::new();
        let alice = online(&backend, "alice").await;
        let bob = online(&backend, "bob").await;

        let patient = Patient::new("Ada").with_bed("4");
        alice.add(patient.clone()).await.unwrap();
        let inbox_id = alice
            .send_patient("bob", &patient.id, Some("night handover".to_string()))
            .await
            .unwrap();

        let items = bob.check_inbox().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].note.as_deref(), Some("night handover"));

        let accepted = bob.accept_inbox_patient(&inbox_id).await.unwrap();
        assert_eq!(accepted.id, patient.id);
        assert!(bob
            .store()
            .get_clone(RecordKind::Patient, &patient.id)
            .is_some());
        assert_eq!(bob.client_rev().await.unwrap(), 1);
        assert_eq!(bob.inbox(Some(InboxStatus::Accepted)).await.unwrap().len(), 1);
        assert!(bob.inbox(Some(InboxStatus::Pending)).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decline_marks_item_declined() {
        let backend = MemoryBackend::new();
        let alice = online(&backend, "alice").await;
        let bob = online(&backend, "bob").await;

        let patient = Patient::new("Ada");
        alice.add(patient.clone()).await.unwrap();
        let inbox_id = alice.send_patient("bob", &patient.id, None).await.unwrap();

        bob.check_inbox().await.unwrap();
        bob.decline_inbox_patient(&inbox_id).await.unwrap();
        assert_eq!(bob.inbox(Some(InboxStatus::Declined)).await.unwrap().len(), 1);
        assert!(bob.store().get_clone(RecordKind::Patient, &patient.id).is_none());
        assert!(bob.check_inbox().await.unwrap().is_empty());
    }
}
