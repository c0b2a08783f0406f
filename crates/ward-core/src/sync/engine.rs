//! Background sync: outbox drain (push) and snapshot pull/subscribe.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::models::{Aggregate, Mutation, MutationStatus, Record, RecordId, RecordKind};
use crate::remote::{
    FailureClass, HeartbeatRequest, HeartbeatResponse, LoadRequest, PushAck, PushRequest,
    RemoteApi, RemoteChange, RemoteError,
};
use crate::services::LocalStore;
use crate::state::SyncState;
use crate::store::Store;
use crate::util::now_ms;

/// Outcome of one outbox drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Entries confirmed by the remote this cycle
    pub synced: usize,
    /// Entries left pending after a transient failure
    pub retried: usize,
    /// Entries rolled back and terminated as `failed_fatal`
    pub failed: usize,
    /// Entries not attempted because an earlier entry for the same record is still pending
    pub deferred: usize,
    /// The drain did not run because the engine is offline
    pub offline: bool,
}

impl FlushReport {
    const fn offline() -> Self {
        Self {
            synced: 0,
            retried: 0,
            failed: 0,
            deferred: 0,
            offline: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum PullOutcome {
    Offline,
    UpToDate { rev: u64 },
    Updated { rev: u64, records: usize },
}

struct EngineInner<R> {
    store: Arc<Store>,
    local: LocalStore,
    remote: Option<R>,
    events: EventBus,
    config: EngineConfig,
    device_id: String,
    online: AtomicBool,
    running: AtomicBool,
    drain: AsyncMutex<()>,
    /// Held while a local write is applied and queued, and while a
    /// rejection is rolled back, so neither sees half of the other
    writes: AsyncMutex<()>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Drains the outbox to the remote and applies remote snapshots.
///
/// Cloning shares the engine. Timers and listeners started through
/// [`SyncEngine::start`] and [`SyncEngine::listen`] run until
/// [`SyncEngine::stop`].
pub struct SyncEngine<R> {
    inner: Arc<EngineInner<R>>,
}

impl<R> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> std::fmt::Debug for SyncEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.inner.device_id)
            .field("remote", &self.inner.remote.is_some())
            .field("online", &self.inner.online.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

enum PushResult {
    Acked(PushAck),
    Failed(RemoteError),
}

impl<R: RemoteApi> SyncEngine<R> {
    /// Build an engine; it starts online when a remote is configured.
    pub fn new(
        store: Arc<Store>,
        local: LocalStore,
        remote: Option<R>,
        events: EventBus,
        config: EngineConfig,
        device_id: String,
    ) -> Self {
        let online = remote.is_some();
        Self {
            inner: Arc::new(EngineInner {
                store,
                local,
                remote,
                events,
                config,
                device_id,
                online: AtomicBool::new(online),
                running: AtomicBool::new(false),
                drain: AsyncMutex::new(()),
                writes: AsyncMutex::new(()),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.remote.is_some() && self.inner.online.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The remote, when configured and online
    pub(crate) fn remote(&self) -> Result<&R> {
        match &self.inner.remote {
            Some(remote) if self.is_online() => Ok(remote),
            Some(_) => Err(Error::Offline("device is offline".to_string())),
            None => Err(Error::Offline("no remote configured".to_string())),
        }
    }

    /// Block outbox drains until the guard drops
    pub(crate) async fn lock_drain(&self) -> MutexGuard<'_, ()> {
        self.inner.drain.lock().await
    }

    /// Block local writes and rollbacks until the guard drops
    pub(crate) async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.inner.writes.lock().await
    }

    /// Record an online/offline transition; going online triggers a drain.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }
        if online {
            tracing::info!("Sync engine online");
            self.spawn_flush();
        } else {
            tracing::info!("Sync engine offline; writes will queue locally");
            self.inner
                .events
                .publish(Event::SyncStatus(SyncState::Offline));
        }
    }

    /// Fire-and-forget drain; a no-op while offline.
    pub fn spawn_flush(&self) {
        if !self.is_online() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.flush().await {
                tracing::warn!(%error, "Background flush failed");
            }
        });
    }

    /// Drain every pending entry in FIFO order.
    ///
    /// Drains are serialized. A failed entry never stops the cycle; after a
    /// transient failure, later entries for the same record wait for the
    /// next cycle so their order is kept. A rejection terminates every later
    /// entry for the same record, including ones queued while the drain ran.
    pub async fn flush(&self) -> Result<FlushReport> {
        let Ok(remote) = self.remote() else {
            return Ok(FlushReport::offline());
        };
        let _drain = self.inner.drain.lock().await;

        let pending = self.inner.local.list_pending().await?;
        if pending.is_empty() {
            self.inner
                .events
                .publish(Event::SyncStatus(SyncState::Synced));
            return Ok(FlushReport::default());
        }

        self.inner
            .events
            .publish(Event::SyncStatus(SyncState::Syncing));
        tracing::debug!(pending = pending.len(), "Draining outbox");

        let mut report = FlushReport::default();
        let mut blocked: HashSet<(RecordKind, RecordId)> = HashSet::new();
        let mut rejected: HashSet<(RecordKind, RecordId)> = HashSet::new();

        for mutation in pending {
            let key = (mutation.collection, mutation.doc_id.clone());
            if rejected.contains(&key) {
                // already terminated alongside the rejected entry
                report.failed += 1;
                continue;
            }
            if blocked.contains(&key) {
                report.deferred += 1;
                continue;
            }

            match self.push(remote, &mutation).await {
                PushResult::Acked(ack) => {
                    self.confirm(&mutation, ack).await?;
                    report.synced += 1;
                }
                PushResult::Failed(error) => match error.class() {
                    FailureClass::Fatal => {
                        self.fail(&mutation, &error.to_string()).await?;
                        report.failed += 1;
                        rejected.insert(key);
                    }
                    FailureClass::Transient => {
                        if self.retry(&mutation, &error).await? {
                            report.retried += 1;
                            blocked.insert(key);
                        } else {
                            report.failed += 1;
                            rejected.insert(key);
                        }
                    }
                },
            }
        }

        let state = if report.retried > 0 || report.failed > 0 {
            SyncState::Error
        } else {
            SyncState::Synced
        };
        self.inner.events.publish(Event::SyncStatus(state));
        tracing::info!(
            synced = report.synced,
            retried = report.retried,
            failed = report.failed,
            deferred = report.deferred,
            "Outbox drain finished"
        );
        Ok(report)
    }

    async fn push(&self, remote: &R, mutation: &Mutation) -> PushResult {
        let request = PushRequest {
            idempotency_key: mutation.idempotency_key.clone(),
            collection: mutation.collection,
            operation: mutation.operation(),
            doc_id: mutation.doc_id.clone(),
            payload: mutation.payload().cloned(),
            device_id: self.inner.device_id.clone(),
        };
        match remote.push_mutation(request).await {
            Ok(ack) => PushResult::Acked(ack),
            Err(error) => PushResult::Failed(error),
        }
    }

    async fn confirm(&self, mutation: &Mutation, ack: PushAck) -> Result<()> {
        self.inner
            .local
            .mark_status(&mutation.id, MutationStatus::Synced)
            .await?;
        if !ack.duplicate {
            self.note_remote_write(ack.rev).await?;
        }
        tracing::debug!(
            mutation_id = %mutation.id,
            collection = %mutation.collection,
            doc_id = %mutation.doc_id,
            rev = ack.rev,
            duplicate = ack.duplicate,
            "Mutation synced"
        );
        self.inner.events.publish(Event::MutationSynced {
            mutation_id: mutation.id,
            collection: mutation.collection,
            doc_id: mutation.doc_id.clone(),
            rev: ack.rev,
        });
        Ok(())
    }

    /// Returns false when the entry ran out of retries and was failed instead
    async fn retry(&self, mutation: &Mutation, error: &RemoteError) -> Result<bool> {
        let local = &self.inner.local;
        let retry_count = local.increment_retry(&mutation.id).await?;
        local.record_error(&mutation.id, &error.to_string()).await?;

        if retry_count >= self.inner.config.max_retry_count {
            let message = format!("gave up after {retry_count} attempts: {error}");
            self.fail(mutation, &message).await?;
            return Ok(false);
        }

        tracing::warn!(
            mutation_id = %mutation.id,
            collection = %mutation.collection,
            doc_id = %mutation.doc_id,
            retry_count,
            %error,
            "Push failed; will retry"
        );
        self.inner.events.publish(Event::MutationRetrying {
            mutation_id: mutation.id,
            retry_count,
            error: error.to_string(),
        });
        Ok(true)
    }

    /// Roll back the optimistic write and terminate the entry, along with
    /// every later pending entry for the same record.
    async fn fail(&self, mutation: &Mutation, message: &str) -> Result<()> {
        let _writes = self.lock_writes().await;
        let kind = mutation.collection;
        self.inner
            .store
            .restore(kind, &mutation.doc_id, mutation.previous.clone());

        let mirrored = match &mutation.previous {
            Some(previous) => self.inner.local.upsert_record(previous).await,
            None => self
                .inner
                .local
                .remove_record(kind, &mutation.doc_id)
                .await
                .map(|_| ()),
        };
        if let Err(error) = mirrored {
            tracing::warn!(doc_id = %mutation.doc_id, %error, "Mirror rollback failed");
        }

        let local = &self.inner.local;
        local
            .mark_status(&mutation.id, MutationStatus::FailedFatal)
            .await?;
        local.record_error(&mutation.id, message).await?;

        tracing::error!(
            mutation_id = %mutation.id,
            collection = %kind,
            doc_id = %mutation.doc_id,
            error = message,
            "Mutation rejected; rolled back"
        );
        self.inner.events.publish(Event::MutationFailed {
            mutation_id: mutation.id,
            collection: kind,
            doc_id: mutation.doc_id.clone(),
            message: format!(
                "Could not save {} {}: {message}",
                kind.as_str(),
                mutation.doc_id
            ),
        });

        self.terminate_pending(
            kind,
            &mutation.doc_id,
            Some((mutation.timestamp, mutation.seq)),
            "an earlier change to this record was rejected",
        )
        .await?;
        Ok(())
    }

    /// Terminate pending entries of one record without rolling anything back.
    ///
    /// With `after`, only entries later than that `(timestamp, seq)` are
    /// touched. Callers hold [`SyncEngine::lock_writes`]. Returns how many
    /// entries were terminated.
    pub(crate) async fn terminate_pending(
        &self,
        kind: RecordKind,
        doc_id: &RecordId,
        after: Option<(i64, i64)>,
        message: &str,
    ) -> Result<usize> {
        let pending = self.inner.local.list_pending_for_doc(kind, doc_id).await?;
        let mut terminated = 0;
        for mutation in pending {
            if after.is_some_and(|after| (mutation.timestamp, mutation.seq) <= after) {
                continue;
            }
            self.terminate(&mutation, message).await?;
            terminated += 1;
        }
        Ok(terminated)
    }

    async fn terminate(&self, mutation: &Mutation, message: &str) -> Result<()> {
        let local = &self.inner.local;
        local
            .mark_status(&mutation.id, MutationStatus::FailedFatal)
            .await?;
        local.record_error(&mutation.id, message).await?;

        tracing::warn!(
            mutation_id = %mutation.id,
            collection = %mutation.collection,
            doc_id = %mutation.doc_id,
            reason = message,
            "Dropped queued change"
        );
        self.inner.events.publish(Event::MutationFailed {
            mutation_id: mutation.id,
            collection: mutation.collection,
            doc_id: mutation.doc_id.clone(),
            message: format!(
                "Could not save {} {}: {message}",
                mutation.collection.as_str(),
                mutation.doc_id
            ),
        });
        Ok(())
    }

    /// Advance `client_rev` after one of our own writes landed.
    ///
    /// Only a contiguous step (`rev == client_rev + 1`) is taken; a larger
    /// jump means another device wrote in between and a pull must fetch it.
    pub(crate) async fn note_remote_write(&self, rev: u64) -> Result<()> {
        let current = self.inner.local.client_rev().await?;
        if rev == current + 1 {
            self.inner.local.set_client_rev(rev).await?;
        }
        Ok(())
    }

    /// Revision-gated fetch of the whole aggregate.
    pub async fn pull(&self) -> Result<PullOutcome> {
        let client_rev = self.inner.local.client_rev().await?;
        self.pull_from(client_rev).await
    }

    async fn pull_from(&self, client_rev: u64) -> Result<PullOutcome> {
        let Ok(remote) = self.remote() else {
            return Ok(PullOutcome::Offline);
        };

        let response = remote
            .load_data(LoadRequest {
                client_rev,
                device_id: self.inner.device_id.clone(),
            })
            .await?;

        let data = match response.data {
            Some(data) if !response.up_to_date => data,
            _ => {
                tracing::debug!(rev = response.rev, "Pull: already up to date");
                return Ok(PullOutcome::UpToDate { rev: response.rev });
            }
        };

        let records = data.patients.len() + data.tasks.len() + data.units.len();
        self.adopt(response.rev, &data).await?;
        self.inner.local.set_last_pull_at(now_ms()).await?;
        tracing::info!(rev = response.rev, records, "Pulled remote snapshot");
        Ok(PullOutcome::Updated {
            rev: response.rev,
            records,
        })
    }

    /// Replace store and mirror with a server aggregate at `rev`.
    ///
    /// Pending local edits are not merged: the snapshot wins.
    pub(crate) async fn adopt(&self, rev: u64, aggregate: &Aggregate) -> Result<()> {
        for kind in RecordKind::ALL {
            self.replace_kind(kind, aggregate.records(kind)).await?;
        }
        self.inner.local.set_client_rev(rev).await
    }

    async fn replace_kind(&self, kind: RecordKind, records: Vec<Record>) -> Result<()> {
        self.inner.local.replace_kind(kind, &records).await?;
        self.inner.store.replace_collection(kind, records);
        Ok(())
    }

    /// Apply one pushed snapshot from a subscription
    async fn apply_snapshot(&self, kind: RecordKind, records: Vec<Record>, rev: u64) -> Result<()> {
        let count = records.len();
        self.replace_kind(kind, records).await?;
        let client_rev = self.inner.local.note_collection_rev(kind, rev).await?;
        tracing::debug!(
            collection = %kind,
            rev,
            client_rev,
            records = count,
            "Applied remote snapshot"
        );
        Ok(())
    }

    /// Subscribe to remote changes of one collection until [`SyncEngine::stop`].
    pub async fn listen(&self, kind: RecordKind) -> Result<()> {
        let remote = self.remote()?;
        let client_rev = self.inner.local.client_rev().await?;
        let mut subscription = remote.subscribe(kind, client_rev)?;

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(change) = subscription.next().await {
                match change {
                    RemoteChange::Snapshot { kind, records, rev } => {
                        if let Err(error) = engine.apply_snapshot(kind, records, rev).await {
                            tracing::warn!(collection = %kind, %error, "Could not apply snapshot");
                        }
                    }
                    RemoteChange::Error(error) => {
                        tracing::warn!(collection = %kind, %error, "Subscription error");
                    }
                }
            }
            subscription.cancel();
        });
        self.track(handle);
        tracing::info!(collection = %kind, "Listening for remote changes");
        Ok(())
    }

    /// Report this device and react to revision drift.
    pub async fn heartbeat(&self) -> Result<HeartbeatResponse> {
        let remote = self.remote()?;
        let client_rev = self.inner.local.client_rev().await?;
        let response = remote
            .heartbeat(HeartbeatRequest {
                device_id: self.inner.device_id.clone(),
                device_info: Some(format!("ward-core/{}", env!("CARGO_PKG_VERSION"))),
                client_rev,
            })
            .await?;

        if response.rev_gap > 0 {
            self.inner.events.publish(Event::RevisionDrift {
                rev_gap: response.rev_gap,
                active_devices: response.active_devices,
            });
        }

        if response.force_full_sync {
            tracing::warn!(
                client_rev,
                rev = response.rev,
                "Revision drift too large; forcing full sync"
            );
            self.pull_from(0).await?;
        } else if response.rev_gap > 0 {
            self.pull().await?;
        }
        Ok(response)
    }

    /// Remove `synced` entries past the retention window.
    pub async fn purge_synced(&self) -> Result<u64> {
        self.inner
            .local
            .purge_synced(self.inner.config.wal_retention_ms(), now_ms())
            .await
    }

    /// Start the periodic flush and heartbeat timers (idempotent).
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = self.clone();
        let flush_every = self.inner.config.flush_interval;
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_every);
            loop {
                ticker.tick().await;
                if let Err(error) = engine.flush().await {
                    tracing::warn!(%error, "Periodic flush failed");
                }
            }
        }));

        if self.inner.remote.is_some() {
            let engine = self.clone();
            let heartbeat_every = self.inner.config.heartbeat_interval;
            self.track(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(heartbeat_every);
                loop {
                    ticker.tick().await;
                    if !engine.is_online() {
                        continue;
                    }
                    if let Err(error) = engine.heartbeat().await {
                        tracing::warn!(%error, "Heartbeat failed");
                    }
                }
            }));
        }

        tracing::info!(
            flush_interval_secs = flush_every.as_secs(),
            "Sync engine started"
        );
    }

    /// Stop timers and cancel every subscription. Safe to call repeatedly.
    pub fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);

        for handle in &handles {
            handle.abort();
        }
        if was_running || !handles.is_empty() {
            tracing::info!(tasks = handles.len(), "Sync engine stopped");
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Number of background tasks (timers and listeners) currently tracked
    pub fn task_count(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Change, Patient, Task};
    use crate::remote::{MemoryBackend, MemoryRemote, RejectCode};
    use pretty_assertions::assert_eq;

    const USER: &str = "ward-7";

    async fn engine_with(
        backend: &Arc<MemoryBackend>,
        config: EngineConfig,
    ) -> (SyncEngine<MemoryRemote>, Arc<Store>, LocalStore) {
        let events = EventBus::default();
        let store = Arc::new(Store::new(events.clone()));
        let local = LocalStore::open_in_memory().await.unwrap();
        let engine = SyncEngine::new(
            Arc::clone(&store),
            local.clone(),
            Some(backend.client(USER)),
            events,
            config,
            "device-test".to_string(),
        );
        (engine, store, local)
    }

    async fn queue_add(store: &Store, local: &LocalStore, patient: &Patient, at: i64) -> Mutation {
        let change = Change::Add(patient.clone().into());
        store
            .apply(RecordKind::Patient, &patient.id, &change)
            .unwrap();
        let mutation = Mutation::at(RecordKind::Patient, patient.id.clone(), change, None, at);
        local.append(&mutation).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_offline_is_noop() {
        let backend = MemoryBackend::new();
        let (engine, store, local) = engine_with(&backend, EngineConfig::default()).await;
        engine.set_online(false);

        queue_add(&store, &local, &Patient::new("Ada"), 1).await;
        let report = engine.flush().await.unwrap();
        assert!(report.offline);
        assert_eq!(local.queue_counts().await.unwrap().pending, 1);
        assert!(backend.push_log().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failure_keeps_entry_and_defers_same_doc() {
        let backend = MemoryBackend::new();
        let (engine, store, local) = engine_with(&backend, EngineConfig::default()).await;

        let patient = Patient::new("Ada");
        let add = queue_add(&store, &local, &patient, 1).await;
        let mut edited = patient.clone();
        edited.bed = Some("9".to_string());
        let update = local
            .append(&Mutation::at(
                RecordKind::Patient,
                patient.id.clone(),
                Change::Update(edited.into()),
                Some(patient.clone().into()),
                2,
            ))
            .await
            .unwrap();
        let other = queue_add(&store, &local, &Patient::new("Grace"), 3).await;

        backend.fail_next(RemoteError::Timeout);
        let report = engine.flush().await.unwrap();
        assert_eq!(
            report,
            FlushReport {
                synced: 1,
                retried: 1,
                failed: 0,
                deferred: 1,
                offline: false,
            }
        );

        let add_entry = local.get_mutation(&add.id).await.unwrap().unwrap();
        assert!(add_entry.is_pending());
        assert_eq!(add_entry.retry_count, 1);
        assert!(local.get_mutation(&update.id).await.unwrap().unwrap().is_pending());
        assert_eq!(
            local.get_mutation(&other.id).await.unwrap().unwrap().status,
            MutationStatus::Synced
        );
        // Optimistic value is kept on transient failure
        assert!(store.get_clone(RecordKind::Patient, &patient.id).is_some());

        let report = engine.flush().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(local.queue_counts().await.unwrap().pending, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fatal_rejection_rolls_back_and_continues() {
        let backend = MemoryBackend::new();
        let (engine, store, local) = engine_with(&backend, EngineConfig::default()).await;
        let mut events = store.events().subscribe();

        let rejected = Patient::new("Rejected");
        let accepted = Patient::new("Accepted");
        let first = queue_add(&store, &local, &rejected, 1).await;
        queue_add(&store, &local, &accepted, 2).await;

        backend.fail_next(RemoteError::rejected(
            RejectCode::PermissionDenied,
            "ward closed",
        ));
        let report = engine.flush().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.synced, 1);

        assert!(store.get_clone(RecordKind::Patient, &rejected.id).is_none());
        assert!(store.get_clone(RecordKind::Patient, &accepted.id).is_some());
        let entry = local.get_mutation(&first.id).await.unwrap().unwrap();
        assert_eq!(entry.status, MutationStatus::FailedFatal);
        assert!(entry.last_error.unwrap().contains("ward closed"));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let Event::MutationFailed { mutation_id, .. } = event {
                assert_eq!(mutation_id, first.id);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejection_terminates_entries_queued_mid_drain() {
        let backend = MemoryBackend::new();
        let (engine, store, local) = engine_with(&backend, EngineConfig::default()).await;

        let patient = Patient::new("Ada");
        let add = queue_add(&store, &local, &patient, 1).await;

        let held = backend.hold_next_push();
        backend.fail_next(RemoteError::rejected(
            RejectCode::FailedPrecondition,
            "unit closed",
        ));
        let draining = tokio::spawn({
            let engine = engine.clone();
            async move { engine.flush().await }
        });
        held.arrived().await;

        let mut edited = patient.clone();
        edited.bed = Some("4".to_string());
        let update = local
            .append(&Mutation::at(
                RecordKind::Patient,
                patient.id.clone(),
                Change::Update(edited.into()),
                Some(patient.clone().into()),
                2,
            ))
            .await
            .unwrap();
        held.release();

        let report = draining.await.unwrap().unwrap();
        assert_eq!(report.failed, 1);
        for id in [add.id, update.id] {
            let entry = local.get_mutation(&id).await.unwrap().unwrap();
            assert_eq!(entry.status, MutationStatus::FailedFatal);
        }

        let next = engine.flush().await.unwrap();
        assert_eq!(next, FlushReport::default());
        assert!(backend.push_log().is_empty());
        assert!(store.get_clone(RecordKind::Patient, &patient.id).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_of_one_collection_keeps_pull_open_for_others() {
        let backend = MemoryBackend::new();
        let (engine, store, local) = engine_with(&backend, EngineConfig::default()).await;
        backend.seed(
            USER,
            2,
            Aggregate {
                patients: vec![Patient::new("Ada")],
                tasks: vec![Task::new(RecordId::from("p-1"), "Obs")],
                ..Aggregate::default()
            },
        );

        let patients = backend.data(USER).records(RecordKind::Patient);
        engine
            .apply_snapshot(RecordKind::Patient, patients, 2)
            .await
            .unwrap();
        assert_eq!(store.len(RecordKind::Patient), 1);
        assert_eq!(local.client_rev().await.unwrap(), 0);

        assert_eq!(
            engine.pull().await.unwrap(),
            PullOutcome::Updated { rev: 2, records: 2 }
        );
        assert_eq!(store.len(RecordKind::Task), 1);
        assert_eq!(local.client_rev().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_exhaustion_is_terminal() {
        let backend = MemoryBackend::new();
        let config = EngineConfig {
            max_retry_count: 2,
            ..EngineConfig::default()
        };
        let (engine, store, local) = engine_with(&backend, config).await;

        let patient = Patient::new("Ada");
        let entry = queue_add(&store, &local, &patient, 1).await;

        backend.fail_next(RemoteError::Unavailable { status: 503 });
        assert_eq!(engine.flush().await.unwrap().retried, 1);
        backend.fail_next(RemoteError::Unavailable { status: 503 });
        assert_eq!(engine.flush().await.unwrap().failed, 1);

        let stored = local.get_mutation(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MutationStatus::FailedFatal);
        assert_eq!(stored.retry_count, 2);
        assert!(store.get_clone(RecordKind::Patient, &patient.id).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_advances_client_rev_only_when_contiguous() {
        let backend = MemoryBackend::new();
        let (engine, store, local) = engine_with(&backend, EngineConfig::default()).await;

        queue_add(&store, &local, &Patient::new("Ada"), 1).await;
        engine.flush().await.unwrap();
        assert_eq!(local.client_rev().await.unwrap(), 1);

        // Another device writes; our next push lands at rev 3
        let other = backend.client(USER);
        other
            .push_mutation(PushRequest {
                idempotency_key: "patients:x:add:1".to_string(),
                collection: RecordKind::Patient,
                operation: crate::models::Operation::Add,
                doc_id: RecordId::from("x"),
                payload: Some(Patient { id: RecordId::from("x"), ..Patient::new("X") }.into()),
                device_id: "device-other".to_string(),
            })
            .await
            .unwrap();
        queue_add(&store, &local, &Patient::new("Grace"), 2).await;
        engine.flush().await.unwrap();
        assert_eq!(local.client_rev().await.unwrap(), 1);

        let outcome = engine.pull().await.unwrap();
        assert_eq!(outcome, PullOutcome::Updated { rev: 3, records: 3 });
        assert_eq!(store.len(RecordKind::Patient), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_is_revision_gated() {
        let backend = MemoryBackend::new();
        let (engine, _store, local) = engine_with(&backend, EngineConfig::default()).await;

        assert_eq!(
            engine.pull().await.unwrap(),
            PullOutcome::UpToDate { rev: 0 }
        );
        backend.seed(
            USER,
            4,
            Aggregate {
                patients: vec![Patient::new("Ada")],
                ..Aggregate::default()
            },
        );
        assert_eq!(
            engine.pull().await.unwrap(),
            PullOutcome::Updated { rev: 4, records: 1 }
        );
        assert_eq!(local.client_rev().await.unwrap(), 4);
        assert!(local.last_pull_at().await.unwrap().is_some());
        assert_eq!(
            engine.pull().await.unwrap(),
            PullOutcome::UpToDate { rev: 4 }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heartbeat_reports_drift_and_pulls() {
        let backend = MemoryBackend::new();
        let (engine, store, _local) = engine_with(&backend, EngineConfig::default()).await;
        let mut events = store.events().subscribe();

        backend.seed(
            USER,
            2,
            Aggregate {
                patients: vec![Patient::new("Ada")],
                ..Aggregate::default()
            },
        );
        let response = engine.heartbeat().await.unwrap();
        assert_eq!(response.rev_gap, 2);
        assert_eq!(store.len(RecordKind::Patient), 1);

        let mut drift = None;
        while let Ok(event) = events.try_recv() {
            if let Event::RevisionDrift { rev_gap, .. } = event {
                drift = Some(rev_gap);
            }
        }
        assert_eq!(drift, Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_idempotent() {
        let backend = MemoryBackend::new();
        let (engine, _store, _local) = engine_with(&backend, EngineConfig::default()).await;

        engine.start();
        engine.start();
        engine.listen(RecordKind::Patient).await.unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.task_count(), 3);

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.task_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_without_remote_is_offline() {
        let events = EventBus::default();
        let store = Arc::new(Store::new(events.clone()));
        let local = LocalStore::open_in_memory().await.unwrap();
        let engine: SyncEngine<MemoryRemote> = SyncEngine::new(
            store,
            local,
            None,
            events,
            EngineConfig::default(),
            "device-test".to_string(),
        );
        engine.set_online(true);
        assert!(!engine.is_online());
        assert!(engine.flush().await.unwrap().offline);
        assert_eq!(engine.pull().await.unwrap(), PullOutcome::Offline);
        assert!(matches!(engine.heartbeat().await, Err(Error::Offline(_))));
    }
}
