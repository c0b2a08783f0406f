//! Shared durable-storage service used by the coordinator and the sync engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{
    meta_collection_rev, Database, LibSqlMirrorRepository, LibSqlWalRepository,
    MirrorRepository, QueueCounts, WalRepository, META_CLIENT_REV, META_DEVICE_ID,
    META_LAST_PULL_AT,
};
use crate::models::{
    InboxItem, InboxStatus, Mutation, MutationId, MutationStatus, Record, RecordId, RecordKind,
    TrashItem,
};
use crate::Result;

/// Thread-safe handle over the local database and its repositories.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open (or create) the database file at `db_path`.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        tracing::debug!(path = %db_path.display(), "Opened local store");
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    // Outbox

    /// Durably append a queue entry; returns it with its sequence assigned.
    pub async fn append(&self, mutation: &Mutation) -> Result<Mutation> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection())
            .append(mutation)
            .await
    }

    pub async fn list_pending(&self) -> Result<Vec<Mutation>> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection()).list_pending().await
    }

    pub async fn list_mutations(&self, status: MutationStatus) -> Result<Vec<Mutation>> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection())
            .list_by_status(status)
            .await
    }

    pub async fn list_pending_for_doc(
        &self,
        kind: RecordKind,
        doc_id: &RecordId,
    ) -> Result<Vec<Mutation>> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection())
            .list_pending_for_doc(kind, doc_id)
            .await
    }

    pub async fn get_mutation(&self, id: &MutationId) -> Result<Option<Mutation>> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection()).get(id).await
    }

    pub async fn mark_status(&self, id: &MutationId, status: MutationStatus) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection())
            .mark_status(id, status)
            .await
    }

    pub async fn increment_retry(&self, id: &MutationId) -> Result<u32> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection())
            .increment_retry(id)
            .await
    }

    pub async fn record_error(&self, id: &MutationId, message: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection())
            .record_error(id, message)
            .await
    }

    pub async fn purge_synced(&self, older_than_ms: i64, now: i64) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection())
            .purge_synced(older_than_ms, now)
            .await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        let db = self.db.lock().await;
        LibSqlWalRepository::new(db.connection()).counts().await
    }

    // Mirror

    pub async fn upsert_record(&self, record: &Record) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .upsert(record)
            .await
    }

    pub async fn soft_delete_record(&self, kind: RecordKind, id: &RecordId, at: i64) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .soft_delete(kind, id, at)
            .await
    }

    pub async fn restore_record(&self, kind: RecordKind, id: &RecordId, at: i64) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .restore(kind, id, at)
            .await
    }

    pub async fn remove_record(&self, kind: RecordKind, id: &RecordId) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .remove(kind, id)
            .await
    }

    pub async fn get_record(&self, kind: RecordKind, id: &RecordId) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .get(kind, id)
            .await
    }

    pub async fn records(&self, kind: RecordKind) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .get_all(kind)
            .await
    }

    pub async fn records_by_parent(
        &self,
        kind: RecordKind,
        parent_id: &RecordId,
    ) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .get_by_parent(kind, parent_id)
            .await
    }

    pub async fn replace_kind(&self, kind: RecordKind, records: &[Record]) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .replace_kind(kind, records)
            .await
    }

    // Trash

    pub async fn insert_trash(&self, item: &TrashItem) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .insert_trash(item)
            .await
    }

    pub async fn list_trash(&self) -> Result<Vec<TrashItem>> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .list_trash()
            .await
    }

    pub async fn remove_trash(&self, id: &RecordId) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .remove_trash(id)
            .await
    }

    pub async fn purge_expired_trash(&self, now: i64) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .purge_expired_trash(now)
            .await
    }

    // Meta

    /// Last server revision this device has observed (0 when never synced).
    pub async fn client_rev(&self) -> Result<u64> {
        let db = self.db.lock().await;
        read_rev(&LibSqlMirrorRepository::new(db.connection()), META_CLIENT_REV).await
    }

    /// Record that `kind` was replaced by a snapshot taken at `rev`.
    ///
    /// `client_rev` only moves to the lowest revision every collection has
    /// reached, so a listener on one collection never hides changes to the
    /// others from the next pull. Returns the resulting `client_rev`.
    pub async fn note_collection_rev(&self, kind: RecordKind, rev: u64) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());

        let key = meta_collection_rev(kind);
        if rev > read_rev(&repo, &key).await? {
            repo.set_meta(&key, &rev.to_string()).await?;
        }

        let current = read_rev(&repo, META_CLIENT_REV).await?;
        let mut floor = u64::MAX;
        for kind in RecordKind::ALL {
            let seen = read_rev(&repo, &meta_collection_rev(kind)).await?;
            floor = floor.min(seen.max(current));
        }
        if floor > current {
            repo.set_meta(META_CLIENT_REV, &floor.to_string()).await?;
            return Ok(floor);
        }
        Ok(current)
    }

    /// Overwrite the stored revision (adopting a server snapshot).
    pub async fn set_client_rev(&self, rev: u64) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .set_meta(META_CLIENT_REV, &rev.to_string())
            .await
    }

    /// Stable device id, generated on first use.
    pub async fn device_id(&self) -> Result<String> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        if let Some(id) = repo.get_meta(META_DEVICE_ID).await? {
            return Ok(id);
        }
        let id = format!("device-{}", RecordId::new());
        repo.set_meta(META_DEVICE_ID, &id).await?;
        tracing::info!(device_id = %id, "Registered new device id");
        Ok(id)
    }

    pub async fn last_pull_at(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        let value = LibSqlMirrorRepository::new(db.connection())
            .get_meta(META_LAST_PULL_AT)
            .await?;
        Ok(value.and_then(|raw| raw.parse().ok()))
    }

    pub async fn set_last_pull_at(&self, at: i64) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .set_meta(META_LAST_PULL_AT, &at.to_string())
            .await
    }

    // Inbox

    pub async fn upsert_inbox(&self, item: &InboxItem) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .upsert_inbox(item)
            .await
    }

    pub async fn list_inbox(&self, status: Option<InboxStatus>) -> Result<Vec<InboxItem>> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .list_inbox(status)
            .await
    }

    pub async fn set_inbox_status(&self, id: &RecordId, status: InboxStatus) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlMirrorRepository::new(db.connection())
            .set_inbox_status(id, status)
            .await
    }

    /// Run raw SQL against the underlying connection (storage fault tests).
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection().execute(sql, ()).await?;
        Ok(())
    }
}

async fn read_rev(repo: &LibSqlMirrorRepository<'_>, key: &str) -> Result<u64> {
    Ok(repo
        .get_meta(key)
        .await?
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default())
}
