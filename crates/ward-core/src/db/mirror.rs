//! Local mirror of remote state: records, trash, meta and inbox tables

use libsql::params::IntoParams;
use libsql::Connection;

use crate::error::{Error, Result};
use crate::models::{InboxItem, InboxStatus, Record, RecordId, RecordKind, TrashItem};

/// Meta key holding the last observed server revision
pub const META_CLIENT_REV: &str = "client_rev";
/// Meta key holding the last revision a snapshot of `kind` was applied at
pub fn meta_collection_rev(kind: RecordKind) -> String {
    format!("{META_CLIENT_REV}:{}", kind.collection())
}
/// Meta key holding this device's stable id
pub const META_DEVICE_ID: &str = "device_id";
/// Meta key holding the Unix ms of the last successful pull
pub const META_LAST_PULL_AT: &str = "last_pull_at";

/// Trait for mirror storage operations (async)
#[allow(async_fn_in_trait)]
pub trait MirrorRepository {
    /// Insert or replace a record row
    async fn upsert(&self, record: &Record) -> Result<()>;

    /// Flag a row as deleted; returns false when the row is unknown
    async fn soft_delete(&self, kind: RecordKind, id: &RecordId, at: i64) -> Result<bool>;

    /// Clear the deleted flag; returns false when the row is unknown
    async fn restore(&self, kind: RecordKind, id: &RecordId, at: i64) -> Result<bool>;

    /// Remove the row entirely
    async fn remove(&self, kind: RecordKind, id: &RecordId) -> Result<bool>;

    /// Fetch a row, deleted or not
    async fn get(&self, kind: RecordKind, id: &RecordId) -> Result<Option<Record>>;

    /// All live rows of one kind in insertion order
    async fn get_all(&self, kind: RecordKind) -> Result<Vec<Record>>;

    /// Live rows pointing at `parent_id` (patients of a ward, tasks of a patient)
    async fn get_by_parent(&self, kind: RecordKind, parent_id: &RecordId) -> Result<Vec<Record>>;

    /// Replace every row of one kind in a single transaction
    async fn replace_kind(&self, kind: RecordKind, records: &[Record]) -> Result<()>;

    async fn insert_trash(&self, item: &TrashItem) -> Result<()>;
    async fn list_trash(&self) -> Result<Vec<TrashItem>>;
    async fn remove_trash(&self, id: &RecordId) -> Result<bool>;
    /// Drop trash rows whose 30-day horizon has passed
    async fn purge_expired_trash(&self, now: i64) -> Result<u64>;

    async fn get_meta(&self, key: &str) -> Result<Option<String>>;
    async fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    async fn upsert_inbox(&self, item: &InboxItem) -> Result<()>;
    async fn list_inbox(&self, status: Option<InboxStatus>) -> Result<Vec<InboxItem>>;
    async fn set_inbox_status(&self, id: &RecordId, status: InboxStatus) -> Result<bool>;
}

/// libSQL implementation of `MirrorRepository`
pub struct LibSqlMirrorRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMirrorRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn write_record(&self, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.conn
            .execute(
                "INSERT INTO records (kind, id, parent_id, deleted, updated_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(kind, id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    deleted = excluded.deleted,
                    updated_at = excluded.updated_at,
                    payload = excluded.payload",
                libsql::params![
                    record.kind().as_str(),
                    record.id().as_str(),
                    record.parent_id().map(|id| id.as_str().to_string()),
                    i64::from(record.is_deleted()),
                    record.updated_at(),
                    payload,
                ],
            )
            .await?;
        Ok(())
    }

    async fn query_records(&self, sql: &str, params: impl IntoParams) -> Result<Vec<Record>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let payload: String = row.get(0)?;
            records.push(serde_json::from_str(&payload)?);
        }
        Ok(records)
    }
}

impl MirrorRepository for LibSqlMirrorRepository<'_> {
    async fn upsert(&self, record: &Record) -> Result<()> {
        self.write_record(record).await
    }

    async fn soft_delete(&self, kind: RecordKind, id: &RecordId, at: i64) -> Result<bool> {
        let Some(mut record) = self.get(kind, id).await? else {
            return Ok(false);
        };
        record.mark_deleted(at);
        self.write_record(&record).await?;
        Ok(true)
    }

    async fn restore(&self, kind: RecordKind, id: &RecordId, at: i64) -> Result<bool> {
        let Some(mut record) = self.get(kind, id).await? else {
            return Ok(false);
        };
        record.clear_deleted(at);
        self.write_record(&record).await?;
        Ok(true)
    }

    async fn remove(&self, kind: RecordKind, id: &RecordId) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM records WHERE kind = ?1 AND id = ?2",
                [kind.as_str(), id.as_str()],
            )
            .await?;
        Ok(removed > 0)
    }

    async fn get(&self, kind: RecordKind, id: &RecordId) -> Result<Option<Record>> {
        Ok(self
            .query_records(
                "SELECT payload FROM records WHERE kind = ?1 AND id = ?2",
                [kind.as_str(), id.as_str()],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn get_all(&self, kind: RecordKind) -> Result<Vec<Record>> {
        self.query_records(
            "SELECT payload FROM records WHERE kind = ?1 AND deleted = 0 ORDER BY rowid",
            [kind.as_str()],
        )
        .await
    }

    async fn get_by_parent(&self, kind: RecordKind, parent_id: &RecordId) -> Result<Vec<Record>> {
        self.query_records(
            "SELECT payload FROM records WHERE kind = ?1 AND parent_id = ?2 AND deleted = 0 ORDER BY rowid",
            [kind.as_str(), parent_id.as_str()],
        )
        .await
    }

    async fn replace_kind(&self, kind: RecordKind, records: &[Record]) -> Result<()> {
        if let Some(stray) = records.iter().find(|record| record.kind() != kind) {
            return Err(Error::InvalidInput(format!(
                "{} record {} in {kind} snapshot",
                stray.kind().as_str(),
                stray.id()
            )));
        }

        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let result = async {
            self.conn
                .execute("DELETE FROM records WHERE kind = ?1", [kind.as_str()])
                .await?;
            for record in records {
                self.write_record(record).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = result {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e);
        }
        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        Ok(())
    }

    async fn insert_trash(&self, item: &TrashItem) -> Result<()> {
        let payload = serde_json::to_string(&item.record)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO trash (id, item_type, payload, deleted_by, deleted_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                libsql::params![
                    item.id.as_str(),
                    item.item_type.as_str(),
                    payload,
                    item.deleted_by.as_str(),
                    item.deleted_at,
                    item.expires_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_trash(&self) -> Result<Vec<TrashItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, item_type, payload, deleted_by, deleted_at, expires_at
                 FROM trash ORDER BY deleted_at DESC",
                (),
            )
            .await?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let item_type: String = row.get(1)?;
            let payload: String = row.get(2)?;
            items.push(TrashItem {
                id: id.into(),
                item_type: item_type.parse()?,
                record: serde_json::from_str(&payload)?,
                deleted_by: row.get(3)?,
                deleted_at: row.get(4)?,
                expires_at: row.get(5)?,
            });
        }
        Ok(items)
    }

    async fn remove_trash(&self, id: &RecordId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM trash WHERE id = ?1", [id.as_str()])
            .await?;
        Ok(removed > 0)
    }

    async fn purge_expired_trash(&self, now: i64) -> Result<u64> {
        Ok(self
            .conn
            .execute("DELETE FROM trash WHERE expires_at <= ?1", [now])
            .await?)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM meta WHERE key = ?1", [key])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                [key, value],
            )
            .await?;
        Ok(())
    }

    async fn upsert_inbox(&self, item: &InboxItem) -> Result<()> {
        let patient = serde_json::to_string(&item.patient)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO inbox (id, from_user, to_user, patient, note, status, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                libsql::params![
                    item.id.as_str(),
                    item.from_user.as_str(),
                    item.to_user.as_str(),
                    patient,
                    item.note.clone(),
                    item.status.as_str(),
                    item.sent_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_inbox(&self, status: Option<InboxStatus>) -> Result<Vec<InboxItem>> {
        const COLUMNS: &str =
            "SELECT id, from_user, to_user, patient, note, status, sent_at FROM inbox";
        let mut rows = match status {
            Some(status) => {
                self.conn
                    .query(
                        &format!("{COLUMNS} WHERE status = ?1 ORDER BY sent_at ASC"),
                        [status.as_str()],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(&format!("{COLUMNS} ORDER BY sent_at ASC"), ())
                    .await?
            }
        };

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let patient: String = row.get(3)?;
            let status: String = row.get(5)?;
            items.push(InboxItem {
                id: id.into(),
                from_user: row.get(1)?,
                to_user: row.get(2)?,
                patient: serde_json::from_str(&patient)?,
                note: row.get(4)?,
                status: status.parse()?,
                sent_at: row.get(6)?,
            });
        }
        Ok(items)
    }

    async fn set_inbox_status(&self, id: &RecordId, status: InboxStatus) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE inbox SET status = ?1 WHERE id = ?2",
                [status.as_str(), id.as_str()],
            )
            .await?;
        Ok(updated > 0)
    }
}
