//! Durable outbox (write-ahead queue) repository

use libsql::params::IntoParams;
use libsql::{Connection, Row};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{
    Change, Mutation, MutationId, MutationStatus, Operation, Record, RecordId, RecordKind,
};

const SELECT_COLUMNS: &str = "SELECT seq, id, collection, doc_id, operation, payload, previous, \
     timestamp, status, retry_count, idempotency_key, last_error FROM wal";

/// Entry counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: u64,
    pub synced: u64,
    pub failed_fatal: u64,
}

/// Trait for outbox storage operations (async)
#[allow(async_fn_in_trait)]
pub trait WalRepository {
    /// Persist a new entry; returns it with its queue sequence assigned
    async fn append(&self, mutation: &Mutation) -> Result<Mutation>;

    /// Pending entries in FIFO order (`timestamp`, then `seq`)
    async fn list_pending(&self) -> Result<Vec<Mutation>>;

    async fn list_by_status(&self, status: MutationStatus) -> Result<Vec<Mutation>>;

    /// Pending entries of one record in FIFO order
    async fn list_pending_for_doc(
        &self,
        collection: RecordKind,
        doc_id: &RecordId,
    ) -> Result<Vec<Mutation>>;

    async fn get(&self, id: &MutationId) -> Result<Option<Mutation>>;

    async fn mark_status(&self, id: &MutationId, status: MutationStatus) -> Result<()>;

    /// Bump the retry counter, returning the new value
    async fn increment_retry(&self, id: &MutationId) -> Result<u32>;

    async fn record_error(&self, id: &MutationId, message: &str) -> Result<()>;

    /// Delete `synced` entries created more than `older_than_ms` before `now`
    ///
    /// Pending and failed entries are never removed.
    async fn purge_synced(&self, older_than_ms: i64, now: i64) -> Result<u64>;

    async fn counts(&self) -> Result<QueueCounts>;
}

/// libSQL implementation of `WalRepository`
pub struct LibSqlWalRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlWalRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_mutations(&self, sql: &str, params: impl IntoParams) -> Result<Vec<Mutation>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut mutations = Vec::new();
        while let Some(row) = rows.next().await? {
            mutations.push(row_to_mutation(&row)?);
        }
        Ok(mutations)
    }
}

fn encode_record(record: Option<&Record>) -> Result<Option<String>> {
    record.map(serde_json::to_string).transpose().map_err(Error::from)
}

fn decode_record(raw: Option<String>) -> Result<Option<Record>> {
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(Error::from)
}

fn row_to_mutation(row: &Row) -> Result<Mutation> {
    let seq: i64 = row.get(0)?;
    let id: String = row.get(1)?;
    let collection: String = row.get(2)?;
    let doc_id: String = row.get(3)?;
    let operation: String = row.get(4)?;
    let payload: Option<String> = row.get(5)?;
    let previous: Option<String> = row.get(6)?;
    let timestamp: i64 = row.get(7)?;
    let status: String = row.get(8)?;
    let retry_count: i64 = row.get(9)?;
    let idempotency_key: String = row.get(10)?;
    let last_error: Option<String> = row.get(11)?;

    let operation: Operation = operation.parse()?;
    let id: MutationId = id
        .parse()
        .map_err(|error| Error::Database(format!("invalid queue entry id {id}: {error}")))?;
    Ok(Mutation {
        id,
        collection: collection.parse()?,
        doc_id: doc_id.into(),
        change: Change::from_parts(operation, decode_record(payload)?)?,
        previous: decode_record(previous)?,
        timestamp,
        seq,
        status: status.parse()?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        idempotency_key,
        last_error,
    })
}

impl WalRepository for LibSqlWalRepository<'_> {
    async fn append(&self, mutation: &Mutation) -> Result<Mutation> {
        let payload = encode_record(mutation.payload())?;
        let previous = encode_record(mutation.previous.as_ref())?;

        self.conn
            .execute(
                "INSERT INTO wal (id, collection, doc_id, operation, payload, previous, timestamp, status, retry_count, idempotency_key, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                libsql::params![
                    mutation.id.as_str(),
                    mutation.collection.collection(),
                    mutation.doc_id.as_str(),
                    mutation.operation().as_str(),
                    payload,
                    previous,
                    mutation.timestamp,
                    mutation.status.as_str(),
                    i64::from(mutation.retry_count),
                    mutation.idempotency_key.as_str(),
                    mutation.last_error.clone(),
                ],
            )
            .await?;

        let mut stored = mutation.clone();
        stored.seq = self.conn.last_insert_rowid();
        Ok(stored)
    }

    async fn list_pending(&self) -> Result<Vec<Mutation>> {
        self.list_by_status(MutationStatus::Pending).await
    }

    async fn list_by_status(&self, status: MutationStatus) -> Result<Vec<Mutation>> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY timestamp ASC, seq ASC");
        self.query_mutations(&sql, [status.as_str()]).await
    }

    async fn list_pending_for_doc(
        &self,
        collection: RecordKind,
        doc_id: &RecordId,
    ) -> Result<Vec<Mutation>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = ?1 AND collection = ?2 AND doc_id = ?3 \
             ORDER BY timestamp ASC, seq ASC"
        );
        self.query_mutations(
            &sql,
            [
                MutationStatus::Pending.as_str(),
                collection.collection(),
                doc_id.as_str(),
            ],
        )
        .await
    }

    async fn get(&self, id: &MutationId) -> Result<Option<Mutation>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        Ok(self
            .query_mutations(&sql, [id.as_str()])
            .await?
            .into_iter()
            .next())
    }

    async fn mark_status(&self, id: &MutationId, status: MutationStatus) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE wal SET status = ?1 WHERE id = ?2",
                [status.as_str().to_string(), id.as_str()],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("queue entry {id}")));
        }
        Ok(())
    }

    async fn increment_retry(&self, id: &MutationId) -> Result<u32> {
        let updated = self
            .conn
            .execute(
                "UPDATE wal SET retry_count = retry_count + 1 WHERE id = ?1",
                [id.as_str()],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("queue entry {id}")));
        }

        let mut rows = self
            .conn
            .query("SELECT retry_count FROM wal WHERE id = ?1", [id.as_str()])
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => return Err(Error::NotFound(format!("queue entry {id}"))),
        };
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn record_error(&self, id: &MutationId, message: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE wal SET last_error = ?1 WHERE id = ?2",
                [message.to_string(), id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn purge_synced(&self, older_than_ms: i64, now: i64) -> Result<u64> {
        let cutoff = now.saturating_sub(older_than_ms);
        let removed = self
            .conn
            .execute(
                "DELETE FROM wal WHERE status = ?1 AND timestamp < ?2",
                libsql::params![MutationStatus::Synced.as_str(), cutoff],
            )
            .await?;
        if removed > 0 {
            tracing::debug!(removed, "Purged synced queue entries");
        }
        Ok(removed)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut rows = self
            .conn
            .query("SELECT status, COUNT(*) FROM wal GROUP BY status", ())
            .await?;
        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count = u64::try_from(row.get::<i64>(1)?).unwrap_or_default();
            match status.parse()? {
                MutationStatus::Pending => counts.pending = count,
                MutationStatus::Synced => counts.synced = count,
                MutationStatus::FailedFatal => counts.failed_fatal = count,
            }
        }
        Ok(counts)
    }
}
