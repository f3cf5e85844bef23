//! Metadata store seam and the SQLite implementation.
//!
//! Every mutation of an existing row is a conditional update keyed on the
//! row's `version`, so concurrent writers to the same transfer serialize
//! without any in-process lock, and writers to different transfers never
//! contend.

use crate::models::{
    page::PageCursor,
    transfer::{RecordUpdate, TransferRecord, TransferState},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{cmp::Ordering, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const RECORD_COLUMNS: &str = "partition_key, transfer_id, blob_key, original_name, content_type, \
     size_bytes, created_at, expires_at, download_count, max_downloads, state, version";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("transfer `{0}` not found")]
    NotFound(Uuid),
    #[error("transfer `{0}` already exists")]
    AlreadyExists(Uuid),
    #[error("transfer `{transfer_id}` changed since version {expected}")]
    VersionConflict { transfer_id: Uuid, expected: i64 },
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl MetadataError {
    /// Whether retrying the same call could succeed. Version conflicts are
    /// not retryable as-is: the caller must re-read and re-decide.
    pub fn is_retryable(&self) -> bool {
        match self {
            MetadataError::Unavailable(_) => true,
            MetadataError::Sqlx(err) => is_transient(err),
            MetadataError::NotFound(_)
            | MetadataError::AlreadyExists(_)
            | MetadataError::VersionConflict { .. } => false,
        }
    }
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Sort order for [`RecordQuery`]. Ties break on `transfer_id` in the same
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrder {
    CreatedDesc,
    ExpiresAsc,
}

/// Filtered, ordered, bounded read over transfer records.
///
/// All timestamp bounds are exclusive. An empty `states` list matches every
/// state.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub states: Vec<TransferState>,
    pub created_before: Option<DateTime<Utc>>,
    pub expires_after: Option<DateTime<Utc>>,
    pub expires_before: Option<DateTime<Utc>>,
    pub order: RecordOrder,
    /// Resume strictly after this sort position.
    pub after: Option<PageCursor>,
    pub limit: usize,
}

impl RecordQuery {
    pub fn new(order: RecordOrder, limit: usize) -> Self {
        Self {
            states: Vec::new(),
            created_before: None,
            expires_after: None,
            expires_before: None,
            order,
            after: None,
            limit,
        }
    }

    pub fn states(mut self, states: &[TransferState]) -> Self {
        self.states = states.to_vec();
        self
    }

    /// Timestamp this query orders by.
    pub fn sort_at(&self, record: &TransferRecord) -> DateTime<Utc> {
        match self.order {
            RecordOrder::CreatedDesc => record.created_at,
            RecordOrder::ExpiresAsc => record.expires_at,
        }
    }

    /// Cursor pointing at `record` for this query's order.
    pub fn cursor_for(&self, record: &TransferRecord) -> PageCursor {
        PageCursor {
            at: self.sort_at(record),
            transfer_id: record.transfer_id,
        }
    }

    /// Filter predicate, cursor included.
    pub fn matches(&self, record: &TransferRecord) -> bool {
        if !self.states.is_empty() && !self.states.contains(&record.state) {
            return false;
        }
        if self.created_before.is_some_and(|t| record.created_at >= t) {
            return false;
        }
        if self.expires_after.is_some_and(|t| record.expires_at <= t) {
            return false;
        }
        if self.expires_before.is_some_and(|t| record.expires_at >= t) {
            return false;
        }
        match &self.after {
            Some(cursor) => self.compare(record, cursor) == Ordering::Greater,
            None => true,
        }
    }

    /// Position of `record` relative to `cursor` in this query's order.
    fn compare(&self, record: &TransferRecord, cursor: &PageCursor) -> Ordering {
        let natural = (self.sort_at(record), record.transfer_id).cmp(&(cursor.at, cursor.transfer_id));
        match self.order {
            RecordOrder::CreatedDesc => natural.reverse(),
            RecordOrder::ExpiresAsc => natural,
        }
    }

    /// Ordering between two records in this query's order.
    pub fn compare_records(&self, a: &TransferRecord, b: &TransferRecord) -> Ordering {
        self.compare(a, &self.cursor_for(b))
    }
}

/// Record storage with conditional updates and ordered queries.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    async fn put_if_absent(&self, record: &TransferRecord) -> MetadataResult<()>;

    async fn get(&self, transfer_id: Uuid) -> MetadataResult<Option<TransferRecord>>;

    /// Apply `update` only if the stored version still equals
    /// `expected_version`. Returns the updated record.
    async fn conditional_update(
        &self,
        transfer_id: Uuid,
        expected_version: i64,
        update: &RecordUpdate,
    ) -> MetadataResult<TransferRecord>;

    /// Remove a record. Returns `false` if it was already gone.
    async fn delete(&self, transfer_id: Uuid) -> MetadataResult<bool>;

    async fn query(&self, query: &RecordQuery) -> MetadataResult<Vec<TransferRecord>>;

    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-backed metadata store.
///
/// Queries are answered from the `(state, created_at)` and
/// `(state, expires_at)` indexes, so ordering and limits never require
/// loading the table.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn put_if_absent(&self, record: &TransferRecord) -> MetadataResult<()> {
        let result = sqlx::query(
            "INSERT INTO transfers (
                partition_key, transfer_id, blob_key, original_name, content_type,
                size_bytes, created_at, expires_at, download_count, max_downloads,
                state, version
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.partition_key)
        .bind(record.transfer_id)
        .bind(&record.blob_key)
        .bind(&record.original_name)
        .bind(&record.content_type)
        .bind(record.size_bytes)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.download_count)
        .bind(record.max_downloads)
        .bind(record.state)
        .bind(record.version)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(MetadataError::AlreadyExists(record.transfer_id))
            }
            Err(err) => Err(MetadataError::Sqlx(err)),
        }
    }

    async fn get(&self, transfer_id: Uuid) -> MetadataResult<Option<TransferRecord>> {
        let record = sqlx::query_as::<_, TransferRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM transfers WHERE transfer_id = ?"
        ))
        .bind(transfer_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    async fn conditional_update(
        &self,
        transfer_id: Uuid,
        expected_version: i64,
        update: &RecordUpdate,
    ) -> MetadataResult<TransferRecord> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("UPDATE transfers SET version = version + 1");
        if let Some(state) = update.state {
            builder.push(", state = ");
            builder.push_bind(state);
        }
        if let Some(size) = update.size_bytes {
            builder.push(", size_bytes = ");
            builder.push_bind(size);
        }
        if let Some(count) = update.download_count {
            builder.push(", download_count = ");
            builder.push_bind(count);
        }
        builder.push(" WHERE transfer_id = ");
        builder.push_bind(transfer_id);
        builder.push(" AND version = ");
        builder.push_bind(expected_version);
        builder.push(" RETURNING ");
        builder.push(RECORD_COLUMNS);

        let updated: Option<TransferRecord> = builder
            .build_query_as()
            .fetch_optional(&*self.db)
            .await?;

        match updated {
            Some(record) => Ok(record),
            None => match self.get(transfer_id).await? {
                Some(_) => Err(MetadataError::VersionConflict {
                    transfer_id,
                    expected: expected_version,
                }),
                None => Err(MetadataError::NotFound(transfer_id)),
            },
        }
    }

    async fn delete(&self, transfer_id: Uuid) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM transfers WHERE transfer_id = ?")
            .bind(transfer_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, query: &RecordQuery) -> MetadataResult<Vec<TransferRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RECORD_COLUMNS} FROM transfers WHERE 1 = 1"
        ));

        if !query.states.is_empty() {
            builder.push(" AND state IN (");
            let mut separated = builder.separated(", ");
            for state in &query.states {
                separated.push_bind(*state);
            }
            separated.push_unseparated(")");
        }
        if let Some(t) = query.created_before {
            builder.push(" AND created_at < ");
            builder.push_bind(t);
        }
        if let Some(t) = query.expires_after {
            builder.push(" AND expires_at > ");
            builder.push_bind(t);
        }
        if let Some(t) = query.expires_before {
            builder.push(" AND expires_at < ");
            builder.push_bind(t);
        }

        let (column, cmp, direction) = match query.order {
            RecordOrder::CreatedDesc => ("created_at", "<", "DESC"),
            RecordOrder::ExpiresAsc => ("expires_at", ">", "ASC"),
        };
        if let Some(cursor) = &query.after {
            builder.push(format!(" AND ({column} {cmp} "));
            builder.push_bind(cursor.at);
            builder.push(format!(" OR ({column} = "));
            builder.push_bind(cursor.at);
            builder.push(format!(" AND transfer_id {cmp} "));
            builder.push_bind(cursor.transfer_id);
            builder.push("))");
        }

        builder.push(format!(
            " ORDER BY {column} {direction}, transfer_id {direction} LIMIT "
        ));
        builder.push_bind(query.limit as i64);

        let rows = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    async fn health_check(&self) -> MetadataResult<()> {
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?
        {
            1 => Ok(()),
            other => Err(MetadataError::Unavailable(format!(
                "unexpected result: {}",
                other
            ))),
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Connection-level failures and lock contention are worth retrying.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}
