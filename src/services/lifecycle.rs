//! LifecycleManager: the only writer of transfer state transitions.
//!
//! Uploads follow write-object-then-commit-metadata: a record is created
//! `Pending`, the caller streams bytes into the object store, and only then
//! is the record flipped to `Active`. An `Active` record therefore always has
//! a backing object, while a crash between the two steps leaves a `Pending`
//! orphan that the reaper reclaims after `pending_timeout`.
//!
//! Every transition is a conditional update on the record version. Losing a
//! race means re-reading the record and deciding again; nothing holds a lock
//! across a store call.

use crate::{
    backends::{
        metadata_store::{MetadataError, MetadataStore},
        object_store::{ObjectStore, ObjectStoreError},
    },
    clock::Clock,
    models::transfer::{RecordUpdate, TransferRecord, TransferState},
    services::{
        error::{TransferError, TransferResult, ValidationError},
        policy::{UploadPolicy, file_extension},
        retry::RetryPolicy,
    },
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Limits and timeouts enforced by the lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub min_ttl_hours: i64,
    pub max_ttl_hours: i64,
    /// Age after which an uncommitted upload is an orphan.
    pub pending_timeout: Duration,
    /// How many times a lost version race is re-evaluated before giving up.
    pub conflict_retry_limit: u32,
    pub retry: RetryPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_ttl_hours: 1,
            max_ttl_hours: 168,
            pending_timeout: Duration::hours(1),
            conflict_retry_limit: 32,
            retry: RetryPolicy::default(),
        }
    }
}

/// Handle returned by [`LifecycleManager::begin_upload`]: where to write the
/// bytes and what to commit afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpload {
    pub transfer_id: Uuid,
    pub blob_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of one reclamation step run on behalf of the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaimed {
    Done,
    /// Someone else changed the record first, or it no longer qualifies.
    Skipped,
}

#[derive(Clone)]
pub struct LifecycleManager {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    policy: Arc<dyn UploadPolicy>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        policy: Arc<dyn UploadPolicy>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            metadata,
            objects,
            policy,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Name and upload-policy checks, usable before any bytes are accepted.
    pub fn check_upload(
        &self,
        file_name: &str,
        content_type: Option<&str>,
    ) -> Result<(), ValidationError> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(ValidationError::EmptyFileName);
        }
        self.policy.check(file_name, content_type)
    }

    /// Validate the request and persist a `Pending` record.
    ///
    /// Nothing touches the object store here; a rejected upload never
    /// reaches it.
    pub async fn begin_upload(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        ttl_hours: i64,
        max_downloads: Option<i64>,
    ) -> TransferResult<PendingUpload> {
        let file_name = file_name.trim();
        self.check_upload(file_name, content_type)?;
        if ttl_hours < self.config.min_ttl_hours || ttl_hours > self.config.max_ttl_hours {
            return Err(ValidationError::TtlOutOfRange {
                requested: ttl_hours,
                min: self.config.min_ttl_hours,
                max: self.config.max_ttl_hours,
            }
            .into());
        }
        if let Some(max) = max_downloads {
            if max < 1 {
                return Err(ValidationError::InvalidMaxDownloads(max).into());
            }
        }

        let transfer_id = Uuid::new_v4();
        let blob_key = match file_extension(file_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let record = TransferRecord::new_pending(
            transfer_id,
            blob_key,
            file_name.to_string(),
            content_type.map(str::to_string),
            self.clock.now(),
            Duration::hours(ttl_hours),
            max_downloads,
        );

        let inserted = self
            .config
            .retry
            .run("put_if_absent", || self.metadata.put_if_absent(&record))
            .await;
        match inserted {
            Ok(()) => {}
            // a retried insert whose first attempt did land
            Err(MetadataError::AlreadyExists(_)) => match self.load(transfer_id).await? {
                Some(existing) if existing.blob_key == record.blob_key => {}
                _ => {
                    return Err(TransferError::BackendUnavailable(format!(
                        "transfer id {transfer_id} collided"
                    )));
                }
            },
            Err(err) => return Err(err.into()),
        }

        info!(
            %transfer_id,
            blob_key = %record.blob_key,
            ttl_hours,
            max_downloads = ?max_downloads,
            "upload started"
        );
        Ok(PendingUpload {
            transfer_id,
            blob_key: record.blob_key,
            created_at: record.created_at,
            expires_at: record.expires_at,
        })
    }

    /// Flip a `Pending` record to `Active` once its object is in place.
    ///
    /// Must only be called after the object write under `blob_key` has
    /// completed. Repeating a successful commit returns the active record.
    pub async fn commit(
        &self,
        transfer_id: Uuid,
        blob_key: &str,
        actual_size: u64,
    ) -> TransferResult<TransferRecord> {
        let size = i64::try_from(actual_size).map_err(|_| ValidationError::InvalidField {
            field: "size",
            reason: "too large".into(),
        })?;

        for _ in 0..self.config.conflict_retry_limit {
            let record = self.require(transfer_id).await?;
            if record.blob_key != blob_key {
                return Err(ValidationError::BlobKeyMismatch.into());
            }
            match record.state {
                TransferState::Active if record.size_bytes == size => return Ok(record),
                TransferState::Active => return Err(ValidationError::AlreadyCommitted.into()),
                TransferState::Pending => {}
                TransferState::Expired | TransferState::Deleted => {
                    return Err(TransferError::Gone(transfer_id));
                }
            }

            // past the orphan fence the reaper may already be deleting the blob
            let now = self.clock.now();
            if record.is_expired_at(now) || now >= record.created_at + self.config.pending_timeout {
                return Err(TransferError::Gone(transfer_id));
            }

            let update = RecordUpdate {
                state: Some(TransferState::Active),
                size_bytes: Some(size),
                download_count: None,
            };
            if let Some(active) = self.transition(&record, &update).await? {
                info!(%transfer_id, size_bytes = size, "upload committed");
                return Ok(active);
            }
        }
        Err(self.contention(transfer_id, "commit"))
    }

    /// Check that `transfer_id` may be downloaded and count the download.
    ///
    /// The counter is incremented before the caller serves any bytes, so a
    /// crash while serving can only over-count, never hand out extra
    /// downloads. The returned record carries the `blob_key` to serve.
    pub async fn resolve_download(&self, transfer_id: Uuid) -> TransferResult<TransferRecord> {
        for _ in 0..self.config.conflict_retry_limit {
            let record = self.require(transfer_id).await?;
            let now = self.clock.now();

            if record.state == TransferState::Active && record.is_expired_at(now) {
                self.mark_expired_lazily(&record).await;
                return Err(TransferError::Gone(transfer_id));
            }
            if record.state != TransferState::Active {
                return Err(TransferError::Gone(transfer_id));
            }
            if record.limit_reached() {
                return Err(TransferError::LimitExceeded(transfer_id));
            }

            let update = RecordUpdate {
                download_count: Some(record.download_count + 1),
                ..RecordUpdate::default()
            };
            // If a retried update already landed, the retry sees a conflict and
            // the download is counted again on the next pass. Over-counting is
            // the accepted failure mode here; under-counting is not.
            if let Some(counted) = self.transition(&record, &update).await? {
                debug!(
                    %transfer_id,
                    download_count = counted.download_count,
                    remaining = ?counted.downloads_remaining(),
                    "download resolved"
                );
                return Ok(counted);
            }
        }
        Err(self.contention(transfer_id, "resolve_download"))
    }

    /// Remove a transfer: object first, then the record. Missing pieces are
    /// not an error, so purging twice is fine.
    pub async fn purge(&self, transfer_id: Uuid) -> TransferResult<()> {
        for _ in 0..self.config.conflict_retry_limit {
            let Some(record) = self.load(transfer_id).await? else {
                debug!(%transfer_id, "purge: already gone");
                return Ok(());
            };

            // stop new downloads / commits before the object goes away
            let fenced = match record.state {
                TransferState::Active => {
                    self.transition(&record, &RecordUpdate::state(TransferState::Expired))
                        .await?
                }
                TransferState::Pending => self.transition(&record, &RecordUpdate::default()).await?,
                TransferState::Expired | TransferState::Deleted => Some(record),
            };
            let Some(record) = fenced else {
                continue;
            };

            self.delete_object(&record.blob_key).await?;
            self.delete_record(transfer_id).await?;
            info!(%transfer_id, "transfer purged");
            return Ok(());
        }
        Err(self.contention(transfer_id, "purge"))
    }

    pub async fn get(&self, transfer_id: Uuid) -> TransferResult<TransferRecord> {
        self.require(transfer_id).await
    }

    /// Retire an expired transfer: `Active -> Expired`, delete the object,
    /// `Expired -> Deleted`. A failed object delete leaves the record
    /// `Expired` so the next sweep picks it up again.
    pub async fn retire(&self, record: &TransferRecord) -> TransferResult<Reclaimed> {
        let now = self.clock.now();
        let expired = match record.state {
            TransferState::Active if record.is_expired_at(now) => {
                match self
                    .transition(record, &RecordUpdate::state(TransferState::Expired))
                    .await?
                {
                    Some(expired) => expired,
                    None => return Ok(Reclaimed::Skipped),
                }
            }
            TransferState::Expired => record.clone(),
            _ => return Ok(Reclaimed::Skipped),
        };

        self.delete_object(&expired.blob_key).await?;

        match self
            .transition(&expired, &RecordUpdate::state(TransferState::Deleted))
            .await?
        {
            Some(_) => {
                info!(transfer_id = %expired.transfer_id, "expired transfer reclaimed");
                Ok(Reclaimed::Done)
            }
            None => Ok(Reclaimed::Skipped),
        }
    }

    /// Reclaim an upload that was never committed.
    ///
    /// The version bump fences off a commit racing with the reclaim: such a
    /// commit loses its CAS, re-reads, and then finds itself past the
    /// orphan fence.
    pub async fn reclaim_orphan(&self, record: &TransferRecord) -> TransferResult<Reclaimed> {
        let now = self.clock.now();
        if record.state != TransferState::Pending
            || now < record.created_at + self.config.pending_timeout
        {
            return Ok(Reclaimed::Skipped);
        }
        let Some(claimed) = self.transition(record, &RecordUpdate::default()).await? else {
            return Ok(Reclaimed::Skipped);
        };

        self.delete_object(&claimed.blob_key).await?;
        self.delete_record(claimed.transfer_id).await?;
        info!(
            transfer_id = %claimed.transfer_id,
            blob_key = %claimed.blob_key,
            "orphaned upload reclaimed"
        );
        Ok(Reclaimed::Done)
    }

    /// Drop a `Deleted` tombstone.
    pub async fn drop_tombstone(&self, record: &TransferRecord) -> TransferResult<Reclaimed> {
        if record.state != TransferState::Deleted {
            return Ok(Reclaimed::Skipped);
        }
        if self.delete_record(record.transfer_id).await? {
            debug!(transfer_id = %record.transfer_id, "tombstone removed");
            Ok(Reclaimed::Done)
        } else {
            Ok(Reclaimed::Skipped)
        }
    }

    /// Best-effort `Active -> Expired` noticed during a download.
    async fn mark_expired_lazily(&self, record: &TransferRecord) {
        match self
            .transition(record, &RecordUpdate::state(TransferState::Expired))
            .await
        {
            Ok(Some(_)) => info!(transfer_id = %record.transfer_id, "transfer expired"),
            Ok(None) => {}
            Err(err) => warn!(
                transfer_id = %record.transfer_id,
                error = %err,
                "could not mark transfer expired; reaper will retry"
            ),
        }
    }

    /// Conditionally apply `update` to `record`.
    ///
    /// `Ok(None)` means the record changed underneath us (or vanished) and
    /// the caller should re-read.
    async fn transition(
        &self,
        record: &TransferRecord,
        update: &RecordUpdate,
    ) -> TransferResult<Option<TransferRecord>> {
        if let Some(next) = update.state {
            debug_assert!(
                record.state.can_transition_to(next),
                "illegal transition {:?} -> {:?}",
                record.state,
                next
            );
        }
        let result = self
            .config
            .retry
            .run("conditional_update", || {
                self.metadata
                    .conditional_update(record.transfer_id, record.version, update)
            })
            .await;
        match result {
            Ok(updated) => Ok(Some(updated)),
            Err(MetadataError::VersionConflict { .. }) | Err(MetadataError::NotFound(_)) => {
                debug!(
                    transfer_id = %record.transfer_id,
                    version = record.version,
                    "lost update race"
                );
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn load(&self, transfer_id: Uuid) -> TransferResult<Option<TransferRecord>> {
        Ok(self
            .config
            .retry
            .run("get", || self.metadata.get(transfer_id))
            .await?)
    }

    async fn require(&self, transfer_id: Uuid) -> TransferResult<TransferRecord> {
        self.load(transfer_id)
            .await?
            .ok_or(TransferError::NotFound(transfer_id))
    }

    /// Delete an object, treating "already gone" as success.
    async fn delete_object(&self, blob_key: &str) -> TransferResult<()> {
        let result = self
            .config
            .retry
            .run("delete_object", || self.objects.delete(blob_key))
            .await;
        match result {
            Ok(_) | Err(ObjectStoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_record(&self, transfer_id: Uuid) -> TransferResult<bool> {
        Ok(self
            .config
            .retry
            .run("delete_record", || self.metadata.delete(transfer_id))
            .await?)
    }

    fn contention(&self, transfer_id: Uuid, op: &str) -> TransferError {
        warn!(%transfer_id, op, "gave up after repeated update conflicts");
        TransferError::BackendUnavailable(format!(
            "too much contention on transfer {transfer_id}"
        ))
    }
}
