//! Represents a transfer: one uploaded file and its lifecycle state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of a transfer.
///
/// The only legal moves are `Pending -> Active -> Expired -> Deleted`.
/// `Deleted` is terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TransferState {
    /// Blob upload started, not yet committed.
    Pending,
    /// Committed and downloadable.
    Active,
    /// Past `expires_at`, purged, or picked up by the reaper. The blob may still exist.
    Expired,
    /// Blob removed. The row is kept as a tombstone until retention runs out.
    Deleted,
}

impl TransferState {
    /// Whether `self -> next` is a single forward step of the lifecycle.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        matches!(
            (self, next),
            (TransferState::Pending, TransferState::Active)
                | (TransferState::Active, TransferState::Expired)
                | (TransferState::Expired, TransferState::Deleted)
        )
    }
}

/// Metadata row describing a single transfer.
///
/// The file bytes live in the object store under `blob_key`; this struct
/// never carries them. Rows are laid out by creation date (`partition_key`,
/// `YYYY-MM-DD`) with `transfer_id` as the sort key.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct TransferRecord {
    /// Creation date in UTC, `YYYY-MM-DD`.
    pub partition_key: String,

    /// External reference used in download links.
    pub transfer_id: Uuid,

    /// Key of the payload in the object store.
    pub blob_key: String,

    /// File name as supplied by the uploader.
    pub original_name: String,

    /// MIME type as supplied by the uploader.
    pub content_type: Option<String>,

    /// Payload size; zero until the upload is committed.
    pub size_bytes: i64,

    pub created_at: DateTime<Utc>,

    /// Fixed at creation, never extended.
    pub expires_at: DateTime<Utc>,

    pub download_count: i64,

    /// Download cap; `None` means unlimited.
    pub max_downloads: Option<i64>,

    pub state: TransferState,

    /// Optimistic concurrency token, bumped by every mutation.
    #[serde(skip_serializing, default)]
    pub version: i64,
}

impl TransferRecord {
    /// Build a fresh `Pending` record created at `now`.
    pub fn new_pending(
        transfer_id: Uuid,
        blob_key: String,
        original_name: String,
        content_type: Option<String>,
        now: DateTime<Utc>,
        ttl: Duration,
        max_downloads: Option<i64>,
    ) -> Self {
        Self {
            partition_key: partition_for(now),
            transfer_id,
            blob_key,
            original_name,
            content_type,
            size_bytes: 0,
            created_at: now,
            expires_at: now + ttl,
            download_count: 0,
            max_downloads,
            state: TransferState::Pending,
            version: 0,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when a download cap is set and already reached.
    pub fn limit_reached(&self) -> bool {
        self.max_downloads
            .is_some_and(|max| self.download_count >= max)
    }

    pub fn downloads_remaining(&self) -> Option<i64> {
        self.max_downloads
            .map(|max| (max - self.download_count).max(0))
    }
}

/// Partition key for a record created at `at`.
pub fn partition_for(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Field changes applied by a conditional update. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub state: Option<TransferState>,
    pub size_bytes: Option<i64>,
    pub download_count: Option<i64>,
}

impl RecordUpdate {
    pub fn state(state: TransferState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Apply the changes and bump the version.
    pub fn apply(&self, record: &mut TransferRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(size) = self.size_bytes {
            record.size_bytes = size;
        }
        if let Some(count) = self.download_count {
            record.download_count = count;
        }
        record.version += 1;
    }
}
