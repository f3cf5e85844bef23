//! Error taxonomy of the transfer lifecycle.

use crate::backends::{metadata_store::MetadataError, object_store::ObjectStoreError};
use thiserror::Error;
use uuid::Uuid;

/// Input rejected before any state changes. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("ttl of {requested}h is outside the allowed range {min}h..={max}h")]
    TtlOutOfRange { requested: i64, min: i64, max: i64 },
    #[error("file type `{0}` not allowed")]
    DisallowedExtension(String),
    #[error("content type `{0}` not allowed")]
    DisallowedContentType(String),
    #[error("file name must not be empty")]
    EmptyFileName,
    #[error("max_downloads must be at least 1, got {0}")]
    InvalidMaxDownloads(i64),
    #[error("file exceeds the {limit_bytes} byte upload limit")]
    FileTooLarge { limit_bytes: u64 },
    #[error("upload body ended early: {0}")]
    IncompleteBody(String),
    #[error("blob key does not belong to this transfer")]
    BlobKeyMismatch,
    #[error("transfer already committed with a different size")]
    AlreadyCommitted,
    #[error(
        "window must be between 1 and {max} hours, got {0}",
        max = crate::services::query::MAX_EXPIRING_WINDOW_HOURS
    )]
    InvalidWindow(i64),
    #[error("invalid pagination cursor")]
    InvalidCursor,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("transfer `{0}` not found")]
    NotFound(Uuid),
    /// Distinct from `NotFound` so clients can say "link expired".
    #[error("transfer `{0}` has expired")]
    Gone(Uuid),
    #[error("transfer `{0}` reached its download limit")]
    LimitExceeded(Uuid),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

pub type TransferResult<T> = Result<T, TransferError>;

impl From<MetadataError> for TransferError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(id) => TransferError::NotFound(id),
            other => TransferError::BackendUnavailable(other.to_string()),
        }
    }
}

impl From<ObjectStoreError> for TransferError {
    fn from(err: ObjectStoreError) -> Self {
        TransferError::BackendUnavailable(err.to_string())
    }
}
