//! The relay's exposed API: upload, download, listings, purge and health.
//!
//! `RelayService` is the state shared by every HTTP handler. It sequences
//! the object store around the lifecycle manager and owns the upload size
//! limit.

use crate::{
    backends::{
        metadata_store::MetadataStore,
        object_store::{BodyStream, ByteStream, ObjectStore, ObjectStoreError},
    },
    models::{page::Page, transfer::TransferRecord},
    services::{
        error::{TransferError, TransferResult, ValidationError},
        lifecycle::{LifecycleManager, PendingUpload},
        query::QueryService,
    },
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the uploader told us about the file.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub content_type: Option<String>,
    pub ttl_hours: i64,
    pub max_downloads: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadReceipt {
    pub transfer_id: Uuid,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
    pub file_name: String,
    pub file_size: i64,
    pub max_downloads: Option<i64>,
}

/// An upload body spooled to a local temp file while the rest of the form
/// arrives. The file is removed when this is dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    pub file_name: String,
    pub content_type: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub metadata: bool,
    pub objects: bool,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.metadata && self.objects
    }
}

#[derive(Clone)]
pub struct RelayService {
    lifecycle: Arc<LifecycleManager>,
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    query: QueryService,
    public_base_url: Option<String>,
    max_file_size: u64,
    staging_dir: Option<PathBuf>,
}

impl RelayService {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        query: QueryService,
        public_base_url: Option<String>,
        max_file_size: u64,
    ) -> Self {
        Self {
            lifecycle,
            metadata,
            objects,
            query,
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
            max_file_size,
            staging_dir: None,
        }
    }

    /// Spool staged uploads under `dir` instead of the system temp dir.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Check the name and copy the body to a temp file, enforcing the size
    /// limit. No record or object is created.
    pub async fn stage_upload(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        mut body: BodyStream<'_>,
    ) -> TransferResult<StagedFile> {
        self.lifecycle.check_upload(file_name, content_type)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("upload-");
        let temp = match &self.staging_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(staging_error)?;
        let (file, path) = temp.into_parts();
        let mut out = tokio::fs::File::from_std(file);

        let mut size: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| ValidationError::IncompleteBody(err.to_string()))?;
            size += chunk.len() as u64;
            if size > self.max_file_size {
                return Err(ValidationError::FileTooLarge {
                    limit_bytes: self.max_file_size,
                }
                .into());
            }
            out.write_all(&chunk).await.map_err(staging_error)?;
        }
        out.flush().await.map_err(staging_error)?;

        debug!(file_name, size, "upload staged");
        Ok(StagedFile {
            path,
            file_name: file_name.to_string(),
            content_type: content_type.map(str::to_string),
            size,
        })
    }

    /// Run [`upload`](Self::upload) over a staged body.
    pub async fn upload_staged(
        &self,
        staged: StagedFile,
        ttl_hours: i64,
        max_downloads: Option<i64>,
    ) -> TransferResult<UploadReceipt> {
        let file = tokio::fs::File::open(&staged.path)
            .await
            .map_err(staging_error)?;
        let request = UploadRequest {
            file_name: staged.file_name.clone(),
            content_type: staged.content_type.clone(),
            ttl_hours,
            max_downloads,
        };
        self.upload(request, ReaderStream::new(file).boxed()).await
    }

    /// Begin, stream the body into the object store, commit.
    ///
    /// If the body cannot be stored the pending record is purged on a
    /// best-effort basis. If the commit fails the object stays behind with
    /// a `Pending` record, which the reaper reclaims.
    pub async fn upload(
        &self,
        request: UploadRequest,
        body: BodyStream<'_>,
    ) -> TransferResult<UploadReceipt> {
        let pending = self
            .lifecycle
            .begin_upload(
                &request.file_name,
                request.content_type.as_deref(),
                request.ttl_hours,
                request.max_downloads,
            )
            .await?;

        let too_large = AtomicBool::new(false);
        let body = limit_body(body, self.max_file_size, &too_large);
        let written = match self.objects.put(&pending.blob_key, body).await {
            Ok(written) => written,
            Err(err) => {
                let cause = if too_large.load(Ordering::SeqCst) {
                    ValidationError::FileTooLarge {
                        limit_bytes: self.max_file_size,
                    }
                    .into()
                } else if let ObjectStoreError::Body(io_err) = &err {
                    ValidationError::IncompleteBody(io_err.to_string()).into()
                } else {
                    TransferError::from(err)
                };
                warn!(
                    transfer_id = %pending.transfer_id,
                    error = %cause,
                    "upload body not stored"
                );
                self.abandon(&pending).await;
                return Err(cause);
            }
        };

        let record = match self
            .lifecycle
            .commit(pending.transfer_id, &pending.blob_key, written)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                // purged or timed out while we were streaming
                if matches!(err, TransferError::NotFound(_) | TransferError::Gone(_)) {
                    if let Err(del_err) = self.objects.delete(&pending.blob_key).await {
                        warn!(blob_key = %pending.blob_key, error = %del_err, "failed to drop uncommitted object");
                    }
                } else {
                    error!(
                        transfer_id = %pending.transfer_id,
                        error = %err,
                        "commit failed; leaving upload for the reaper"
                    );
                }
                return Err(err);
            }
        };

        info!(
            transfer_id = %record.transfer_id,
            file_name = %record.original_name,
            size_bytes = record.size_bytes,
            expires_at = %record.expires_at,
            "file uploaded"
        );
        Ok(UploadReceipt {
            transfer_id: record.transfer_id,
            download_url: self.download_url(record.transfer_id),
            expires_at: record.expires_at,
            file_name: record.original_name,
            file_size: record.size_bytes,
            max_downloads: record.max_downloads,
        })
    }

    /// Count a download and open its payload.
    pub async fn download(&self, transfer_id: Uuid) -> TransferResult<(TransferRecord, ByteStream)> {
        let record = self.lifecycle.resolve_download(transfer_id).await?;
        let retry = &self.lifecycle.config().retry;
        match retry.run("get_object", || self.objects.get(&record.blob_key)).await {
            Ok(stream) => Ok((record, stream)),
            Err(ObjectStoreError::NotFound(_)) => {
                // reaped between resolve and get
                warn!(%transfer_id, blob_key = %record.blob_key, "object missing for active transfer");
                Err(TransferError::Gone(transfer_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, transfer_id: Uuid) -> TransferResult<TransferRecord> {
        self.lifecycle.get(transfer_id).await
    }

    pub async fn purge(&self, transfer_id: Uuid) -> TransferResult<()> {
        self.lifecycle.purge(transfer_id).await
    }

    pub async fn recent(
        &self,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> TransferResult<Page<TransferRecord>> {
        self.query.recent_uploads(limit, cursor).await
    }

    pub async fn expiring_soon(
        &self,
        limit: Option<usize>,
        within_hours: Option<i64>,
        cursor: Option<&str>,
    ) -> TransferResult<Page<TransferRecord>> {
        self.query.expiring_soon(limit, within_hours, cursor).await
    }

    pub async fn health(&self) -> HealthReport {
        let metadata = match self.metadata.health_check().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "metadata store health check failed");
                false
            }
        };
        let objects = match self.objects.health_check().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "object store health check failed");
                false
            }
        };
        HealthReport { metadata, objects }
    }

    pub fn download_url(&self, transfer_id: Uuid) -> String {
        match &self.public_base_url {
            Some(base) => format!("{base}/api/download/{transfer_id}"),
            None => format!("/api/download/{transfer_id}"),
        }
    }

    async fn abandon(&self, pending: &PendingUpload) {
        if let Err(err) = self.lifecycle.purge(pending.transfer_id).await {
            warn!(
                transfer_id = %pending.transfer_id,
                error = %err,
                "could not clean up failed upload; reaper will reclaim it"
            );
        }
    }
}

fn staging_error(err: io::Error) -> TransferError {
    TransferError::BackendUnavailable(format!("staging upload: {err}"))
}

/// Fail the stream once more than `limit` bytes have passed through it.
fn limit_body<'a>(body: BodyStream<'a>, limit: u64, tripped: &'a AtomicBool) -> BodyStream<'a> {
    let mut seen: u64 = 0;
    body.map(move |chunk| {
        let chunk = chunk?;
        seen += chunk.len() as u64;
        if seen > limit {
            tripped.store(true, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("upload exceeds {limit} bytes"),
            ));
        }
        Ok(chunk)
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::transfer::TransferState, testing::Harness};
    use bytes::Bytes;
    use futures::{TryStreamExt, stream};

    fn body(parts: &[&'static str]) -> BodyStream<'static> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    fn request(name: &str, ttl_hours: i64, max_downloads: Option<i64>) -> UploadRequest {
        UploadRequest {
            file_name: name.into(),
            content_type: Some("application/pdf".into()),
            ttl_hours,
            max_downloads,
        }
    }

    async fn read_all(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn upload_then_download_until_limit() {
        let h = Harness::new();
        let receipt = h
            .relay
            .upload(request("report.pdf", 1, Some(2)), body(&["%PDF-", "1.7"]))
            .await
            .unwrap();
        assert_eq!(receipt.file_size, 8);
        assert_eq!(receipt.file_name, "report.pdf");
        assert_eq!(
            receipt.download_url,
            format!("https://relay.test/api/download/{}", receipt.transfer_id)
        );

        for _ in 0..2 {
            let (record, stream) = h.relay.download(receipt.transfer_id).await.unwrap();
            assert_eq!(record.original_name, "report.pdf");
            assert_eq!(read_all(stream).await, b"%PDF-1.7");
        }
        assert!(matches!(
            h.relay.download(receipt.transfer_id).await,
            Err(TransferError::LimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn executable_never_reaches_object_store() {
        let h = Harness::new();
        let err = h
            .relay
            .upload(request("virus.exe", 1, None), body(&["MZ"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Validation(ValidationError::DisallowedExtension(_))
        ));
        assert_eq!(h.objects.put_calls(), 0);
        assert!(h.metadata.is_empty());
    }

    #[tokio::test]
    async fn staging_checks_name_and_size_before_any_write() {
        let h = Harness::with_max_file_size(4);
        let err = h
            .relay
            .stage_upload("virus.exe", None, body(&["MZ"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Validation(ValidationError::DisallowedExtension(_))
        ));
        let err = h
            .relay
            .stage_upload("big.pdf", None, body(&["abc", "def"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Validation(ValidationError::FileTooLarge { limit_bytes: 4 })
        ));
        assert_eq!(h.objects.put_calls(), 0);
        assert!(h.metadata.is_empty());

        let staged = h
            .relay
            .stage_upload("tiny.pdf", Some("application/pdf"), body(&["ab", "cd"]))
            .await
            .unwrap();
        assert_eq!(staged.size, 4);
        let spool = staged.path.to_path_buf();
        assert!(spool.exists());

        let receipt = h.relay.upload_staged(staged, 3, Some(1)).await.unwrap();
        assert!(!spool.exists());
        assert_eq!(receipt.file_size, 4);
        let (record, stream) = h.relay.download(receipt.transfer_id).await.unwrap();
        assert_eq!(record.expires_at - record.created_at, chrono::Duration::hours(3));
        assert_eq!(read_all(stream).await, b"abcd");
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_and_cleaned_up() {
        let h = Harness::with_max_file_size(4);
        let err = h
            .relay
            .upload(request("big.pdf", 1, None), body(&["abc", "def"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Validation(ValidationError::FileTooLarge { limit_bytes: 4 })
        ));
        assert!(h.objects.is_empty());
        assert!(h.metadata.is_empty());
    }

    #[tokio::test]
    async fn broken_body_is_incomplete_upload() {
        let h = Harness::new();
        let failing: BodyStream<'static> = stream::iter(vec![
            Ok(Bytes::from_static(b"part")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client gone")),
        ])
        .boxed();
        let err = h
            .relay
            .upload(request("doc.pdf", 1, None), failing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Validation(ValidationError::IncompleteBody(_))
        ));
        assert!(h.metadata.is_empty());
    }

    #[tokio::test]
    async fn object_store_outage_surfaces_as_unavailable() {
        let h = Harness::new();
        h.objects.fail_puts(true);
        let err = h
            .relay
            .upload(request("doc.pdf", 1, None), body(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::BackendUnavailable(_)));
        assert!(h.metadata.is_empty());
    }

    #[tokio::test]
    async fn failed_commit_leaves_orphan_for_reaper() {
        let h = Harness::new();
        h.metadata.fail_updates(true);
        let err = h
            .relay
            .upload(request("doc.pdf", 1, None), body(&["payload"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::BackendUnavailable(_)));
        assert_eq!(h.objects.len(), 1);
        assert_eq!(h.metadata.len(), 1);

        h.metadata.fail_updates(false);
        h.clock.advance(chrono::Duration::hours(2));
        let report = h.reaper().sweep().await;
        assert_eq!(report.orphans_reclaimed, 1);
        assert!(h.objects.is_empty());
        assert!(h.metadata.is_empty());
    }

    #[tokio::test]
    async fn download_of_reaped_object_is_gone() {
        let h = Harness::new();
        let rec = h.active("report.pdf", 1, None).await;
        h.objects.delete(&rec.blob_key).await.unwrap();
        assert!(matches!(
            h.relay.download(rec.transfer_id).await,
            Err(TransferError::Gone(_))
        ));
    }

    #[tokio::test]
    async fn purge_through_relay_and_health() {
        let h = Harness::new();
        let rec = h.active("report.pdf", 1, None).await;
        assert_eq!(h.relay.get(rec.transfer_id).await.unwrap().state, TransferState::Active);
        h.relay.purge(rec.transfer_id).await.unwrap();
        h.relay.purge(rec.transfer_id).await.unwrap();
        assert!(matches!(
            h.relay.get(rec.transfer_id).await,
            Err(TransferError::NotFound(_))
        ));

        assert!(h.relay.health().await.is_ready());
        h.metadata.fail_next(1);
        let report = h.relay.health().await;
        assert!(!report.metadata);
        assert!(report.objects);
    }
}
