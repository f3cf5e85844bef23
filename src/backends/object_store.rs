//! Object store seam and the local-disk implementation.
//!
//! Payloads are immutable blobs addressed by key. `FsObjectStore` shards them
//! beneath `base_path/{shard}/{shard}/{key}` so no single directory grows
//! unbounded.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, pin_mut, stream::BoxStream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

/// Streamed upload body; may borrow from the request it is read from.
pub type BodyStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Owned payload stream handed back by `get`.
pub type ByteStream = BodyStream<'static>;

const MAX_BLOB_KEY_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    /// The body stream itself failed; the store is fine.
    #[error("upload stream aborted: {0}")]
    Body(io::Error),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ObjectStoreError {
    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ObjectStoreError::Unavailable(_) | ObjectStoreError::Io(_))
    }
}

pub type ObjectResult<T> = Result<T, ObjectStoreError>;

/// Blob put/get/delete, addressed by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key`, replacing nothing: keys are fresh per upload.
    /// Returns the number of bytes written. A failed put leaves no object.
    async fn put(&self, key: &str, body: BodyStream<'_>) -> ObjectResult<u64>;

    /// Open the payload stored under `key`.
    async fn get(&self, key: &str) -> ObjectResult<ByteStream>;

    /// Remove `key`. Returns `false` if it was already gone.
    async fn delete(&self, key: &str) -> ObjectResult<bool>;

    /// Cheap probe used by readiness checks.
    async fn health_check(&self) -> ObjectResult<()>;
}

/// Reject keys that could escape the storage root.
pub(crate) fn ensure_key_safe(key: &str) -> ObjectResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_BLOB_KEY_LEN
        || key.starts_with('.')
        || key.contains("..")
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\');
    if invalid {
        return Err(ObjectStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Disk-backed object store.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    base_path: PathBuf,
}

impl FsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Two-level shard directories from MD5(key), as lowercase hex bytes.
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Remove empty shard directories up to (not including) the base path.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    /// Stream to a temp file, fsync, then rename into place.
    async fn put(&self, key: &str, body: BodyStream<'_>) -> ObjectResult<u64> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        pin_mut!(body);
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ObjectStoreError::Body(err));
                }
            };
            size_bytes += chunk.len() as u64;
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ObjectStoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }

        debug!(key, size_bytes, "stored object {}", file_path.display());
        Ok(size_bytes)
    }

    async fn get(&self, key: &str) -> ObjectResult<ByteStream> {
        ensure_key_safe(key)?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::NotFound(key.to_string())
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, key: &str) -> ObjectResult<bool> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let removed = match fs::remove_file(&file_path).await {
            Ok(_) => {
                debug!("removed physical file {}", file_path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
                false
            }
            Err(err) => return Err(ObjectStoreError::Io(err)),
        };

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(removed)
    }

    /// Write, read back and remove a probe file under the base path.
    async fn health_check(&self) -> ObjectResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"readyz" {
            return Err(ObjectStoreError::Unavailable(
                "probe file content mismatch".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{TryStreamExt, stream};
    use tempfile::TempDir;

    fn body(parts: &[&'static [u8]]) -> ByteStream {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn read_all(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());

        let written = store
            .put("abc.pdf", body(&[b"hello ", b"world"]))
            .await
            .unwrap();
        assert_eq!(written, 11);

        let data = read_all(store.get("abc.pdf").await.unwrap()).await;
        assert_eq!(data, b"hello world");

        assert!(store.delete("abc.pdf").await.unwrap());
        assert!(!store.delete("abc.pdf").await.unwrap());
        assert!(matches!(
            store.get("abc.pdf").await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_prunes_shard_directories() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("k1", body(&[b"x"])).await.unwrap();
        store.delete("k1").await.unwrap();

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none(), "shard directories should be pruned");
    }

    #[tokio::test]
    async fn failed_body_leaves_no_object_or_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        let failing: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ])
        .boxed();

        let err = store.put("broken", failing).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::Body(_)));
        assert!(!err.is_retryable());
        assert!(matches!(
            store.get("broken").await,
            Err(ObjectStoreError::NotFound(_))
        ));

        let (a, b) = FsObjectStore::shards("broken");
        let shard_dir = dir.path().join(a).join(b);
        let leftovers = std::fs::read_dir(&shard_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn unsafe_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        for key in ["", "../etc/passwd", "a/b", ".hidden", "a\\b"] {
            assert!(
                matches!(
                    store.put(key, body(&[b"x"])).await,
                    Err(ObjectStoreError::InvalidKey(_))
                ),
                "key {key:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn health_check_round_trips_probe() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path().join("nested"));
        store.health_check().await.unwrap();
        assert_eq!(std::fs::read_dir(store.base_path()).unwrap().count(), 0);
    }
}
