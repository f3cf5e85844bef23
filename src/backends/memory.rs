//! In-process backends.
//!
//! Both stores keep everything in a `HashMap` behind a `std::sync::Mutex`
//! that is never held across an await. They support failure injection so
//! partial-failure paths can be exercised deterministically.
//!
//! `MemoryMetadataStore::query` has no index to lean on: it filters and
//! sorts every record, O(n) per call. That is fine for tests and small
//! single-node setups and is the known scaling limit of this backend.

use super::{
    metadata_store::{MetadataError, MetadataResult, MetadataStore, RecordQuery},
    object_store::{ByteStream, BodyStream, ObjectResult, ObjectStore, ObjectStoreError, ensure_key_safe},
};
use crate::models::transfer::{RecordUpdate, TransferRecord};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Take one unit from a "fail the next N calls" budget.
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    put_calls: AtomicUsize,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
    transient_failures: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing the upload path.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        lock(&self.objects).insert(key.to_string(), data.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `put` calls seen, successful or not.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` calls of any kind fail with a retryable error.
    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    fn check_transient(&self) -> ObjectResult<()> {
        if take_failure(&self.transient_failures) {
            return Err(ObjectStoreError::Unavailable("injected transient failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, mut body: BodyStream<'_>) -> ObjectResult<u64> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        ensure_key_safe(key)?;
        self.check_transient()?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Unavailable("injected put failure".into()));
        }
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk.map_err(ObjectStoreError::Body)?);
        }
        let size = buf.len() as u64;
        lock(&self.objects).insert(key.to_string(), buf.freeze());
        Ok(size)
    }

    async fn get(&self, key: &str) -> ObjectResult<ByteStream> {
        self.check_transient()?;
        let data = lock(&self.objects)
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        Ok(stream::once(async move { Ok(data) }).boxed())
    }

    async fn delete(&self, key: &str) -> ObjectResult<bool> {
        self.check_transient()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Unavailable("injected delete failure".into()));
        }
        Ok(lock(&self.objects).remove(key).is_some())
    }

    async fn health_check(&self) -> ObjectResult<()> {
        self.check_transient()
    }
}

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<Uuid, TransferRecord>>,
    fail_updates: AtomicBool,
    fail_deletes: AtomicBool,
    transient_failures: AtomicUsize,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite or insert a record directly, bypassing version checks.
    pub fn insert(&self, record: TransferRecord) {
        lock(&self.records).insert(record.transfer_id, record);
    }

    pub fn snapshot(&self, transfer_id: Uuid) -> Option<TransferRecord> {
        lock(&self.records).get(&transfer_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` calls of any kind fail with a retryable error.
    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    fn check_transient(&self) -> MetadataResult<()> {
        if take_failure(&self.transient_failures) {
            return Err(MetadataError::Unavailable("injected transient failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put_if_absent(&self, record: &TransferRecord) -> MetadataResult<()> {
        self.check_transient()?;
        let mut records = lock(&self.records);
        if records.contains_key(&record.transfer_id) {
            return Err(MetadataError::AlreadyExists(record.transfer_id));
        }
        records.insert(record.transfer_id, record.clone());
        Ok(())
    }

    async fn get(&self, transfer_id: Uuid) -> MetadataResult<Option<TransferRecord>> {
        self.check_transient()?;
        Ok(self.snapshot(transfer_id))
    }

    async fn conditional_update(
        &self,
        transfer_id: Uuid,
        expected_version: i64,
        update: &RecordUpdate,
    ) -> MetadataResult<TransferRecord> {
        self.check_transient()?;
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(MetadataError::Unavailable("injected update failure".into()));
        }
        let mut records = lock(&self.records);
        let record = records
            .get_mut(&transfer_id)
            .ok_or(MetadataError::NotFound(transfer_id))?;
        if record.version != expected_version {
            return Err(MetadataError::VersionConflict {
                transfer_id,
                expected: expected_version,
            });
        }
        update.apply(record);
        Ok(record.clone())
    }

    async fn delete(&self, transfer_id: Uuid) -> MetadataResult<bool> {
        self.check_transient()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(MetadataError::Unavailable("injected delete failure".into()));
        }
        Ok(lock(&self.records).remove(&transfer_id).is_some())
    }

    async fn query(&self, query: &RecordQuery) -> MetadataResult<Vec<TransferRecord>> {
        self.check_transient()?;
        let mut rows: Vec<TransferRecord> = lock(&self.records)
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| query.compare_records(a, b));
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.check_transient()
    }
}
