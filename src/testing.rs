//! Shared test utilities: tracing setup and a fully wired in-memory relay.

use crate::{
    backends::memory::{MemoryMetadataStore, MemoryObjectStore},
    clock::ManualClock,
    models::transfer::TransferRecord,
    services::{
        lifecycle::{LifecycleConfig, LifecycleManager, PendingUpload},
        policy::DenylistPolicy,
        query::QueryService,
        reaper::{ExpiryReaper, ReaperConfig},
        relay::RelayService,
        retry::RetryPolicy,
    },
};
use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

pub const TEST_BASE_URL: &str = "https://relay.test";

/// Initialise a tracing subscriber for tests.
///
/// Respects `RUST_LOG`, defaults to `debug`. Safe to call more than once.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// In-memory stores, a manual clock and every service wired on top.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub lifecycle: LifecycleManager,
    pub query: QueryService,
    pub relay: RelayService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_max_file_size(1024 * 1024)
    }

    pub fn with_max_file_size(max_file_size: u64) -> Self {
        init_test_tracing();

        let start = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let metadata = Arc::new(MemoryMetadataStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let retry = RetryPolicy::immediate(4);

        let lifecycle = LifecycleManager::new(
            metadata.clone(),
            objects.clone(),
            Arc::new(DenylistPolicy::default()),
            clock.clone(),
            LifecycleConfig {
                pending_timeout: Duration::hours(1),
                retry: retry.clone(),
                ..LifecycleConfig::default()
            },
        );
        let query = QueryService::new(metadata.clone(), clock.clone(), retry);
        let relay = RelayService::new(
            Arc::new(lifecycle.clone()),
            metadata.clone(),
            objects.clone(),
            query.clone(),
            Some(format!("{TEST_BASE_URL}/")),
            max_file_size,
        );

        Self {
            clock,
            metadata,
            objects,
            lifecycle,
            query,
            relay,
        }
    }

    /// Start an upload without writing or committing anything.
    pub async fn begin(&self, name: &str, ttl_hours: i64, max_downloads: Option<i64>) -> PendingUpload {
        self.lifecycle
            .begin_upload(name, None, ttl_hours, max_downloads)
            .await
            .unwrap()
    }

    /// Fully uploaded transfer with a stored object.
    pub async fn active(&self, name: &str, ttl_hours: i64, max_downloads: Option<i64>) -> TransferRecord {
        let pending = self.begin(name, ttl_hours, max_downloads).await;
        let payload = format!("contents of {name}");
        let size = payload.len() as u64;
        self.objects.insert(&pending.blob_key, payload);
        self.lifecycle
            .commit(pending.transfer_id, &pending.blob_key, size)
            .await
            .unwrap()
    }

    pub fn reaper(&self) -> ExpiryReaper {
        ExpiryReaper::new(
            Arc::new(self.lifecycle.clone()),
            self.metadata.clone(),
            ReaperConfig {
                interval: std::time::Duration::from_millis(10),
                tombstone_retention: Duration::hours(24),
                batch_size: 50,
            },
        )
    }
}
