//! Background reclamation of expired transfers and abandoned uploads.
//!
//! A sweep walks four categories in bounded batches:
//!
//! 1. `Expired` leftovers whose object delete failed earlier
//! 2. `Active` records past `expires_at`
//! 3. `Pending` orphans older than the pending timeout
//! 4. `Deleted` tombstones past their retention
//!
//! Each record goes through [`LifecycleManager`], so the reaper never writes
//! state on its own and two concurrent sweeps only cost skipped records.

use crate::{
    backends::metadata_store::{MetadataStore, RecordOrder, RecordQuery},
    models::transfer::{TransferRecord, TransferState},
    services::{
        error::TransferResult,
        lifecycle::{LifecycleManager, Reclaimed},
    },
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: std::time::Duration,
    /// How long `Deleted` rows are kept after `expires_at`.
    pub tombstone_retention: Duration,
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(300),
            tombstone_retention: Duration::hours(168),
            batch_size: 100,
        }
    }
}

/// Outcome counts of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub orphans_reclaimed: usize,
    pub tombstones_removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Expired,
    Active,
    Orphan,
    Tombstone,
}

impl Category {
    const SWEEP_ORDER: [Category; 4] = [
        Category::Expired,
        Category::Active,
        Category::Orphan,
        Category::Tombstone,
    ];

    fn name(self) -> &'static str {
        match self {
            Category::Expired => "expired",
            Category::Active => "active",
            Category::Orphan => "orphan",
            Category::Tombstone => "tombstone",
        }
    }
}

pub struct ExpiryReaper {
    lifecycle: Arc<LifecycleManager>,
    metadata: Arc<dyn MetadataStore>,
    config: ReaperConfig,
}

impl ExpiryReaper {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        metadata: Arc<dyn MetadataStore>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            lifecycle,
            metadata,
            config,
        }
    }

    /// Sweep every `interval` until `cancel` fires. The first sweep runs
    /// immediately.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "expiry reaper started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }

        info!("expiry reaper stopped");
    }

    /// Run one pass over all categories. Failures are counted and logged,
    /// never propagated.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.lifecycle.now();
        let mut report = SweepReport::default();

        for category in Category::SWEEP_ORDER {
            if let Err(err) = self.sweep_category(category, now, &mut report).await {
                report.failed += 1;
                warn!(category = category.name(), error = %err, "reaper: listing failed");
            }
        }

        if report.is_idle() {
            debug!("reaper: nothing to do");
        } else {
            info!(
                expired = report.expired,
                orphans_reclaimed = report.orphans_reclaimed,
                tombstones_removed = report.tombstones_removed,
                skipped = report.skipped,
                failed = report.failed,
                "reaper: sweep finished"
            );
        }
        report
    }

    async fn sweep_category(
        &self,
        category: Category,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> TransferResult<()> {
        let mut query = self.query_for(category, now);
        let retry = &self.lifecycle.config().retry;

        loop {
            let batch = retry
                .run("reaper_query", || self.metadata.query(&query))
                .await?;

            for record in &batch {
                match self.reclaim(category, record).await {
                    Ok(Reclaimed::Done) => match category {
                        Category::Expired | Category::Active => report.expired += 1,
                        Category::Orphan => report.orphans_reclaimed += 1,
                        Category::Tombstone => report.tombstones_removed += 1,
                    },
                    Ok(Reclaimed::Skipped) => report.skipped += 1,
                    Err(err) => {
                        report.failed += 1;
                        warn!(
                            category = category.name(),
                            transfer_id = %record.transfer_id,
                            blob_key = %record.blob_key,
                            error = %err,
                            "reaper: could not reclaim transfer; will retry next sweep"
                        );
                    }
                }
            }

            match batch.last() {
                Some(last) if batch.len() == query.limit => {
                    query.after = Some(query.cursor_for(last));
                }
                _ => return Ok(()),
            }
        }
    }

    fn query_for(&self, category: Category, now: DateTime<Utc>) -> RecordQuery {
        let limit = self.config.batch_size.max(1);
        match category {
            Category::Expired => {
                RecordQuery::new(RecordOrder::ExpiresAsc, limit).states(&[TransferState::Expired])
            }
            Category::Active => {
                let mut q = RecordQuery::new(RecordOrder::ExpiresAsc, limit)
                    .states(&[TransferState::Active]);
                q.expires_before = Some(now);
                q
            }
            Category::Orphan => {
                let mut q = RecordQuery::new(RecordOrder::CreatedDesc, limit)
                    .states(&[TransferState::Pending]);
                q.created_before = Some(now - self.lifecycle.config().pending_timeout);
                q
            }
            Category::Tombstone => {
                let mut q = RecordQuery::new(RecordOrder::ExpiresAsc, limit)
                    .states(&[TransferState::Deleted]);
                q.expires_before = Some(now - self.config.tombstone_retention);
                q
            }
        }
    }

    async fn reclaim(&self, category: Category, record: &TransferRecord) -> TransferResult<Reclaimed> {
        match category {
            Category::Expired | Category::Active => self.lifecycle.retire(record).await,
            Category::Orphan => self.lifecycle.reclaim_orphan(record).await,
            Category::Tombstone => self.lifecycle.drop_tombstone(record).await,
        }
    }
}
