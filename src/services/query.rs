//! Read-only views over committed transfers.

use crate::{
    backends::metadata_store::{MetadataStore, RecordOrder, RecordQuery},
    clock::Clock,
    models::{
        page::{Page, PageCursor},
        transfer::{TransferRecord, TransferState},
    },
    services::{
        error::{TransferResult, ValidationError},
        retry::RetryPolicy,
    },
};
use chrono::Duration;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_PAGE_LIMIT: usize = 10;
pub const MAX_PAGE_LIMIT: usize = 100;
pub const DEFAULT_EXPIRING_WINDOW_HOURS: i64 = 24;
/// Ten years; longer than any TTL a deployment can configure.
pub const MAX_EXPIRING_WINDOW_HOURS: i64 = 24 * 365 * 10;

/// States a client may see in listings.
const VISIBLE_STATES: &[TransferState] = &[TransferState::Active, TransferState::Expired];

#[derive(Clone)]
pub struct QueryService {
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl QueryService {
    pub fn new(metadata: Arc<dyn MetadataStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            metadata,
            clock,
            retry,
        }
    }

    /// Committed transfers, newest first.
    pub async fn recent_uploads(
        &self,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> TransferResult<Page<TransferRecord>> {
        let mut query =
            RecordQuery::new(RecordOrder::CreatedDesc, clamp_limit(limit)).states(VISIBLE_STATES);
        query.after = decode_cursor(cursor)?;
        self.page(query).await
    }

    /// Active transfers expiring within `within_hours`, soonest first.
    pub async fn expiring_soon(
        &self,
        limit: Option<usize>,
        within_hours: Option<i64>,
        cursor: Option<&str>,
    ) -> TransferResult<Page<TransferRecord>> {
        let within = within_hours.unwrap_or(DEFAULT_EXPIRING_WINDOW_HOURS);
        if !(1..=MAX_EXPIRING_WINDOW_HOURS).contains(&within) {
            return Err(ValidationError::InvalidWindow(within).into());
        }
        let now = self.clock.now();
        let until = Duration::try_hours(within)
            .and_then(|window| now.checked_add_signed(window))
            .ok_or(ValidationError::InvalidWindow(within))?;
        let mut query = RecordQuery::new(RecordOrder::ExpiresAsc, clamp_limit(limit))
            .states(&[TransferState::Active]);
        query.expires_after = Some(now);
        query.expires_before = Some(until);
        query.after = decode_cursor(cursor)?;
        self.page(query).await
    }

    /// Fetch one extra row to learn whether another page exists.
    async fn page(&self, mut query: RecordQuery) -> TransferResult<Page<TransferRecord>> {
        let limit = query.limit;
        query.limit = limit + 1;
        let mut items = self
            .retry
            .run("query", || self.metadata.query(&query))
            .await?;

        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| query.cursor_for(last).encode())
        } else {
            None
        };
        debug!(
            order = ?query.order,
            returned = items.len(),
            more = next_cursor.is_some(),
            "listing served"
        );
        Ok(Page { items, next_cursor })
    }
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

fn decode_cursor(cursor: Option<&str>) -> Result<Option<PageCursor>, ValidationError> {
    match cursor.map(str::trim).filter(|c| !c.is_empty()) {
        Some(token) => PageCursor::decode(token)
            .map(Some)
            .ok_or(ValidationError::InvalidCursor),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{services::error::TransferError, testing::Harness};
    use uuid::Uuid;

    fn ids(page: &Page<TransferRecord>) -> Vec<Uuid> {
        page.items.iter().map(|r| r.transfer_id).collect()
    }

    #[tokio::test]
    async fn recent_lists_newest_first_and_hides_pending_and_deleted() {
        let h = Harness::new();
        let mut active = Vec::new();
        for i in 0..3 {
            active.push(h.active(&format!("f{i}.txt"), 24, None).await.transfer_id);
            h.clock.advance(Duration::minutes(1));
        }
        h.begin("wip.txt", 24, None).await;
        let purged = h.active("gone.txt", 24, None).await;
        let mut tombstone = purged.clone();
        tombstone.state = TransferState::Deleted;
        h.metadata.insert(tombstone);

        let page = h.query.recent_uploads(None, None).await.unwrap();
        active.reverse();
        assert_eq!(ids(&page), active);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn recent_paginates_without_gaps_or_repeats() {
        let h = Harness::new();
        let mut expected = Vec::new();
        for i in 0..7 {
            expected.push(h.active(&format!("f{i}.txt"), 24, None).await.transfer_id);
            if i % 2 == 0 {
                h.clock.advance(Duration::seconds(1));
            }
        }
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = h
                .query
                .recent_uploads(Some(3), cursor.as_deref())
                .await
                .unwrap();
            assert!(page.items.len() <= 3);
            seen.extend(ids(&page));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn expiring_soon_orders_by_expiry_within_window() {
        let h = Harness::new();
        let later = h.active("later.txt", 20, None).await;
        let soon = h.active("soon.txt", 2, None).await;
        let outside = h.active("outside.txt", 48, None).await;

        let page = h.query.expiring_soon(None, None, None).await.unwrap();
        assert_eq!(ids(&page), vec![soon.transfer_id, later.transfer_id]);
        assert!(!ids(&page).contains(&outside.transfer_id));

        // already-expired records drop out
        h.clock.advance(Duration::hours(3));
        let page = h.query.expiring_soon(Some(5), Some(72), None).await.unwrap();
        assert_eq!(ids(&page), vec![later.transfer_id, outside.transfer_id]);
    }

    #[tokio::test]
    async fn limits_are_clamped_and_bad_input_rejected() {
        assert_eq!(clamp_limit(None), DEFAULT_PAGE_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_PAGE_LIMIT);

        let h = Harness::new();
        assert!(matches!(
            h.query.recent_uploads(None, Some("%%%")).await,
            Err(TransferError::Validation(ValidationError::InvalidCursor))
        ));
        assert!(matches!(
            h.query.expiring_soon(None, Some(0), None).await,
            Err(TransferError::Validation(ValidationError::InvalidWindow(0)))
        ));
        for huge in [MAX_EXPIRING_WINDOW_HOURS + 1, 10_000_000_000, i64::MAX] {
            assert!(matches!(
                h.query.expiring_soon(None, Some(huge), None).await,
                Err(TransferError::Validation(ValidationError::InvalidWindow(w))) if w == huge
            ));
        }
        assert!(
            h.query
                .expiring_soon(None, Some(MAX_EXPIRING_WINDOW_HOURS), None)
                .await
                .is_ok()
        );
    }
}
