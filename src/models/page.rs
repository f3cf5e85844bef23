//! Keyset pagination for the read-only transfer views.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Sort position of the last row returned by a previous page.
///
/// `at` is whichever timestamp the view orders by (`created_at` for recent
/// uploads, `expires_at` for the expiring view); `transfer_id` breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub at: DateTime<Utc>,
    pub transfer_id: Uuid,
}

impl PageCursor {
    /// Encode as an opaque token for clients.
    pub fn encode(&self) -> String {
        let nanos = self.at.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let raw = format!("{}|{}", nanos, self.transfer_id);
        general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a token produced by [`PageCursor::encode`]. Returns `None` on
    /// anything malformed.
    pub fn decode(token: &str) -> Option<Self> {
        let bytes = general_purpose::URL_SAFE_NO_PAD.decode(token).ok()?;
        let raw = String::from_utf8(bytes).ok()?;
        let (nanos, id) = raw.split_once('|')?;
        let at = DateTime::from_timestamp_nanos(nanos.parse().ok()?);
        let transfer_id = Uuid::parse_str(id).ok()?;
        Some(Self { at, transfer_id })
    }
}

/// One page of results plus the token for the next page, if any.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_token_is_opaque_and_reversible() {
        let cursor = PageCursor {
            at: DateTime::from_timestamp_nanos(1_780_000_000_123_456_789),
            transfer_id: Uuid::new_v4(),
        };
        let token = cursor.encode();
        assert!(!token.contains('|'));
        assert_eq!(PageCursor::decode(&token), Some(cursor));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert_eq!(PageCursor::decode("not base64!"), None);
        let no_sep = general_purpose::URL_SAFE_NO_PAD.encode("12345");
        assert_eq!(PageCursor::decode(&no_sep), None);
        let bad_id = general_purpose::URL_SAFE_NO_PAD.encode("12345|nope");
        assert_eq!(PageCursor::decode(&bad_id), None);
    }
}
