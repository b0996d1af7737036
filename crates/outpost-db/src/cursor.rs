//! Opaque pagination tokens.
//!
//! Listing cursors and log continuation offsets cross the API boundary as
//! base64 strings so callers cannot depend on the underlying paging scheme.

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Keyset position for user-indexed dispatch listing.
///
/// Encodes the `(started_at, dispatch_id)` pair of the last row returned,
/// matching the `ORDER BY started_at DESC, dispatch_id DESC` listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub started_at: DateTime<Utc>,
    pub dispatch_id: Uuid,
}

impl PageCursor {
    /// Encode to an opaque base64 token.
    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.started_at.to_rfc3339(), self.dispatch_id);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a token previously produced by [`PageCursor::encode`].
    pub fn decode(token: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .context("cursor is not valid base64")?;
        let raw = String::from_utf8(raw).context("cursor is not valid UTF-8")?;
        let Some((ts, id)) = raw.split_once('|') else {
            bail!("cursor is missing its separator");
        };
        let started_at = DateTime::parse_from_rfc3339(ts)
            .context("cursor timestamp is malformed")?
            .with_timezone(&Utc);
        let dispatch_id = Uuid::parse_str(id).context("cursor dispatch id is malformed")?;
        Ok(Self {
            started_at,
            dispatch_id,
        })
    }
}

/// Encode a log sequence id as an opaque continuation token.
pub fn encode_log_offset(last_id: i64) -> String {
    URL_SAFE_NO_PAD.encode(last_id.to_string())
}

/// Decode a log continuation token back to a sequence id.
pub fn decode_log_offset(token: &str) -> Result<i64> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .context("log offset is not valid base64")?;
    let raw = String::from_utf8(raw).context("log offset is not valid UTF-8")?;
    raw.parse::<i64>().context("log offset is not an integer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_cursor_roundtrip() {
        let cursor = PageCursor {
            started_at: Utc::now(),
            dispatch_id: Uuid::new_v4(),
        };
        let token = cursor.encode();
        let decoded = PageCursor::decode(&token).expect("should decode");
        assert_eq!(decoded.dispatch_id, cursor.dispatch_id);
        assert_eq!(
            decoded.started_at.timestamp_micros(),
            cursor.started_at.timestamp_micros()
        );
    }

    #[test]
    fn page_cursor_rejects_garbage() {
        assert!(PageCursor::decode("not-base64!!!").is_err());
        let token = URL_SAFE_NO_PAD.encode("no-separator-here");
        assert!(PageCursor::decode(&token).is_err());
    }

    #[test]
    fn log_offset_roundtrip() {
        let token = encode_log_offset(42);
        assert_eq!(decode_log_offset(&token).unwrap(), 42);
    }

    #[test]
    fn log_offset_rejects_garbage() {
        assert!(decode_log_offset("$$$").is_err());
        let token = URL_SAFE_NO_PAD.encode("forty-two");
        assert!(decode_log_offset(&token).is_err());
    }
}
