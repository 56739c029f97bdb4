//! Cursor pagination.
//!
//! A cursor is `base64url(epoch_millis ‖ '|' ‖ id)` over the boundary
//! row. Ids may themselves contain `|`; only the first separator counts.
//! Listings fetch `limit + 1` rows to learn whether a further page
//! exists.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};

use crate::{DbError, DbResult};

/// Boundary of the previous page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub ts: DateTime<Utc>,
    pub id: String,
}

impl Cursor {
    pub fn new(ts: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self { ts, id: id.into() }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}|{}", self.ts.timestamp_millis(), self.id))
    }

    pub fn decode(token: &str) -> DbResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| DbError::BadCursor(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|e| DbError::BadCursor(e.to_string()))?;
        let (millis, id) = text
            .split_once('|')
            .ok_or_else(|| DbError::BadCursor("missing separator".into()))?;
        let millis: i64 = millis
            .parse()
            .map_err(|_| DbError::BadCursor("bad timestamp".into()))?;
        let ts = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| DbError::BadCursor("timestamp out of range".into()))?;
        Ok(Self {
            ts,
            id: id.to_string(),
        })
    }
}

/// One page of results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Shape `limit + 1` fetched rows into a page. `boundary` extracts the
/// `(timestamp, id)` pair of a row for the next cursor.
pub fn page_from_rows<T>(
    mut rows: Vec<T>,
    limit: usize,
    boundary: impl Fn(&T) -> (DateTime<Utc>, String),
) -> Page<T> {
    let has_more = rows.len() > limit;
    if has_more {
        rows.truncate(limit);
    }
    let next_cursor = if has_more {
        rows.last().map(|row| {
            let (ts, id) = boundary(row);
            Cursor::new(ts, id).encode()
        })
    } else {
        None
    };
    Page {
        items: rows,
        next_cursor,
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_is_a_bijection() {
        let cursor = Cursor::new(Utc::now(), "0195b2f4-abcd-7000-8000-000000000001");
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        // Millisecond resolution survives the round trip.
        assert_eq!(decoded.ts.timestamp_millis(), cursor.ts.timestamp_millis());
        assert_eq!(decoded.id, cursor.id);
    }

    #[test]
    fn id_containing_pipe_survives() {
        let cursor = Cursor::new(Utc::now(), "weird|id|with|pipes");
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.id, "weird|id|with|pipes");
    }

    #[test]
    fn garbage_tokens_rejected() {
        assert!(Cursor::decode("not-base64!!!").is_err());
        let no_sep = URL_SAFE_NO_PAD.encode("12345");
        assert!(Cursor::decode(&no_sep).is_err());
        let bad_ts = URL_SAFE_NO_PAD.encode("abc|id");
        assert!(Cursor::decode(&bad_ts).is_err());
    }

    #[test]
    fn exact_limit_has_no_more() {
        let rows: Vec<i32> = (0..5).collect();
        let page = page_from_rows(rows, 5, |_| (Utc::now(), "x".into()));
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
        assert_eq!(page.items.len(), 5);
    }

    #[test]
    fn over_limit_truncates_and_points_at_boundary() {
        let rows: Vec<i32> = (0..6).collect();
        let page = page_from_rows(rows, 5, |row| (Utc.timestamp_millis_opt(0).unwrap(), row.to_string()));
        assert!(page.has_more);
        assert_eq!(page.items.len(), 5);
        let cursor = Cursor::decode(page.next_cursor.as_deref().unwrap()).unwrap();
        assert_eq!(cursor.id, "4");
    }
}
