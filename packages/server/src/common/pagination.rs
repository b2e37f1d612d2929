//! Forward cursor pagination for list endpoints.
//!
//! Cursors are the base64 (URL-safe, unpadded) bytes of the last row's id.
//! Ids are UUID v7, so ordering by id is ordering by creation time.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i32 = 25;
pub const MAX_PAGE_SIZE: i32 = 100;

/// Opaque pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(Uuid);

impl Cursor {
    pub fn new(id: Uuid) -> Self {
        Cursor(id)
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }

    pub fn decode(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .context("Invalid cursor: not valid base64")?;
        let uuid = Uuid::from_slice(&bytes).context("Invalid cursor: not a valid UUID")?;
        Ok(Cursor(uuid))
    }

    pub fn into_uuid(self) -> Uuid {
        self.0
    }
}

/// Query-string arguments (`?first=&after=`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageArgs {
    pub first: Option<i32>,
    pub after: Option<String>,
}

impl PageArgs {
    pub fn new(first: i32, after: Option<String>) -> Self {
        Self {
            first: Some(first),
            after,
        }
    }

    /// Apply defaults and bounds, decode the cursor.
    pub fn validate(&self) -> Result<PageRequest, &'static str> {
        let limit = self.first.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let after = self
            .after
            .as_deref()
            .map(Cursor::decode)
            .transpose()
            .map_err(|_| "Invalid cursor")?
            .map(Cursor::into_uuid);
        Ok(PageRequest { limit, after })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    /// 1..=100
    pub limit: i32,
    pub after: Option<Uuid>,
}

impl PageRequest {
    /// LIMIT for the query: one extra row tells us whether a next page exists.
    pub fn fetch_limit(&self) -> i64 {
        (self.limit + 1) as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            after: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// One page of results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page_info: PageInfo,
}

impl<T> Page<T> {
    /// Build a page from a `fetch_limit()`-sized result set.
    pub fn from_rows(rows: Vec<T>, req: &PageRequest, id_of: impl Fn(&T) -> Uuid) -> Self {
        let (items, has_more) = trim_results(rows, req.limit);
        let end_cursor = items.last().map(|item| Cursor::new(id_of(item)).encode());
        Page {
            items,
            page_info: PageInfo {
                has_next_page: has_more,
                end_cursor,
            },
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page_info: self.page_info,
        }
    }
}

/// Trim a `limit + 1` result set down to `limit`, reporting whether rows were dropped.
pub fn trim_results<T>(mut results: Vec<T>, limit: i32) -> (Vec<T>, bool) {
    let limit = limit.max(0) as usize;
    let has_more = results.len() > limit;
    results.truncate(limit);
    (results, has_more)
}
