//! Cursor-based page aggregation
//!
//! The server returns list results one page at a time together with an
//! opaque continuation cursor. [`collect`] either returns a single page or
//! walks the cursor chain to exhaustion.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One page of list results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items in server order
    pub data: Vec<T>,
    /// Cursor for the next page; `None` means iteration is complete
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Build a page, treating an empty cursor as exhaustion
    pub fn new(data: Vec<T>, next_cursor: Option<String>) -> Self {
        Self {
            data,
            next_cursor: next_cursor.filter(|c| !c.is_empty()),
        }
    }

    /// True when no further page exists
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Wire shape of a list response: `{"data": [...], "meta": {"cursor": "..."}}`
#[derive(Debug, Deserialize)]
pub(crate) struct ListEnvelope<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub meta: Option<ListMeta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListMeta {
    #[serde(default)]
    pub cursor: Option<String>,
}

impl<T> From<ListEnvelope<T>> for Page<T> {
    fn from(envelope: ListEnvelope<T>) -> Self {
        Page::new(envelope.data, envelope.meta.and_then(|m| m.cursor))
    }
}

/// Collect list results through `fetch_page`
///
/// `fetch_page` receives the cursor to start from and the page-size hint.
/// With `fetch_all == false` exactly one fetch is made and its page is
/// returned unchanged. Otherwise pages are fetched sequentially, following
/// each returned cursor, until a page carries none; the concatenated items
/// are returned with `next_cursor = None`. Items are never truncated,
/// re-sorted or de-duplicated. The first failure aborts the collection.
pub async fn collect<T, E, F, Fut>(
    mut fetch_page: F,
    limit: Option<u32>,
    start_cursor: Option<String>,
    fetch_all: bool,
) -> Result<Page<T>, E>
where
    F: FnMut(Option<String>, Option<u32>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    if !fetch_all {
        return fetch_page(start_cursor, limit).await;
    }

    let mut items = Vec::new();
    let mut cursor = start_cursor;
    let mut pages = 0usize;

    loop {
        let page = fetch_page(cursor.take(), limit).await?;
        pages += 1;
        items.extend(page.data);

        match page.next_cursor.filter(|c| !c.is_empty()) {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    debug!(pages = pages, items = items.len(), "Collected all pages");
    Ok(Page {
        data: items,
        next_cursor: None,
    })
}
