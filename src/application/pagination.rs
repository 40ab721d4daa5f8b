//! Offset-cursor pages for infinite lists.

use serde::Serialize;

/// One fetched page. `next_cursor` is the next page index, absent on the last page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub next_cursor: Option<u64>,
    /// Total rows at the time this page was fetched.
    pub total: u64,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, next_cursor: Option<u64>, total: u64) -> Self {
        Self {
            data,
            next_cursor,
            total,
        }
    }

    /// Build page `index` of a `total`-row listing split into `size`-row pages.
    pub fn from_offset(data: Vec<T>, index: u64, size: u64, total: u64) -> Self {
        let consumed = (index + 1).saturating_mul(size);
        let next_cursor = (consumed < total).then_some(index + 1);
        Self::new(data, next_cursor, total)
    }

    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Inclusive row range for page `index`.
pub fn page_range(index: u64, size: u64) -> (u64, u64) {
    let size = size.max(1);
    let from = index.saturating_mul(size);
    (from, from.saturating_add(size - 1))
}
