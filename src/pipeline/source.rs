//! Read-only page fetch boundary.
//!
//! Scans never touch storage directly: they ask a [`PageSource`] to copy one
//! page into a scratch block and then decode it with [`TuplePage`].

use crate::error::{Result, StageflowError};
use crate::pipeline::tuple::{Tuple, TuplePage};
use std::fmt;

/// Page number within a source.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    #[inline]
    pub fn next(self) -> Self {
        PageId(self.0 + 1)
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

/// Something that can serve encoded tuple pages.
#[cfg_attr(test, mockall::automock)]
pub trait PageSource: Send + Sync {
    /// Copy page `page` into `out` using the [`TuplePage`] layout.
    ///
    /// Returns the number of tuples written, or `None` past the last page.
    fn fetch_page(&self, page: PageId, out: &mut [u8]) -> Result<Option<usize>>;
}

/// In-memory table served as pages sized to the caller's buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    rows: Vec<Tuple>,
}

impl MemoryTable {
    pub fn new(rows: Vec<Tuple>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Tuple] {
        &self.rows
    }

    /// Pages needed to serve the table with pages of `page_len` bytes.
    pub fn page_count(&self, page_len: usize) -> usize {
        match TuplePage::capacity(page_len) {
            0 => 0,
            per_page => self.rows.len().div_ceil(per_page),
        }
    }
}

impl FromIterator<Tuple> for MemoryTable {
    fn from_iter<I: IntoIterator<Item = Tuple>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl PageSource for MemoryTable {
    fn fetch_page(&self, page: PageId, out: &mut [u8]) -> Result<Option<usize>> {
        let per_page = TuplePage::capacity(out.len());
        if per_page == 0 {
            return Err(StageflowError::invalid(format!(
                "page buffer of {} bytes cannot hold a tuple",
                out.len()
            )));
        }
        let start = usize::try_from(page.0)
            .ok()
            .and_then(|p| p.checked_mul(per_page))
            .unwrap_or(usize::MAX);
        if start >= self.rows.len() {
            return Ok(None);
        }
        let end = (start + per_page).min(self.rows.len());
        TuplePage::encode(out, &self.rows[start..end]).map(Some)
    }
}
