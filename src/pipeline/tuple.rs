//! Fixed-size tuples and the page layout they are stored in.
//!
//! A `Tuple` is the unit that flows through every buffer. It is `Copy` and
//! `repr(C)`, so a buffer slot is exactly `size_of::<Tuple>()` bytes and a
//! handoff is a plain memory copy.
//!
//! On a page, tuples are little-endian:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬─────┐
//! │ count: u64   │ arity: u64 │ c0 │ c1 │ c2 │ c3 │ ... │
//! └──────────────┴──────────────────────────────┴─────┘
//!     8 bytes              40 bytes per tuple
//! ```

use crate::error::{Result, StageflowError};

/// Columns per tuple.
pub const MAX_TUPLE_COLUMNS: usize = 4;

/// Encoded size of one tuple on a page.
pub const TUPLE_ENCODED_SIZE: usize = 8 + 8 * MAX_TUPLE_COLUMNS;

/// Page header: tuple count as `u64`.
pub const PAGE_HEADER_SIZE: usize = 8;

/// Fixed-width relational row.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct Tuple {
    columns: [i64; MAX_TUPLE_COLUMNS],
    arity: u32,
}

impl Tuple {
    /// Build a tuple from up to four column values.
    pub fn new(values: &[i64]) -> Result<Self> {
        if values.len() > MAX_TUPLE_COLUMNS {
            return Err(StageflowError::invalid(format!(
                "tuple has {} columns, at most {MAX_TUPLE_COLUMNS} are supported",
                values.len()
            )));
        }
        let mut columns = [0; MAX_TUPLE_COLUMNS];
        columns[..values.len()].copy_from_slice(values);
        Ok(Self {
            columns,
            arity: values.len() as u32,
        })
    }

    pub const fn single(a: i64) -> Self {
        Self {
            columns: [a, 0, 0, 0],
            arity: 1,
        }
    }

    pub const fn pair(a: i64, b: i64) -> Self {
        Self {
            columns: [a, b, 0, 0],
            arity: 2,
        }
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.arity as usize
    }

    #[inline]
    pub fn get(&self, column: usize) -> Option<i64> {
        self.values().get(column).copied()
    }

    #[inline]
    pub fn values(&self) -> &[i64] {
        &self.columns[..self.arity()]
    }

    /// Write the 40-byte page encoding into `out`.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < TUPLE_ENCODED_SIZE {
            return Err(StageflowError::invalid(format!(
                "tuple needs {TUPLE_ENCODED_SIZE} bytes, got {}",
                out.len()
            )));
        }
        out[..8].copy_from_slice(&(self.arity as u64).to_le_bytes());
        for (i, value) in self.columns.iter().enumerate() {
            let at = 8 + i * 8;
            out[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Read a tuple back from its page encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TUPLE_ENCODED_SIZE {
            return Err(StageflowError::Source(format!(
                "truncated tuple: {} of {TUPLE_ENCODED_SIZE} bytes",
                bytes.len()
            )));
        }
        let arity = read_u64(&bytes[..8]);
        if arity > MAX_TUPLE_COLUMNS as u64 {
            return Err(StageflowError::Source(format!(
                "corrupt tuple arity {arity}"
            )));
        }
        let mut columns = [0; MAX_TUPLE_COLUMNS];
        for (i, column) in columns.iter_mut().enumerate() {
            let at = 8 + i * 8;
            *column = read_u64(&bytes[at..at + 8]) as i64;
        }
        Ok(Self {
            columns,
            arity: arity as u32,
        })
    }
}

impl std::fmt::Debug for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Tuple").field(&self.values()).finish()
    }
}

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Read-only view of an encoded page.
#[derive(Clone, Copy)]
pub struct TuplePage<'a> {
    bytes: &'a [u8],
    count: usize,
}

impl<'a> TuplePage<'a> {
    /// How many tuples fit on a page of `page_len` bytes.
    pub fn capacity(page_len: usize) -> usize {
        page_len.saturating_sub(PAGE_HEADER_SIZE) / TUPLE_ENCODED_SIZE
    }

    /// Encode as many of `tuples` as fit into `out`. Returns how many were
    /// written.
    pub fn encode(out: &mut [u8], tuples: &[Tuple]) -> Result<usize> {
        if out.len() < PAGE_HEADER_SIZE {
            return Err(StageflowError::invalid(format!(
                "page of {} bytes cannot hold a header",
                out.len()
            )));
        }
        let count = tuples.len().min(Self::capacity(out.len()));
        out[..PAGE_HEADER_SIZE].copy_from_slice(&(count as u64).to_le_bytes());
        for (i, tuple) in tuples[..count].iter().enumerate() {
            let at = PAGE_HEADER_SIZE + i * TUPLE_ENCODED_SIZE;
            tuple.encode(&mut out[at..at + TUPLE_ENCODED_SIZE])?;
        }
        Ok(count)
    }

    /// Validate the header of `bytes` and wrap it.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(StageflowError::Source("page shorter than its header".into()));
        }
        let count = read_u64(&bytes[..PAGE_HEADER_SIZE]) as usize;
        if count > Self::capacity(bytes.len()) {
            return Err(StageflowError::Source(format!(
                "page claims {count} tuples but only {} fit",
                Self::capacity(bytes.len())
            )));
        }
        Ok(Self { bytes, count })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: usize) -> Result<Tuple> {
        if index >= self.count {
            return Err(StageflowError::invalid(format!(
                "tuple {index} out of range for page of {}",
                self.count
            )));
        }
        let at = PAGE_HEADER_SIZE + index * TUPLE_ENCODED_SIZE;
        Tuple::decode(&self.bytes[at..at + TUPLE_ENCODED_SIZE])
    }
}
