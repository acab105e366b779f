//! Fixed-size block pool over a growable region.
//!
//! Blocks are carved out of one [`MemoryRegion`] by index. A returned block
//! goes onto an [`IndexFreeList`] and is handed out again before any new
//! block is minted, so the committed prefix only grows when every minted
//! block is checked out at the same time.

use super::free_list::IndexFreeList;
use super::region::MemoryRegion;
use crate::error::{Result, StageflowError};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Pool of `max_blocks` blocks of `block_size` bytes each.
pub struct BlockPool {
    /// Only the minting path grows the region, under this lock.
    region: Mutex<MemoryRegion>,
    base: NonNull<u8>,
    free: IndexFreeList,
    block_size: usize,
    max_blocks: u32,
    minted: AtomicUsize,
    checked_out: AtomicUsize,
}

// `base` points into `region`, which never moves. Block bytes are only
// reachable through a `PoolBlock`, and each index has at most one.
unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// Reserve room for `max_blocks` blocks. Nothing is committed until the
    /// first checkout.
    pub fn new(block_size: usize, max_blocks: u32) -> Result<Arc<Self>> {
        if block_size == 0 {
            return Err(StageflowError::invalid("block size must be non-zero"));
        }
        if max_blocks == 0 || max_blocks == u32::MAX {
            return Err(StageflowError::invalid(format!(
                "block count {max_blocks} out of range"
            )));
        }
        let total = block_size
            .checked_mul(max_blocks as usize)
            .ok_or(StageflowError::TooLarge {
                requested: usize::MAX,
                limit: super::MAX_REGION_SIZE,
            })?;

        let region = MemoryRegion::reserve(total.max(super::page_size()), 8)?;
        let base = region.base();

        tracing::debug!(block_size, max_blocks, "created block pool");

        Ok(Arc::new(Self {
            region: Mutex::new(region),
            base,
            free: IndexFreeList::new(max_blocks),
            block_size,
            max_blocks,
            minted: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
        }))
    }

    /// Take a block out of the pool.
    ///
    /// Returns `Ok(None)` when every block is checked out. Committing a
    /// fresh block can fail with `OutOfMemory`.
    pub fn checkout(self: &Arc<Self>) -> Result<Option<PoolBlock>> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => match self.mint()? {
                Some(index) => index,
                None => return Ok(None),
            },
        };

        self.checked_out.fetch_add(1, Ordering::Relaxed);
        let offset = index as usize * self.block_size;
        // SAFETY: offset + block_size <= committed, and the index is ours.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) };
        Ok(Some(PoolBlock {
            pool: Arc::clone(self),
            ptr,
            index,
        }))
    }

    fn mint(&self) -> Result<Option<u32>> {
        let mut region = self.region.lock();
        let minted = self.minted.load(Ordering::Relaxed);
        if minted >= self.max_blocks as usize {
            // A block may have come back while we waited for the lock.
            return Ok(self.free.pop());
        }
        region.ensure_capacity((minted + 1) * self.block_size)?;
        self.minted.store(minted + 1, Ordering::Release);
        Ok(Some(minted as u32))
    }

    fn give_back(&self, index: u32) {
        self.checked_out.fetch_sub(1, Ordering::Relaxed);
        self.free.push(index);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    /// Blocks currently held by callers.
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::Relaxed)
    }

    /// Blocks ever carved out of the region.
    pub fn minted(&self) -> usize {
        self.minted.load(Ordering::Acquire)
    }

    /// Bytes committed in the backing region.
    pub fn committed_bytes(&self) -> usize {
        self.region.lock().committed()
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("block_size", &self.block_size)
            .field("max_blocks", &self.max_blocks)
            .field("minted", &self.minted())
            .field("checked_out", &self.checked_out())
            .finish()
    }
}

/// Exclusive handle to one pool block. Returns the block on drop.
pub struct PoolBlock {
    pool: Arc<BlockPool>,
    ptr: NonNull<u8>,
    index: u32,
}

// The handle is the only owner of its block's bytes.
unsafe impl Send for PoolBlock {}
unsafe impl Sync for PoolBlock {}

impl PoolBlock {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Deref for PoolBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: committed, block_size long, exclusively ours.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.pool.block_size) }
    }
}

impl DerefMut for PoolBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.pool.block_size) }
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        self.pool.give_back(self.index);
    }
}

impl std::fmt::Debug for PoolBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBlock")
            .field("index", &self.index)
            .field("len", &self.pool.block_size)
            .finish()
    }
}
