//! Lock-free recycling free-list of arena indices.
//!
//! Two intrusive stacks share one side table of links:
//!
//! ```text
//! push ──► backup:  [7] → [3] → [9] → NIL
//! pop  ◄── active:  [2] → [5] → NIL
//! ```
//!
//! `push` always prepends to `backup`. `pop` takes from `active`; when
//! `active` runs dry one thread grabs the swap lock, detaches the whole
//! `backup` stack, keeps its first node and installs the rest as the new
//! `active`. Poppers that lose the race for the lock wait briefly and retry
//! the fast path rather than queueing on the lock.
//!
//! Each head is a `(tag, index)` pair packed into one `AtomicU64`. Every
//! successful CAS bumps the tag, so a node that was popped and pushed back
//! between another thread's load and its CAS is detected and retried (ABA).
//! Tags are 32 bits wide; wrapping a tag within one thread's preemption
//! window is the residual risk of any bounded version counter and is not
//! detected.
//!
//! The list owns only indices. Storage lives in whatever arena the caller
//! keeps alongside it (see [`BlockPool`](super::BlockPool)).

use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// End-of-list marker.
const NIL: u32 = u32::MAX;

#[inline]
const fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
const fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

enum Refill {
    Got(u32),
    Empty,
    Retry,
}

/// Versioned two-list free stack over the index space `0..capacity`.
pub struct IndexFreeList {
    next: Box<[AtomicU32]>,
    active: CachePadded<AtomicU64>,
    backup: CachePadded<AtomicU64>,
    swap_lock: CachePadded<AtomicBool>,
}

impl IndexFreeList {
    /// Create an empty list able to hold indices `0..capacity`.
    ///
    /// # Panics
    ///
    /// If `capacity` does not leave room for the end-of-list marker.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity < NIL, "free-list capacity must be below u32::MAX");
        let next = (0..capacity).map(|_| AtomicU32::new(NIL)).collect();
        Self {
            next,
            active: CachePadded::new(AtomicU64::new(pack(0, NIL))),
            backup: CachePadded::new(AtomicU64::new(pack(0, NIL))),
            swap_lock: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Create a list with every index in `0..capacity` already free.
    /// Pops return the indices in ascending order.
    pub fn with_all_free(capacity: u32) -> Self {
        let list = Self::new(capacity);
        if capacity > 0 {
            for i in 0..capacity - 1 {
                list.next[i as usize].store(i + 1, Ordering::Relaxed);
            }
            list.active.store(pack(0, 0), Ordering::Release);
        }
        list
    }

    /// Number of indices this list can track.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.next.len() as u32
    }

    /// Return an index to the list. Never blocks, never fails.
    ///
    /// The caller must own `index` (it must not already be in the list).
    pub fn push(&self, index: u32) {
        debug_assert!(index < self.capacity(), "index {index} out of range");
        let link = &self.next[index as usize];
        let mut head = self.backup.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(head);
            link.store(top, Ordering::Relaxed);
            match self.backup.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Take an index out of the list, or `None` if both stacks are empty.
    pub fn pop(&self) -> Option<u32> {
        loop {
            let head = self.active.load(Ordering::Acquire);
            let (tag, top) = unpack(head);

            if top != NIL {
                // `top` may be popped and re-linked by another thread before
                // our CAS; the tag makes that CAS fail.
                let next = self.next[top as usize].load(Ordering::Acquire);
                if self
                    .active
                    .compare_exchange_weak(
                        head,
                        pack(tag.wrapping_add(1), next),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Some(top);
                }
                continue;
            }

            match self.refill() {
                Refill::Got(index) => return Some(index),
                Refill::Empty => return None,
                Refill::Retry => continue,
            }
        }
    }

    /// Whether both stacks look empty. Racy by nature; for diagnostics.
    pub fn is_empty(&self) -> bool {
        unpack(self.active.load(Ordering::Acquire)).1 == NIL
            && unpack(self.backup.load(Ordering::Acquire)).1 == NIL
    }

    fn active_has_nodes(&self) -> bool {
        unpack(self.active.load(Ordering::Acquire)).1 != NIL
    }

    /// Slow path: move `backup` into `active`, keeping its first node.
    fn refill(&self) -> Refill {
        if self.swap_lock.swap(true, Ordering::Acquire) {
            let backoff = Backoff::new();
            while self.swap_lock.load(Ordering::Relaxed) {
                if self.active_has_nodes() {
                    break;
                }
                backoff.snooze();
            }
            return Refill::Retry;
        }

        // Someone refilled between our fast-path miss and taking the lock.
        if self.active_has_nodes() {
            self.swap_lock.store(false, Ordering::Release);
            return Refill::Retry;
        }

        let mut head = self.backup.load(Ordering::Acquire);
        let first = loop {
            let (tag, top) = unpack(head);
            if top == NIL {
                self.swap_lock.store(false, Ordering::Release);
                return Refill::Empty;
            }
            match self.backup.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), NIL),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break top,
                Err(current) => head = current,
            }
        };

        let rest = self.next[first as usize].load(Ordering::Acquire);
        if rest != NIL {
            // Only the lock holder installs into an empty `active`, but
            // poppers still CAS on it, so bump the tag with a CAS too.
            let mut current = self.active.load(Ordering::Acquire);
            loop {
                let (tag, _) = unpack(current);
                match self.active.compare_exchange_weak(
                    current,
                    pack(tag.wrapping_add(1), rest),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }

        self.swap_lock.store(false, Ordering::Release);
        Refill::Got(first)
    }
}

impl std::fmt::Debug for IndexFreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (active_tag, active_top) = unpack(self.active.load(Ordering::Relaxed));
        let (backup_tag, backup_top) = unpack(self.backup.load(Ordering::Relaxed));
        f.debug_struct("IndexFreeList")
            .field("capacity", &self.capacity())
            .field("active", &(active_tag, active_top))
            .field("backup", &(backup_tag, backup_top))
            .finish()
    }
}
