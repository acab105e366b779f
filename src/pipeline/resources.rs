//! Resource declarations and the admission ledger.
//!
//! Every packet declares what it will hold while running. The dispatcher
//! sums the declarations of a whole packet graph into one [`ResourceSet`] and
//! asks the [`ResourceLedger`] for all of it at once, so a graph is either
//! fully admitted or not started at all.

use crate::error::{Result, StageflowError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of bounded resources a packet can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// One running stage instance.
    StageSlot,
    /// Pages of tuple-buffer memory.
    BufferPages,
    /// Scratch blocks from the block pool.
    ScratchBlocks,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::StageSlot,
        ResourceKind::BufferPages,
        ResourceKind::ScratchBlocks,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// One declared need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNeed {
    pub kind: ResourceKind,
    pub amount: u64,
}

impl ResourceNeed {
    pub const fn new(kind: ResourceKind, amount: u64) -> Self {
        Self { kind, amount }
    }
}

/// Amount per resource kind.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSet {
    pub stage_slots: u64,
    pub buffer_pages: u64,
    pub scratch_blocks: u64,
}

impl ResourceSet {
    pub const fn new(stage_slots: u64, buffer_pages: u64, scratch_blocks: u64) -> Self {
        Self {
            stage_slots,
            buffer_pages,
            scratch_blocks,
        }
    }

    /// Sum a declaration list. Zero amounts are rejected; repeated kinds are
    /// added together.
    pub fn from_needs(needs: &[ResourceNeed]) -> Result<Self> {
        let mut set = Self::default();
        for need in needs {
            if need.amount == 0 {
                return Err(StageflowError::invalid(format!(
                    "resource need for {:?} has zero amount",
                    need.kind
                )));
            }
            set.add(need.kind, need.amount)?;
        }
        Ok(set)
    }

    pub fn get(&self, kind: ResourceKind) -> u64 {
        self.as_array()[kind.index()]
    }

    fn as_array(&self) -> [u64; 3] {
        [self.stage_slots, self.buffer_pages, self.scratch_blocks]
    }

    fn slot_mut(&mut self, kind: ResourceKind) -> &mut u64 {
        match kind {
            ResourceKind::StageSlot => &mut self.stage_slots,
            ResourceKind::BufferPages => &mut self.buffer_pages,
            ResourceKind::ScratchBlocks => &mut self.scratch_blocks,
        }
    }

    pub fn add(&mut self, kind: ResourceKind, amount: u64) -> Result<()> {
        let slot = self.slot_mut(kind);
        *slot = slot
            .checked_add(amount)
            .ok_or_else(|| StageflowError::invalid(format!("{kind:?} declaration overflows")))?;
        Ok(())
    }

    pub fn add_set(&mut self, other: &ResourceSet) -> Result<()> {
        for kind in ResourceKind::ALL {
            self.add(kind, other.get(kind))?;
        }
        Ok(())
    }

    pub fn fits_within(&self, limit: &ResourceSet) -> bool {
        ResourceKind::ALL
            .iter()
            .all(|&kind| self.get(kind) <= limit.get(kind))
    }

    fn saturating_sub(&mut self, other: &ResourceSet) {
        for kind in ResourceKind::ALL {
            let slot = self.slot_mut(kind);
            *slot = slot.saturating_sub(other.get(kind));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_array().iter().all(|&v| v == 0)
    }
}

impl fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{slots: {}, pages: {}, scratch: {}}}",
            self.stage_slots, self.buffer_pages, self.scratch_blocks
        )
    }
}

/// Total capacity and what is currently free, behind one lock.
pub struct ResourceLedger {
    total: ResourceSet,
    available: Mutex<ResourceSet>,
}

impl ResourceLedger {
    pub fn new(total: ResourceSet) -> Self {
        Self {
            total,
            available: Mutex::new(total),
        }
    }

    /// Reject a request that could never be satisfied, even on an idle
    /// engine.
    pub fn check_feasible(&self, request: &ResourceSet) -> Result<()> {
        if request.fits_within(&self.total) {
            Ok(())
        } else {
            Err(StageflowError::invalid(format!(
                "request {request:?} exceeds total capacity {:?}",
                self.total
            )))
        }
    }

    /// Acquire all of `request` or nothing. Returns whether it was acquired.
    pub fn try_acquire(&self, request: &ResourceSet) -> Result<bool> {
        self.check_feasible(request)?;
        let mut available = self.available.lock();
        if !request.fits_within(&available) {
            return Ok(false);
        }
        available.saturating_sub(request);
        Ok(true)
    }

    pub fn release(&self, granted: &ResourceSet) {
        let mut available = self.available.lock();
        for kind in ResourceKind::ALL {
            let freed = available.get(kind).saturating_add(granted.get(kind));
            *available.slot_mut(kind) = freed.min(self.total.get(kind));
        }
    }

    pub fn total(&self) -> ResourceSet {
        self.total
    }

    pub fn available(&self) -> ResourceSet {
        *self.available.lock()
    }

    pub fn in_use(&self) -> ResourceSet {
        let mut used = self.total;
        used.saturating_sub(&self.available());
        used
    }
}

impl fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLedger")
            .field("total", &self.total)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_needs_sums_duplicates() {
        let set = ResourceSet::from_needs(&[
            ResourceNeed::new(ResourceKind::BufferPages, 2),
            ResourceNeed::new(ResourceKind::StageSlot, 1),
            ResourceNeed::new(ResourceKind::BufferPages, 3),
        ])
        .unwrap();
        assert_eq!(set, ResourceSet::new(1, 5, 0));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let err = ResourceSet::from_needs(&[ResourceNeed::new(ResourceKind::StageSlot, 0)])
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_acquire_is_all_or_nothing() {
        let ledger = ResourceLedger::new(ResourceSet::new(2, 10, 1));
        assert!(ledger.try_acquire(&ResourceSet::new(1, 8, 1)).unwrap());

        // Slots would fit, pages would not: nothing is taken.
        assert!(!ledger.try_acquire(&ResourceSet::new(1, 4, 0)).unwrap());
        assert_eq!(ledger.available(), ResourceSet::new(1, 2, 0));

        ledger.release(&ResourceSet::new(1, 8, 1));
        assert_eq!(ledger.available(), ledger.total());
        assert!(ledger.in_use().is_empty());
    }

    #[test]
    fn test_infeasible_request_is_invalid() {
        let ledger = ResourceLedger::new(ResourceSet::new(1, 1, 1));
        let err = ledger.try_acquire(&ResourceSet::new(2, 0, 0)).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(ledger.available(), ledger.total());
    }

    #[test]
    fn test_concurrent_acquire_never_oversubscribes() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let ledger = Arc::new(ResourceLedger::new(ResourceSet::new(3, 0, 0)));
        let held = Arc::new(AtomicU64::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let held = Arc::clone(&held);
                std::thread::spawn(move || {
                    let one = ResourceSet::new(1, 0, 0);
                    for _ in 0..200 {
                        if ledger.try_acquire(&one).unwrap() {
                            let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                            assert!(now <= 3);
                            held.fetch_sub(1, Ordering::SeqCst);
                            ledger.release(&one);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(ledger.available(), ledger.total());
    }
}
