//! Identity types for the pipeline system.
//!
//! `PacketId` pairs a packet-table slot with a generation so a stale handle
//! cannot observe the packet that later reuses its slot. `StageId` and
//! `WorkerId` are plain `u32` newtypes used as array indices.

use std::fmt;

/// Slot index + generation into the dispatcher's packet table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketId {
    pub slot: u32,
    pub generation: u32,
}

impl PacketId {
    pub const INVALID: PacketId = PacketId {
        slot: u32::MAX,
        generation: 0,
    };

    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.slot != u32::MAX
    }

    #[inline]
    pub fn index(self) -> usize {
        self.slot as usize
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            write!(f, "PacketId(INVALID)")
        } else {
            write!(f, "PacketId({}v{})", self.slot, self.generation)
        }
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity of a stage instance. Survives across the packets it runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageId(pub u32);

impl StageId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StageId({})", self.0)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Index of a dispatcher worker thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WorkerId(pub u32);

impl WorkerId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id() {
        let id = PacketId::new(3, 7);
        assert!(id.is_valid());
        assert_eq!(id.index(), 3);
        assert!(!PacketId::INVALID.is_valid());
        assert_eq!(format!("{id}"), "PacketId(3v7)");
    }

    #[test]
    fn test_generation_distinguishes_reused_slot() {
        assert_ne!(PacketId::new(0, 1), PacketId::new(0, 2));
    }

    #[test]
    fn test_stage_and_worker_ids() {
        assert_eq!(StageId(5).index(), 5);
        assert_eq!(format!("{:?}", WorkerId(2)), "WorkerId(2)");
    }
}
