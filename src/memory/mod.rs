//! Memory primitives: growable regions, the lock-free index free-list and
//! the block pool built from the two.

pub mod free_list;
pub mod pool;
pub mod region;

pub use free_list::IndexFreeList;
pub use pool::{BlockPool, PoolBlock};
pub use region::{page_size, MemoryRegion, MAX_REGION_SIZE};
