//! Region growth and concurrent block recycling

use proptest::prelude::*;
use stageflow::memory::{page_size, BlockPool, IndexFreeList, MemoryRegion};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Barrier};

#[test]
fn test_region_commit_preserves_prefix() {
    let page = page_size();
    let mut region = MemoryRegion::reserve(16 * page, page).unwrap();
    region.commit(page + 10).unwrap();
    for (i, b) in region.as_mut_slice().iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    region.commit(5 * page).unwrap();
    assert_eq!(region.committed(), 5 * page);
    let slice = region.as_slice();
    assert!((0..page + 10).all(|i| slice[i] == (i % 251) as u8));
    assert!(slice[page + 10..].iter().all(|&b| b == 0));
}

#[test]
fn test_region_ceiling_is_resource_exhausted() {
    let page = page_size();
    let mut region = MemoryRegion::reserve(4 * page, page).unwrap();
    region.ensure_capacity(4 * page).unwrap();
    let err = region.ensure_capacity(4 * page + 1).unwrap_err();
    assert!(err.is_resource_exhausted());
    assert_eq!(region.committed(), 4 * page);
}

#[test]
fn test_aligned_reservation() {
    let align = 4 * 1024 * 1024;
    let region = MemoryRegion::reserve(page_size(), align).unwrap();
    assert_eq!(region.as_ptr() as usize % align, 0);
    assert_eq!(region.capacity(), align);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_ensure_capacity_bounds(pages in 1usize..64, requests in prop::collection::vec(1usize..64 * 4096, 1..8)) {
        let page = page_size();
        let mut region = MemoryRegion::reserve(pages * page, page).unwrap();
        for req in requests {
            let before = region.committed();
            match region.ensure_capacity(req) {
                Ok(()) => {
                    prop_assert!(region.committed() >= req);
                    prop_assert!(region.committed() >= before);
                    prop_assert!(region.committed() <= region.capacity());
                }
                Err(e) => {
                    prop_assert!(req > region.capacity());
                    prop_assert!(e.is_resource_exhausted());
                    prop_assert_eq!(region.committed(), before);
                }
            }
        }
    }
}

#[test]
fn test_free_list_each_push_popped_once() {
    const THREADS: usize = 8;
    const CAPACITY: u32 = 64;
    const ROUNDS: usize = 5_000;

    let list = Arc::new(IndexFreeList::with_all_free(CAPACITY));
    let owners: Arc<Vec<AtomicU8>> = Arc::new((0..CAPACITY).map(|_| AtomicU8::new(0)).collect());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let list = Arc::clone(&list);
            let owners = Arc::clone(&owners);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let mut held = Vec::new();
                for round in 0..ROUNDS {
                    if let Some(idx) = list.pop() {
                        let prev = owners[idx as usize].fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "index {idx} handed out twice");
                        held.push(idx);
                    }
                    if round % 3 == 0 || held.len() > 4 {
                        if let Some(idx) = held.pop() {
                            owners[idx as usize].fetch_sub(1, Ordering::SeqCst);
                            list.push(idx);
                        }
                    }
                }
                for idx in held {
                    owners[idx as usize].fetch_sub(1, Ordering::SeqCst);
                    list.push(idx);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut seen = HashSet::new();
    while let Some(idx) = list.pop() {
        assert!(seen.insert(idx), "index {idx} present twice");
    }
    assert_eq!(seen.len(), CAPACITY as usize);
}

#[test]
fn test_pool_blocks_never_shared() {
    const THREADS: usize = 6;
    let pool = BlockPool::new(256, 4).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    if let Some(mut block) = pool.checkout().unwrap() {
                        block.fill(t as u8);
                        std::thread::yield_now();
                        assert!(block.iter().all(|&b| b == t as u8));
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(pool.checked_out(), 0);
    assert!(pool.minted() <= 4);
}
