//! # Allocator Behavior Tests
//!
//! Black-box tests of the chain allocator through the public manager API:
//! split and coalesce round trips, growth into new segments, pointer
//! stability across growth, and cross-chain pointer rejection.

use std::mem::size_of;

use mmarena::{
    ArenaError, ChainPtr, Manager, ALLOCATOR_HEADER_SIZE, BASE_SIZE, BLOCK_ALIGN,
    BLOCK_HEADER_SIZE,
};

fn manager() -> &'static Manager {
    Manager::global()
}

/// Position and size of the single free block in a fresh prefix-less chain.
fn pristine_free_list() -> Vec<(u64, u64)> {
    let first_block = ALLOCATOR_HEADER_SIZE;
    vec![(first_block, BASE_SIZE - first_block - BLOCK_HEADER_SIZE)]
}

mod split_and_coalesce {
    use super::*;

    #[test]
    fn freeing_everything_restores_one_spanning_block() {
        let chain = manager().create_chain(b"").unwrap();

        let a = manager().allocate_from(chain, 100).unwrap();
        let b = manager().allocate_from(chain, 200).unwrap();
        manager().deallocate(a).unwrap();
        manager().deallocate(b).unwrap();

        assert_eq!(manager().free_blocks(chain).unwrap(), pristine_free_list());

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn free_order_does_not_matter() {
        let chain = manager().create_chain(b"").unwrap();

        let a = manager().allocate_from(chain, 64).unwrap();
        let b = manager().allocate_from(chain, 128).unwrap();
        let c = manager().allocate_from(chain, 256).unwrap();
        manager().deallocate(b).unwrap();
        manager().deallocate(c).unwrap();
        manager().deallocate(a).unwrap();

        assert_eq!(manager().free_blocks(chain).unwrap(), pristine_free_list());

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn interior_free_leaves_a_sorted_two_block_list() {
        let chain = manager().create_chain(b"").unwrap();

        let _a = manager().allocate_from(chain, 64).unwrap();
        let b = manager().allocate_from(chain, 64).unwrap();
        let _c = manager().allocate_from(chain, 64).unwrap();
        manager().deallocate(b).unwrap();

        let free = manager().free_blocks(chain).unwrap();
        assert_eq!(free.len(), 2);
        assert!(free[0].0 < free[1].0);
        assert_eq!(free[0].1, 64);

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn exact_fit_reuses_the_freed_block() {
        let chain = manager().create_chain(b"").unwrap();

        let a = manager().allocate_from(chain, 64).unwrap();
        manager().deallocate(a).unwrap();
        let b = manager().allocate_from(chain, 64).unwrap();

        assert_eq!(a, b);

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn boundary_fit_splits_off_an_empty_block() {
        let chain = manager().create_chain(b"").unwrap();
        let whole = BASE_SIZE - ALLOCATOR_HEADER_SIZE - BLOCK_HEADER_SIZE;

        // The leftover is exactly one block header, which is just enough
        // to split: a zero-capacity block stays on the list and merges
        // back once a neighbour is freed.
        let request = whole - BLOCK_HEADER_SIZE;
        let a = manager().allocate_from(chain, request).unwrap();

        let tail = ALLOCATOR_HEADER_SIZE + BLOCK_HEADER_SIZE + request;
        assert_eq!(manager().free_blocks(chain).unwrap(), vec![(tail, 0)]);

        manager().deallocate(a).unwrap();
        assert_eq!(manager().free_blocks(chain).unwrap(), pristine_free_list());

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn near_fit_hands_out_the_whole_block_without_splitting() {
        let chain = manager().create_chain(b"").unwrap();
        let whole = BASE_SIZE - ALLOCATOR_HEADER_SIZE - BLOCK_HEADER_SIZE;

        // One granule past the boundary: the leftover cannot hold a block
        // header, so the whole block is handed out.
        manager()
            .allocate_from(chain, whole - BLOCK_HEADER_SIZE + BLOCK_ALIGN)
            .unwrap();

        assert_eq!(manager().free_blocks(chain).unwrap(), vec![]);

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn block_accounting_tiles_the_whole_chain() {
        let chain = manager().create_chain(b"").unwrap();

        let kept: Vec<_> = [40u64, 80, 120]
            .iter()
            .map(|&n| (manager().allocate_from(chain, n).unwrap(), n))
            .collect();
        let dropped = manager().allocate_from(chain, 56).unwrap();
        manager().deallocate(dropped).unwrap();

        let allocated: u64 = kept
            .iter()
            .map(|&(_, n)| BLOCK_HEADER_SIZE + n.div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN)
            .sum();
        let free: u64 = manager()
            .free_blocks(chain)
            .unwrap()
            .iter()
            .map(|&(_, size)| BLOCK_HEADER_SIZE + size)
            .sum();

        assert_eq!(
            ALLOCATOR_HEADER_SIZE + allocated + free,
            manager().chain_size(chain).unwrap()
        );

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn allocated_regions_never_overlap() {
        let chain = manager().create_chain(b"").unwrap();

        let mut regions: Vec<(u64, u64)> = Vec::new();
        for n in [24u64, 100, 8, 500, 64, 2000, 16] {
            let addr = manager().allocate_from(chain, n).unwrap();
            let (_, position) = manager().chain_and_position(addr, n).unwrap();
            regions.push((position, n));
        }

        regions.sort();
        for pair in regions.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }

        manager().destroy_chain(chain).unwrap();
    }
}

mod growth {
    use super::*;

    #[test]
    fn oversized_allocation_adds_a_second_segment() {
        let chain = manager().create_chain(b"").unwrap();

        let p = manager().allocate_from(chain, 2000).unwrap();

        assert!(
            manager().chain_size(chain).unwrap()
                >= BASE_SIZE + 2000 + 2 * BLOCK_HEADER_SIZE
        );
        let segments = manager().segments(chain).unwrap();
        assert_eq!(segments.len(), 2);

        let (_, position) = manager().chain_and_position(p, 2000).unwrap();
        assert!(position >= segments[1].0);

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn chain_size_never_shrinks() {
        let chain = manager().create_chain(b"").unwrap();

        let mut last = manager().chain_size(chain).unwrap();
        for _ in 0..4 {
            let addr = manager().allocate_from(chain, 3000).unwrap();
            let size = manager().chain_size(chain).unwrap();
            assert!(size >= last);
            last = size;

            manager().deallocate(addr).unwrap();
            assert_eq!(manager().chain_size(chain).unwrap(), size);
        }

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn growth_never_merges_blocks_across_segments() {
        let chain = manager().create_chain(b"").unwrap();

        // Fill segment 0, grow twice, then free everything.
        let fills: Vec<_> = (0..3)
            .map(|_| manager().allocate_from(chain, 900).unwrap())
            .collect();
        for addr in fills {
            manager().deallocate(addr).unwrap();
        }

        let segments = manager().segments(chain).unwrap();
        let free = manager().free_blocks(chain).unwrap();
        assert_eq!(free.len(), segments.len());
        for (&(seg_start, seg_len), &(block, size)) in segments.iter().zip(&free) {
            let lead = if seg_start == 0 { ALLOCATOR_HEADER_SIZE } else { 0 };
            assert_eq!(block, seg_start + lead);
            assert_eq!(size, seg_len - lead - BLOCK_HEADER_SIZE);
        }

        manager().destroy_chain(chain).unwrap();
    }
}

mod pointer_stability {
    use super::*;

    #[test]
    fn stored_pointers_survive_growth() {
        let chain = manager().create_chain(b"").unwrap();

        let value = manager().allocate_from(chain, 8).unwrap() as *mut u64;
        // SAFETY: freshly allocated, 8 bytes, exclusively ours.
        unsafe { value.write_unaligned(0xFEED_F00D) };

        let cell = manager()
            .allocate_from(chain, size_of::<ChainPtr<u64>>() as u64)
            .unwrap() as *mut ChainPtr<u64>;
        // SAFETY: freshly allocated cell of pointer size.
        unsafe {
            cell.write(ChainPtr::NULL);
            (*cell).set(value as *const u64).unwrap();
        }

        // Force growth into a new segment.
        manager().allocate_from(chain, 8 * BASE_SIZE).unwrap();
        assert!(manager().segments(chain).unwrap().len() >= 2);

        // SAFETY: the cell address is stable; set/deref go through the
        // manager.
        let resolved = unsafe { (*cell).deref().unwrap() };
        assert_eq!(resolved.as_ptr() as usize, value as usize);
        // SAFETY: resolved points at the u64 written above.
        unsafe { assert_eq!(resolved.as_ptr().read_unaligned(), 0xFEED_F00D) };

        manager().destroy_chain(chain).unwrap();
    }

    #[test]
    fn back_references_between_allocations_stay_paired() {
        let chain = manager().create_chain(b"").unwrap();

        let a = manager()
            .allocate_from(chain, size_of::<ChainPtr<u8>>() as u64)
            .unwrap() as *mut ChainPtr<u8>;
        let b = manager()
            .allocate_from(chain, size_of::<ChainPtr<u8>>() as u64)
            .unwrap() as *mut ChainPtr<u8>;

        // SAFETY: a and b are fresh pointer-sized allocations in the chain.
        unsafe {
            a.write(ChainPtr::NULL);
            b.write(ChainPtr::NULL);
            (*a).set(b as *const u8).unwrap();
            (*b).set(a as *const u8).unwrap();
        }

        manager().allocate_from(chain, 8 * BASE_SIZE).unwrap();

        // SAFETY: both cells remain mapped at their original addresses.
        unsafe {
            assert_eq!((*a).deref().unwrap().as_ptr() as usize, b as usize);
            assert_eq!((*b).deref().unwrap().as_ptr() as usize, a as usize);
        }

        manager().destroy_chain(chain).unwrap();
    }
}

mod chain_isolation {
    use super::*;

    #[test]
    fn pointer_cannot_target_another_chain() {
        let here = manager().create_chain(b"").unwrap();
        let there = manager().create_chain(b"").unwrap();

        let cell = manager()
            .allocate_from(here, size_of::<ChainPtr<u8>>() as u64)
            .unwrap() as *mut ChainPtr<u8>;
        let foreign = manager().allocate_from(there, 8).unwrap();

        // SAFETY: cell is a fresh in-chain allocation of pointer size.
        let err = unsafe {
            cell.write(ChainPtr::NULL);
            (*cell).set(foreign as *const u8).unwrap_err()
        };

        assert!(matches!(
            err.downcast_ref::<ArenaError>(),
            Some(ArenaError::ChainMismatch { pointer_chain, target_chain })
                if *pointer_chain == here && *target_chain == there
        ));

        manager().destroy_chain(there).unwrap();
        manager().destroy_chain(here).unwrap();
    }

    #[test]
    fn allocate_from_same_chain_follows_the_address() {
        let first = manager().create_chain(b"").unwrap();
        let second = manager().create_chain(b"").unwrap();

        let anchor = manager().allocate_from(second, 16).unwrap();
        let neighbour = manager().allocate_from_same_chain(anchor, 16).unwrap();

        assert_eq!(manager().chain_of(neighbour), second);
        assert_ne!(manager().chain_of(neighbour), first);

        manager().destroy_chain(second).unwrap();
        manager().destroy_chain(first).unwrap();
    }
}

mod contention {
    use super::*;

    #[test]
    fn concurrent_allocators_leave_a_consistent_chain() {
        let chain = manager().create_chain(b"").unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut held: Vec<usize> = Vec::new();
                    for _ in 0..50 {
                        let addr = manager().allocate_from(chain, 64).unwrap();
                        held.push(addr as usize);
                    }
                    for addr in held {
                        manager().deallocate(addr as *mut u8).unwrap();
                    }
                });
            }
        });

        // Everything was freed, so each segment is one free block again.
        let segments = manager().segments(chain).unwrap();
        let free = manager().free_blocks(chain).unwrap();
        assert_eq!(free.len(), segments.len());
        let reclaimed: u64 = free
            .iter()
            .map(|&(_, size)| size + BLOCK_HEADER_SIZE)
            .sum();
        assert_eq!(
            reclaimed + ALLOCATOR_HEADER_SIZE,
            manager().chain_size(chain).unwrap()
        );

        manager().destroy_chain(chain).unwrap();
    }
}
