#![cfg(not(no_global_oom_handling))]

#[cfg(feature = "alloc")]
mod conformance {
    use crate::WheelAlloc;
    use allocator_api2_tests::make_test;
    make_test![
        test_sizes(WheelAlloc::new()),
        test_vec(WheelAlloc::new()),
        test_many_boxes(&WheelAlloc::new())
    ];
}

mod pool {
    use core::ptr::NonNull;

    use allocator_api2::alloc::Layout;

    use crate::{block::MAX_ALLOC_SIZE, WheelAlloc, ALIGN};

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 1).unwrap()
    }

    unsafe fn fill(p: NonNull<u8>, n: usize, tag: u8) {
        core::ptr::write_bytes(p.as_ptr(), tag, n);
    }

    unsafe fn check(p: NonNull<u8>, n: usize, tag: u8) {
        for i in 0..n {
            assert_eq!(p.as_ptr().add(i).read(), tag, "payload byte {} lost", i);
        }
    }

    #[test]
    fn zero_size_allocations() {
        let pool = WheelAlloc::new();
        let a = pool.allocate(layout(0)).unwrap().cast::<u8>();
        assert_eq!(a.as_ptr() as usize % ALIGN, 0);
        assert_eq!(pool.block_count(), 1);

        let b = pool.allocate(layout(0)).unwrap().cast::<u8>();
        for _ in 0..100 {
            let p = pool.allocate(layout(0)).unwrap().cast::<u8>();
            unsafe {
                pool.deallocate(p, layout(0));
            }
        }
        // Churning empty allocations never costs another block.
        assert_eq!(pool.block_count(), 1);

        unsafe {
            pool.deallocate(a, layout(0));
            pool.deallocate(b, layout(0));
        }
        pool.check_integrity();
    }

    #[test]
    fn exact_block_capacity() {
        let pool = WheelAlloc::new();
        let p = pool.allocate(layout(MAX_ALLOC_SIZE)).unwrap().cast::<u8>();
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.master_count(), 0);
        pool.check_integrity();

        let q = pool.allocate(layout(16)).unwrap().cast::<u8>();
        assert_eq!(pool.block_count(), 2);

        unsafe {
            pool.deallocate(p, layout(MAX_ALLOC_SIZE));
            pool.deallocate(q, layout(16));
        }
        pool.check_integrity();
    }

    #[test]
    fn jumbo_allocations() {
        let pool = WheelAlloc::new();
        let p = pool
            .allocate(layout(MAX_ALLOC_SIZE + 1))
            .unwrap()
            .cast::<u8>();
        assert_eq!(pool.block_count(), 1);
        pool.check_integrity();
        unsafe {
            pool.deallocate(p, layout(MAX_ALLOC_SIZE + 1));
        }
        // Jumbo blocks go straight back to the OS.
        assert_eq!(pool.block_count(), 0);

        let a = pool.allocate(layout(100)).unwrap().cast::<u8>();
        let j = pool
            .allocate(layout(MAX_ALLOC_SIZE + 123))
            .unwrap()
            .cast::<u8>();
        assert_eq!(pool.block_count(), 2);
        unsafe {
            pool.deallocate(j, layout(MAX_ALLOC_SIZE + 123));
        }
        assert_eq!(pool.block_count(), 1);
        unsafe {
            pool.deallocate(a, layout(100));
        }
        pool.check_integrity();
    }

    #[test]
    fn coalesce_both_directions() {
        let pool = WheelAlloc::new();
        let a = pool.allocate(layout(100)).unwrap().cast::<u8>();
        let b = pool.allocate(layout(100)).unwrap().cast::<u8>();
        unsafe {
            pool.deallocate(a, layout(100));
            pool.deallocate(b, layout(100));
        }
        // Both frees coalesced back into the pristine block tail.
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.master_count(), 1);
        assert_eq!(pool.recycler_count(), 0);
        assert_eq!(pool.master_head_payload(), Some(MAX_ALLOC_SIZE));
        pool.check_integrity();
    }

    #[test]
    fn reverse_free_reassembles_block() {
        let pool = WheelAlloc::new();
        let kib = 1024;
        let mut ptrs = std::vec::Vec::new();
        for _ in 0..10 {
            ptrs.push(pool.allocate(layout(kib)).unwrap().cast::<u8>());
        }
        for p in ptrs.into_iter().rev() {
            unsafe {
                pool.deallocate(p, layout(kib));
            }
        }
        pool.check_integrity();

        // Everything merged: ten chunks' worth is served without a second block.
        let big = pool.allocate(layout(10 * kib)).unwrap().cast::<u8>();
        assert_eq!(pool.block_count(), 1);
        unsafe {
            pool.deallocate(big, layout(10 * kib));
        }
        pool.check_integrity();
    }

    #[test]
    fn wheel_surfaces_largest() {
        let pool = WheelAlloc::new();

        // Free chunks of distinct sizes, kept apart by live spacers so they
        // cannot coalesce.
        let sizes = [256usize, 512, 1024, 2048, 4096];
        let mut frees = std::vec::Vec::new();
        let mut spacers = std::vec::Vec::new();
        for &s in &sizes {
            frees.push((pool.allocate(layout(s)).unwrap().cast::<u8>(), s));
            spacers.push(pool.allocate(layout(64)).unwrap().cast::<u8>());
        }
        for (p, s) in frees {
            unsafe {
                pool.deallocate(p, layout(s));
            }
        }
        pool.check_integrity();
        assert_eq!(pool.recycler_count(), sizes.len());
        assert_eq!(pool.recycler_head_payload(), Some(4096));

        // Serving from the head leaves its remainder in front; the wheel
        // turn run by the allocation brings the next-largest right back.
        let p = pool.allocate(layout(2048)).unwrap().cast::<u8>();
        assert_eq!(pool.recycler_head_payload(), Some(2048));

        // Once the largest chunk holds the head, it keeps it.
        for _ in 0..2 * sizes.len() {
            pool.cycle_once();
            assert_eq!(pool.recycler_head_payload(), Some(2048));
        }
        pool.check_integrity();

        unsafe {
            pool.deallocate(p, layout(2048));
            for s in spacers {
                pool.deallocate(s, layout(64));
            }
        }
        pool.check_integrity();
    }

    #[test]
    fn reset_restores_pristine_state() {
        let pool = WheelAlloc::new();
        let p = pool.allocate(layout(100)).unwrap().cast::<u8>();
        unsafe {
            pool.deallocate(p, layout(100));
            pool.reset();
        }
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.master_count(), 1);
        assert_eq!(pool.recycler_count(), 0);
        assert_eq!(pool.master_head_payload(), Some(MAX_ALLOC_SIZE));
        pool.check_integrity();

        // Same story with live allocations dropped wholesale.
        let _q = pool.allocate(layout(100)).unwrap();
        let _r = pool.allocate(layout(3000)).unwrap();
        unsafe {
            pool.reset();
        }
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.master_head_payload(), Some(MAX_ALLOC_SIZE));
        pool.check_integrity();
    }

    #[test]
    fn reset_then_flush_releases_everything() {
        let pool = WheelAlloc::new();
        let mut ptrs = std::vec::Vec::new();
        for i in 0..150 {
            ptrs.push(pool.allocate(layout(64 * 1024 + i)).unwrap());
        }
        let _jumbo = pool.allocate(layout(MAX_ALLOC_SIZE + 1)).unwrap();
        assert!(pool.block_count() > 1);

        unsafe {
            pool.reset();
        }
        // The jumbo went back with the reset; normal blocks wait for flush.
        pool.check_integrity();
        pool.flush();
        assert_eq!(pool.block_count(), 0);

        // The pool stays usable afterwards.
        let p = pool.allocate(layout(32)).unwrap().cast::<u8>();
        unsafe {
            pool.deallocate(p, layout(32));
        }
        pool.check_integrity();
    }

    #[test]
    fn flush_spares_live_blocks() {
        let pool = WheelAlloc::new();
        let keep = pool.allocate(layout(128)).unwrap().cast::<u8>();
        unsafe {
            fill(keep, 128, 0xa5);
        }
        // A second block, immediately emptied again.
        let big = pool.allocate(layout(MAX_ALLOC_SIZE)).unwrap().cast::<u8>();
        let gone = pool.allocate(layout(64)).unwrap().cast::<u8>();
        unsafe {
            pool.deallocate(big, layout(MAX_ALLOC_SIZE));
            pool.deallocate(gone, layout(64));
        }
        assert_eq!(pool.block_count(), 2);

        pool.flush();
        assert_eq!(pool.block_count(), 1);
        unsafe {
            check(keep, 128, 0xa5);
            pool.deallocate(keep, layout(128));
        }
        pool.check_integrity();
    }

    #[test]
    fn grow_in_place_preserves_contents() {
        let pool = WheelAlloc::new();
        let old = layout(100);
        let p = pool.allocate(old).unwrap().cast::<u8>();
        unsafe {
            fill(p, 100, 0x3c);
        }
        // The block tail sits right behind the chunk; growth is in place.
        let new = layout(200);
        let q = unsafe { pool.grow(p, old, new).unwrap() }.cast::<u8>();
        assert_eq!(q, p);
        unsafe {
            check(q, 100, 0x3c);
        }
        pool.check_integrity();
        unsafe {
            pool.deallocate(q, new);
        }
        pool.check_integrity();
    }

    #[test]
    fn grow_moves_when_neighbor_is_used() {
        let pool = WheelAlloc::new();
        let old = layout(100);
        let a = pool.allocate(old).unwrap().cast::<u8>();
        let b = pool.allocate(layout(100)).unwrap().cast::<u8>();
        unsafe {
            fill(a, 100, 0x77);
        }
        let new = layout(50_000);
        let q = unsafe { pool.grow(a, old, new).unwrap() }.cast::<u8>();
        assert_ne!(q, a);
        unsafe {
            check(q, 100, 0x77);
        }
        pool.check_integrity();
        unsafe {
            pool.deallocate(q, new);
            pool.deallocate(b, layout(100));
        }
        pool.check_integrity();
    }

    #[test]
    fn realloc_same_size_is_identity() {
        let pool = WheelAlloc::new();
        let l = layout(256);
        let p = pool.allocate(l).unwrap().cast::<u8>();
        let q = unsafe { pool.grow(p, l, l).unwrap() }.cast::<u8>();
        assert_eq!(q, p);
        let r = unsafe { pool.shrink(q, l, l).unwrap() }.cast::<u8>();
        assert_eq!(r, p);
        unsafe {
            pool.deallocate(r, l);
        }
        pool.check_integrity();
    }

    #[test]
    fn shrink_returns_tail_to_pool() {
        let pool = WheelAlloc::new();
        let old = layout(4096);
        let p = pool.allocate(old).unwrap().cast::<u8>();
        unsafe {
            fill(p, 64, 0x42);
        }
        let new = layout(64);
        let q = unsafe { pool.shrink(p, old, new).unwrap() }.cast::<u8>();
        assert_eq!(q, p);
        unsafe {
            check(q, 64, 0x42);
        }
        // The tail coalesced back into the master chunk behind it.
        assert_eq!(pool.master_head_payload(), Some(MAX_ALLOC_SIZE - 80));
        pool.check_integrity();
        unsafe {
            pool.deallocate(q, new);
        }
        pool.check_integrity();
    }

    #[test]
    fn jumbo_realloc_keeps_contents() {
        let pool = WheelAlloc::new();
        let old = layout(MAX_ALLOC_SIZE + 100);
        let p = pool.allocate(old).unwrap().cast::<u8>();
        unsafe {
            fill(p, 64, 0x5a);
        }

        let new = layout(2 * MAX_ALLOC_SIZE);
        let q = unsafe { pool.grow(p, old, new).unwrap() }.cast::<u8>();
        unsafe {
            check(q, 64, 0x5a);
        }
        assert_eq!(pool.block_count(), 1);
        pool.check_integrity();

        let smaller = layout(MAX_ALLOC_SIZE + 50);
        let r = unsafe { pool.shrink(q, new, smaller).unwrap() }.cast::<u8>();
        unsafe {
            check(r, 64, 0x5a);
        }
        pool.check_integrity();
        unsafe {
            pool.deallocate(r, smaller);
        }
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn over_aligned_requests_get_dedicated_blocks() {
        let pool = WheelAlloc::new();
        let l = Layout::from_size_align(64, 4096).unwrap();
        let p = pool.allocate(l).unwrap().cast::<u8>();
        assert_eq!(p.as_ptr() as usize % 4096, 0);
        assert_eq!(pool.block_count(), 1);
        pool.check_integrity();
        unsafe {
            pool.deallocate(p, l);
        }
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn tiny_free_neighbor_does_not_promote_master() {
        let pool = WheelAlloc::new();
        let a = pool.allocate(layout(100)).unwrap().cast::<u8>();
        let b = pool.allocate(layout(0)).unwrap().cast::<u8>();
        let c = pool.allocate(layout(100)).unwrap().cast::<u8>();

        // `b` is too small to track: it floats free outside both lists.
        unsafe {
            pool.deallocate(b, layout(0));
        }
        assert_eq!(pool.recycler_count(), 0);
        pool.check_integrity();

        // Freeing `a` absorbs the tiny chunk. The merge lands in the
        // recycler; the master head is untouched.
        let master = pool.master_head_payload();
        unsafe {
            pool.deallocate(a, layout(100));
        }
        assert_eq!(pool.master_head_payload(), master);
        assert_eq!(pool.recycler_count(), 1);
        assert_eq!(pool.recycler_head_payload(), Some(128));
        pool.check_integrity();

        unsafe {
            pool.deallocate(c, layout(100));
        }
        pool.check_integrity();
    }

    #[test]
    fn handles_share_one_pool() {
        let pool = WheelAlloc::new();
        let clone = pool.clone();
        assert!(pool == clone);

        let p = clone.allocate(layout(64)).unwrap().cast::<u8>();
        drop(pool);
        unsafe {
            clone.deallocate(p, layout(64));
        }
        clone.check_integrity();
    }

    #[test]
    fn random_operation_mix_holds_invariants() {
        let pool = WheelAlloc::new();

        let mut state = 0x9e3779b97f4a7c15u64;
        let mut rng = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut live: std::vec::Vec<(NonNull<u8>, Layout, u8)> = std::vec::Vec::new();

        for i in 0..4000u32 {
            let roll = rng() % 100;
            if roll < 55 || live.is_empty() {
                let size = if rng() % 499 == 0 {
                    MAX_ALLOC_SIZE + (rng() % 100) as usize
                } else {
                    (rng() % 5000) as usize
                };
                let align = match rng() % 10 {
                    0 => 64,
                    1 | 2 => 16,
                    _ => 1,
                };
                let l = Layout::from_size_align(size, align).unwrap();
                let p = pool.allocate(l).unwrap().cast::<u8>();
                let tag = (rng() % 256) as u8;
                unsafe {
                    fill(p, size.min(64), tag);
                }
                live.push((p, l, tag));
            } else if roll < 85 {
                let idx = (rng() % live.len() as u64) as usize;
                let (p, l, tag) = live.swap_remove(idx);
                unsafe {
                    check(p, l.size().min(64), tag);
                    pool.deallocate(p, l);
                }
            } else if roll < 93 {
                let idx = (rng() % live.len() as u64) as usize;
                let (p, l, tag) = live[idx];
                let new_size = (rng() % 6000) as usize;
                let new_l = Layout::from_size_align(new_size, l.align()).unwrap();
                let q = unsafe {
                    if new_size >= l.size() {
                        pool.grow(p, l, new_l).unwrap()
                    } else {
                        pool.shrink(p, l, new_l).unwrap()
                    }
                }
                .cast::<u8>();
                unsafe {
                    check(q, l.size().min(new_size).min(64), tag);
                    fill(q, new_size.min(64), tag);
                }
                live[idx] = (q, new_l, tag);
            } else if roll < 97 {
                pool.flush();
            } else {
                unsafe {
                    pool.reset();
                }
                live.clear();
            }

            if i % 64 == 0 {
                pool.check_integrity();
            }
        }

        for (p, l, tag) in live.drain(..) {
            unsafe {
                check(p, l.size().min(64), tag);
                pool.deallocate(p, l);
            }
        }
        pool.check_integrity();
        unsafe {
            pool.reset();
        }
        pool.flush();
        assert_eq!(pool.block_count(), 0);
    }
}
