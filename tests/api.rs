//! Explicit allocation API tests, covering the round-trip and
//! end-to-end behaviors without installing the global allocator.

use spanalloc::{
    allocate, allocate_aligned, allocate_zeroed, deallocate, reallocate, reallocate_aligned,
    usable_size, REALLOC_GROW_OR_FAIL,
};

#[test]
fn small_fixed_churn() {
    unsafe {
        let marker = std::process::id() as u8;
        let mut blocks = Vec::with_capacity(1024);
        for _ in 0..1024 {
            let block = allocate(32);
            assert!(!block.is_null());
            assert_eq!(usable_size(block), 32);
            block.write_bytes(marker, 32);
            blocks.push(block);
        }
        for &block in &blocks {
            assert_eq!(*block, marker);
            assert_eq!(*block.add(31), marker);
        }
        for block in blocks {
            deallocate(block);
        }
    }
}

#[test]
fn zeroed_allocation_is_zero() {
    unsafe {
        let block = allocate_zeroed(3, 75);
        assert!(!block.is_null());
        assert!(usable_size(block) >= 225);
        for offset in 0..225 {
            assert_eq!(*block.add(offset), 0, "dirty byte at {}", offset);
        }
        deallocate(block);
    }
}

#[test]
fn zeroed_allocation_after_dirty_reuse() {
    unsafe {
        // Dirty a block, free it, then demand zeroed memory of the same
        // class; the recycled block must be cleared
        for _ in 0..64 {
            let dirty = allocate(64);
            assert!(!dirty.is_null());
            dirty.write_bytes(0xA5, 64);
            deallocate(dirty);
            let clean = allocate_zeroed(1, 64);
            assert!(!clean.is_null());
            for offset in 0..64 {
                assert_eq!(*clean.add(offset), 0);
            }
            deallocate(clean);
        }
    }
}

#[test]
fn zeroed_allocation_overflow_fails() {
    unsafe {
        let block = allocate_zeroed(usize::MAX, 2);
        assert!(block.is_null());
    }
}

#[test]
fn aligned_allocation() {
    unsafe {
        let block = allocate_aligned(4096, 873);
        assert!(!block.is_null());
        assert_eq!(block as usize % 4096, 0);
        assert!(usable_size(block) >= 873);
        block.write_bytes(0x3C, 873);
        assert_eq!(*block.add(872), 0x3C);
        deallocate(block);
    }
}

#[test]
fn aligned_allocation_all_powers() {
    unsafe {
        let mut alignment = 32;
        while alignment <= 256 * 1024 {
            let block = allocate_aligned(alignment, alignment / 2 + 9);
            assert!(!block.is_null(), "alignment {} failed", alignment);
            assert_eq!(block as usize % alignment, 0);
            assert!(usable_size(block) >= alignment / 2 + 9);
            deallocate(block);
            alignment *= 2;
        }
    }
}

#[test]
fn aligned_allocation_rejects_bad_alignment() {
    unsafe {
        // Above the supported maximum
        assert!(allocate_aligned(512 * 1024, 64).is_null());
        // Not a power of two
        assert!(allocate_aligned(48, 64).is_null());
    }
}

#[test]
fn realloc_growth_preserves_contents() {
    unsafe {
        let pattern: Vec<u8> = (0..64u8).collect();
        let mut block = allocate(64);
        assert!(!block.is_null());
        std::ptr::copy_nonoverlapping(pattern.as_ptr(), block, 64);

        let mut size = 128;
        for _ in 0..20 {
            block = reallocate(block, size);
            assert!(!block.is_null(), "realloc to {} failed", size);
            assert!(usable_size(block) >= size, "usable below {} after realloc", size);
            for (offset, &expected) in pattern.iter().enumerate() {
                assert_eq!(*block.add(offset), expected, "pattern lost at {}", offset);
            }
            size *= 2;
        }
        deallocate(block);
    }
}

#[test]
fn realloc_in_place_when_it_fits() {
    unsafe {
        let block = allocate(200);
        assert!(!block.is_null());
        let fits = usable_size(block);
        assert!(fits >= 200);
        let same = reallocate(block, fits);
        assert_eq!(same, block);
        let shrunk = reallocate(same, 10);
        assert_eq!(shrunk, block);
        deallocate(shrunk);
    }
}

#[test]
fn realloc_null_allocates() {
    unsafe {
        let block = reallocate(std::ptr::null_mut(), 100);
        assert!(!block.is_null());
        assert!(usable_size(block) >= 100);
        deallocate(block);
    }
}

#[test]
fn realloc_grow_or_fail_stays_put() {
    unsafe {
        let block = allocate(100);
        assert!(!block.is_null());
        let moved = reallocate_aligned(block, 16, 1024 * 1024, 0, REALLOC_GROW_OR_FAIL);
        assert!(moved.is_null());
        // Original block is untouched and still usable
        *block = 77;
        assert_eq!(*block, 77);
        deallocate(block);
    }
}

#[test]
fn aligned_realloc_keeps_aligned_block() {
    unsafe {
        let block = allocate_aligned(256, 300);
        assert!(!block.is_null());
        assert_eq!(block as usize % 256, 0);
        block.write_bytes(0x11, 300);
        // Same size and alignment already satisfied, block stays
        let kept = reallocate_aligned(block, 256, 300, 300, 0);
        assert_eq!(kept, block);
        // Growth must keep the alignment and the contents
        let grown = reallocate_aligned(kept, 256, 4000, 300, 0);
        assert!(!grown.is_null());
        assert_eq!(grown as usize % 256, 0);
        for offset in 0..300 {
            assert_eq!(*grown.add(offset), 0x11);
        }
        deallocate(grown);
    }
}

#[test]
fn null_free_and_usable_size() {
    unsafe {
        deallocate(std::ptr::null_mut());
        assert_eq!(usable_size(std::ptr::null_mut()), 0);
    }
}

#[test]
fn zero_size_allocation() {
    unsafe {
        let block = allocate(0);
        assert!(!block.is_null());
        assert!(usable_size(block) >= 1);
        deallocate(block);
    }
}

#[test]
fn medium_and_large_classes() {
    unsafe {
        for size in [5 * 1024, 100 * 1024, 256 * 1024, 1024 * 1024, 8 * 1024 * 1024] {
            let block = allocate(size);
            assert!(!block.is_null(), "allocation of {} failed", size);
            assert!(usable_size(block) >= size);
            // Touch both ends
            *block = 1;
            *block.add(size - 1) = 2;
            assert_eq!(*block, 1);
            assert_eq!(*block.add(size - 1), 2);
            deallocate(block);
        }
    }
}

#[test]
fn usable_size_is_tight() {
    unsafe {
        // The serving class is the smallest that fits
        for (size, expected) in [(1, 16), (16, 16), (17, 32), (160, 160), (161, 192)] {
            let block = allocate(size);
            assert!(!block.is_null());
            assert_eq!(usable_size(block), expected, "size {}", size);
            deallocate(block);
        }
    }
}

#[test]
fn many_classes_round_robin() {
    unsafe {
        let sizes = [8, 24, 56, 120, 250, 500, 1000, 2000, 4000, 8000, 16000, 64000];
        let mut live: Vec<(*mut u8, usize)> = Vec::new();
        for round in 0..32 {
            for &size in &sizes {
                let block = allocate(size);
                assert!(!block.is_null());
                *block = round as u8;
                live.push((block, size));
            }
            if round % 3 == 0 {
                for (block, _) in live.drain(..sizes.len() / 2) {
                    deallocate(block);
                }
            }
        }
        for (block, _) in live {
            deallocate(block);
        }
    }
}
