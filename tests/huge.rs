//! Huge allocations map a span of their own and release it immediately
//! on free, from any thread.
//!
//! Kept as the only test in this binary so the global map counters are
//! not disturbed by concurrent tests.

use spanalloc::{allocate, deallocate, usable_size};

const SPAN_SIZE: usize = 256 * 1024 * 1024;
const SPAN_HEADER_SIZE: usize = 128;

#[test]
fn huge_allocation_lifecycle() {
    const SIZE: usize = 32 * 1024 * 1024;
    unsafe {
        let before = spanalloc::global_statistics();

        let block = allocate(SIZE);
        assert!(!block.is_null());
        // The block sits just past the span header of a naturally
        // aligned span
        assert_eq!(block as usize & (SPAN_SIZE - 1), SPAN_HEADER_SIZE);
        assert!(usable_size(block) >= SIZE);

        // Touch a few spots across the whole range
        *block = 1;
        *block.add(SIZE / 2) = 2;
        *block.add(SIZE - 1) = 3;
        assert_eq!(*block, 1);
        assert_eq!(*block.add(SIZE / 2), 2);
        assert_eq!(*block.add(SIZE - 1), 3);

        let mapped_while_live = spanalloc::global_statistics().mapped;
        assert!(mapped_while_live >= before.mapped + SIZE);

        deallocate(block);
        let after_local_free = spanalloc::global_statistics();
        assert!(
            after_local_free.mapped < mapped_while_live,
            "huge span still mapped after free"
        );

        // A huge block freed by another thread unmaps just the same
        let block = allocate(SIZE);
        assert!(!block.is_null());
        *block.add(SIZE - 1) = 9;
        let mapped_while_live = spanalloc::global_statistics().mapped;
        let address = block as usize;
        std::thread::spawn(move || {
            deallocate(address as *mut u8);
        })
        .join()
        .unwrap();
        let after_remote_free = spanalloc::global_statistics();
        assert!(after_remote_free.mapped < mapped_while_live);
    }
}
