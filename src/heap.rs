//! Per thread heap.
//!
//! The heap routes allocations between the small fast free lists, the
//! per size class available pages, the per page type free page pools
//! and the spans backing them. A heap has at most one owner thread at
//! any instant; released heaps queue up under the global spin lock and
//! are inherited wholesale by the next claiming thread.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::init;
use crate::internal::{thread_id, wait_spin};
use crate::page::{page_allocate_block, page_block_start, page_deallocate_block};
use crate::size_class::{page_size_of, page_type_of, size_class_of, SIZE_CLASSES};
use crate::span::{span_allocate_page, span_get_page_from_block};
use crate::types::{
    Block, Heap, Page, PageType, Span, LARGE_BLOCK_SIZE_LIMIT, MAX_ALIGNMENT,
    MEDIUM_BLOCK_SIZE_LIMIT, REALLOC_GROW_OR_FAIL, REALLOC_NO_PRESERVE, SMALL_BLOCK_SIZE_LIMIT,
    SMALL_GRANULARITY, SPAN_HEADER_SIZE, SPAN_MASK, SPAN_SIZE,
};

// ------------------------------------------------------
// Global heap queue
// ------------------------------------------------------

/// Queue of released heaps, guarded by the heap lock.
static GLOBAL_HEAP_QUEUE: AtomicPtr<Heap> = AtomicPtr::new(ptr::null_mut());
/// Spin lock holding the owning thread ID.
static GLOBAL_HEAP_LOCK: AtomicUsize = AtomicUsize::new(0);
/// Heap ID counter.
static GLOBAL_HEAP_ID: AtomicU32 = AtomicU32::new(1);

fn heap_lock_acquire() {
    let this_lock = thread_id();
    while GLOBAL_HEAP_LOCK
        .compare_exchange_weak(0, this_lock, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        wait_spin();
    }
}

fn heap_lock_release() {
    debug_assert_eq!(
        GLOBAL_HEAP_LOCK.load(Ordering::Relaxed),
        thread_id(),
        "bad heap lock"
    );
    GLOBAL_HEAP_LOCK.store(0, Ordering::Release);
}

// ------------------------------------------------------
// Heap lifecycle
// ------------------------------------------------------

unsafe fn heap_initialize(block: *mut u8) -> *mut Heap {
    let heap = block as *mut Heap;
    ptr::write_bytes(block, 0, core::mem::size_of::<Heap>());
    (*heap).id = 1 + GLOBAL_HEAP_ID.fetch_add(1, Ordering::Relaxed);
    heap
}

unsafe fn heap_allocate_new() -> *mut Heap {
    let heap_size = crate::os::page_aligned_size(core::mem::size_of::<Heap>());
    let mut offset = 0;
    let mut mapped_size = 0;
    let interface = init::memory_interface();
    let block = (interface.memory_map)(heap_size, 0, &mut offset, &mut mapped_size);
    if block.is_null() {
        return ptr::null_mut();
    }
    let heap = heap_initialize(block);
    (*heap).offset = offset as u32;
    (*heap).mapped_size = mapped_size;
    heap
}

/// Acquire a heap for the calling thread: the static fallback heap if
/// still unclaimed, else the head of the free heap queue, else a fresh
/// mapping. The owner thread is stamped before the heap is returned.
pub unsafe fn heap_allocate() -> *mut Heap {
    let mut heap = init::claim_default_heap();
    if heap.is_null() {
        heap_lock_acquire();
        heap = GLOBAL_HEAP_QUEUE.load(Ordering::Relaxed);
        if !heap.is_null() {
            GLOBAL_HEAP_QUEUE.store((*heap).next, Ordering::Relaxed);
        }
        heap_lock_release();
    }
    if heap.is_null() {
        heap = heap_allocate_new();
    }
    if !heap.is_null() {
        (*heap).next = ptr::null_mut();
        (*heap).owner_thread.store(thread_id(), Ordering::Relaxed);
    }
    heap
}

/// Release a heap to the front of the free heap queue. The heap keeps
/// all attached spans, pages and cached blocks; the next claimer
/// inherits them.
pub unsafe fn heap_release(heap: *mut Heap) {
    heap_lock_acquire();
    (*heap).owner_thread.store(0, Ordering::Relaxed);
    (*heap).next = GLOBAL_HEAP_QUEUE.load(Ordering::Relaxed);
    GLOBAL_HEAP_QUEUE.store(heap, Ordering::Relaxed);
    heap_lock_release();
}

// ------------------------------------------------------
// Page selection
// ------------------------------------------------------

/// Re-stamp a free page with a new size class and link it as the head
/// available page for that class.
unsafe fn heap_make_free_page_available(heap: *mut Heap, size_class: u32, page: *mut Page) {
    (*page).size_class = size_class;
    (*page).block_size = SIZE_CLASSES[size_class as usize].block_size;
    (*page).block_count = SIZE_CLASSES[size_class as usize].block_count;
    (*page).block_used = 0;
    (*page).block_initialized = 0;
    (*page).local_free = ptr::null_mut();
    (*page).local_free_count = 0;
    (*page).thread_free.store(0, Ordering::Relaxed);
    (*page).is_full = false;
    (*page).is_free = false;
    (*page).is_available = true;
    // The page held live blocks in its previous life, its memory is no
    // longer known zero
    (*page).is_zero = false;
    (*page).has_aligned_block = false;
    let head = (*heap).page_available[size_class as usize];
    (*page).next = head;
    (*page).prev = ptr::null_mut();
    if !head.is_null() {
        (*head).prev = page;
    }
    (*heap).page_available[size_class as usize] = page;
}

/// Find or map a span for the given page type.
unsafe fn heap_get_span(heap: *mut Heap, page_type: PageType) -> *mut Span {
    // Fast path, a partially initialized span exists
    let partial = (*heap).span_partial[page_type.index()];
    if !partial.is_null() {
        return partial;
    }

    // Fallback path, map more memory
    let mut offset = 0;
    let mut mapped_size = 0;
    let interface = init::memory_interface();
    let span = (interface.memory_map)(SPAN_SIZE, SPAN_SIZE, &mut offset, &mut mapped_size)
        as *mut Span;
    if !span.is_null() {
        let page_size = page_size_of(page_type);
        (*span).page.page_type = page_type;
        (*span).page.is_zero = true;
        (*span).page.heap = heap;
        (*span).page_count = (SPAN_SIZE / page_size) as u32;
        (*span).page_initialized = 0;
        (*span).page_size = page_size;
        (*span).offset = offset as u32;
        (*span).mapped_size = mapped_size;

        (*heap).span_partial[page_type.index()] = span;
    }

    // Make sure the fallback heap has an owning thread
    if (*heap).owner_thread.load(Ordering::Relaxed) == 0 {
        (*heap).owner_thread.store(thread_id(), Ordering::Relaxed);
    }

    span
}

/// Find or create an available page for the given size class: the head
/// available page, a re-stamped free page, a page reclaimed from remote
/// drains, or a fresh page carved from a span.
unsafe fn heap_get_page(heap: *mut Heap, size_class: u32) -> *mut Page {
    // Fast path, available page for the size class
    let page = (*heap).page_available[size_class as usize];
    if !page.is_null() {
        return page;
    }

    // Check if there is a free page of the right type
    let page_type = page_type_of(size_class);
    let page = (*heap).page_free[page_type.index()];
    if !page.is_null() {
        (*heap).page_free[page_type.index()] = (*page).next;
        heap_make_free_page_available(heap, size_class, page);
        return page;
    }

    // Check for pages fully drained by other threads. The swap takes
    // the whole stack, concurrent pushes land on the cleared head
    let page = (*heap).page_free_thread[page_type.index()].swap(ptr::null_mut(), Ordering::Acquire);
    if !page.is_null() {
        (*heap).page_free[page_type.index()] = (*page).next;
        heap_make_free_page_available(heap, size_class, page);
        return page;
    }

    // Fallback path, find or map a span to carve a new page from
    let span = heap_get_span(heap, page_type);
    if !span.is_null() {
        let page = span_allocate_page(span, size_class);
        heap_make_free_page_available(heap, size_class, page);
        return page;
    }

    ptr::null_mut()
}

// ------------------------------------------------------
// Allocation
// ------------------------------------------------------

/// Find or allocate a block of the given size. Zeroing requests skip
/// the heap fast list, whose blocks are recycled without zeroing.
pub unsafe fn heap_allocate_block(heap: *mut Heap, size: usize, zero: bool) -> *mut u8 {
    if size <= LARGE_BLOCK_SIZE_LIMIT {
        // Fast track with a small block available in the heap level
        // free list
        let size_class = size_class_of(size);
        if size <= SMALL_BLOCK_SIZE_LIMIT && !zero {
            let block = (*heap).small_free[size_class as usize];
            if !block.is_null() {
                (*heap).small_free[size_class as usize] = (*block).next;
                return block as *mut u8;
            }
        }
        let page = heap_get_page(heap, size_class);
        if !page.is_null() {
            return page_allocate_block(page, zero);
        }
    } else {
        // Oversized block, map a span of its own, unmapped directly on
        // free. No heap is stamped, huge spans are never pooled
        let Some(total_size) = size.checked_add(SPAN_HEADER_SIZE) else {
            return ptr::null_mut();
        };
        let alloc_size = crate::os::page_aligned_size(total_size);
        let mut offset = 0;
        let mut mapped_size = 0;
        let interface = init::memory_interface();
        let span =
            (interface.memory_map)(alloc_size, SPAN_SIZE, &mut offset, &mut mapped_size) as *mut Span;
        if !span.is_null() {
            (*span).page.page_type = PageType::Huge;
            (*span).page_size = size;
            (*span).offset = offset as u32;
            (*span).mapped_size = mapped_size;
            return (span as *mut u8).add(SPAN_HEADER_SIZE);
        }
    }
    ptr::null_mut()
}

/// Allocate a block aligned to the given power of two. Alignments above
/// `MAX_ALIGNMENT` cannot honor the span mask contract on free and are
/// rejected.
pub unsafe fn heap_allocate_block_aligned(
    heap: *mut Heap,
    alignment: usize,
    size: usize,
    zero: bool,
) -> *mut u8 {
    if alignment <= SMALL_GRANULARITY {
        return heap_allocate_block(heap, size, zero);
    }
    if alignment & (alignment - 1) != 0 || alignment > MAX_ALIGNMENT {
        return ptr::null_mut();
    }
    debug_assert!(MAX_ALIGNMENT <= MEDIUM_BLOCK_SIZE_LIMIT);
    let Some(padded_size) = size.checked_add(alignment) else {
        return ptr::null_mut();
    };

    // Over-allocate and round up inside the block
    let align_mask = alignment - 1;
    let mut block = heap_allocate_block(heap, padded_size, zero);
    if block as usize & align_mask != 0 {
        block = ((block as usize & !align_mask) + alignment) as *mut u8;
        // Mark the page so the free path realigns interior pointers
        let span = (block as usize & SPAN_MASK) as *mut Span;
        let page = span_get_page_from_block(span, block);
        (*page).has_aligned_block = true;
    }
    block
}

// ------------------------------------------------------
// Reallocation
// ------------------------------------------------------

/// Resize a block, in place when it still fits. Growth over-allocates
/// by 37.5% of the old size to avoid hysteresis on repeated small
/// increases.
pub unsafe fn heap_reallocate_block(
    heap: *mut Heap,
    block: *mut u8,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    let mut old_size = old_size;
    if !block.is_null() {
        // Grab the span using the guaranteed span alignment
        let span = (block as usize & SPAN_MASK) as *mut Span;
        if (*span).page.page_type != PageType::Huge {
            let page = span_get_page_from_block(span, block);
            let blocks_start = page_block_start(page) as usize;
            let block_size = (*page).block_size as usize;
            let block_offset = block as usize - blocks_start;
            let block_origin = (blocks_start + (block_offset / block_size) * block_size) as *mut u8;
            if old_size == 0 {
                old_size = block_size - (block as usize - block_origin as usize);
            }
            if block_size >= size {
                // Still fits, but preserve data if the alignment shift
                // moved the pointer
                if block != block_origin && flags & REALLOC_NO_PRESERVE == 0 {
                    ptr::copy(block, block_origin, old_size);
                }
                return block_origin;
            }
        } else {
            let huge_block = (span as *mut u8).add(SPAN_HEADER_SIZE);
            let huge_size = (*span).page_size;
            if old_size == 0 {
                old_size = huge_size - (block as usize - huge_block as usize);
            }
            if huge_size >= size {
                if block != huge_block && flags & REALLOC_NO_PRESERVE == 0 {
                    ptr::copy(block, huge_block, old_size);
                }
                return huge_block;
            }
        }
    } else {
        old_size = 0;
    }

    if flags & REALLOC_GROW_OR_FAIL != 0 {
        return ptr::null_mut();
    }

    // Need a bigger block, allocate fresh and release the old one.
    // Avoid hysteresis by overallocating when the increase is small
    let lower_bound = old_size + (old_size >> 2) + (old_size >> 3);
    let new_size = if size > lower_bound {
        size
    } else if size > old_size {
        lower_bound
    } else {
        size
    };
    let old_block = block;
    let block = heap_allocate_block(heap, new_size, false);
    if !block.is_null() && !old_block.is_null() {
        if flags & REALLOC_NO_PRESERVE == 0 {
            ptr::copy_nonoverlapping(old_block, block, old_size.min(new_size));
        }
        block_deallocate(old_block);
    }
    block
}

/// Aligned resize. Keeps the block when both the alignment and size
/// already suffice and the size has not shrunk below half the usable
/// size.
pub unsafe fn heap_reallocate_block_aligned(
    heap: *mut Heap,
    block: *mut u8,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    if alignment <= SMALL_GRANULARITY {
        return heap_reallocate_block(heap, block, size, old_size, flags);
    }

    let no_alloc = flags & REALLOC_GROW_OR_FAIL != 0;
    let usable_size = if block.is_null() {
        0
    } else {
        block_usable_size(block)
    };
    if usable_size >= size && block as usize & (alignment - 1) == 0 {
        if no_alloc || size >= usable_size / 2 {
            return block;
        }
    }
    let old_block = block;
    let block = if no_alloc {
        ptr::null_mut()
    } else {
        heap_allocate_block_aligned(heap, alignment, size, false)
    };
    if !block.is_null() {
        if flags & REALLOC_NO_PRESERVE == 0 && !old_block.is_null() {
            let old_size = if old_size != 0 { old_size } else { usable_size };
            ptr::copy_nonoverlapping(old_block, block, old_size.min(size));
        }
        if !old_block.is_null() {
            block_deallocate(old_block);
        }
    }
    block
}

// ------------------------------------------------------
// Block entry points
// ------------------------------------------------------

/// Free a block given only its raw pointer, resolving span then page
/// through the span mask.
pub unsafe fn block_deallocate(block: *mut u8) {
    let span = (block as usize & SPAN_MASK) as *mut Span;
    if !span.is_null() {
        let page = span_get_page_from_block(span, block);
        page_deallocate_block(page, block as *mut Block);
    }
}

/// Usable bytes from the given pointer to the end of its block.
pub unsafe fn block_usable_size(block: *mut u8) -> usize {
    let span = (block as usize & SPAN_MASK) as *mut Span;
    let page = span_get_page_from_block(span, block);
    if (*page).page_type == PageType::Huge {
        return (*span).page_size;
    }
    let blocks_start = page_block_start(page) as usize;
    (*page).block_size as usize - ((block as usize - blocks_start) % (*page).block_size as usize)
}

/// Pointer into the page header region of the block's span, used by the
/// tests to validate structural invariants.
#[cfg(test)]
pub(crate) unsafe fn block_page(block: *mut u8) -> *mut Page {
    let span = (block as usize & SPAN_MASK) as *mut Span;
    span_get_page_from_block(span, block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_alloc_usable_size_matches_class() {
        unsafe {
            let heap = heap_allocate();
            assert!(!heap.is_null());
            let block = heap_allocate_block(heap, 32, false);
            assert!(!block.is_null());
            assert_eq!(block_usable_size(block), 32);
            let page = block_page(block);
            assert_eq!((*page).block_size, 32);
            assert!((*page).block_count > 0);
            block_deallocate(block);
        }
    }

    #[test]
    fn block_resolves_to_span_and_page() {
        unsafe {
            let heap = heap_allocate();
            let block = heap_allocate_block(heap, 128, false);
            assert!(!block.is_null());
            let span = (block as usize & SPAN_MASK) as *mut Span;
            assert_eq!(span as usize % SPAN_SIZE, 0);
            let page = block_page(block);
            assert!((*page).block_size as usize >= block_usable_size(block));
            block_deallocate(block);
        }
    }
}
