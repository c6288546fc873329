//! Page level block management.
//!
//! A page hands out equal sized blocks of one size class. The owning
//! heap mutates the local free list, counters and flags without
//! synchronization; any other thread may only push onto the atomic
//! `thread_free` token, a packed (length, block index) pair updated by
//! compare exchange.

use core::ptr;
use core::sync::atomic::Ordering;

use crate::internal::{report_corruption, thread_id, wait_spin};
use crate::os;
use crate::types::{
    Block, Heap, Page, PageType, Span, LARGE_PAGE_SIZE, MEDIUM_PAGE_SIZE, PAGE_HEADER_SIZE,
    SMALL_PAGE_SIZE, SMALL_SIZE_CLASS_COUNT, SPAN_MASK, SPAN_SIZE,
};

#[inline]
pub unsafe fn page_get_span(page: *mut Page) -> *mut Span {
    (page as usize & SPAN_MASK) as *mut Span
}

#[inline]
pub unsafe fn page_get_size(page: *mut Page) -> usize {
    match (*page).page_type {
        PageType::Small => SMALL_PAGE_SIZE,
        PageType::Medium => MEDIUM_PAGE_SIZE,
        PageType::Large => LARGE_PAGE_SIZE,
        PageType::Huge => (*page_get_span(page)).page_size,
    }
}

#[inline]
pub unsafe fn page_block_start(page: *mut Page) -> *mut Block {
    (page as *mut u8).add(PAGE_HEADER_SIZE) as *mut Block
}

#[inline]
pub unsafe fn page_block(page: *mut Page, block_index: u32) -> *mut Block {
    (page as *mut u8).add(PAGE_HEADER_SIZE + ((*page).block_size * block_index) as usize)
        as *mut Block
}

#[inline]
pub unsafe fn page_block_index(page: *mut Page, block: *mut Block) -> u32 {
    let block_first = page_block_start(page);
    ((block as usize - block_first as usize) / (*page).block_size as usize) as u32
}

/// Realign an interior pointer of an aligned block to the block start.
#[inline]
pub unsafe fn page_block_realign(page: *mut Page, block: *mut Block) -> *mut Block {
    let blocks_start = page_block_start(page);
    let block_offset = block as usize - blocks_start as usize;
    (block as *mut u8).sub(block_offset % (*page).block_size as usize) as *mut Block
}

// ------------------------------------------------------
// Thread free token
// ------------------------------------------------------

#[inline]
fn thread_free_encode(block_index: u32, list_size: u32) -> u64 {
    ((list_size as u64) << 32) | (block_index as u64)
}

#[inline]
fn thread_free_decode(token: u64) -> (u32, u32) {
    (token as u32, (token >> 32) as u32)
}

/// Resolve a thread free token into a list head, returning the length.
#[inline]
unsafe fn page_block_from_thread_free(page: *mut Page, token: u64, block: &mut *mut Block) -> u32 {
    let (block_index, list_size) = thread_free_decode(token);
    *block = if list_size != 0 {
        page_block(page, block_index)
    } else {
        ptr::null_mut()
    };
    list_size
}

// ------------------------------------------------------
// Local free list
// ------------------------------------------------------

#[inline]
unsafe fn page_get_local_free_block(page: *mut Page) -> *mut Block {
    let block = (*page).local_free;
    if !block.is_null() {
        (*page).local_free = (*block).next;
        (*page).local_free_count -= 1;
        (*page).block_used += 1;
    }
    block
}

/// Decommit everything past the first OS page of a page that went idle,
/// keeping the header resident. Skipped while fewer than half of the
/// blocks were ever touched.
unsafe fn page_evict_memory_pages(page: *mut Page) {
    if (*page).block_initialized < ((*page).block_count >> 1) {
        return;
    }
    let os_page_size = os::page_size();
    let page_size = page_get_size(page);
    if page_size <= os_page_size {
        return;
    }
    let extra_page = (page as *mut u8).add(os_page_size);
    let interface = crate::init::memory_interface();
    (interface.memory_unmap)(extra_page, page_size - os_page_size, 0, 0, 0);
}

unsafe fn page_put_local_free_block(page: *mut Page, block: *mut Block) {
    (*block).next = (*page).local_free;
    (*page).local_free = block;
    (*page).local_free_count += 1;
    (*page).block_used -= 1;

    let heap = (*page).heap;
    if (*page).block_used == 0 {
        debug_assert!((*page).is_available, "page state out of sync");
        let size_class = (*page).size_class as usize;
        if (*heap).page_available[size_class] == page {
            (*heap).page_available[size_class] = (*page).next;
        } else {
            (*(*page).prev).next = (*page).next;
            if !(*page).next.is_null() {
                (*(*page).next).prev = (*page).prev;
            }
        }
        (*page).is_available = false;
        (*page).is_free = true;
        page_evict_memory_pages(page);
        let page_type = (*page).page_type.index();
        (*page).next = (*heap).page_free[page_type];
        (*heap).page_free[page_type] = page;
    } else if (*page).is_full {
        let size_class = (*page).size_class as usize;
        (*page).next = (*heap).page_available[size_class];
        if !(*page).next.is_null() {
            (*(*page).next).prev = page;
        }
        (*heap).page_available[size_class] = page;
        (*page).is_full = false;
        (*page).is_available = true;
    }
}

// ------------------------------------------------------
// Thread free list
// ------------------------------------------------------

/// Take over the entire thread free list as the local free list. The
/// blocks were counted as used when remotely freed, so the used count
/// shrinks by the adopted length.
unsafe fn page_adopt_thread_free_block_list(page: *mut Page) {
    let mut thread_free = (*page).thread_free.load(Ordering::Relaxed);
    if thread_free == 0 {
        return;
    }
    // Other threads only ever replace the token with another valid list
    // head, it never changes back to zero concurrently. Acquire pairs
    // with the releasing push so the block links are visible
    while let Err(current) = (*page).thread_free.compare_exchange_weak(
        thread_free,
        0,
        Ordering::Acquire,
        Ordering::Relaxed,
    ) {
        thread_free = current;
        wait_spin();
    }
    (*page).local_free_count =
        page_block_from_thread_free(page, thread_free, &mut (*page).local_free);
    debug_assert!(
        (*page).local_free_count <= (*page).block_used,
        "thread free list count out of sync"
    );
    (*page).block_used -= (*page).local_free_count;
}

unsafe fn page_get_thread_free_block(page: *mut Page) -> *mut Block {
    page_adopt_thread_free_block_list(page);
    page_get_local_free_block(page)
}

unsafe fn page_put_thread_free_block(page: *mut Page, block: *mut Block) {
    let block_index = page_block_index(page, block);
    debug_assert!(
        page_block(page, block_index) == block,
        "block pointer not aligned to block start"
    );
    let mut prev_token = (*page).thread_free.load(Ordering::Relaxed);
    let mut list_size;
    loop {
        list_size = page_block_from_thread_free(page, prev_token, &mut (*block).next) + 1;
        let token = thread_free_encode(block_index, list_size);
        match (*page).thread_free.compare_exchange_weak(
            prev_token,
            token,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(current) => {
                prev_token = current;
                wait_spin();
            }
        }
    }
    if list_size > (*page).block_count {
        report_corruption("thread free list longer than page block count");
        return;
    }
    if list_size == (*page).block_count {
        // Page completely freed by remote deallocations. Safe to clean
        // up from here, the page is full and the owning heap will not
        // touch it before reclaiming it from the free thread stack
        debug_assert!((*page).is_full, "page full flag and thread free list mismatch");
        page_evict_memory_pages(page);
        let heap = (*page).heap;
        let stack = &(*heap).page_free_thread[(*page).page_type.index()];
        let mut prev_head = stack.load(Ordering::Relaxed);
        loop {
            (*page).next = prev_head;
            match stack.compare_exchange_weak(
                prev_head,
                page,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => {
                    prev_head = current;
                    wait_spin();
                }
            }
        }
    }
}

// ------------------------------------------------------
// Allocation
// ------------------------------------------------------

/// Hoist the page local free list into the owning heap fast list for
/// small classes. The blocks count as used from the page's view until
/// they come back through the deallocation path. The heap slot must be
/// empty; it always is on the regular allocation path, but zeroing
/// requests reach the page with the fast list intact.
#[inline]
unsafe fn page_push_local_free_to_heap(page: *mut Page) {
    if ((*page).size_class as usize) < SMALL_SIZE_CLASS_COUNT
        && !(*page).local_free.is_null()
        && (*(*page).heap).small_free[(*page).size_class as usize].is_null()
    {
        (*(*page).heap).small_free[(*page).size_class as usize] = (*page).local_free;
        (*page).block_used += (*page).local_free_count;
        (*page).local_free = ptr::null_mut();
        (*page).local_free_count = 0;
    }
}

/// Carve the next block by bump initialization. For small pages with
/// blocks below half an OS page, eagerly link every successor block on
/// the same OS page into the local free list to amortize future
/// allocations.
unsafe fn page_initialize_blocks(page: *mut Page) -> *mut Block {
    debug_assert!(
        (*page).block_initialized < (*page).block_count,
        "block initialization out of sync"
    );
    let block = page_block(page, (*page).block_initialized);
    (*page).block_initialized += 1;
    (*page).block_used += 1;

    let block_size = (*page).block_size as usize;
    if (*page).page_type == PageType::Small && block_size < (os::page_size() >> 1) {
        let memory_page_next = (block as usize & !(os::page_size() - 1)) + os::page_size();
        let mut free_block = (block as *mut u8).add(block_size) as *mut Block;
        let first_block = free_block;
        let mut last_block = free_block;
        while (free_block as usize) < memory_page_next
            && (*page).block_initialized < (*page).block_count
        {
            last_block = free_block;
            let next_block = (free_block as *mut u8).add(block_size) as *mut Block;
            (*free_block).next = next_block;
            free_block = next_block;
            (*page).block_initialized += 1;
            (*page).local_free_count += 1;
        }
        if first_block != free_block {
            (*last_block).next = ptr::null_mut();
            (*page).local_free = first_block;
        } else {
            (*page).local_free_count = 0;
        }
    }
    block
}

/// Allocate a block from the page. Must be called by the owner thread
/// with the page linked on the heap available list.
pub unsafe fn page_allocate_block(page: *mut Page, zero: bool) -> *mut u8 {
    let mut is_zero = false;
    let mut block = page_get_local_free_block(page);
    if block.is_null() {
        block = page_get_thread_free_block(page);
        if block.is_null() {
            block = page_initialize_blocks(page);
            is_zero = (*page).is_zero;
        }
    }
    debug_assert!(
        (*page).block_used <= (*page).block_count,
        "page block use counter out of sync"
    );

    page_push_local_free_to_heap(page);

    if (*page).block_used == (*page).block_count {
        // Give pending remote frees a chance before declaring the page
        // full and unlinking it
        page_adopt_thread_free_block_list(page);
    }
    if (*page).block_used == (*page).block_count {
        if (*page).is_available {
            let heap = (*page).heap;
            let size_class = (*page).size_class as usize;
            if (*heap).page_available[size_class] == page {
                (*heap).page_available[size_class] = (*page).next;
            } else {
                (*(*page).prev).next = (*page).next;
                if !(*page).next.is_null() {
                    (*(*page).next).prev = (*page).prev;
                }
            }
        }
        (*page).is_full = true;
        (*page).is_zero = false;
        (*page).is_available = false;
    }

    if zero && !is_zero && !block.is_null() {
        ptr::write_bytes(block as *mut u8, 0, (*page).block_size as usize);
    }

    block as *mut u8
}

// ------------------------------------------------------
// Deallocation
// ------------------------------------------------------

/// Free a block back to its page, dispatching on the calling thread.
/// Huge spans are unmapped immediately by whichever thread frees them.
pub unsafe fn page_deallocate_block(page: *mut Page, block: *mut Block) {
    if (*page).page_type == PageType::Huge {
        // The span holds this one block; any interior or realigned
        // pointer still masks back to the same span
        let span = page_get_span(page);
        let interface = crate::init::memory_interface();
        (interface.memory_unmap)(
            span as *mut u8,
            (*span).page_size,
            SPAN_SIZE,
            (*span).offset as usize,
            (*span).mapped_size,
        );
        return;
    }

    let block = if (*page).has_aligned_block {
        page_block_realign(page, block)
    } else {
        block
    };

    let calling_thread = thread_id();
    let heap: *mut Heap = (*page).heap;
    if !heap.is_null() && (*heap).owner_thread.load(Ordering::Relaxed) == calling_thread {
        page_put_local_free_block(page, block);
    } else {
        page_put_thread_free_block(page, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_free_token_round_trip() {
        for (index, size) in [(0u32, 0u32), (1, 1), (4087, 12), (u32::MAX, u32::MAX)] {
            let token = thread_free_encode(index, size);
            assert_eq!(thread_free_decode(token), (index, size));
        }
    }

    #[test]
    fn empty_token_is_zero() {
        assert_eq!(thread_free_encode(0, 0), 0);
        let (_, list_size) = thread_free_decode(0);
        assert_eq!(list_size, 0);
    }
}
