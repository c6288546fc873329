//! Span level page management.
//!
//! A span is a naturally aligned 256MiB virtual region hosting pages of
//! one page type. Pages are initialized lazily, front to back; the span
//! stays on the owning heap's partial list until the last page is
//! carved out, then moves to the used list. Spans are never coalesced
//! and only huge spans are ever returned to the OS before heap
//! destruction.

use crate::size_class::SIZE_CLASSES;
use crate::types::{Page, Span};

/// Page containing the given block, located by page size arithmetic
/// from the span base.
#[inline]
pub unsafe fn span_get_page_from_block(span: *mut Span, block: *mut u8) -> *mut Page {
    let page_index = (block as usize - span as usize) / (*span).page_size;
    (span as *mut u8).add(page_index * (*span).page_size) as *mut Page
}

/// Initialize the next page of the span for the given size class. The
/// first page header doubles as the span header, so its type and owner
/// are already stamped when the span is created.
pub unsafe fn span_allocate_page(span: *mut Span, size_class: u32) -> *mut Page {
    debug_assert!(
        (*span).page_initialized < (*span).page_count,
        "page initialization out of sync"
    );
    let page =
        (span as *mut u8).add((*span).page_size * (*span).page_initialized as usize) as *mut Page;
    (*page).size_class = size_class;
    (*page).block_size = SIZE_CLASSES[size_class as usize].block_size;
    (*page).block_count = SIZE_CLASSES[size_class as usize].block_count;
    (*page).block_initialized = 0;
    (*page).block_used = 0;
    if (*span).page_initialized != 0 {
        (*page).page_type = (*span).page.page_type;
        (*page).heap = (*span).page.heap;
    }
    (*page).is_zero = true;
    (*span).page_initialized += 1;

    if (*span).page_initialized == (*span).page_count {
        // Span fully initialized, unlink from the partial list and
        // prepend to the used list
        let heap = (*span).page.heap;
        let page_type = (*span).page.page_type.index();
        if span == (*heap).span_partial[page_type] {
            (*heap).span_partial[page_type] = (*span).next;
        } else {
            (*(*span).prev).next = (*span).next;
            if !(*span).next.is_null() {
                (*(*span).next).prev = (*span).prev;
            }
        }
        (*span).next = (*heap).span_used[page_type];
        if !(*span).next.is_null() {
            (*(*span).next).prev = span;
        }
        (*heap).span_used[page_type] = span;
    }

    page
}
