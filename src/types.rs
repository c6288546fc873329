use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};

// ------------------------------------------------------
// Built in size configuration
// ------------------------------------------------------

// Main tuning parameters for block, page and span sizes.
// Every span is naturally aligned to SPAN_SIZE, so masking any block
// pointer with SPAN_MASK yields its enclosing span.
pub const SMALL_GRANULARITY: usize = 16;

pub const PAGE_HEADER_SIZE: usize = 128;
pub const SPAN_HEADER_SIZE: usize = PAGE_HEADER_SIZE;

pub const SMALL_BLOCK_SIZE_LIMIT: usize = 4 * 1024;
pub const MEDIUM_BLOCK_SIZE_LIMIT: usize = 256 * 1024;
pub const LARGE_BLOCK_SIZE_LIMIT: usize = 8 * 1024 * 1024;

pub const SMALL_SIZE_CLASS_COUNT: usize = 29;
pub const MEDIUM_SIZE_CLASS_COUNT: usize = 24;
pub const LARGE_SIZE_CLASS_COUNT: usize = 20;
pub const SIZE_CLASS_COUNT: usize =
    SMALL_SIZE_CLASS_COUNT + MEDIUM_SIZE_CLASS_COUNT + LARGE_SIZE_CLASS_COUNT;

pub const SMALL_PAGE_SIZE: usize = 64 * 1024;
pub const MEDIUM_PAGE_SIZE: usize = 4 * 1024 * 1024;
pub const LARGE_PAGE_SIZE: usize = 64 * 1024 * 1024;

pub const SPAN_SIZE: usize = 256 * 1024 * 1024;
pub const SPAN_MASK: usize = !(SPAN_SIZE - 1);

/// Maximum alignment serviced by the aligned allocation paths. Larger
/// alignments cannot honor the span mask contract on free.
pub const MAX_ALIGNMENT: usize = 256 * 1024;

/// Number of pooled page types (small, medium, large). Huge pages are
/// mapped and unmapped directly and never enter the heap lists.
pub const PAGE_TYPE_COUNT: usize = 3;

/// Flag to the reallocation paths to not preserve block contents.
pub const REALLOC_NO_PRESERVE: u32 = 1;
/// Flag to the reallocation paths to fail instead of moving the block.
pub const REALLOC_GROW_OR_FAIL: u32 = 2;

// ------------------------------------------------------
// Main internal data structures
// ------------------------------------------------------

/// Memory page type, determines the page size within a span.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum PageType {
    /// 64KiB pages
    Small = 0,
    /// 4MiB pages
    Medium = 1,
    /// 64MiB pages
    Large = 2,
    /// One oversized block mapped as its own span
    Huge = 3,
}

impl PageType {
    /// Index into the per-page-type heap lists. Must not be called for
    /// huge pages, which are never pooled.
    #[inline]
    pub fn index(self) -> usize {
        debug_assert!(self != PageType::Huge);
        self as usize
    }
}

/// Block size class.
#[derive(Clone, Copy)]
pub struct SizeClass {
    /// Size of blocks in this class
    pub block_size: u32,
    /// Number of blocks in each page
    pub block_count: u32,
}

/// A memory block. When free, the first word links to the next free
/// block; when allocated, every byte belongs to the caller.
#[repr(C)]
pub struct Block {
    pub next: *mut Block,
}

/// A page contains blocks of a single size class. The header occupies
/// the first `PAGE_HEADER_SIZE` bytes of the page memory.
#[repr(C)]
pub struct Page {
    /// Local free list, owner thread only
    pub local_free: *mut Block,
    /// Local free list count
    pub local_free_count: u32,
    /// Size class of blocks
    pub size_class: u32,
    /// Multithreaded free list, block index in low 32 bits, list length in high 32 bits
    pub thread_free: AtomicU64,
    /// Block size
    pub block_size: u32,
    /// Block count
    pub block_count: u32,
    /// Blocks carved out by bump initialization so far
    pub block_initialized: u32,
    /// Blocks currently handed out
    pub block_used: u32,
    /// Page type
    pub page_type: PageType,
    /// Set while the page is fully utilized and off the heap lists
    pub is_full: bool,
    /// Set while the page is on the heap available list
    pub is_available: bool,
    /// Set while the page is on a heap free list
    pub is_free: bool,
    /// Set while the page memory is known zero initialized
    pub is_zero: bool,
    /// Set if the page ever served an aligned block
    pub has_aligned_block: bool,
    /// Owning heap
    pub heap: *mut Heap,
    /// Next page in list
    pub next: *mut Page,
    /// Previous page in list
    pub prev: *mut Page,
}

/// A span is a naturally aligned 256MiB region carved into pages of one
/// page type. The first page header doubles as the span header.
#[repr(C)]
pub struct Span {
    /// Page header of the first page
    pub page: Page,
    /// Number of pages initialized
    pub page_initialized: u32,
    /// Number of pages in total
    pub page_count: u32,
    /// Number of bytes per page (the block size for huge spans)
    pub page_size: usize,
    /// Offset to start of the mapped memory region
    pub offset: u32,
    /// Total bytes held by the mapping
    pub mapped_size: usize,
    /// Next span in list
    pub next: *mut Span,
    /// Previous span in list
    pub prev: *mut Span,
}

/// Control structure for a heap, one per thread.
#[repr(C)]
pub struct Heap {
    /// Owning thread ID, zero while the heap sits in the free queue.
    /// Read by non-owner threads on the deallocation path, so atomic
    pub owner_thread: AtomicUsize,
    /// Heap ID
    pub id: u32,
    /// Heap local free list for small size classes
    pub small_free: [*mut Block; SMALL_SIZE_CLASS_COUNT],
    /// Available non-full pages for each size class
    pub page_available: [*mut Page; SIZE_CLASS_COUNT],
    /// Free pages for each page type
    pub page_free: [*mut Page; PAGE_TYPE_COUNT],
    /// Pages fully drained by other threads, for each page type
    pub page_free_thread: [AtomicPtr<Page>; PAGE_TYPE_COUNT],
    /// Current partially initialized span for each page type
    pub span_partial: [*mut Span; PAGE_TYPE_COUNT],
    /// Fully initialized spans for each page type
    pub span_used: [*mut Span; PAGE_TYPE_COUNT],
    /// Next heap in the free heap queue
    pub next: *mut Heap,
    /// Offset to start of the mapped memory region
    pub offset: u32,
    /// Total bytes held by the mapping
    pub mapped_size: usize,
}

impl Heap {
    pub const fn new() -> Self {
        Heap {
            owner_thread: AtomicUsize::new(0),
            id: 0,
            small_free: [ptr::null_mut(); SMALL_SIZE_CLASS_COUNT],
            page_available: [ptr::null_mut(); SIZE_CLASS_COUNT],
            page_free: [ptr::null_mut(); PAGE_TYPE_COUNT],
            page_free_thread: [const { AtomicPtr::new(ptr::null_mut()) }; PAGE_TYPE_COUNT],
            span_partial: [ptr::null_mut(); PAGE_TYPE_COUNT],
            span_used: [ptr::null_mut(); PAGE_TYPE_COUNT],
            next: ptr::null_mut(),
            offset: 0,
            mapped_size: 0,
        }
    }
}

// ------------------------------------------------------
// Host configuration
// ------------------------------------------------------

/// Map memory pages for at least `size` bytes, aligned to `alignment`
/// (zero for plain page alignment). Stores the padding offset from the
/// raw mapping start and the total mapped size for the later unmap.
pub type MapFn =
    unsafe fn(size: usize, alignment: usize, offset: &mut usize, mapped_size: &mut usize) -> *mut u8;

/// Unmap (`release` non-zero, passing the total mapped size) or decommit
/// (`release` zero) memory pages previously obtained from [`MapFn`].
pub type UnmapFn =
    unsafe fn(address: *mut u8, size: usize, alignment: usize, offset: usize, release: usize);

/// Called when mapping fails; returning `true` retries the mapping once.
pub type MapFailFn = fn(size: usize) -> bool;

/// Called on opportunistically detected heap corruption. Must not call
/// back into the allocator.
pub type ErrorFn = fn(message: &'static str);

/// Host overrides for memory mapping, installed write-once by
/// [`initialize`](crate::initialize).
pub struct MemoryInterface {
    pub memory_map: MapFn,
    pub memory_unmap: UnmapFn,
    pub map_fail_callback: Option<MapFailFn>,
    pub error_callback: Option<ErrorFn>,
    /// Use OS huge/large page support for all mappings
    pub enable_huge_pages: bool,
}

const _: () = assert!(core::mem::size_of::<Page>() <= PAGE_HEADER_SIZE);
const _: () = assert!(core::mem::size_of::<Span>() <= SPAN_HEADER_SIZE);
