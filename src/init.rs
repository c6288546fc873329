//! Process and thread lifecycle.
//!
//! A statically allocated fallback heap lets the very first allocation
//! in the process succeed without mapping memory; the first thread to
//! claim it triggers process initialization. Every other thread binds a
//! heap on first use, cached in thread local storage, and returns it to
//! the global free heap queue when the thread exits.

use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::heap::{heap_allocate, heap_release};
use crate::os;
use crate::types::{Heap, MemoryInterface};

// --------------------------------------------------------
// Memory interface
// --------------------------------------------------------

/// Default interface backed by the OS mapper.
static DEFAULT_MEMORY_INTERFACE: MemoryInterface = MemoryInterface {
    memory_map: os::map,
    memory_unmap: os::unmap,
    map_fail_callback: None,
    error_callback: None,
    enable_huge_pages: false,
};

/// Installed interface, write-once until `finalize`.
static GLOBAL_MEMORY_INTERFACE: AtomicPtr<MemoryInterface> = AtomicPtr::new(ptr::null_mut());

/// The active memory interface. Falls back to the default so mapping
/// works before any explicit initialization.
#[inline]
pub(crate) fn memory_interface() -> &'static MemoryInterface {
    let interface = GLOBAL_MEMORY_INTERFACE.load(Ordering::Acquire);
    if interface.is_null() {
        &DEFAULT_MEMORY_INTERFACE
    } else {
        unsafe { &*interface }
    }
}

fn install_interface(interface: &'static MemoryInterface) -> bool {
    let installed = GLOBAL_MEMORY_INTERFACE
        .compare_exchange(
            ptr::null_mut(),
            interface as *const MemoryInterface as *mut MemoryInterface,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok();
    if installed {
        os::os_init(interface.enable_huge_pages);
        log::debug!(
            "process initialized, heap id counter live, os page size {}",
            os::page_size()
        );
    }
    installed
}

/// Initialize the allocator, optionally overriding how memory is
/// mapped. Idempotent; the first call wins. Also binds a heap to the
/// calling thread.
pub fn initialize(interface: Option<&'static MemoryInterface>) {
    install_interface(interface.unwrap_or(&DEFAULT_MEMORY_INTERFACE));
    thread_initialize();
}

/// Drop the installed memory interface. Heaps still attached to live
/// threads are not released; they return to the queue as their threads
/// exit.
pub fn finalize() {
    GLOBAL_MEMORY_INTERFACE.store(ptr::null_mut(), Ordering::Release);
}

// --------------------------------------------------------
// Fallback heap
// --------------------------------------------------------

// Statically allocate the fallback heap so the first allocation in the
// process needs no mapping. Only the first thread to claim it owns it;
// later threads map their own.
#[repr(align(64))]
struct FallbackHeap(UnsafeCell<Heap>);

unsafe impl Sync for FallbackHeap {}

static HEAP_FALLBACK: FallbackHeap = FallbackHeap(UnsafeCell::new(Heap::new()));
static HEAP_FALLBACK_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Claim the fallback heap, once per process. The winner also runs
/// process initialization, covering allocations made before any
/// explicit `initialize` call.
pub(crate) unsafe fn claim_default_heap() -> *mut Heap {
    if HEAP_FALLBACK_CLAIMED.swap(true, Ordering::AcqRel) {
        return ptr::null_mut();
    }
    install_interface(&DEFAULT_MEMORY_INTERFACE);
    let heap = HEAP_FALLBACK.0.get();
    debug_assert_eq!(
        (*heap).owner_thread.load(Ordering::Relaxed),
        0,
        "fallback heap claimed twice"
    );
    heap
}

// --------------------------------------------------------
// Thread local heap
// --------------------------------------------------------

struct ThreadHeap {
    heap: Cell<*mut Heap>,
}

// Return the heap to the queue when the thread exits, covering threads
// that never call thread_finalize themselves
impl Drop for ThreadHeap {
    fn drop(&mut self) {
        let heap = self.heap.replace(ptr::null_mut());
        if !heap.is_null() {
            unsafe { heap_release(heap) };
        }
    }
}

thread_local! {
    static THREAD_HEAP: ThreadHeap = const {
        ThreadHeap {
            heap: Cell::new(ptr::null_mut()),
        }
    };
}

/// The calling thread's heap without binding one.
#[inline]
pub(crate) fn get_thread_heap_raw() -> *mut Heap {
    THREAD_HEAP
        .try_with(|slot| slot.heap.get())
        .unwrap_or(ptr::null_mut())
}

/// The calling thread's heap, bound on first use. Null when thread
/// local storage is gone or the heap mapping failed.
pub(crate) unsafe fn get_thread_heap() -> *mut Heap {
    THREAD_HEAP
        .try_with(|slot| {
            let mut heap = slot.heap.get();
            if heap.is_null() {
                heap = unsafe { heap_allocate() };
                slot.heap.set(heap);
            }
            heap
        })
        .unwrap_or(ptr::null_mut())
}

/// Run an operation against the calling thread's heap. During thread
/// teardown, when thread local storage is no longer usable, a heap is
/// borrowed from the queue for the single operation and released right
/// back, preserving the single owner protocol. Returns `None` when no
/// heap could be obtained at all.
#[inline]
pub(crate) unsafe fn with_heap<R>(operation: impl FnOnce(*mut Heap) -> R) -> Option<R> {
    let heap = get_thread_heap();
    if !heap.is_null() {
        return Some(operation(heap));
    }
    let heap = heap_allocate();
    if heap.is_null() {
        return None;
    }
    let result = operation(heap);
    heap_release(heap);
    Some(result)
}

/// Ensure a heap is bound to the calling thread.
pub fn thread_initialize() {
    unsafe {
        get_thread_heap();
    }
}

/// Detach the calling thread's heap and push it to the free heap queue.
/// All caches stay attached to the heap object for the next claimer.
pub fn thread_finalize(_release_caches: bool) {
    let _ = THREAD_HEAP.try_with(|slot| {
        let heap = slot.heap.replace(ptr::null_mut());
        if !heap.is_null() {
            unsafe { heap_release(heap) };
        }
    });
}

/// Whether the calling thread has a heap bound.
pub fn is_thread_initialized() -> bool {
    !get_thread_heap_raw().is_null()
}
