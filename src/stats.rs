//! Global mapping statistics.
//!
//! Relaxed atomic counters updated by the OS mapper. Decommits keep the
//! reservation and are not counted as unmaps.

use core::sync::atomic::{AtomicUsize, Ordering};

static MAPPED: AtomicUsize = AtomicUsize::new(0);
static MAPPED_TOTAL: AtomicUsize = AtomicUsize::new(0);
static UNMAPPED_TOTAL: AtomicUsize = AtomicUsize::new(0);
static MAP_CALLS: AtomicUsize = AtomicUsize::new(0);

/// Snapshot of the global virtual memory accounting.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalStatistics {
    /// Current amount of virtual memory mapped
    pub mapped: usize,
    /// Total amount of virtual memory mapped since start
    pub mapped_total: usize,
    /// Total amount of virtual memory unmapped since start
    pub unmapped_total: usize,
    /// Number of map calls made to the OS
    pub map_calls: usize,
}

pub(crate) fn map_recorded(size: usize) {
    MAPPED.fetch_add(size, Ordering::Relaxed);
    MAPPED_TOTAL.fetch_add(size, Ordering::Relaxed);
    MAP_CALLS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn unmap_recorded(size: usize) {
    MAPPED.fetch_sub(size, Ordering::Relaxed);
    UNMAPPED_TOTAL.fetch_add(size, Ordering::Relaxed);
}

/// Get the global virtual memory statistics.
pub fn global_statistics() -> GlobalStatistics {
    GlobalStatistics {
        mapped: MAPPED.load(Ordering::Relaxed),
        mapped_total: MAPPED_TOTAL.load(Ordering::Relaxed),
        unmapped_total: UNMAPPED_TOTAL.load(Ordering::Relaxed),
        map_calls: MAP_CALLS.load(Ordering::Relaxed),
    }
}
