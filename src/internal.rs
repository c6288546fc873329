//! Small shared helpers for the hot paths.

/// Fast thread ID. Only compared for equality against the owner thread
/// stamp of a heap, never dereferenced.
#[inline]
pub fn thread_id() -> usize {
    #[cfg(windows)]
    unsafe {
        winapi::um::processthreadsapi::GetCurrentThreadId() as usize
    }
    #[cfg(not(windows))]
    unsafe {
        libc::pthread_self() as usize
    }
}

/// CPU level pause for bounded atomic retry loops.
#[inline]
pub fn wait_spin() {
    core::hint::spin_loop();
}

/// Report opportunistically detected heap corruption to the host
/// callback. The callback must not call back into the allocator.
#[cold]
pub fn report_corruption(message: &'static str) {
    if let Some(callback) = crate::init::memory_interface().error_callback {
        callback(message);
    }
    debug_assert!(false, "{}", message);
}
