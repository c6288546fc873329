//! Default OS memory mapper.
//!
//! Reserves and releases large virtual address regions, with optional
//! alignment padding and huge page support. All functions here match
//! the [`MapFn`]/[`UnmapFn`] contract so they double as the default
//! [`MemoryInterface`](crate::MemoryInterface) implementation.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::warn;

use crate::stats;

// OS memory page size, queried lazily so the first allocation works
// before any explicit initialization
static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

// Minimal allocation granularity
static OS_MAP_GRANULARITY: AtomicUsize = AtomicUsize::new(0);

// Set when huge pages are enabled and supported by the OS
static OS_HUGE_PAGES: AtomicBool = AtomicBool::new(false);

#[cfg(any(target_os = "linux", target_os = "android"))]
static PAGE_NAME: &[u8] = b"spanalloc\0";
#[cfg(any(target_os = "linux", target_os = "android"))]
static HUGE_PAGE_NAME: &[u8] = b"spanalloc-huge\0";

fn align_up(size: usize, align: usize) -> usize {
    let unalign = size % align;
    if unalign != 0 {
        size + align - unalign
    } else {
        size
    }
}

/// OS memory page size.
#[inline]
pub fn page_size() -> usize {
    match OS_PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = query_page_size();
            OS_PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// OS allocation granularity. Equal to the page size except on Windows
/// and in huge page mode.
#[inline]
pub fn allocation_granularity() -> usize {
    match OS_MAP_GRANULARITY.load(Ordering::Relaxed) {
        0 => {
            let size = query_allocation_granularity();
            OS_MAP_GRANULARITY.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

#[inline]
fn huge_pages_active() -> bool {
    OS_HUGE_PAGES.load(Ordering::Relaxed)
}

/// Round a size up to a whole number of OS pages.
pub(crate) fn page_aligned_size(size: usize) -> usize {
    align_up(size, page_size())
}

/// Read system page size and allocation granularity, and enable huge
/// page support when requested. Called once from `initialize`.
pub(crate) fn os_init(enable_huge_pages: bool) {
    OS_PAGE_SIZE.store(query_page_size(), Ordering::Relaxed);
    OS_MAP_GRANULARITY.store(query_allocation_granularity(), Ordering::Relaxed);
    if enable_huge_pages {
        match query_huge_page_size() {
            0 => warn!("huge pages requested but not available"),
            huge_page_size => {
                OS_HUGE_PAGES.store(true, Ordering::Relaxed);
                if huge_page_size > OS_PAGE_SIZE.load(Ordering::Relaxed) {
                    OS_PAGE_SIZE.store(huge_page_size, Ordering::Relaxed);
                }
                if huge_page_size > OS_MAP_GRANULARITY.load(Ordering::Relaxed) {
                    OS_MAP_GRANULARITY.store(huge_page_size, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Map at least `size` bytes, aligned to `alignment` (zero for plain
/// page alignment). Stores the alignment padding in `offset` and the
/// total reservation in `mapped_size`; both are needed to release the
/// region later.
pub unsafe fn map(
    size: usize,
    alignment: usize,
    offset: &mut usize,
    mapped_size: &mut usize,
) -> *mut u8 {
    let map_size = size + alignment;
    let mut ptr = os_map_raw(size, map_size);
    if ptr.is_null() {
        if let Some(map_fail_callback) = crate::init::memory_interface().map_fail_callback {
            if map_fail_callback(map_size) {
                return map(size, alignment, offset, mapped_size);
            }
        }
        warn!(
            "failed to map {} bytes of virtual memory: {}",
            map_size,
            errno::errno()
        );
        return ptr::null_mut();
    }
    if alignment != 0 {
        let mut padding = ptr as usize & (alignment - 1);
        if padding != 0 {
            padding = alignment - padding;
            ptr = ptr.add(padding);
        }
        debug_assert!(padding <= alignment);
        debug_assert!(padding % 8 == 0);
        *offset = padding;
    }
    *mapped_size = map_size;
    stats::map_recorded(map_size);
    ptr
}

/// Unmap or decommit memory pages previously obtained from [`map`]. A
/// non-zero `release` returns the entire reservation of that many bytes
/// to the OS (rewinding the alignment `offset`); zero only decommits
/// the given range, keeping the reservation.
pub unsafe fn unmap(address: *mut u8, size: usize, _alignment: usize, offset: usize, release: usize) {
    if release != 0 {
        os_release_raw(address.sub(offset), release);
        stats::unmap_recorded(release);
    } else {
        os_decommit_raw(address, size);
    }
}

// ------------------------------------------------------
// POSIX
// ------------------------------------------------------

#[cfg(not(windows))]
fn query_page_size() -> usize {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if result > 0 {
        result as usize
    } else {
        4096
    }
}

#[cfg(not(windows))]
fn query_allocation_granularity() -> usize {
    query_page_size()
}

#[cfg(not(windows))]
unsafe fn os_map_raw(size: usize, map_size: usize) -> *mut u8 {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let mut ptr = libc::MAP_FAILED;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if huge_pages_active() {
        ptr = libc::mmap(ptr::null_mut(), map_size, prot, flags | libc::MAP_HUGETLB, -1, 0);
        if ptr == libc::MAP_FAILED {
            // Huge page allocations can fail even when enabled, fall
            // back to a normal mapping promoted to transparent huge
            // pages
            ptr = libc::mmap(ptr::null_mut(), map_size, prot, flags, -1, 0);
            if ptr != libc::MAP_FAILED && libc::madvise(ptr, size, libc::MADV_HUGEPAGE) != 0 {
                warn!("failed to promote mapping to transparent huge pages");
            }
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = size;

    if ptr == libc::MAP_FAILED {
        ptr = libc::mmap(ptr::null_mut(), map_size, prot, flags, -1, 0);
    }
    if ptr == libc::MAP_FAILED {
        return ptr::null_mut();
    }
    set_page_name(ptr as *mut u8, map_size);
    ptr as *mut u8
}

#[cfg(not(windows))]
unsafe fn os_release_raw(address: *mut u8, size: usize) {
    if libc::munmap(address as *mut libc::c_void, size) != 0 {
        warn!(
            "failed to unmap virtual memory block: {}, addr {:p}, size {}",
            errno::errno(),
            address,
            size
        );
    }
}

#[cfg(all(unix, not(target_vendor = "apple")))]
unsafe fn os_decommit_raw(address: *mut u8, size: usize) {
    if libc::madvise(address as *mut libc::c_void, size, libc::MADV_DONTNEED) != 0 {
        warn!(
            "failed to madvise virtual memory block as free: {}",
            errno::errno()
        );
    }
}

#[cfg(target_vendor = "apple")]
unsafe fn os_decommit_raw(address: *mut u8, size: usize) {
    loop {
        if libc::madvise(address as *mut libc::c_void, size, libc::MADV_FREE_REUSABLE) == 0 {
            return;
        }
        if errno::errno().0 != libc::EAGAIN {
            warn!(
                "failed to madvise virtual memory block as free: {}",
                errno::errno()
            );
            return;
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn set_page_name(address: *mut u8, size: usize) {
    // PR_SET_VMA is a no-op on kernels without CONFIG_ANON_VMA_NAME
    const PR_SET_VMA: libc::c_int = 0x53564d41;
    const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;
    let name = if huge_pages_active() {
        HUGE_PAGE_NAME
    } else {
        PAGE_NAME
    };
    let _ = libc::prctl(
        PR_SET_VMA,
        PR_SET_VMA_ANON_NAME,
        address as libc::c_ulong,
        size as libc::c_ulong,
        name.as_ptr() as libc::c_ulong,
    );
}

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
unsafe fn set_page_name(_address: *mut u8, _size: usize) {}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn query_huge_page_size() -> usize {
    // Parse the Hugepagesize line of /proc/meminfo without allocating,
    // this can run inside an allocation
    let mut buffer = [0u8; 4096];
    let read = unsafe {
        let fd = libc::open(b"/proc/meminfo\0".as_ptr() as *const libc::c_char, libc::O_RDONLY);
        if fd < 0 {
            return 0;
        }
        let read = libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len() - 1);
        libc::close(fd);
        read
    };
    if read <= 0 {
        return 0;
    }
    let contents = &buffer[..read as usize];
    let key = b"Hugepagesize:";
    let mut line_start = 0;
    while line_start < contents.len() {
        let line_end = contents[line_start..]
            .iter()
            .position(|&byte| byte == b'\n')
            .map(|at| line_start + at)
            .unwrap_or(contents.len());
        let line = &contents[line_start..line_end];
        if line.starts_with(key) {
            let mut kilobytes = 0usize;
            for &byte in &line[key.len()..] {
                match byte {
                    b'0'..=b'9' => kilobytes = kilobytes * 10 + (byte - b'0') as usize,
                    b' ' | b'\t' if kilobytes == 0 => {}
                    _ => break,
                }
            }
            return kilobytes * 1024;
        }
        line_start = line_end + 1;
    }
    0
}

#[cfg(all(not(windows), not(any(target_os = "linux", target_os = "android"))))]
fn query_huge_page_size() -> usize {
    // 2MiB superpages on the BSDs and macOS
    2 * 1024 * 1024
}

// ------------------------------------------------------
// Windows
// ------------------------------------------------------

#[cfg(windows)]
fn query_system_info() -> winapi::um::sysinfoapi::SYSTEM_INFO {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    let mut system_info: SYSTEM_INFO = Default::default();
    unsafe { GetSystemInfo(&mut system_info) };
    system_info
}

#[cfg(windows)]
fn query_page_size() -> usize {
    let system_info = query_system_info();
    if system_info.dwPageSize > 0 {
        system_info.dwPageSize as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn query_allocation_granularity() -> usize {
    let system_info = query_system_info();
    if system_info.dwAllocationGranularity > 0 {
        system_info.dwAllocationGranularity as usize
    } else {
        query_page_size()
    }
}

#[cfg(windows)]
unsafe fn os_map_raw(_size: usize, map_size: usize) -> *mut u8 {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_LARGE_PAGES, MEM_RESERVE, PAGE_READWRITE};
    // Ok to MEM_COMMIT the whole reservation, physical pages are not
    // allocated until the virtual addresses are actually accessed
    let flags = if huge_pages_active() {
        MEM_LARGE_PAGES | MEM_RESERVE | MEM_COMMIT
    } else {
        MEM_RESERVE | MEM_COMMIT
    };
    VirtualAlloc(ptr::null_mut(), map_size, flags, PAGE_READWRITE) as *mut u8
}

#[cfg(windows)]
unsafe fn os_release_raw(address: *mut u8, _size: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    if VirtualFree(address as *mut _, 0, MEM_RELEASE) == 0 {
        warn!("failed to unmap virtual memory block, addr {:p}", address);
    }
}

#[cfg(windows)]
unsafe fn os_decommit_raw(address: *mut u8, size: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_DECOMMIT;
    if VirtualFree(address as *mut _, size, MEM_DECOMMIT) == 0 {
        warn!("failed to decommit virtual memory block, addr {:p}", address);
    }
}

#[cfg(windows)]
fn query_huge_page_size() -> usize {
    use winapi::shared::minwindef::FALSE;
    use winapi::shared::winerror::ERROR_SUCCESS;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::memoryapi::GetLargePageMinimum;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::AdjustTokenPrivileges;
    use winapi::um::winbase::LookupPrivilegeValueA;
    use winapi::um::winnt::{
        HANDLE, SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
    };

    // Large pages need the "Lock pages in memory" privilege
    unsafe {
        let large_page_minimum = GetLargePageMinimum();
        if large_page_minimum == 0 {
            return 0;
        }
        let mut token: HANDLE = ptr::null_mut();
        if OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        ) == 0
        {
            return 0;
        }
        let mut token_privileges: TOKEN_PRIVILEGES = Default::default();
        let mut enabled = false;
        if LookupPrivilegeValueA(
            ptr::null(),
            b"SeLockMemoryPrivilege\0".as_ptr() as *const i8,
            &mut token_privileges.Privileges[0].Luid,
        ) != 0
        {
            token_privileges.PrivilegeCount = 1;
            token_privileges.Privileges[0].Attributes = SE_PRIVILEGE_ENABLED;
            if AdjustTokenPrivileges(token, FALSE, &mut token_privileges, 0, ptr::null_mut(), ptr::null_mut())
                != 0
            {
                enabled = GetLastError() == ERROR_SUCCESS;
            }
        }
        CloseHandle(token);
        if !enabled {
            warn!("cannot enable large OS page support, error {}", GetLastError());
            return 0;
        }
        large_page_minimum
    }
}
