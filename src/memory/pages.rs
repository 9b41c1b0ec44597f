//! Host paged-memory allocation.
//!
//! [`MmapPageAllocator`] maps anonymous private pages with `mmap` and
//! unmaps them with `munmap`. Sizes are rounded up to whole pages by the
//! caller ([`PagedMemoryBackend`](super::PagedMemoryBackend)), never here.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Page protection requested from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageProtection {
    /// Readable and writable.
    ReadWrite,
    /// Readable, writable and executable.
    ReadWriteExecute,
}

impl PageProtection {
    /// Maps the engine's `executable` flag onto a protection.
    #[must_use]
    pub const fn for_executable(executable: bool) -> Self {
        if executable {
            Self::ReadWriteExecute
        } else {
            Self::ReadWrite
        }
    }
}

/// Host paged-memory allocator.
pub trait PageAllocator: Send + Sync + fmt::Debug {
    /// Host page size in bytes.
    fn page_size(&self) -> usize;

    /// Maps `size` bytes (a page multiple) near `hint`.
    ///
    /// The hint is advisory. Returns `None` when the host refuses.
    fn map(&self, hint: Option<NonNull<u8>>, size: usize, protection: PageProtection)
        -> Option<NonNull<u8>>;

    /// Unmaps `[address, address + size)`. Returns `false` on host failure.
    ///
    /// # Safety
    ///
    /// The range must lie inside a mapping produced by [`map`](Self::map)
    /// and must not be accessed afterwards.
    unsafe fn unmap(&self, address: NonNull<u8>, size: usize) -> bool;
}

/// `mmap`-backed page allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapPageAllocator;

impl MmapPageAllocator {
    /// Creates the allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
fn host_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
    })
}

#[cfg(not(unix))]
fn host_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| 4096)
}

#[cfg(unix)]
impl PageAllocator for MmapPageAllocator {
    fn page_size(&self) -> usize {
        host_page_size()
    }

    fn map(
        &self,
        hint: Option<NonNull<u8>>,
        size: usize,
        protection: PageProtection,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let prot = match protection {
            PageProtection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            PageProtection::ReadWriteExecute => {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            }
        };
        let hint = hint.map_or(std::ptr::null_mut(), |h| h.as_ptr().cast::<libc::c_void>());
        // SAFETY: anonymous private mapping without MAP_FIXED; the hint is
        // advisory and the kernel picks a free range.
        let address = unsafe {
            libc::mmap(
                hint,
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if address == libc::MAP_FAILED {
            tracing::debug!(
                size,
                error = %std::io::Error::last_os_error(),
                "mmap refused"
            );
            return None;
        }
        NonNull::new(address.cast::<u8>())
    }

    unsafe fn unmap(&self, address: NonNull<u8>, size: usize) -> bool {
        // SAFETY: the caller guarantees the range came from `map`.
        let rc = unsafe { libc::munmap(address.as_ptr().cast::<libc::c_void>(), size) };
        if rc != 0 {
            tracing::warn!(
                address = address.as_ptr() as usize,
                size,
                error = %std::io::Error::last_os_error(),
                "munmap failed"
            );
        }
        rc == 0
    }
}

#[cfg(not(unix))]
impl PageAllocator for MmapPageAllocator {
    fn page_size(&self) -> usize {
        host_page_size()
    }

    fn map(
        &self,
        _hint: Option<NonNull<u8>>,
        _size: usize,
        _protection: PageProtection,
    ) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn unmap(&self, _address: NonNull<u8>, _size: usize) -> bool {
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn page_size_is_power_of_two() {
        init_test("page_size_is_power_of_two");
        let size = MmapPageAllocator::new().page_size();
        crate::assert_with_log!(size.is_power_of_two(), "power of two", true, size);
        crate::test_complete!("page_size_is_power_of_two");
    }

    #[test]
    fn mapped_pages_are_writable() {
        init_test("mapped_pages_are_writable");
        let pages = MmapPageAllocator::new();
        let size = pages.page_size() * 2;
        let base = pages
            .map(None, size, PageProtection::ReadWrite)
            .expect("mmap failed");
        // SAFETY: `base` maps `size` writable bytes.
        unsafe {
            std::ptr::write_bytes(base.as_ptr(), 0x5A, size);
        }
        // SAFETY: the last byte was written above.
        let last = unsafe { *base.as_ptr().add(size - 1) };
        crate::assert_with_log!(last == 0x5A, "written", 0x5A, last);
        // SAFETY: mapped above with the same size.
        let ok = unsafe { pages.unmap(base, size) };
        crate::assert_with_log!(ok, "unmapped", true, ok);
        crate::test_complete!("mapped_pages_are_writable");
    }

    #[test]
    fn zero_size_is_refused() {
        init_test("zero_size_is_refused");
        let mapped = MmapPageAllocator::new().map(None, 0, PageProtection::ReadWrite);
        crate::assert_with_log!(mapped.is_none(), "refused", "None", mapped);
        crate::test_complete!("zero_size_is_refused");
    }
}
