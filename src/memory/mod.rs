//! Executable-memory backend for the engine's code space.
//!
//! The engine asks for whole pages, RW or RWX, and gives them back either
//! entirely ([`MemoryBackend::free`]) or by trimming a page-aligned tail
//! ([`MemoryBackend::release`]). Every live range is mirrored in a
//! [`CloakRegistry`] so the engine's memory scanner skips its own JIT
//! buffers.
//!
//! Registry updates are paired with host success only:
//!
//! - a failed `mmap` registers nothing;
//! - a failed `munmap`, or a range this backend never handed out, leaves the
//!   registry untouched and reports `false`.

#![allow(unsafe_code)]

pub mod cloak;
pub mod pages;

pub use cloak::{CloakRegistry, CloakedRanges, MemoryRange};
pub use pages::{MmapPageAllocator, PageAllocator, PageProtection};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Engine-facing page allocator interface.
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Host page size in bytes.
    fn page_size(&self) -> usize;

    /// Allocates at least `size` bytes of page-aligned memory.
    ///
    /// `hint` is advisory. Returns `None` on failure.
    fn allocate(&self, hint: Option<NonNull<u8>>, size: usize, executable: bool)
        -> Option<NonNull<u8>>;

    /// Frees an allocation returned by [`allocate`](Self::allocate).
    ///
    /// `address` and `size` must describe the whole allocation.
    fn free(&self, address: NonNull<u8>, size: usize) -> bool;

    /// Returns `[address, address + size)` to the host.
    ///
    /// The range must be a page-aligned tail of a live allocation (or the
    /// whole allocation).
    fn release(&self, address: NonNull<u8>, size: usize) -> bool;
}

/// [`MemoryBackend`] over a [`PageAllocator`] with a live-allocation ledger.
pub struct PagedMemoryBackend<P = MmapPageAllocator> {
    pages: P,
    registry: Arc<dyn CloakRegistry>,
    live: Mutex<BTreeMap<usize, usize>>,
}

impl PagedMemoryBackend<MmapPageAllocator> {
    /// Creates an `mmap` backend reporting to `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn CloakRegistry>) -> Self {
        Self::with_pages(MmapPageAllocator::new(), registry)
    }
}

impl<P: PageAllocator> PagedMemoryBackend<P> {
    /// Creates a backend over a custom page allocator.
    #[must_use]
    pub fn with_pages(pages: P, registry: Arc<dyn CloakRegistry>) -> Self {
        Self {
            pages,
            registry,
            live: Mutex::new(BTreeMap::new()),
        }
    }

    /// The registry this backend reports to.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn CloakRegistry> {
        &self.registry
    }

    /// Number of live allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.live.lock().len()
    }

    fn round_up(&self, size: usize) -> Option<usize> {
        let page = self.pages.page_size();
        size.checked_add(page - 1).map(|s| s & !(page - 1))
    }
}

impl<P: PageAllocator> fmt::Debug for PagedMemoryBackend<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedMemoryBackend")
            .field("pages", &self.pages)
            .field("live", &self.live_allocations())
            .finish_non_exhaustive()
    }
}

impl<P: PageAllocator> MemoryBackend for PagedMemoryBackend<P> {
    fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    fn allocate(
        &self,
        hint: Option<NonNull<u8>>,
        size: usize,
        executable: bool,
    ) -> Option<NonNull<u8>> {
        let size = self.round_up(size).filter(|&s| s > 0)?;
        let base = self
            .pages
            .map(hint, size, PageProtection::for_executable(executable))?;
        let range = MemoryRange::new(base.as_ptr() as usize, size);
        self.live.lock().insert(range.base, range.size);
        self.registry.add(range);
        tracing::trace!(base = range.base, size, executable, "pages allocated");
        Some(base)
    }

    fn free(&self, address: NonNull<u8>, size: usize) -> bool {
        let Some(size) = self.round_up(size) else {
            return false;
        };
        let base = address.as_ptr() as usize;
        let mut live = self.live.lock();
        if live.get(&base) != Some(&size) {
            tracing::debug!(base, size, "free of unknown allocation");
            return false;
        }
        // SAFETY: the ledger proves `[base, base + size)` is a live mapping
        // produced by `self.pages`.
        if !unsafe { self.pages.unmap(address, size) } {
            return false;
        }
        live.remove(&base);
        drop(live);
        self.registry.remove(MemoryRange::new(base, size));
        tracing::trace!(base, size, "pages freed");
        true
    }

    fn release(&self, address: NonNull<u8>, size: usize) -> bool {
        let page = self.pages.page_size();
        let start = address.as_ptr() as usize;
        if start % page != 0 {
            return false;
        }
        let Some(size) = self.round_up(size).filter(|&s| s > 0) else {
            return false;
        };
        let mut live = self.live.lock();
        let Some((base, total)) = live
            .range(..=start)
            .next_back()
            .map(|(&b, &s)| (b, s))
        else {
            tracing::debug!(start, size, "release of unknown range");
            return false;
        };
        let whole = MemoryRange::new(base, total);
        if start.checked_add(size) != Some(whole.end()) {
            tracing::debug!(start, size, base, total, "release is not a tail of a live allocation");
            return false;
        }
        // SAFETY: `[start, start + size)` is the tail of the live mapping
        // `whole`, produced by `self.pages`.
        if !unsafe { self.pages.unmap(address, size) } {
            return false;
        }
        self.registry.remove(whole);
        if start == base {
            live.remove(&base);
        } else {
            let kept = MemoryRange::new(base, start - base);
            live.insert(base, kept.size);
            self.registry.add(kept);
        }
        tracing::trace!(start, size, base, "pages released");
        true
    }
}
