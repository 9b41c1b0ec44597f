//! Registry of memory ranges hidden from the engine's own memory scanner.
//!
//! The registry is owned outside the platform: the memory backend only adds
//! and removes ranges. [`CloakedRanges::shared`] returns the process-wide
//! instance used by default.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A `[base, base + size)` extent of process memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryRange {
    /// First address of the range.
    pub base: usize,
    /// Length in bytes.
    pub size: usize,
}

impl MemoryRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// One past the last address of the range.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    /// Returns `true` if `address` falls inside the range.
    #[must_use]
    pub const fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }
}

/// Add/remove interface of the cloaked-range registry.
pub trait CloakRegistry: Send + Sync + fmt::Debug {
    /// Hides `range`.
    fn add(&self, range: MemoryRange);

    /// Un-hides `range`. Ranges are removed by exact extent.
    fn remove(&self, range: MemoryRange);

    /// Returns `true` if `range` is currently registered.
    fn contains(&self, range: MemoryRange) -> bool;
}

/// In-process cloak registry keyed by base address.
#[derive(Default)]
pub struct CloakedRanges {
    ranges: Mutex<BTreeMap<usize, usize>>,
}

impl CloakedRanges {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<CloakedRanges>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(Self::new())))
    }

    /// Number of registered ranges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.lock().len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.lock().is_empty()
    }

    /// Returns the registered range covering `address`, if any.
    #[must_use]
    pub fn find(&self, address: usize) -> Option<MemoryRange> {
        let ranges = self.ranges.lock();
        ranges
            .range(..=address)
            .next_back()
            .map(|(&base, &size)| MemoryRange::new(base, size))
            .filter(|r| r.contains(address))
    }
}

impl fmt::Debug for CloakedRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloakedRanges")
            .field("ranges", &self.len())
            .finish()
    }
}

impl CloakRegistry for CloakedRanges {
    fn add(&self, range: MemoryRange) {
        self.ranges.lock().insert(range.base, range.size);
    }

    fn remove(&self, range: MemoryRange) {
        let mut ranges = self.ranges.lock();
        if ranges.get(&range.base) == Some(&range.size) {
            ranges.remove(&range.base);
        }
    }

    fn contains(&self, range: MemoryRange) -> bool {
        self.ranges.lock().get(&range.base) == Some(&range.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn add_find_remove() {
        init_test("add_find_remove");
        let registry = CloakedRanges::new();
        let range = MemoryRange::new(0x1000, 0x2000);
        registry.add(range);

        let hit = registry.find(0x2fff);
        crate::assert_with_log!(hit == Some(range), "find inside", Some(range), hit);
        let miss = registry.find(0x3000);
        crate::assert_with_log!(miss.is_none(), "find past end", "None", miss);

        registry.remove(MemoryRange::new(0x1000, 0x1000));
        let kept = registry.contains(range);
        crate::assert_with_log!(kept, "mismatched size ignored", true, kept);

        registry.remove(range);
        crate::assert_with_log!(registry.is_empty(), "removed", true, registry.len());
        crate::test_complete!("add_find_remove");
    }

    #[test]
    fn shared_is_a_singleton() {
        init_test("shared_is_a_singleton");
        let a = CloakedRanges::shared();
        let b = CloakedRanges::shared();
        let same = Arc::ptr_eq(&a, &b);
        crate::assert_with_log!(same, "same instance", true, same);
        crate::test_complete!("shared_is_a_singleton");
    }
}
