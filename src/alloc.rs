//! Byte-buffer allocator for engine array buffers.
//!
//! The engine hands back the length on `free`, so the allocator does not
//! keep any bookkeeping of its own. Exhaustion is reported as `None`.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

/// Alignment of every buffer, matching the host `malloc` guarantee.
pub const BUFFER_ALIGN: usize = 16;

/// Engine allocator interface.
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    /// Allocates `length` zeroed bytes.
    fn allocate(&self, length: usize) -> Option<NonNull<u8>>;

    /// Allocates `length` bytes with unspecified contents.
    fn allocate_uninitialized(&self, length: usize) -> Option<NonNull<u8>>;

    /// Releases a buffer.
    ///
    /// # Safety
    ///
    /// `data` must come from `allocate` / `allocate_uninitialized` on this
    /// allocator with the same `length`, and must not be used afterwards.
    unsafe fn free(&self, data: NonNull<u8>, length: usize);
}

/// Allocator backed by the global Rust allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl HostAllocator {
    fn layout(length: usize) -> Option<Layout> {
        Layout::from_size_align(length, BUFFER_ALIGN).ok()
    }
}

impl BufferAllocator for HostAllocator {
    fn allocate(&self, length: usize) -> Option<NonNull<u8>> {
        if length == 0 {
            return Some(NonNull::dangling());
        }
        let layout = Self::layout(length)?;
        // SAFETY: `layout` has a non-zero size.
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    fn allocate_uninitialized(&self, length: usize) -> Option<NonNull<u8>> {
        if length == 0 {
            return Some(NonNull::dangling());
        }
        let layout = Self::layout(length)?;
        // SAFETY: `layout` has a non-zero size.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn free(&self, data: NonNull<u8>, length: usize) {
        if length == 0 {
            return;
        }
        if let Some(layout) = Self::layout(length) {
            // SAFETY: the caller guarantees `data` was allocated here with
            // this length, hence with this layout.
            unsafe { alloc::dealloc(data.as_ptr(), layout) };
        }
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
    fn zeroed_allocation_is_zero() {
        init_test("zeroed_allocation_is_zero");
        let allocator = HostAllocator;
        let len = 4096;
        let ptr = allocator.allocate(len).expect("allocation failed");
        // SAFETY: `ptr` points to `len` initialized (zeroed) bytes.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) };
        let all_zero = bytes.iter().all(|&b| b == 0);
        crate::assert_with_log!(all_zero, "zeroed", true, all_zero);
        let aligned = ptr.as_ptr() as usize % BUFFER_ALIGN == 0;
        crate::assert_with_log!(aligned, "aligned", true, aligned);
        // SAFETY: allocated above with the same length.
        unsafe { allocator.free(ptr, len) };
        crate::test_complete!("zeroed_allocation_is_zero");
    }

    #[test]
    fn uninitialized_allocation_is_writable() {
        init_test("uninitialized_allocation_is_writable");
        let allocator = HostAllocator;
        let len = 64;
        let ptr = allocator
            .allocate_uninitialized(len)
            .expect("allocation failed");
        // SAFETY: `ptr` is valid for `len` bytes of writes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, len);
        }
        // SAFETY: bytes were initialized above.
        let last = unsafe { *ptr.as_ptr().add(len - 1) };
        crate::assert_with_log!(last == 0xAB, "written", 0xAB, last);
        // SAFETY: allocated above with the same length.
        unsafe { allocator.free(ptr, len) };
        crate::test_complete!("uninitialized_allocation_is_writable");
    }

    #[test]
    fn zero_length_round_trips() {
        init_test("zero_length_round_trips");
        let allocator = HostAllocator;
        let ptr = allocator.allocate(0);
        crate::assert_with_log!(ptr.is_some(), "non-null", true, ptr.is_some());
        if let Some(ptr) = ptr {
            // SAFETY: zero-length buffers are never dereferenced or deallocated.
            unsafe { allocator.free(ptr, 0) };
        }
        crate::test_complete!("zero_length_round_trips");
    }

    #[test]
    fn impossible_length_reports_none() {
        init_test("impossible_length_reports_none");
        let allocator = HostAllocator;
        let result = allocator.allocate(usize::MAX);
        crate::assert_with_log!(result.is_none(), "exhaustion", "None", result);
        crate::test_complete!("impossible_length_reports_none");
    }
}
