//! Clocks, executable memory, and the synchronization primitives handed to
//! the engine, plus property tests for mutual exclusion and loop ordering.
//!
//! ```bash
//! cargo test --test host_services -- --nocapture
//! ```

#[macro_use]
mod common;

use common::{init_test_logging, test_platform, test_proptest_config};
use proptest::prelude::*;
use script_platform::runtime::{MainContext, Source};
use script_platform::{
    CloakRegistry, CloakedRanges, MemoryRange, MutexImpl, PlatformBuilder, Priority,
    ThreadingBackend,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

#[test]
fn monotonic_time_never_decreases() {
    init_test("monotonic_time_never_decreases");
    let platform = test_platform("clock");
    let mut last = platform.monotonically_increasing_time();
    for _ in 0..10_000 {
        let now = platform.monotonically_increasing_time();
        assert_with_log!(now >= last, "non-decreasing", last, now);
        last = now;
    }
    std::thread::sleep(Duration::from_millis(5));
    let later = platform.monotonically_increasing_time();
    assert_with_log!(later > last, "advances across a sleep", last, later);

    let wall = platform.current_clock_time_millis();
    assert_with_log!(wall > 1.0e12, "wall clock is epoch millis", "> 1e12", wall);
    test_complete!("monotonic_time_never_decreases");
}

#[test]
fn executable_pages_are_cloaked_until_freed() {
    init_test("executable_pages_are_cloaked_until_freed");
    let registry = Arc::new(CloakedRanges::new());
    let platform = PlatformBuilder::new()
        .worker_threads(1)
        .thread_name_prefix("cloak")
        .cloak_registry(registry.clone())
        .build()
        .expect("build");
    let backend = platform.memory_backend();
    let page = backend.page_size();

    let Some(base) = backend.allocate(None, 3 * page, true) else {
        tracing::warn!("host refused executable pages; skipping");
        return;
    };
    let whole = MemoryRange::new(base.as_ptr() as usize, 3 * page);
    let cloaked = registry.contains(whole);
    assert_with_log!(cloaked, "whole allocation cloaked", true, cloaked);

    test_section!("release tail");
    let tail = std::ptr::NonNull::new(base.as_ptr().wrapping_add(2 * page)).expect("non-null");
    let released = backend.release(tail, page);
    assert_with_log!(released, "tail released", true, released);
    let head = MemoryRange::new(whole.base, 2 * page);
    let kept = registry.contains(head) && !registry.contains(whole);
    assert_with_log!(kept, "cloak shrinks with the allocation", true, kept);

    test_section!("free");
    let freed = backend.free(base, 2 * page);
    assert_with_log!(freed, "freed", true, freed);
    let empty = registry.is_empty();
    assert_with_log!(empty, "registry empty", true, empty);
    test_complete!("executable_pages_are_cloaked_until_freed");
}

#[test]
fn unknown_ranges_are_refused() {
    init_test("unknown_ranges_are_refused");
    let registry = Arc::new(CloakedRanges::new());
    let foreign = MemoryRange::new(0x7000_0000, 4096);
    registry.add(foreign);
    let platform = PlatformBuilder::new()
        .worker_threads(1)
        .thread_name_prefix("refuse")
        .cloak_registry(registry.clone())
        .build()
        .expect("build");
    let backend = platform.memory_backend();
    let bogus = std::ptr::NonNull::new(foreign.base as *mut u8).expect("non-null");

    let released = backend.release(bogus, foreign.size);
    assert_with_log!(!released, "release refused", false, released);
    let freed = backend.free(bogus, foreign.size);
    assert_with_log!(!freed, "free refused", false, freed);
    let intact = registry.contains(foreign);
    assert_with_log!(intact, "foreign range untouched", true, intact);
    test_complete!("unknown_ranges_are_refused");
}

#[test]
fn buffer_allocator_zeroes() {
    init_test("buffer_allocator_zeroes");
    let platform = test_platform("buffers");
    let allocator = platform.allocator();
    let len = 1024;
    let ptr = allocator.allocate(len).expect("allocate");
    // SAFETY: `ptr` is a fresh zeroed allocation of `len` bytes.
    let zeroed = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
        .iter()
        .all(|&b| b == 0);
    assert_with_log!(zeroed, "zeroed", true, zeroed);
    // SAFETY: allocated above with the same length and not used afterwards.
    unsafe {
        allocator.free(ptr, len);
    }
    test_complete!("buffer_allocator_zeroes");
}

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::High),
        Just(Priority::Default),
        Just(Priority::Low),
    ]
}

proptest! {
    #![proptest_config(test_proptest_config(32))]

    #[test]
    fn loop_dispatches_by_priority_then_fifo(
        priorities in prop::collection::vec(priority_strategy(), 1..40)
    ) {
        init_test_logging();
        let context = Arc::new(MainContext::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for (index, priority) in priorities.iter().copied().enumerate() {
            let o = Arc::clone(&order);
            context
                .attach(
                    Source::idle(priority),
                    Box::new(move || o.lock().push((priority, index))),
                    None,
                )
                .expect("attach");
        }
        let c = Arc::clone(&context);
        context
            .attach(Source::idle(Priority::Low), Box::new(move || c.quit()), None)
            .expect("attach quit");
        context.run();

        let mut expected: Vec<_> = priorities.iter().copied().zip(0..).collect();
        expected.sort();
        let order = order.lock().clone();
        prop_assert_eq!(order, expected);
    }

    #[test]
    fn engine_mutex_excludes(threads in 2usize..6, rounds in 1usize..100) {
        init_test_logging();
        let backend = script_platform::HostThreadingBackend;
        let mutex: Arc<dyn MutexImpl> = Arc::from(backend.create_plain_mutex());
        let inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let (m, i, v) = (Arc::clone(&mutex), Arc::clone(&inside), Arc::clone(&violations));
                std::thread::spawn(move || {
                    for _ in 0..rounds {
                        m.lock();
                        if i.fetch_add(1, Ordering::SeqCst) != 0 {
                            v.fetch_add(1, Ordering::SeqCst);
                        }
                        i.fetch_sub(1, Ordering::SeqCst);
                        m.unlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        prop_assert_eq!(violations.load(Ordering::SeqCst), 0);
    }
}
