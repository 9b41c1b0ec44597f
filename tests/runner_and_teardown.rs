//! Engine task runners under contention, and platform teardown.
//!
//! ```bash
//! cargo test --test runner_and_teardown -- --nocapture
//! ```

#[macro_use]
mod common;

use common::{init_test_logging, test_platform, thread_name, wait_until, CountingEngine};
use parking_lot::Mutex;
use script_platform::{EngineInstance, Operation, PlatformError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

const POSTERS: usize = 8;
const TASKS_PER_POSTER: usize = 50;

#[test]
fn runner_tasks_never_overlap() {
    init_test("runner_tasks_never_overlap");
    let platform = test_platform("exclusion");
    let engine = Arc::new(CountingEngine::new());
    let dyn_engine: Arc<dyn EngineInstance> = engine.clone();
    let ran = Arc::new(AtomicUsize::new(0));
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        test_section!("direct lock holder");
        let holder = scope.spawn(|| {
            let mut rounds = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let _guard = engine.execution_lock().lock();
                engine.enter();
                std::thread::yield_now();
                engine.exit();
                rounds += 1;
            }
            rounds
        });

        test_section!("posters");
        let posters: Vec<_> = (0..POSTERS)
            .map(|_| {
                let (platform, dyn_engine, ran) = (&platform, &dyn_engine, &ran);
                scope.spawn(move || {
                    for _ in 0..TASKS_PER_POSTER {
                        let r = Arc::clone(ran);
                        platform.call_on_foreground_thread(
                            dyn_engine,
                            Box::new(move || {
                                r.fetch_add(1, Ordering::SeqCst);
                            }),
                        );
                    }
                })
            })
            .collect();
        for poster in posters {
            poster.join().expect("poster panicked");
        }

        let expected = POSTERS * TASKS_PER_POSTER;
        let all = wait_until(Duration::from_secs(10), || {
            ran.load(Ordering::SeqCst) == expected
        });
        stop.store(true, Ordering::SeqCst);
        let rounds = holder.join().expect("holder panicked");
        assert_with_log!(all, "every task ran", expected, ran.load(Ordering::SeqCst));
        tracing::debug!(rounds, "direct lock rounds");
    });

    let overlaps = engine.overlaps();
    assert_with_log!(overlaps == 0, "no overlapping scopes", 0, overlaps);
    test_complete!("runner_tasks_never_overlap");
}

#[test]
fn runner_is_shared_per_engine() {
    init_test("runner_is_shared_per_engine");
    let platform = test_platform("runner-identity");
    let a: Arc<dyn EngineInstance> = Arc::new(CountingEngine::new());
    let b: Arc<dyn EngineInstance> = Arc::new(CountingEngine::new());

    let first = platform.foreground_task_runner(&a);
    let again = platform.foreground_task_runner(&a);
    let other = platform.foreground_task_runner(&b);
    let same = Arc::ptr_eq(&first, &again);
    let distinct = !Arc::ptr_eq(&first, &other);
    assert_with_log!(same, "same engine, same runner", true, same);
    assert_with_log!(distinct, "other engine, other runner", true, distinct);
    test_complete!("runner_is_shared_per_engine");
}

#[test]
fn idle_task_gets_a_future_deadline() {
    init_test("idle_task_gets_a_future_deadline");
    let platform = test_platform("idle");
    let engine: Arc<dyn EngineInstance> = Arc::new(CountingEngine::new());
    let clock = *platform.clock();
    let seen = Arc::new(Mutex::new(None));

    let s = Arc::clone(&seen);
    platform.call_idle_on_foreground_thread(
        &engine,
        Box::new(move |deadline: f64| {
            *s.lock() = Some((deadline, clock.monotonic_seconds(), thread_name()));
        }),
    );
    let ran = wait_until(Duration::from_secs(5), || seen.lock().is_some());
    assert_with_log!(ran, "idle task ran", true, ran);

    let (deadline, now, name) = seen.lock().take().expect("recorded");
    let budget = platform.config().idle_frame_budget.as_secs_f64();
    let ahead = deadline - now;
    assert_with_log!(ahead > 0.0, "deadline in the future", "> 0", ahead);
    assert_with_log!(ahead <= budget, "within one frame", budget, ahead);
    assert_with_log!(name == "idle-js", "ran on foreground", "idle-js", name);
    test_complete!("idle_task_gets_a_future_deadline");
}

#[test]
fn drop_blocks_until_runners_are_disposed() {
    init_test("drop_blocks_until_runners_are_disposed");
    let platform = test_platform("teardown");
    let engine = Arc::new(CountingEngine::new());
    let dyn_engine: Arc<dyn EngineInstance> = engine.clone();
    let runner = platform.foreground_task_runner(&dyn_engine);

    let slow = runner
        .post_delayed_task(Box::new(|| {}), 60.0)
        .expect("post delayed");
    let quick = runner.post_task(Box::new(|| {})).expect("post");
    quick.wait();

    drop(platform);
    let disposed = engine.disposed();
    assert_with_log!(disposed == 1, "disposed before drop returned", 1, disposed);
    let finished = slow.is_finished();
    assert_with_log!(finished, "pending delayed task cancelled", true, finished);

    let refused = runner.post_task(Box::new(|| {}));
    let shut = matches!(refused, Err(PlatformError::ShutDown));
    assert_with_log!(shut, "runner refuses work after teardown", true, shut);
    test_complete!("drop_blocks_until_runners_are_disposed");
}

#[test]
fn work_posted_during_teardown_always_finishes() {
    init_test("work_posted_during_teardown_always_finishes");
    let platform = test_platform("racing-teardown");
    let engine = Arc::new(CountingEngine::new());
    let dyn_engine: Arc<dyn EngineInstance> = engine.clone();
    let runner = platform.foreground_task_runner(&dyn_engine);

    let posted = Arc::new(Mutex::new(Vec::new()));
    let stuck = Arc::new(AtomicUsize::new(0));
    let looping = Arc::new(AtomicBool::new(false));
    let poster = {
        let (posted, stuck, looping) = (
            Arc::clone(&posted),
            Arc::clone(&stuck),
            Arc::clone(&looping),
        );
        platform.schedule_on_pool(move || {
            looping.store(true, Ordering::SeqCst);
            while let Ok(op) = runner.post_task(Box::new(|| {})) {
                if !op.wait_timeout(Duration::from_secs(5)) {
                    stuck.fetch_add(1, Ordering::SeqCst);
                }
                posted.lock().push(op);
            }
        })
    };
    let delayed_pool = platform.schedule_on_pool_delayed(Duration::from_secs(30), || {});
    let delayed_fg = platform.schedule_on_foreground_delayed(Duration::from_secs(30), || {});

    let running = wait_until(Duration::from_secs(5), || looping.load(Ordering::SeqCst));
    assert_with_log!(running, "poster started", true, running);

    test_section!("drop while posting");
    drop(platform);

    let done = poster.is_finished();
    assert_with_log!(done, "poster exited before drop returned", true, done);
    let stuck = stuck.load(Ordering::SeqCst);
    assert_with_log!(stuck == 0, "no posted task left waiting", 0, stuck);
    let posted = posted.lock();
    let all = posted.iter().all(|op| op.is_finished());
    assert_with_log!(all, "every posted handle finished", true, all);
    let timers = delayed_pool.is_finished() && delayed_fg.is_finished();
    assert_with_log!(timers, "pending timers cancelled", true, timers);
    assert_with_log!(engine.disposed() == 1, "engine disposed", 1, engine.disposed());
    assert_with_log!(engine.overlaps() == 0, "no overlap", 0, engine.overlaps());
    test_complete!("work_posted_during_teardown_always_finishes");
}

#[test]
fn teardown_runs_pool_thread_hooks() {
    init_test("teardown_runs_pool_thread_hooks");
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));
    let (s, t) = (Arc::clone(&started), Arc::clone(&stopped));
    let platform = script_platform::PlatformBuilder::new()
        .worker_threads(3)
        .thread_name_prefix("hooks")
        .on_thread_start(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .on_thread_stop(move || {
            t.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("build");
    platform.schedule_on_pool(|| {}).wait();
    drop(platform);

    let started = started.load(Ordering::SeqCst);
    let stopped = stopped.load(Ordering::SeqCst);
    assert_with_log!(started == 3, "start hooks", 3, started);
    assert_with_log!(stopped == 3, "stop hooks", 3, stopped);
    test_complete!("teardown_runs_pool_thread_hooks");
}
