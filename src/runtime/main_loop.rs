//! Foreground event loop.
//!
//! A [`MainContext`] is a run loop that dispatches one-shot sources on the
//! thread that calls [`MainContext::run`]. Sources are either immediately
//! ready ([`Source::idle`]) or become ready once their delay has elapsed
//! ([`Source::timeout`]).
//!
//! # Dispatch order
//!
//! Among ready sources the loop always picks the one with the highest
//! [`Priority`]; equal priorities dispatch in the order they became ready.
//! Pending timers live in a min-heap keyed by deadline and are promoted to
//! the ready set when they expire.
//!
//! # Callbacks and destroy notifies
//!
//! Every attached source carries a callback and an optional destroy notify.
//! The notify runs exactly once when the source goes away: after its
//! callback was dispatched, when it is destroyed before dispatch, when the
//! loop quits with the source still attached, or when attaching fails
//! because the loop has already quit. Neither callbacks nor notifies run
//! while the context's internal lock is held.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

/// Dispatch priority of a foreground source.
///
/// `High` is used for disposal requests, `Default` for ordinary posted work
/// and `Low` for idle-class work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Dispatched before everything else.
    High,
    /// Ordinary work.
    #[default]
    Default,
    /// Idle-class work.
    Low,
}

/// Identifier of a source attached to a [`MainContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u64);

impl SourceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Raw numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// When a source becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Immediate,
    At(Instant),
    Never,
}

/// A one-shot source description, not yet attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source {
    readiness: Readiness,
    priority: Priority,
}

impl Source {
    /// A source that is ready as soon as it is attached.
    #[must_use]
    pub const fn idle(priority: Priority) -> Self {
        Self {
            readiness: Readiness::Immediate,
            priority,
        }
    }

    /// A source that becomes ready `delay` after it is created.
    ///
    /// A delay past the range of [`Instant`] never fires; such a source can
    /// only be destroyed.
    #[must_use]
    pub fn timeout(delay: Duration, priority: Priority) -> Self {
        let readiness = Instant::now()
            .checked_add(delay)
            .map_or(Readiness::Never, Readiness::At);
        Self {
            readiness,
            priority,
        }
    }

    /// The source's priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }
}

/// Work dispatched by the loop.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Cleanup run when a source goes away.
pub type DestroyNotify = Box<dyn FnOnce() + Send>;

struct Attached {
    callback: Callback,
    destroy: Option<DestroyNotify>,
    ready_key: Option<(Priority, u64)>,
    priority: Priority,
}

impl Attached {
    fn discard(self) {
        drop(self.callback);
        if let Some(destroy) = self.destroy {
            destroy();
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: SourceId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Destroyed timers tolerated in the heap before it is rebuilt.
const STALE_TIMER_SLACK: usize = 64;

#[derive(Default)]
struct LoopState {
    sources: HashMap<SourceId, Attached>,
    ready: BTreeMap<(Priority, u64), SourceId>,
    timers: BinaryHeap<TimerEntry>,
    next_seq: u64,
    quit: bool,
}

impl LoopState {
    fn seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn mark_ready(&mut self, id: SourceId) {
        let seq = self.seq();
        if let Some(attached) = self.sources.get_mut(&id) {
            let key = (attached.priority, seq);
            attached.ready_key = Some(key);
            self.ready.insert(key, id);
        }
    }

    /// Moves expired timers into the ready set.
    fn promote_expired(&mut self, now: Instant) {
        while let Some(entry) = self.timers.peek() {
            if entry.deadline > now {
                break;
            }
            let id = entry.id;
            self.timers.pop();
            if self.sources.contains_key(&id) {
                self.mark_ready(id);
            }
        }
    }

    fn take_next_ready(&mut self) -> Option<(SourceId, Attached)> {
        while let Some((_, id)) = self.ready.pop_first() {
            if let Some(attached) = self.sources.remove(&id) {
                return Some((id, attached));
            }
        }
        None
    }

    /// Drops heap heads whose source was destroyed before it fired.
    fn prune_stale_timers(&mut self) {
        while let Some(entry) = self.timers.peek() {
            if self.sources.contains_key(&entry.id) {
                break;
            }
            self.timers.pop();
        }
    }

    /// Rebuilds the heap once destroyed timers dominate it.
    fn compact_timers(&mut self) {
        if self.timers.len() <= 2 * self.sources.len() + STALE_TIMER_SLACK {
            return;
        }
        let sources = &self.sources;
        self.timers.retain(|entry| sources.contains_key(&entry.id));
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        self.prune_stale_timers();
        self.timers.peek().map(|e| e.deadline)
    }
}

/// Error returned by [`MainContext::attach`] once the loop has quit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopQuit;

impl fmt::Display for LoopQuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("main loop has quit")
    }
}

impl std::error::Error for LoopQuit {}

/// Run loop for foreground sources.
pub struct MainContext {
    state: Mutex<LoopState>,
    wakeup: Condvar,
}

impl MainContext {
    /// Creates a context with no sources.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopState::default()),
            wakeup: Condvar::new(),
        }
    }

    /// Attaches a source.
    ///
    /// On [`LoopQuit`] the callback is dropped and `destroy` has already run.
    pub fn attach(
        &self,
        source: Source,
        callback: Callback,
        destroy: Option<DestroyNotify>,
    ) -> Result<SourceId, LoopQuit> {
        let mut state = self.state.lock();
        if state.quit {
            drop(state);
            drop(callback);
            if let Some(destroy) = destroy {
                destroy();
            }
            return Err(LoopQuit);
        }

        let id = SourceId::next();
        state.sources.insert(
            id,
            Attached {
                callback,
                destroy,
                ready_key: None,
                priority: source.priority,
            },
        );
        match source.readiness {
            Readiness::Immediate => state.mark_ready(id),
            Readiness::At(deadline) => {
                let seq = state.seq();
                state.timers.push(TimerEntry { deadline, seq, id });
            }
            Readiness::Never => {}
        }
        drop(state);
        self.wakeup.notify_one();
        tracing::trace!(%id, priority = ?source.priority, "source attached");
        Ok(id)
    }

    /// Detaches a source that has not been dispatched yet.
    ///
    /// Returns `false` if the source already dispatched, was already
    /// destroyed, or never existed.
    pub fn destroy(&self, id: SourceId) -> bool {
        let mut state = self.state.lock();
        let Some(attached) = state.sources.remove(&id) else {
            return false;
        };
        match attached.ready_key {
            Some(key) => {
                state.ready.remove(&key);
            }
            None => state.compact_timers(),
        }
        drop(state);
        attached.discard();
        tracing::trace!(%id, "source destroyed");
        true
    }

    /// Number of sources attached and not yet dispatched.
    #[must_use]
    pub fn pending_sources(&self) -> usize {
        self.state.lock().sources.len()
    }

    /// Returns `true` once [`quit`](Self::quit) has been called.
    #[must_use]
    pub fn has_quit(&self) -> bool {
        self.state.lock().quit
    }

    /// Asks [`run`](Self::run) to return after the current dispatch.
    pub fn quit(&self) {
        self.state.lock().quit = true;
        self.wakeup.notify_all();
    }

    /// Dispatches sources on the calling thread until [`quit`](Self::quit).
    ///
    /// Sources still attached when the loop quits are discarded without
    /// running their callbacks.
    pub fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.quit {
                break;
            }
            state.promote_expired(Instant::now());
            if let Some((id, attached)) = state.take_next_ready() {
                drop(state);
                tracing::trace!(%id, "dispatching source");
                let Attached {
                    callback, destroy, ..
                } = attached;
                callback();
                if let Some(destroy) = destroy {
                    destroy();
                }
                state = self.state.lock();
                continue;
            }
            match state.next_deadline() {
                Some(deadline) => {
                    self.wakeup.wait_until(&mut state, deadline);
                }
                None => self.wakeup.wait(&mut state),
            }
        }

        let leftover: Vec<Attached> = state.sources.drain().map(|(_, a)| a).collect();
        state.ready.clear();
        state.timers.clear();
        drop(state);
        if !leftover.is_empty() {
            tracing::debug!(count = leftover.len(), "discarding sources left at quit");
        }
        for attached in leftover {
            attached.discard();
        }
    }
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MainContext")
            .field("sources", &state.sources.len())
            .field("ready", &state.ready.len())
            .field("timers", &state.timers.len())
            .field("quit", &state.quit)
            .finish()
    }
}
