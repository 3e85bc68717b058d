//! Timer thread for deadline management.
//!
//! One background thread owns a min-heap of deadlines. Cancellation removes
//! the callback and leaves the heap entry to be skipped when it surfaces.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::cause::Defect;

type Callback = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey(u64);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    key: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other.deadline.cmp(&self.deadline).then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    callbacks: FxHashMap<u64, Callback>,
    next_key: u64,
    shutdown: bool,
}

impl TimerState {
    /// Pop every live entry due at `now`.
    fn pop_expired(&mut self, now: Instant) -> Vec<Callback> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek().copied() {
            if entry.deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&entry.key) {
                expired.push(callback);
            }
        }
        expired
    }
}

struct Shared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// The runtime's timer facility.
pub(crate) struct Timer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Spawn the timer thread.
    pub(crate) fn start() -> io::Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            changed: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("skein-timer".into())
            .spawn(move || run_loop(&worker))?;
        Ok(Arc::new(Self { shared, thread: Mutex::new(Some(handle)) }))
    }

    /// Run `callback` on the timer thread once `delay` has elapsed. After
    /// shutdown the callback is dropped without running.
    pub(crate) fn schedule<F>(&self, delay: Duration, callback: F) -> TimerKey
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        if state.shutdown {
            return TimerKey(key);
        }
        let earliest = state.heap.peek().map_or(true, |entry| deadline < entry.deadline);
        state.heap.push(TimerEntry { deadline, key });
        state.callbacks.insert(key, Box::new(callback));
        drop(state);
        if earliest {
            self.shared.changed.notify_one();
        }
        TimerKey(key)
    }

    /// Cancel a pending callback. Returns whether it had not run yet.
    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        self.shared.state.lock().callbacks.remove(&key.0).is_some()
    }

    /// Number of callbacks still pending.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    /// Stop the thread and drop every pending callback. Returns whether the
    /// thread exited before `timeout`.
    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.heap.clear();
            state.callbacks.clear();
        }
        self.shared.changed.notify_all();
        let Some(handle) = self.thread.lock().take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = handle.join();
        true
    }
}

fn run_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        let expired = state.pop_expired(now);
        if !expired.is_empty() {
            trace!(count = expired.len(), "timers fired");
            drop(state);
            for callback in expired {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                    warn!(defect = %Defect::from_panic(payload), "timer callback panicked");
                }
            }
            state = shared.state.lock();
            continue;
        }
        match state.heap.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                shared.changed.wait_until(&mut state, deadline);
            }
            None => shared.changed.wait(&mut state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn test_heap_earliest_first() {
        let mut state = TimerState::default();
        let base = Instant::now();
        for (key, offset) in [(1u64, 100u64), (2, 50), (3, 150)] {
            state.heap.push(TimerEntry { deadline: base + Duration::from_millis(offset), key });
            state.callbacks.insert(key, Box::new(|| ()));
        }
        state.callbacks.remove(&1);
        let expired = state.pop_expired(base + Duration::from_millis(100));
        // Entry 1 was cancelled; only entry 2 is live and due.
        assert_eq!(expired.len(), 1);
        assert_eq!(state.heap.len(), 1);
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let timer = Timer::start().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [("slow", 40u64), ("fast", 5)] {
            let order = order.clone();
            timer.schedule(Duration::from_millis(delay), move || order.lock().push(label));
        }
        thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock(), vec!["fast", "slow"]);
        assert!(timer.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_cancel() {
        let timer = Timer::start().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let key = timer.schedule(Duration::from_millis(30), move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert!(timer.cancel(key));
        assert!(!timer.cancel(key));
        assert_eq!(timer.pending(), 0);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
        assert!(timer.shutdown(Duration::from_secs(1)));
    }
}
