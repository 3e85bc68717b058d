//! # Queues
//!
//! An asynchronous producer/consumer buffer for fibers.
//!
//! ## Design
//!
//! A queue is a buffer plus two FIFO lists of suspended fibers: `takers`
//! waiting for an element and, for back-pressured queues, `offers` waiting
//! for space. At most one of the two lists is non-empty at any time:
//!
//! - An offer hands its value to the oldest live taker before touching the
//!   buffer. A taker that has already been resumed (it was interrupted)
//!   refuses the value, which moves on to the next taker.
//! - Every take that frees space immediately admits pending offers in
//!   arrival order, so the buffer is only ever full while offers wait.
//! - A waiting offer is resumed before its last values are placed. An
//!   offeror interrupted in between refuses the resumption and its values
//!   are dropped, so a retried offer never duplicates them.
//!
//! All bookkeeping, including handing values to waiting fibers, happens
//! under the queue's mutex. Resuming a fiber only enqueues it on the
//! scheduler. A fiber's lock may be taken while the queue lock is held,
//! never the other way around.
//!
//! | Strategy | Full queue on `offer` |
//! |----------|-----------------------|
//! | `BackPressure` | suspends until space frees |
//! | `Sliding` | evicts the oldest element, reports `true` |
//! | `Dropping` | discards the new element, reports `false` |
//! | `Unbounded` | never full |

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cause::Cause;
use crate::effect::{AsyncCallback, Effect};
use crate::fiber_id::FiberId;

/// What a queue does with an offer when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Suspend the offering fiber until space frees.
    BackPressure,
    /// Evict the oldest element.
    Sliding,
    /// Discard the offered element.
    Dropping,
    /// No capacity limit.
    Unbounded,
}

struct PendingOffer<A> {
    id: u64,
    /// Remaining values of the offer, admitted front to back.
    values: VecDeque<A>,
    callback: AsyncCallback<bool>,
}

struct State<A> {
    buffer: VecDeque<A>,
    takers: VecDeque<(u64, AsyncCallback<A>)>,
    offers: VecDeque<PendingOffer<A>>,
    next_waiter: u64,
    /// Set once, to the fiber that shut the queue down.
    shutdown: Option<FiberId>,
    shutdown_waiters: Vec<(u64, AsyncCallback<()>)>,
}

struct Inner<A> {
    capacity: usize,
    strategy: Strategy,
    state: Mutex<State<A>>,
}

/// An asynchronous queue shared by fibers.
pub struct Queue<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Queue")
            .field("strategy", &self.inner.strategy)
            .field("capacity", &self.inner.capacity)
            .field("size", &state.buffer.len())
            .field("takers", &state.takers.len())
            .field("offers", &state.offers.len())
            .field("shutdown", &state.shutdown.is_some())
            .finish()
    }
}

impl<A: Send + 'static> Queue<A> {
    fn with_strategy(capacity: usize, strategy: Strategy) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                strategy,
                state: Mutex::new(State {
                    buffer: VecDeque::new(),
                    takers: VecDeque::new(),
                    offers: VecDeque::new(),
                    next_waiter: 0,
                    shutdown: None,
                    shutdown_waiters: Vec::new(),
                }),
            }),
        }
    }

    /// A queue holding at most `capacity` elements whose offers suspend
    /// while it is full. A capacity of 0 is raised to 1.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::BackPressure)
    }

    /// A bounded queue that evicts its oldest element to make room.
    pub fn sliding(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::Sliding)
    }

    /// A bounded queue that discards offers while full.
    pub fn dropping(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::Dropping)
    }

    /// A queue without a capacity limit.
    pub fn unbounded() -> Self {
        Self::with_strategy(usize::MAX, Strategy::Unbounded)
    }

    /// Maximum number of buffered elements.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// The overflow strategy.
    pub fn strategy(&self) -> Strategy {
        self.inner.strategy
    }

    // ------------------------------------------------------------------------
    // Offering
    // ------------------------------------------------------------------------

    /// Offer one value. Succeeds with `false` only when a dropping queue
    /// discarded it.
    pub fn offer(&self, value: A) -> Effect<bool> {
        self.offer_all(std::iter::once(value))
    }

    /// Offer values in order. A back-pressured queue admits what fits and
    /// suspends on the remainder as one batch. Succeeds with whether every
    /// value was accepted.
    pub fn offer_all<I>(&self, values: I) -> Effect<bool>
    where
        I: IntoIterator<Item = A>,
        I::IntoIter: Send + 'static,
    {
        let queue = self.clone();
        let values = values.into_iter();
        Effect::suspend(move || {
            let mut state = queue.inner.state.lock();
            if state.shutdown.is_some() {
                return Effect::interrupt();
            }
            let mut accepted = true;
            let mut rest = VecDeque::new();
            for value in values {
                if !rest.is_empty() {
                    rest.push_back(value);
                    continue;
                }
                match queue.offer_locked(&mut state, value) {
                    Ok(taken) => accepted &= taken,
                    Err(value) => rest.push_back(value),
                }
            }
            drop(state);
            if rest.is_empty() {
                Effect::succeed(accepted)
            } else {
                queue.suspend_offer(rest)
            }
        })
    }

    /// Place `value` without blocking; `Err` hands it back when a
    /// back-pressured queue is full.
    fn offer_locked(&self, state: &mut State<A>, mut value: A) -> Result<bool, A> {
        while let Some((_, taker)) = state.takers.pop_front() {
            match taker.succeed(value) {
                Ok(()) => return Ok(true),
                Err(refused) => value = refused,
            }
        }
        if state.buffer.len() < self.inner.capacity {
            state.buffer.push_back(value);
            return Ok(true);
        }
        match self.inner.strategy {
            Strategy::Sliding => {
                state.buffer.pop_front();
                state.buffer.push_back(value);
                Ok(true)
            }
            Strategy::Dropping => Ok(false),
            Strategy::BackPressure | Strategy::Unbounded => Err(value),
        }
    }

    fn suspend_offer(&self, values: VecDeque<A>) -> Effect<bool> {
        let queue = self.clone();
        Effect::async_interruptible(move |callback: AsyncCallback<bool>| {
            queue.register_offer(values, callback)
        })
    }

    /// Park an offer's remaining values, or complete it at once if space
    /// freed since the fast path gave up.
    fn register_offer(
        &self,
        mut values: VecDeque<A>,
        callback: AsyncCallback<bool>,
    ) -> Option<Effect<()>> {
        let mut state = self.inner.state.lock();
        if let Some(by) = state.shutdown.clone() {
            drop(state);
            callback.fail_cause(Cause::Interrupt(by));
            return None;
        }
        // Place values until the remainder fits or the buffer is full.
        while values.len() > self.free_space(&state) {
            let Some(value) = values.pop_front() else {
                break;
            };
            if let Err(value) = self.offer_locked(&mut state, value) {
                values.push_front(value);
                break;
            }
        }
        if values.len() <= self.free_space(&state) {
            self.commit_offer(&mut state, values, callback);
            return None;
        }
        let id = state.next_waiter;
        state.next_waiter += 1;
        state.offers.push_back(PendingOffer { id, values, callback });
        drop(state);
        let queue = self.clone();
        Some(Effect::sync(move || {
            queue.inner.state.lock().offers.retain(|offer| offer.id != id);
        }))
    }

    /// Resume the offeror, then place its values. An offeror interrupted
    /// in the meantime refuses, and its values are dropped unseen.
    fn commit_offer(
        &self,
        state: &mut State<A>,
        values: VecDeque<A>,
        callback: AsyncCallback<bool>,
    ) {
        if callback.succeed(true).is_err() {
            debug!(values = values.len(), "withdrew the values of an interrupted offer");
            return;
        }
        for value in values {
            let placed = self.offer_locked(state, value);
            debug_assert!(placed.is_ok(), "committed offer overflowed the buffer");
        }
    }

    fn free_space(&self, state: &State<A>) -> usize {
        self.inner.capacity.saturating_sub(state.buffer.len())
    }

    /// Move pending offers into freed space, oldest first. A batch larger
    /// than the free space is admitted in part and keeps waiting; values
    /// admitted that way stay even if its offeror is interrupted later.
    fn admit_offers(&self, state: &mut State<A>) {
        loop {
            let free = self.free_space(state);
            if free == 0 {
                return;
            }
            let Some(front) = state.offers.front_mut() else {
                return;
            };
            if front.values.len() > free {
                if !front.callback.is_pending() {
                    // Interrupted; its canceler has not run yet.
                    state.offers.pop_front();
                    continue;
                }
                state.buffer.extend(front.values.drain(..free));
                return;
            }
            if let Some(offer) = state.offers.pop_front() {
                self.commit_offer(state, offer.values, offer.callback);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Taking
    // ------------------------------------------------------------------------

    /// Take the oldest element, suspending while the queue is empty.
    pub fn take(&self) -> Effect<A> {
        let queue = self.clone();
        Effect::suspend(move || {
            let mut state = queue.inner.state.lock();
            if state.shutdown.is_some() {
                return Effect::interrupt();
            }
            if let Some(value) = state.buffer.pop_front() {
                queue.admit_offers(&mut state);
                return Effect::succeed(value);
            }
            drop(state);
            queue.suspend_take()
        })
    }

    fn suspend_take(&self) -> Effect<A> {
        let queue = self.clone();
        Effect::async_interruptible(move |callback: AsyncCallback<A>| {
            let mut state = queue.inner.state.lock();
            if let Some(by) = state.shutdown.clone() {
                drop(state);
                callback.fail_cause(Cause::Interrupt(by));
                return None;
            }
            if let Some(value) = state.buffer.pop_front() {
                match callback.succeed(value) {
                    Ok(()) => queue.admit_offers(&mut state),
                    Err(value) => state.buffer.push_front(value),
                }
                return None;
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.takers.push_back((id, callback));
            drop(state);
            Some(Effect::sync(move || {
                queue.inner.state.lock().takers.retain(|(taker, _)| *taker != id);
            }))
        })
    }

    /// Take every buffered element without suspending.
    pub fn take_all(&self) -> Effect<Vec<A>> {
        self.take_up_to(usize::MAX)
    }

    /// Take up to `max` buffered elements without suspending.
    pub fn take_up_to(&self, max: usize) -> Effect<Vec<A>> {
        let queue = self.clone();
        Effect::suspend(move || {
            let mut state = queue.inner.state.lock();
            if state.shutdown.is_some() {
                return Effect::interrupt();
            }
            let mut taken = Vec::new();
            // Admitting offers as space frees keeps FIFO order across the
            // buffer and the waiting batches.
            while taken.len() < max {
                match state.buffer.pop_front() {
                    Some(value) => {
                        taken.push(value);
                        queue.admit_offers(&mut state);
                    }
                    None => break,
                }
            }
            Effect::succeed(taken)
        })
    }

    /// Take the oldest element if there is one.
    pub fn poll(&self) -> Effect<Option<A>> {
        self.take_up_to(1).map(|mut taken| taken.pop())
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Number of buffered elements.
    pub fn size(&self) -> Effect<usize> {
        let queue = self.clone();
        Effect::suspend(move || {
            let state = queue.inner.state.lock();
            if state.shutdown.is_some() {
                return Effect::interrupt();
            }
            Effect::succeed(state.buffer.len())
        })
    }

    /// Whether no element is buffered.
    pub fn is_empty(&self) -> Effect<bool> {
        self.size().map(|size| size == 0)
    }

    /// Whether the buffer is at capacity.
    pub fn is_full(&self) -> Effect<bool> {
        let capacity = self.inner.capacity;
        self.size().map(move |size| size >= capacity)
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Shut the queue down: waiting takers and offerors are interrupted on
    /// behalf of the caller, buffered elements are dropped, and every later
    /// operation interrupts its caller. Idempotent.
    pub fn shutdown(&self) -> Effect<()> {
        let queue = self.clone();
        Effect::fiber_id().map(move |by| {
            let (takers, offers, waiters) = {
                let mut state = queue.inner.state.lock();
                if state.shutdown.is_some() {
                    return;
                }
                state.shutdown = Some(by.clone());
                state.buffer.clear();
                (
                    std::mem::take(&mut state.takers),
                    std::mem::take(&mut state.offers),
                    std::mem::take(&mut state.shutdown_waiters),
                )
            };
            debug!(
                by = %by,
                takers = takers.len(),
                offers = offers.len(),
                "queue shut down"
            );
            for (_, taker) in takers {
                taker.fail_cause(Cause::Interrupt(by.clone()));
            }
            for offer in offers {
                offer.callback.fail_cause(Cause::Interrupt(by.clone()));
            }
            for (_, waiter) in waiters {
                let _ = waiter.succeed(());
            }
        })
    }

    /// Whether the queue has been shut down.
    pub fn is_shutdown(&self) -> Effect<bool> {
        let queue = self.clone();
        Effect::sync(move || queue.inner.state.lock().shutdown.is_some())
    }

    /// Wait until the queue is shut down.
    pub fn await_shutdown(&self) -> Effect<()> {
        let queue = self.clone();
        Effect::async_interruptible(move |callback: AsyncCallback<()>| {
            let mut state = queue.inner.state.lock();
            if state.shutdown.is_some() {
                drop(state);
                let _ = callback.succeed(());
                return None;
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.shutdown_waiters.push((id, callback));
            drop(state);
            Some(Effect::sync(move || {
                queue.inner.state.lock().shutdown_waiters.retain(|(waiter, _)| *waiter != id);
            }))
        })
    }
}
