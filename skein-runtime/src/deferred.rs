//! One-shot completion cell.
//!
//! A [`Deferred`] starts empty and is completed at most once with an
//! [`Exit`]. Any number of fibers may wait on it; they are resumed in the
//! order they started waiting, and a waiter that is interrupted first
//! removes itself.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::{AsyncCallback, Effect, EffectError};
use crate::exit::Exit;

enum State<A, E> {
    Pending {
        waiters: VecDeque<(u64, AsyncCallback<A, E>)>,
        next_id: u64,
    },
    Done(Exit<A, E>),
}

/// A cell completed at most once, awaited by any number of fibers.
pub struct Deferred<A, E = Infallible> {
    state: Arc<Mutex<State<A, E>>>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl<A, E> fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(*self.state.lock(), State::Done(_));
        f.debug_struct("Deferred").field("done", &done).finish()
    }
}

impl<A, E> Default for Deferred<A, E>
where
    A: Clone + Send + 'static,
    E: EffectError,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, E> Deferred<A, E>
where
    A: Clone + Send + 'static,
    E: EffectError,
{
    /// An empty cell.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending { waiters: VecDeque::new(), next_id: 0 })),
        }
    }

    /// An effect that creates an empty cell.
    pub fn make() -> Effect<Self> {
        Effect::sync(Self::new)
    }

    /// Complete with `exit`. Succeeds with whether this call completed the
    /// cell.
    pub fn complete(&self, exit: Exit<A, E>) -> Effect<bool> {
        let deferred = self.clone();
        Effect::sync(move || deferred.try_complete(exit))
    }

    /// Complete with a value.
    pub fn succeed(&self, value: A) -> Effect<bool> {
        self.complete(Exit::Success(value))
    }

    /// Complete with a typed failure.
    pub fn fail(&self, error: E) -> Effect<bool> {
        self.complete(Exit::fail(error))
    }

    /// Complete with a cause.
    pub fn fail_cause(&self, cause: Cause<E>) -> Effect<bool> {
        self.complete(Exit::Failure(cause))
    }

    /// Complete with a defect.
    pub fn die(&self, defect: Defect) -> Effect<bool> {
        self.complete(Exit::die(defect))
    }

    /// Complete with an interruption attributed to the calling fiber.
    pub fn interrupt(&self) -> Effect<bool> {
        let deferred = self.clone();
        Effect::fiber_id().flat_map(move |id| deferred.complete(Exit::interrupt(id)))
    }

    /// Wait for the cell and continue with its exit.
    pub fn await_value(&self) -> Effect<A, E> {
        let deferred = self.clone();
        Effect::suspend(move || {
            if let State::Done(exit) = &*deferred.state.lock() {
                return Effect::from_exit(exit.clone());
            }
            Effect::async_interruptible(move |callback: AsyncCallback<A, E>| {
                let mut state = deferred.state.lock();
                match &mut *state {
                    State::Done(exit) => {
                        let exit = exit.clone();
                        drop(state);
                        callback.done(exit);
                        None
                    }
                    State::Pending { waiters, next_id } => {
                        let id = *next_id;
                        *next_id += 1;
                        waiters.push_back((id, callback));
                        drop(state);
                        Some(Effect::sync(move || deferred.remove_waiter(id)))
                    }
                }
            })
        })
    }

    /// The exit if the cell is complete.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>> {
        let deferred = self.clone();
        Effect::sync(move || match &*deferred.state.lock() {
            State::Done(exit) => Some(exit.clone()),
            State::Pending { .. } => None,
        })
    }

    /// Whether the cell is complete.
    pub fn is_done(&self) -> Effect<bool> {
        let deferred = self.clone();
        Effect::sync(move || matches!(*deferred.state.lock(), State::Done(_)))
    }

    fn try_complete(&self, exit: Exit<A, E>) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending { waiters, .. } => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Done(exit.clone());
                    waiters
                }
            }
        };
        for (_, waiter) in waiters {
            waiter.done(exit.clone());
        }
        true
    }

    fn remove_waiter(&self, id: u64) {
        if let State::Pending { waiters, .. } = &mut *self.state.lock() {
            waiters.retain(|(waiter, _)| *waiter != id);
        }
    }
}
