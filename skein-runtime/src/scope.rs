//! # Scopes
//!
//! A [`Scope`] is an ordered registry of finalizers (its release map) that
//! is closed exactly once with an exit. Closing runs every finalizer still
//! registered, newest first, uninterruptibly.
//!
//! ## Design
//!
//! The release map is either `Open` (next key plus an ordered map of
//! finalizers) or `Closed` (the recorded exit). Every transition is a
//! read-check-commit under the scope's mutex; finalizers themselves run as
//! effects after the lock is released, so a finalizer may freely touch the
//! scope that is running it.
//!
//! Child scopes created with [`Scope::fork`] are registered as a finalizer
//! of their parent and hold only a weak back-link, so a child closed first
//! removes itself from its parent.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::cause::{AnyError, Cause, Defect};
use crate::effect::primitive::erase_cause;
use crate::effect::{Effect, EffectError};
use crate::exit::Exit;

/// The exit a scope is closed with: success or failure shape only.
pub type ScopeExit = Exit<(), AnyError>;

/// A finalizer registered in a scope.
pub type Finalizer = Box<dyn FnOnce(&ScopeExit) -> Effect<()> + Send>;

/// Handle to a registered finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FinalizerKey(u64);

impl FinalizerKey {
    /// Returned when the scope was already closed and the finalizer ran
    /// immediately.
    pub const CLOSED: FinalizerKey = FinalizerKey(u64::MAX);
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

enum ReleaseMap {
    Open {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer>,
    },
    Closed(ScopeExit),
}

struct ScopeInner {
    id: u64,
    state: Mutex<ReleaseMap>,
    parent: Mutex<Option<(Weak<ScopeInner>, FinalizerKey)>>,
}

/// A finalizer registry closed exactly once.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .field("len", &self.len())
            .finish()
    }
}

impl Scope {
    /// Create an open, empty scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(ReleaseMap::Open { next_key: 0, finalizers: BTreeMap::new() }),
                parent: Mutex::new(None),
            }),
        }
    }

    /// Process-unique id, for diagnostics.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the scope has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), ReleaseMap::Closed(_))
    }

    /// Number of finalizers still registered.
    pub fn len(&self) -> usize {
        match &*self.inner.state.lock() {
            ReleaseMap::Open { finalizers, .. } => finalizers.len(),
            ReleaseMap::Closed(_) => 0,
        }
    }

    /// Whether no finalizer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `finalizer`. On a closed scope it runs at once with the
    /// recorded exit and the key is [`FinalizerKey::CLOSED`].
    pub fn add_finalizer<F>(&self, finalizer: F) -> Effect<FinalizerKey>
    where
        F: FnOnce(&ScopeExit) -> Effect<()> + Send + 'static,
    {
        let scope = self.clone();
        Effect::suspend(move || match scope.try_add(Box::new(finalizer)) {
            Ok(key) => Effect::succeed(key),
            Err((finalizer, exit)) => {
                run_finalizer(finalizer, &exit).uninterruptible().as_value(FinalizerKey::CLOSED)
            }
        })
    }

    /// Remove the finalizer under `key` and run it with `exit`. Does
    /// nothing if it is gone or the scope is closed.
    pub fn release(&self, key: FinalizerKey, exit: ScopeExit) -> Effect<()> {
        let scope = self.clone();
        Effect::suspend(move || match scope.remove(key) {
            Some(finalizer) => run_finalizer(finalizer, &exit).uninterruptible(),
            None => Effect::unit(),
        })
    }

    /// Close the scope with `exit`, running the remaining finalizers in
    /// reverse registration order. Every finalizer runs; their failures
    /// are combined in sequence and become the failure of `close`.
    /// Closing a closed scope does nothing.
    pub fn close(&self, exit: ScopeExit) -> Effect<()> {
        let scope = self.clone();
        Effect::suspend(move || {
            let finalizers = {
                let mut state = scope.inner.state.lock();
                match &mut *state {
                    ReleaseMap::Closed(_) => return Effect::unit(),
                    ReleaseMap::Open { finalizers, .. } => {
                        let taken = std::mem::take(finalizers);
                        *state = ReleaseMap::Closed(exit.clone());
                        taken
                    }
                }
            };
            scope.detach();
            trace!(scope = scope.inner.id, finalizers = finalizers.len(), "closing scope");
            run_all(finalizers.into_values().collect(), exit, Cause::Empty).uninterruptible()
        })
    }

    /// A child scope, closed with this one and detached from it when
    /// closed first. Forking a closed scope yields a closed child.
    pub fn fork(&self) -> Effect<Scope> {
        let parent = self.clone();
        Effect::suspend(move || {
            let child = Scope::new();
            let closing = child.clone();
            let finalizer: Finalizer = Box::new(move |exit: &ScopeExit| closing.close(exit.clone()));
            match parent.try_add(finalizer) {
                Ok(key) => {
                    *child.inner.parent.lock() = Some((Arc::downgrade(&parent.inner), key));
                    Effect::succeed(child)
                }
                Err((_, exit)) => {
                    let closed = child.clone();
                    child.close(exit).as_value(closed)
                }
            }
        })
    }

    /// Insert without running anything; a closed scope hands the finalizer
    /// back with its exit.
    pub(crate) fn try_add(&self, finalizer: Finalizer) -> Result<FinalizerKey, (Finalizer, ScopeExit)> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            ReleaseMap::Open { next_key, finalizers } => {
                let key = *next_key;
                *next_key += 1;
                finalizers.insert(key, finalizer);
                Ok(FinalizerKey(key))
            }
            ReleaseMap::Closed(exit) => Err((finalizer, exit.clone())),
        }
    }

    /// Remove a finalizer without running it.
    pub(crate) fn remove(&self, key: FinalizerKey) -> Option<Finalizer> {
        match &mut *self.inner.state.lock() {
            ReleaseMap::Open { finalizers, .. } => finalizers.remove(&key.0),
            ReleaseMap::Closed(_) => None,
        }
    }

    /// Close synchronously if there is nothing to run. Returns whether the
    /// scope is closed afterwards.
    pub(crate) fn try_close_empty(&self, exit: &ScopeExit) -> bool {
        {
            let mut state = self.inner.state.lock();
            let empty = match &*state {
                ReleaseMap::Closed(_) => return true,
                ReleaseMap::Open { finalizers, .. } => finalizers.is_empty(),
            };
            if !empty {
                return false;
            }
            *state = ReleaseMap::Closed(exit.clone());
        }
        self.detach();
        true
    }

    fn detach(&self) {
        let link = self.inner.parent.lock().take();
        if let Some((parent, key)) = link {
            if let Some(parent) = parent.upgrade() {
                drop(Scope { inner: parent }.remove(key));
            }
        }
    }
}

/// Run one finalizer, turning a panic while building its effect into a
/// defect.
fn run_finalizer(finalizer: Finalizer, exit: &ScopeExit) -> Effect<()> {
    panic::catch_unwind(AssertUnwindSafe(|| finalizer(exit)))
        .unwrap_or_else(|payload| Effect::die(Defect::from_panic(payload)))
}

/// Pop and run finalizers from the back, accumulating failures in order.
fn run_all(mut pending: Vec<Finalizer>, exit: ScopeExit, failed: Cause<Infallible>) -> Effect<()> {
    match pending.pop() {
        None if failed.is_empty() => Effect::unit(),
        None => Effect::fail_cause(failed),
        Some(finalizer) => run_finalizer(finalizer, &exit).exit().flat_map(move |done| {
            let failed = match done {
                Exit::Success(()) => failed,
                Exit::Failure(cause) => failed.then(cause),
            };
            run_all(pending, exit, failed)
        }),
    }
}

/// Forget a typed exit's value, keeping its failure shape.
pub(crate) fn erase_exit<A, E: EffectError>(exit: &Exit<A, E>) -> ScopeExit {
    match exit {
        Exit::Success(_) => Exit::Success(()),
        Exit::Failure(cause) => Exit::Failure(erase_cause(cause.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use pretty_assertions::assert_eq;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked()).unwrap()
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Finalizer {
        let log = log.clone();
        Box::new(move |_: &ScopeExit| {
            Effect::sync(move || log.lock().push(name))
        })
    }

    #[test]
    fn test_keys_increase() {
        let scope = Scope::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = scope.try_add(recorder(&log, "a")).ok().unwrap();
        let b = scope.try_add(recorder(&log, "b")).ok().unwrap();
        assert!(a < b);
        assert_eq!(scope.len(), 2);
        assert!(scope.remove(a).is_some());
        assert!(scope.remove(a).is_none());
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_try_close_empty() {
        let scope = Scope::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let key = scope.try_add(recorder(&log, "a")).ok().unwrap();
        assert!(!scope.try_close_empty(&Exit::Success(())));
        scope.remove(key);
        assert!(scope.try_close_empty(&Exit::Success(())));
        assert!(scope.is_closed());
        assert!(scope.try_add(recorder(&log, "b")).is_err());
    }

    #[test]
    fn test_close_runs_lifo_and_combines_failures() {
        let rt = runtime();
        let scope = Scope::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        scope.try_add(recorder(&log, "first")).ok().unwrap();
        scope.try_add(Box::new(|_: &ScopeExit| Effect::die_message("boom"))).ok().unwrap();
        scope.try_add(recorder(&log, "third")).ok().unwrap();

        let exit = rt.run_blocking(scope.close(Exit::Success(())));
        assert_eq!(*log.lock(), vec!["third", "first"]);
        let cause = exit.cause().cloned().unwrap();
        assert_eq!(cause.defects().len(), 1);
        assert!(scope.is_closed());

        // Idempotent.
        assert!(rt.run_blocking(scope.close(Exit::Success(()))).is_success());
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_add_after_close_runs_immediately() {
        let rt = runtime();
        let scope = Scope::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(rt.run_blocking(scope.close(Exit::Success(()))).is_success());
        let recorded = log.clone();
        let key = rt.run_blocking(scope.add_finalizer(move |_| {
            Effect::sync(move || recorded.lock().push("late"))
        }));
        assert_eq!(key, Exit::Success(FinalizerKey::CLOSED));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn test_release_runs_once() {
        let rt = runtime();
        let scope = Scope::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let key = scope.try_add(recorder(&log, "released")).ok().unwrap();
        assert!(rt.run_blocking(scope.release(key, Exit::Success(()))).is_success());
        assert!(rt.run_blocking(scope.release(key, Exit::Success(()))).is_success());
        assert!(rt.run_blocking(scope.close(Exit::Success(()))).is_success());
        assert_eq!(*log.lock(), vec!["released"]);
    }

    #[test]
    fn test_forked_scope_closes_with_parent_and_detaches() {
        let rt = runtime();
        let parent = Scope::new();
        let child = rt.run_blocking(parent.fork()).into_result().unwrap();
        assert_eq!(parent.len(), 1);
        assert!(rt.run_blocking(child.close(Exit::Success(()))).is_success());
        assert_eq!(parent.len(), 0);

        let second = rt.run_blocking(parent.fork()).into_result().unwrap();
        assert!(rt.run_blocking(parent.close(Exit::Success(()))).is_success());
        assert!(second.is_closed());

        let late = rt.run_blocking(parent.fork()).into_result().unwrap();
        assert!(late.is_closed());
    }
}
