//! # Fibers
//!
//! A fiber is a running effect: a lightweight, cooperatively scheduled
//! thread of execution. This module holds the state a fiber shares with the
//! rest of the runtime ([`FiberCore`]), the one-shot resumption handle used
//! by suspending primitives ([`Resumer`]), and the typed user-facing handle
//! ([`Fiber`]).
//!
//! ## Design
//!
//! Every status transition happens under the fiber's own `parking_lot`
//! mutex; side effects (scheduling, observer callbacks) run after it is
//! released.
//!
//! ```text
//!             begin_suspend             finish_suspend
//!   Running ───────────────> Suspending ─────────────> Suspended
//!      ^                         │                         │
//!      │   resumed before park   │        resume / interrupt
//!      └─────────────────────────┴─────────────────────────┘
//!   Running ──complete──> Done
//! ```
//!
//! `Suspending` covers the window in which the register function runs. A
//! resumption arriving in that window is stored and picked up by the fiber
//! itself when it tries to park, so it continues inline on the same worker.
//! Each suspension gets a fresh epoch; a [`Resumer`] from an older epoch is
//! stale and its delivery is refused.
//!
//! ## Technical References
//!
//! - [Structured concurrency](https://vorpus.org/blog/notes-on-structured-concurrency-or-go-statement-considered-harmful/)

use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::cause::{Cause, Defect};
use crate::effect::primitive::{typed_exit, ErasedCause, SharedExit, Step};
use crate::effect::{Effect, EffectError};
use crate::exit::Exit;
use crate::fiber_id::FiberId;
use crate::fiber_ref::FiberRefs;
use crate::interpreter::{FiberContext, FiberRuntime};

type Observer = Box<dyn FnOnce(&SharedExit) + Send>;

/// Observable status of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Evaluating, or queued to evaluate.
    Running,
    /// Waiting for an asynchronous resumption.
    Suspended {
        /// Whether an interrupt request would resume it.
        interruptible: bool,
    },
    /// Finished; the exit is available.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Suspending { interruptible: bool },
    Suspended { interruptible: bool },
    Done,
}

/// How a suspended fiber is woken.
pub(crate) enum Wakeup {
    Step(Step),
    Interrupted,
}

struct FiberShared {
    phase: Phase,
    /// Latched interrupt request, combined over every requester.
    pending_interrupt: Option<FiberId>,
    /// Resumption delivered while `Suspending`.
    resume: Option<Wakeup>,
    epoch: u64,
    /// The parked interpreter state while `Suspended`.
    parked: Option<Box<FiberRuntime>>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
}

/// Runtime state of a fiber shared with handles, resumers and its parent.
pub(crate) struct FiberCore {
    id: FiberId,
    seq: u64,
    shared: Mutex<FiberShared>,
    /// Fast-path mirror of `pending_interrupt.is_some()`.
    interrupted: AtomicBool,
    exit: OnceLock<SharedExit>,
    final_refs: OnceLock<FiberRefs>,
    children: Mutex<FxHashMap<u64, Weak<FiberCore>>>,
}

impl FiberCore {
    pub(crate) fn new(id: FiberId) -> Arc<Self> {
        let seq = match &id {
            FiberId::Runtime { id, .. } => *id,
            _ => 0,
        };
        Arc::new(Self {
            id,
            seq,
            shared: Mutex::new(FiberShared {
                phase: Phase::Running,
                pending_interrupt: None,
                resume: None,
                epoch: 0,
                parked: None,
                observers: Vec::new(),
                next_observer: 0,
            }),
            interrupted: AtomicBool::new(false),
            exit: OnceLock::new(),
            final_refs: OnceLock::new(),
            children: Mutex::new(FxHashMap::default()),
        })
    }

    pub(crate) fn id(&self) -> &FiberId {
        &self.id
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// The cause a checkpoint fails with.
    pub(crate) fn interrupt_cause(&self) -> ErasedCause {
        let by = self.shared.lock().pending_interrupt.clone().unwrap_or_default();
        Cause::Interrupt(by)
    }

    pub(crate) fn status(&self) -> FiberStatus {
        match self.shared.lock().phase {
            Phase::Running | Phase::Suspending { .. } => FiberStatus::Running,
            Phase::Suspended { interruptible } => FiberStatus::Suspended { interruptible },
            Phase::Done => FiberStatus::Done,
        }
    }

    pub(crate) fn exit(&self) -> Option<&SharedExit> {
        self.exit.get()
    }

    pub(crate) fn final_refs(&self) -> Option<&FiberRefs> {
        self.final_refs.get()
    }

    // ------------------------------------------------------------------------
    // Interruption
    // ------------------------------------------------------------------------

    /// Record an interrupt request from `by`. A fiber suspended
    /// interruptibly is woken at once; otherwise the request is latched for
    /// the next checkpoint.
    pub(crate) fn interrupt(&self, by: FiberId) {
        let woken = {
            let mut shared = self.shared.lock();
            if shared.phase == Phase::Done {
                return;
            }
            shared.pending_interrupt = Some(match shared.pending_interrupt.take() {
                Some(previous) => previous.combine(by.clone()),
                None => by.clone(),
            });
            self.interrupted.store(true, Ordering::Release);
            match shared.phase {
                Phase::Suspended { interruptible: true } => {
                    shared.phase = Phase::Running;
                    shared.epoch += 1;
                    shared.parked.take()
                }
                Phase::Suspending { interruptible: true } if shared.resume.is_none() => {
                    shared.resume = Some(Wakeup::Interrupted);
                    shared.epoch += 1;
                    None
                }
                _ => None,
            }
        };
        trace!(fiber = %self.id, by = %by, "interrupt requested");
        if let Some(mut runtime) = woken {
            runtime.set_wakeup(Wakeup::Interrupted);
            runtime.schedule();
        }
    }

    // ------------------------------------------------------------------------
    // Suspension
    // ------------------------------------------------------------------------

    /// Enter `Suspending`. Fails with the pending interrupt instead when the
    /// fiber is interruptible and already interrupted.
    pub(crate) fn begin_suspend(&self, interruptible: bool) -> Result<u64, ErasedCause> {
        let mut shared = self.shared.lock();
        if interruptible {
            if let Some(by) = &shared.pending_interrupt {
                return Err(Cause::Interrupt(by.clone()));
            }
        }
        shared.phase = Phase::Suspending { interruptible };
        shared.epoch += 1;
        shared.resume = None;
        Ok(shared.epoch)
    }

    /// Leave `Suspending` without parking (the register function panicked).
    pub(crate) fn abort_suspend(&self) {
        let mut shared = self.shared.lock();
        shared.phase = Phase::Running;
        shared.epoch += 1;
        shared.resume = None;
    }

    /// Park `runtime` unless a resumption already arrived, in which case it
    /// is handed back with the wakeup to continue inline.
    pub(crate) fn finish_suspend(
        &self,
        runtime: Box<FiberRuntime>,
    ) -> Option<(Box<FiberRuntime>, Wakeup)> {
        let mut shared = self.shared.lock();
        if let Some(wakeup) = shared.resume.take() {
            shared.phase = Phase::Running;
            shared.epoch += 1;
            return Some((runtime, wakeup));
        }
        let interruptible = match shared.phase {
            Phase::Suspending { interruptible } => interruptible,
            _ => false,
        };
        shared.phase = Phase::Suspended { interruptible };
        shared.parked = Some(runtime);
        None
    }

    fn resume_with<F>(&self, epoch: u64, make: F) -> bool
    where
        F: FnOnce() -> Step,
    {
        let woken = {
            let mut shared = self.shared.lock();
            if shared.epoch != epoch {
                return false;
            }
            match shared.phase {
                Phase::Suspending { .. } => {
                    shared.resume = Some(Wakeup::Step(make()));
                    shared.epoch += 1;
                    return true;
                }
                Phase::Suspended { .. } => {
                    let Some(runtime) = shared.parked.take() else {
                        return false;
                    };
                    shared.phase = Phase::Running;
                    shared.epoch += 1;
                    (runtime, make())
                }
                Phase::Running | Phase::Done => return false,
            }
        };
        let (mut runtime, step) = woken;
        runtime.set_wakeup(Wakeup::Step(step));
        runtime.schedule();
        true
    }

    fn is_waiting(&self, epoch: u64) -> bool {
        let shared = self.shared.lock();
        shared.epoch == epoch
            && matches!(shared.phase, Phase::Suspending { .. } | Phase::Suspended { .. })
    }

    // ------------------------------------------------------------------------
    // Completion and observers
    // ------------------------------------------------------------------------

    /// Register `observer` for the exit. Runs it immediately (returning
    /// `None`) when the fiber is already done.
    pub(crate) fn observe(&self, observer: Observer) -> Option<u64> {
        {
            let mut shared = self.shared.lock();
            if shared.phase != Phase::Done {
                let key = shared.next_observer;
                shared.next_observer += 1;
                shared.observers.push((key, observer));
                return Some(key);
            }
        }
        if let Some(exit) = self.exit.get() {
            notify(&self.id, observer, exit);
        }
        None
    }

    pub(crate) fn unobserve(&self, key: u64) {
        self.shared.lock().observers.retain(|(k, _)| *k != key);
    }

    /// Publish the exit and notify observers in registration order.
    pub(crate) fn complete(&self, exit: SharedExit, refs: FiberRefs) {
        let _ = self.final_refs.set(refs);
        if self.exit.set(exit).is_err() {
            warn!(fiber = %self.id, "fiber completed twice");
            return;
        }
        let observers = {
            let mut shared = self.shared.lock();
            shared.phase = Phase::Done;
            shared.parked = None;
            shared.resume = None;
            std::mem::take(&mut shared.observers)
        };
        if let Some(exit) = self.exit.get() {
            for (_, observer) in observers {
                notify(&self.id, observer, exit);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Supervision
    // ------------------------------------------------------------------------

    pub(crate) fn add_child(&self, child: &Arc<FiberCore>) {
        self.children.lock().insert(child.seq, Arc::downgrade(child));
    }

    pub(crate) fn remove_child(&self, child: &FiberCore) {
        self.children.lock().remove(&child.seq);
    }

    pub(crate) fn children(&self) -> Vec<Arc<FiberCore>> {
        let mut children: Vec<Arc<FiberCore>> =
            self.children.lock().values().filter_map(Weak::upgrade).collect();
        children.sort_by_key(|child| child.seq);
        children
    }
}

fn notify(id: &FiberId, observer: Observer, exit: &SharedExit) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(exit))) {
        let defect = Defect::from_panic(payload);
        warn!(fiber = %id, defect = %defect, "fiber observer panicked");
    }
}

impl fmt::Debug for FiberCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberCore")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// Resumer
// ============================================================================

/// One-shot capability to resume a fiber from one particular suspension.
pub(crate) struct Resumer {
    core: Arc<FiberCore>,
    epoch: u64,
}

impl Resumer {
    pub(crate) fn new(core: Arc<FiberCore>, epoch: u64) -> Self {
        Self { core, epoch }
    }

    pub(crate) fn fiber_id(&self) -> &FiberId {
        &self.core.id
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.core.is_waiting(self.epoch)
    }

    /// Deliver the step built by `make`. `make` runs under the fiber lock
    /// and only if the delivery is accepted.
    pub(crate) fn resume_with<F>(self, make: F) -> bool
    where
        F: FnOnce() -> Step,
    {
        self.core.resume_with(self.epoch, make)
    }
}

// ============================================================================
// Fiber handle
// ============================================================================

/// Typed handle to a running fiber.
pub struct Fiber<A, E = std::convert::Infallible> {
    core: Arc<FiberCore>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self { core: self.core.clone(), _marker: PhantomData }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.core.id)
            .field("status", &self.core.status())
            .finish()
    }
}

impl<A, E> Fiber<A, E> {
    pub(crate) fn from_core(core: Arc<FiberCore>) -> Self {
        Self { core, _marker: PhantomData }
    }

    /// The fiber's id.
    pub fn id(&self) -> &FiberId {
        &self.core.id
    }

    /// Current status.
    pub fn status(&self) -> FiberStatus {
        self.core.status()
    }

    /// Ids of the supervised children still alive, oldest first.
    pub fn children(&self) -> Vec<FiberId> {
        self.core.children().iter().map(|child| child.id.clone()).collect()
    }
}

impl<A, E> Fiber<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: EffectError,
{
    /// Wait for the fiber to finish. Interrupting the waiter deregisters it
    /// without affecting the fiber.
    pub fn await_exit(&self) -> Effect<Exit<A, E>> {
        await_core(self.core.clone()).map(|exit| typed_exit::<A, E>(&exit))
    }

    /// Wait for the fiber, merge its fiber refs into the caller, and
    /// continue with its exit.
    pub fn join(&self) -> Effect<A, E> {
        let core = self.core.clone();
        self.await_exit().widen_error().flat_map(move |exit| {
            Effect::with_context(move |ctx: &mut FiberContext| {
                if let Some(refs) = core.final_refs() {
                    ctx.refs.join(refs);
                }
                Effect::from_exit(exit)
            })
        })
    }

    /// Interrupt the fiber on behalf of the caller and wait for its exit.
    pub fn interrupt(&self) -> Effect<Exit<A, E>> {
        let core = self.core.clone();
        Effect::fiber_id()
            .flat_map(move |by| {
                core.interrupt(by);
                Effect::unit()
            })
            .zip_right(self.await_exit())
    }

    /// Interrupt the fiber on behalf of `by` and wait for its exit.
    pub fn interrupt_as(&self, by: FiberId) -> Effect<Exit<A, E>> {
        let core = self.core.clone();
        Effect::sync(move || core.interrupt(by)).zip_right(self.await_exit())
    }

    /// Request interruption without waiting.
    pub fn interrupt_fork(&self) -> Effect<()> {
        let core = self.core.clone();
        Effect::fiber_id().map(move |by| core.interrupt(by))
    }

    /// The exit if the fiber is done.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>> {
        let core = self.core.clone();
        Effect::sync(move || core.exit().map(typed_exit::<A, E>))
    }

    /// The exit if the fiber is done, read without running an effect.
    pub fn try_exit(&self) -> Option<Exit<A, E>> {
        self.core.exit().map(typed_exit::<A, E>)
    }
}

/// Suspend until `core` is done; the canceler removes the observer.
pub(crate) fn await_core(core: Arc<FiberCore>) -> Effect<SharedExit> {
    if let Some(exit) = core.exit() {
        return Effect::succeed(exit.clone());
    }
    Effect::async_interruptible(move |callback| {
        let observer: Observer = Box::new(move |exit: &SharedExit| {
            let _ = callback.succeed(exit.clone());
        });
        let key = core.observe(observer)?;
        Some(Effect::sync(move || core.unobserve(key)))
    })
}

/// Interrupt `core` on behalf of the running fiber and wait for it.
pub(crate) fn interrupt_core(core: Arc<FiberCore>) -> Effect<()> {
    Effect::with_context(move |ctx: &mut FiberContext| {
        core.interrupt(ctx.fiber_id.clone());
        await_core(core).as_unit()
    })
}

/// Interrupt every fiber, then wait for all of them.
pub(crate) fn interrupt_all<A, E>(fibers: Vec<Fiber<A, E>>) -> Effect<()>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Effect::with_context(move |ctx: &mut FiberContext| {
        let by = ctx.fiber_id.clone();
        let cores: Vec<Arc<FiberCore>> = fibers.into_iter().map(|fiber| fiber.core).collect();
        for core in &cores {
            core.interrupt(by.clone());
        }
        Effect::for_each(cores, await_core).as_unit()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_observers_notified_in_order_once() {
        let core = FiberCore::new(FiberId::next());
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            assert!(core.observe(Box::new(move |_: &SharedExit| log.lock().push(i))).is_some());
        }
        core.complete(Exit::Success(Arc::new(1u8)), FiberRefs::empty());
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(core.status(), FiberStatus::Done);

        // Late observers run immediately.
        let late = Arc::new(AtomicUsize::new(0));
        let seen = late.clone();
        assert!(core
            .observe(Box::new(move |_: &SharedExit| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .is_none());
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unobserve() {
        let core = FiberCore::new(FiberId::next());
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let key = core
            .observe(Box::new(move |_: &SharedExit| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        core.unobserve(key);
        core.complete(Exit::Success(Arc::new(())), FiberRefs::empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        let core = FiberCore::new(FiberId::next());
        let hits = Arc::new(AtomicUsize::new(0));
        core.observe(Box::new(|_: &SharedExit| panic!("observer failure")));
        let seen = hits.clone();
        core.observe(Box::new(move |_: &SharedExit| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        core.complete(Exit::Success(Arc::new(())), FiberRefs::empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_latches_while_running() {
        let core = FiberCore::new(FiberId::next());
        let a = FiberId::next();
        let b = FiberId::next();
        core.interrupt(a.clone());
        core.interrupt(b.clone());
        assert!(core.is_interrupted());
        assert_eq!(core.interrupt_cause(), Cause::Interrupt(a.combine(b)));
        assert!(core.begin_suspend(true).is_err());
        assert!(core.begin_suspend(false).is_ok());
    }

    #[test]
    fn test_stale_resumer_is_refused() {
        let core = FiberCore::new(FiberId::next());
        let epoch = core.begin_suspend(true).unwrap();
        let first = Resumer::new(core.clone(), epoch);
        let second = Resumer::new(core.clone(), epoch);
        assert!(first.is_pending());
        assert!(first.resume_with(|| Step::Value(Box::new(1u8))));
        assert!(!second.is_pending());
        assert!(!second.resume_with(|| Step::Value(Box::new(2u8))));
    }

    #[test]
    fn test_children_tracking() {
        let parent = FiberCore::new(FiberId::next());
        let child = FiberCore::new(FiberId::next());
        parent.add_child(&child);
        assert_eq!(parent.children().len(), 1);
        parent.remove_child(&child);
        assert!(parent.children().is_empty());
    }
}
