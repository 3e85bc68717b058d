//! # Fiber Interpreter
//!
//! The trampoline that evaluates [`Primitive`] trees on a fiber.
//!
//! ## Design
//!
//! A [`FiberRuntime`] owns everything a running fiber needs: its context
//! (id, fiber refs, runtime flags, scopes), an explicit continuation stack,
//! and the pending canceler of an interruptible suspension. The run loop
//! steps between three states:
//!
//! ```text
//!   Eval(primitive) ── eval ──> Eval | Value | Failure | suspend | yield
//!   Value(v)        ── pop  ──> success continuation, or skip to the next
//!   Failure(cause)  ── pop  ──> failure handler, or skip to the next
//! ```
//!
//! Nothing recurses on the host stack: sequencing pushes a frame and the
//! loop continues, so programs of any depth run in constant stack.
//!
//! Interruption is observed at checkpoints: before every evaluation step
//! while the fiber is interruptible, when the stack unwinds past a region
//! that re-enables interruption, and when an interruptible suspension is
//! woken. Failure handlers are skipped while the fiber is interruptible and
//! interrupted, so an interrupted fiber unwinds to its masked finalizers.
//!
//! When the stack empties the fiber becomes uninterruptible, closes its own
//! scope (interrupting and awaiting every child it still supervises), and
//! only then publishes its exit.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use crate::cause::{Cause, Defect};
use crate::effect::primitive::{
    Continuation, ErasedCause, ForkTarget, Recovery, Share, SharedExit, Step, Value,
};
use crate::effect::Primitive;
use crate::exit::Exit;
use crate::fiber::{interrupt_core, FiberCore, Resumer, Wakeup};
use crate::fiber_id::FiberId;
use crate::fiber_ref::FiberRefs;
use crate::flags::RuntimeFlags;
use crate::runtime::RuntimeShared;
use crate::scope::{FinalizerKey, Finalizer, Scope, ScopeExit};

/// The running fiber's state visible to effects.
pub(crate) struct FiberContext {
    pub(crate) fiber_id: FiberId,
    pub(crate) refs: FiberRefs,
    pub(crate) flags: RuntimeFlags,
    /// Innermost scope opened with `Effect::scoped`, or `fiber_scope`.
    pub(crate) scope: Scope,
    /// Scope owning the fiber's supervised children; closed when the fiber
    /// finishes.
    pub(crate) fiber_scope: Scope,
    pub(crate) runtime: Arc<RuntimeShared>,
}

enum Frame {
    OnSuccess(Continuation),
    OnFailure(Recovery),
    OnSuccessAndFailure(Continuation, Recovery),
    RestoreFlags(RuntimeFlags),
    RestoreScope(Scope),
}

enum Next {
    Continue(Step),
    Suspend,
    Yield(Step),
}

/// Where and how a new fiber is started.
pub(crate) struct ForkOptions {
    pub(crate) refs: FiberRefs,
    pub(crate) flags: RuntimeFlags,
    /// Scope whose closing interrupts the fiber.
    pub(crate) scope: Scope,
    /// Supervising fiber, if any.
    pub(crate) parent: Option<Arc<FiberCore>>,
    /// Credited with the interruption when `scope` is already closed.
    pub(crate) forked_by: FiberId,
}

/// Interpreter state of one fiber. Owned by exactly one place at a time: a
/// worker running it, a scheduler queue, or its core while parked.
pub(crate) struct FiberRuntime {
    core: Arc<FiberCore>,
    context: FiberContext,
    stack: Vec<Frame>,
    wakeup: Option<Wakeup>,
    canceler: Option<Primitive>,
    share: Share,
    parent: Option<Weak<FiberCore>>,
    registration: Option<(Scope, FinalizerKey)>,
    finishing: bool,
    outcome: Option<Result<Value, ErasedCause>>,
}

/// Start a fiber evaluating `body` and return its core.
pub(crate) fn spawn(
    runtime: &Arc<RuntimeShared>,
    body: Primitive,
    share: Share,
    options: ForkOptions,
) -> Arc<FiberCore> {
    let ForkOptions { refs, flags, scope, parent, forked_by } = options;
    let id = FiberId::next();
    let core = FiberCore::new(id.clone());

    let target = core.clone();
    let finalizer: Finalizer = Box::new(move |_: &ScopeExit| interrupt_core(target));
    let registration = match scope.try_add(finalizer) {
        Ok(key) => Some((scope.clone(), key)),
        Err(_) => {
            // Still runs, but fails at its first interruptible step.
            core.interrupt(forked_by);
            None
        }
    };
    if let Some(parent) = &parent {
        parent.add_child(&core);
    }

    let fiber_scope = Scope::new();
    let fiber = Box::new(FiberRuntime {
        core: core.clone(),
        context: FiberContext {
            fiber_id: id,
            refs,
            flags,
            scope: fiber_scope.clone(),
            fiber_scope,
            runtime: runtime.clone(),
        },
        stack: Vec::new(),
        wakeup: Some(Wakeup::Step(Step::Eval(body))),
        canceler: None,
        share,
        parent: parent.as_ref().map(Arc::downgrade),
        registration,
        finishing: false,
        outcome: None,
    });
    trace!(fiber = %core.id(), scope = scope.id(), "fiber forked");
    fiber.schedule();
    core
}

/// Run `f`, turning a panic into a defect.
fn guarded<F>(f: F) -> Step
where
    F: FnOnce() -> Step,
{
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Step::Failure(Cause::Die(Defect::from_panic(payload))))
}

impl FiberRuntime {
    pub(crate) fn set_wakeup(&mut self, wakeup: Wakeup) {
        self.wakeup = Some(wakeup);
    }

    /// Hand the fiber to the scheduler.
    pub(crate) fn schedule(self: Box<Self>) {
        let runtime = self.context.runtime.clone();
        runtime.scheduler.schedule(self);
    }

    fn yield_now(mut self: Box<Self>, step: Step) {
        self.wakeup = Some(Wakeup::Step(step));
        let runtime = self.context.runtime.clone();
        runtime.scheduler.yield_task(self);
    }

    fn interrupted(&self) -> bool {
        self.context.flags.interruptible() && self.core.is_interrupted()
    }

    /// Evaluate until the fiber suspends, yields or finishes.
    pub(crate) fn run(self: Box<Self>) {
        let mut fiber = self;
        let Some(wakeup) = fiber.wakeup.take() else {
            warn!(fiber = %fiber.core.id(), "fiber scheduled without a wakeup");
            return;
        };
        let budget = fiber.context.runtime.config.scheduler.ops_before_yield;
        let mut ops = 0usize;
        let mut step = fiber.resume_step(wakeup);

        loop {
            step = match step {
                Step::Eval(primitive) => {
                    if fiber.interrupted() {
                        drop(primitive);
                        Step::Failure(fiber.core.interrupt_cause())
                    } else if ops >= budget && fiber.context.flags.cooperative_yielding() {
                        trace!(fiber = %fiber.core.id(), ops, "budget exhausted");
                        fiber.yield_now(Step::Eval(primitive));
                        return;
                    } else {
                        ops += 1;
                        match fiber.eval(primitive) {
                            Next::Continue(next) => next,
                            Next::Yield(next) => {
                                fiber.yield_now(next);
                                return;
                            }
                            Next::Suspend => {
                                let core = fiber.core.clone();
                                match core.finish_suspend(fiber) {
                                    Some((resumed, wakeup)) => {
                                        fiber = resumed;
                                        fiber.resume_step(wakeup)
                                    }
                                    None => return,
                                }
                            }
                        }
                    }
                }
                Step::Value(value) => match fiber.stack.pop() {
                    None => match fiber.finish(Ok(value)) {
                        Some(next) => next,
                        None => return,
                    },
                    Some(Frame::OnSuccess(k)) | Some(Frame::OnSuccessAndFailure(k, _)) => {
                        guarded(move || Step::Eval(k(value)))
                    }
                    Some(Frame::OnFailure(_)) => Step::Value(value),
                    Some(Frame::RestoreFlags(flags)) => {
                        fiber.context.flags = flags;
                        if fiber.interrupted() {
                            Step::Failure(fiber.core.interrupt_cause())
                        } else {
                            Step::Value(value)
                        }
                    }
                    Some(Frame::RestoreScope(scope)) => {
                        fiber.context.scope = scope;
                        Step::Value(value)
                    }
                },
                Step::Failure(cause) => match fiber.stack.pop() {
                    None => match fiber.finish(Err(cause)) {
                        Some(next) => next,
                        None => return,
                    },
                    Some(Frame::OnSuccess(_)) => Step::Failure(cause),
                    Some(Frame::OnFailure(h)) | Some(Frame::OnSuccessAndFailure(_, h)) => {
                        if fiber.interrupted() {
                            Step::Failure(fiber.with_interruption(cause))
                        } else {
                            guarded(move || Step::Eval(h(cause)))
                        }
                    }
                    Some(Frame::RestoreFlags(flags)) => {
                        fiber.context.flags = flags;
                        if fiber.interrupted() {
                            Step::Failure(fiber.with_interruption(cause))
                        } else {
                            Step::Failure(cause)
                        }
                    }
                    Some(Frame::RestoreScope(scope)) => {
                        fiber.context.scope = scope;
                        Step::Failure(cause)
                    }
                },
            };
        }
    }

    /// Append the pending interruption unless the cause already records one.
    fn with_interruption(&self, cause: ErasedCause) -> ErasedCause {
        if cause.is_interrupted() {
            cause
        } else {
            cause.then(self.core.interrupt_cause())
        }
    }

    /// The first step after a wakeup. Interrupting a suspension that left a
    /// canceler runs the canceler uninterruptibly, then fails with the
    /// interruption followed by anything the canceler failed with.
    fn resume_step(&mut self, wakeup: Wakeup) -> Step {
        match wakeup {
            Wakeup::Step(step) => {
                self.canceler = None;
                step
            }
            Wakeup::Interrupted => {
                let cause = self.core.interrupt_cause();
                match self.canceler.take() {
                    None => Step::Failure(cause),
                    Some(canceler) => {
                        self.stack.push(Frame::RestoreFlags(self.context.flags));
                        self.context.flags.remove(RuntimeFlags::INTERRUPTION);
                        let after = cause.clone();
                        Step::Eval(Primitive::OnSuccessAndFailure(
                            Box::new(canceler),
                            Box::new(move |_: Value| Primitive::fail_cause(cause)),
                            Box::new(move |failed: ErasedCause| {
                                Primitive::fail_cause(after.then(failed))
                            }),
                        ))
                    }
                }
            }
        }
    }

    fn eval(&mut self, primitive: Primitive) -> Next {
        let step = match primitive {
            Primitive::Succeed(value) => Step::Value(value),
            Primitive::Fail(cause) => guarded(move || Step::Failure(cause())),
            Primitive::Sync(f) => guarded(move || Step::Value(f())),
            Primitive::Suspend(f) => guarded(move || Step::Eval(f())),
            Primitive::OnSuccess(body, k) => {
                self.stack.push(Frame::OnSuccess(k));
                Step::Eval(*body)
            }
            Primitive::OnFailure(body, h) => {
                self.stack.push(Frame::OnFailure(h));
                Step::Eval(*body)
            }
            Primitive::OnSuccessAndFailure(body, k, h) => {
                self.stack.push(Frame::OnSuccessAndFailure(k, h));
                Step::Eval(*body)
            }
            Primitive::Async(register) => {
                let epoch = match self.core.begin_suspend(self.context.flags.interruptible()) {
                    Ok(epoch) => epoch,
                    Err(cause) => return Next::Continue(Step::Failure(cause)),
                };
                let resumer = Resumer::new(self.core.clone(), epoch);
                match panic::catch_unwind(AssertUnwindSafe(move || register(resumer))) {
                    Ok(canceler) => {
                        self.canceler = canceler;
                        return Next::Suspend;
                    }
                    Err(payload) => {
                        self.core.abort_suspend();
                        Step::Failure(Cause::Die(Defect::from_panic(payload)))
                    }
                }
            }
            Primitive::Fork { body, target, share } => self.fork(*body, target, share),
            Primitive::UpdateRuntimeFlags { patch, body } => {
                let previous = self.context.flags;
                let next = patch.apply(previous);
                if next != previous {
                    self.stack.push(Frame::RestoreFlags(previous));
                    self.context.flags = next;
                }
                guarded(move || Step::Eval(body(previous)))
            }
            Primitive::WithContext(f) => {
                let context = &mut self.context;
                guarded(move || Step::Eval(f(context)))
            }
            Primitive::WithScope { scope, body } => {
                let outer = mem::replace(&mut self.context.scope, scope);
                self.stack.push(Frame::RestoreScope(outer));
                Step::Eval(*body)
            }
            Primitive::Yield => return Next::Yield(Step::Value(Box::new(()))),
        };
        Next::Continue(step)
    }

    fn fork(&mut self, body: Primitive, target: ForkTarget, share: Share) -> Step {
        let (scope, supervised) = match target {
            ForkTarget::Parent => (self.context.fiber_scope.clone(), true),
            ForkTarget::CurrentScope => (self.context.scope.clone(), true),
            ForkTarget::Global => (self.context.runtime.global_scope.clone(), false),
            ForkTarget::Scope(scope) => (scope, false),
        };
        let options = ForkOptions {
            refs: self.context.refs.fork(),
            flags: self.context.flags,
            scope,
            parent: supervised.then(|| self.core.clone()),
            forked_by: self.context.fiber_id.clone(),
        };
        let runtime = self.context.runtime.clone();
        let child = spawn(&runtime, body, share, options);
        Step::Value(Box::new(child))
    }

    /// The stack is empty. The first time, close the fiber scope; once that
    /// is done, publish the exit. Returns the next step while closing.
    fn finish(&mut self, result: Result<Value, ErasedCause>) -> Option<Step> {
        if !self.finishing {
            self.finishing = true;
            self.context.flags.remove(RuntimeFlags::INTERRUPTION);
            let shape: ScopeExit = match &result {
                Ok(_) => Exit::Success(()),
                Err(cause) => Exit::Failure(cause.clone()),
            };
            if self.context.fiber_scope.try_close_empty(&shape) {
                self.complete(result);
                return None;
            }
            self.outcome = Some(result);
            let close = self.context.fiber_scope.close(shape);
            return Some(Step::Eval(close.into_primitive()));
        }

        let outcome = match (self.outcome.take(), result) {
            (Some(original), Ok(_)) => original,
            (Some(Ok(_)), Err(closing)) => Err(closing),
            (Some(Err(cause)), Err(closing)) => Err(cause.then(closing)),
            (None, result) => result,
        };
        self.complete(outcome);
        None
    }

    fn complete(&mut self, result: Result<Value, ErasedCause>) {
        let exit: SharedExit = match result {
            Ok(value) => match (self.share)(value) {
                Ok(shared) => Exit::Success(shared),
                Err(cause) => Exit::Failure(cause),
            },
            Err(cause) => Exit::Failure(cause),
        };
        if let Some((scope, key)) = self.registration.take() {
            drop(scope.remove(key));
        }
        if let Some(parent) = self.parent.take().and_then(|parent| parent.upgrade()) {
            parent.remove_child(&self.core);
        }
        debug!(
            fiber = %self.core.id(),
            success = exit.is_success(),
            interrupted = exit.is_interrupted(),
            "fiber finished"
        );
        let refs = mem::take(&mut self.context.refs);
        self.core.complete(exit, refs);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::cause::Cause;
    use crate::config::RuntimeConfig;
    use crate::deferred::Deferred;
    use crate::effect::Effect;
    use crate::exit::Exit;
    use crate::fiber::FiberStatus;
    use crate::runtime::Runtime;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked()).unwrap()
    }

    fn count_down(n: u64) -> Effect<u64> {
        if n == 0 {
            Effect::succeed(0)
        } else {
            Effect::suspend(move || count_down(n - 1)).map(|m| m + 1)
        }
    }

    #[test]
    fn test_deep_chains_run_in_constant_stack() {
        let rt = runtime();
        assert_eq!(rt.run_blocking(count_down(200_000)), Exit::Success(200_000));

        let mut effect: Effect<u64> = Effect::succeed(0);
        for _ in 0..100_000 {
            effect = effect.flat_map(|n| Effect::succeed(n + 1));
        }
        assert_eq!(rt.run_blocking(effect), Exit::Success(100_000));
    }

    #[test]
    fn test_panic_becomes_defect() {
        let rt = runtime();
        let effect: Effect<i32> = Effect::succeed(1).map(|_: i32| -> i32 { panic!("bad map") });
        match rt.run_blocking(effect) {
            Exit::Failure(cause) => {
                assert!(cause.is_die());
                assert_eq!(cause.defects()[0].message(), "bad map");
            }
            Exit::Success(_) => panic!("expected a defect"),
        }
    }

    #[test]
    fn test_error_recovery_skips_success_frames() {
        let rt = runtime();
        let effect: Effect<i32, String> = Effect::fail("boom".to_string())
            .map(|n: i32| n + 1)
            .catch_all(|e| Effect::succeed(e.len() as i32));
        assert_eq!(rt.run_blocking(effect), Exit::Success(4));
    }

    #[test]
    fn test_interrupt_wakes_suspended_fiber() {
        let rt = runtime();
        let fiber = rt.run_fork(Effect::<()>::never());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fiber.status(), FiberStatus::Suspended { interruptible: true });
        let exit = rt.run_blocking(fiber.interrupt());
        assert!(exit.into_result().unwrap().is_interrupted());
        assert_eq!(fiber.status(), FiberStatus::Done);
    }

    #[test]
    fn test_handlers_skipped_when_interrupted() {
        let rt = runtime();
        let recovered = Arc::new(AtomicBool::new(false));
        let flag = recovered.clone();
        let fiber = rt.run_fork(Effect::<(), ()>::never().catch_cause(move |_| {
            flag.store(true, Ordering::SeqCst);
            Effect::<(), ()>::unit()
        }));
        std::thread::sleep(Duration::from_millis(20));
        let exit = rt.run_blocking(fiber.interrupt());
        assert!(exit.into_result().unwrap().is_interrupted());
        assert!(!recovered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_masked_region_completes_before_interrupt() {
        let rt = runtime();
        let started: Deferred<()> = Deferred::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let body: Effect<()> = started
            .succeed(())
            .zip_right(Effect::sleep(Duration::from_millis(30)))
            .zip_right(Effect::sync(move || flag.store(true, Ordering::SeqCst)))
            .uninterruptible();
        let fiber = rt.run_fork(body);
        assert!(rt.run_blocking(started.await_value()).is_success());
        let exit = rt.run_blocking(fiber.interrupt());
        assert!(finished.load(Ordering::SeqCst));
        // The request is honored when the region ends.
        assert!(exit.into_result().unwrap().is_interrupted());
    }

    #[test]
    fn test_canceler_runs_on_interrupt() {
        let rt = runtime();
        let (registered_tx, registered_rx) = crossbeam_channel::bounded(1);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen = cancelled.clone();
        let fiber = rt.run_fork(Effect::<()>::async_interruptible(move |_callback| {
            let _ = registered_tx.send(());
            Some(Effect::sync(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
        }));
        registered_rx.recv().unwrap();
        let exit = rt.run_blocking(fiber.interrupt());
        assert!(exit.into_result().unwrap().is_interrupted());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_budget_yields_to_other_fibers() {
        // One worker and a tiny budget: a busy loop must not starve the
        // fiber that flips the flag.
        let rt = Runtime::new(
            RuntimeConfig::builder().num_workers(1).ops_before_yield(64).build_unchecked(),
        )
        .unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let spin = stop.clone();
        let busy = rt.run_fork(Effect::<(), ()>::forever(move || {
            let spin = spin.clone();
            Effect::attempt(move || if spin.load(Ordering::SeqCst) { Err(()) } else { Ok(()) })
        }));
        let flag = stop.clone();
        let exit = rt.run_blocking(Effect::<()>::sync(move || flag.store(true, Ordering::SeqCst)));
        assert!(exit.is_success());
        assert_eq!(rt.run_blocking(busy.await_exit()), Exit::Success(Exit::fail(())));
    }

    #[test]
    fn test_child_interrupted_when_parent_finishes() {
        let rt = runtime();
        let started: Deferred<()> = Deferred::new();
        let signal = started.clone();
        let child_exit = Arc::new(parking_lot::Mutex::new(None));
        let slot = child_exit.clone();
        let child: Effect<()> = signal
            .succeed(())
            .zip_right(Effect::never())
            .on_exit(move |exit| {
                *slot.lock() = Some(exit.is_interrupted());
                Effect::unit()
            });
        let parent = child.fork().zip_right(started.await_value());
        assert!(rt.run_blocking(parent).is_success());
        // The parent's exit is published only after its children are done.
        assert_eq!(*child_exit.lock(), Some(true));
    }

    #[test]
    fn test_fork_into_closed_scope_is_interrupted() {
        let rt = runtime();
        let scope = crate::scope::Scope::new();
        assert!(rt.run_blocking(scope.close(Exit::Success(()))).is_success());
        let program = Effect::<u8>::never()
            .fork_in(&scope)
            .flat_map(|fiber| fiber.await_exit());
        match rt.run_blocking(program) {
            Exit::Success(Exit::Failure(cause)) => assert!(matches!(cause, Cause::Interrupt(_))),
            other => panic!("unexpected exit: {:?}", other),
        }
    }
}
