//! # Effects
//!
//! An [`Effect<A, E>`] is an immutable description of a computation that
//! may succeed with `A`, fail with a [`Cause<E>`], or never finish. Nothing
//! happens until a [`Runtime`](crate::Runtime) interprets it on a fiber.
//!
//! ## Design
//!
//! - Descriptions are consumed when run. Code that needs to run "the same"
//!   effect twice builds it twice from a closure; no node graph is ever
//!   shared between two runs.
//! - Every combinator lowers to a small set of [`Primitive`] nodes. The
//!   interpreter keeps its own continuation stack, so chains of any length
//!   evaluate in constant host stack.
//! - `E` defaults to [`Infallible`]; effects that cannot fail compose with
//!   fallible ones through [`Effect::widen_error`].
//!
//! The combinator surface is split across `ops` (sequencing, error
//! handling, interruption, forking, resources) and `concurrent` (racing,
//! parallelism, timeouts).

mod concurrent;
mod ops;
pub(crate) mod primitive;

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::fiber::Resumer;
use crate::fiber_id::FiberId;
use crate::interpreter::FiberContext;

pub use ops::Restore;

pub(crate) use primitive::Primitive;
use primitive::{downcast_value, erase_cause, Step};

/// Bound on error types carried in the failure channel.
///
/// Errors are shared between every observer of a fiber, so they must be
/// cloneable and thread-safe.
pub trait EffectError: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> EffectError for T {}

/// A description of an effectful computation.
#[must_use = "effects do nothing unless run"]
pub struct Effect<A, E = Infallible> {
    primitive: Primitive,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.primitive).finish()
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_primitive(primitive: Primitive) -> Self {
        Self { primitive, _marker: PhantomData }
    }

    pub(crate) fn into_primitive(self) -> Primitive {
        self.primitive
    }

    /// Re-tag the description; only sound when the runtime representation
    /// of the success and failure channels is unchanged.
    fn retag<B, E2>(self) -> Effect<B, E2> {
        Effect::from_primitive(self.primitive)
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: EffectError,
{
    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_primitive(Primitive::Succeed(Box::new(value)))
    }

    /// An effect that runs `f` when evaluated. A panic in `f` becomes a
    /// defect.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_primitive(Primitive::Sync(Box::new(move || Box::new(f()))))
    }

    /// An effect that runs `f` and fails with its error.
    pub fn attempt<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<A, E> + Send + 'static,
    {
        Self::suspend(move || Self::from_result(f()))
    }

    /// Defer building the effect until it is evaluated.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce() -> Effect<A, E> + Send + 'static,
    {
        Self::from_primitive(Primitive::Suspend(Box::new(move || f().primitive)))
    }

    /// An effect that fails with `error`.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::Fail(error))
    }

    /// An effect that fails with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_primitive(Primitive::fail_cause(erase_cause(cause)))
    }

    /// An effect that dies with `defect`.
    pub fn die(defect: Defect) -> Self {
        Self::fail_cause(Cause::Die(defect))
    }

    /// An effect that dies with a message.
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// An effect that ends with `exit`.
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(a) => Self::succeed(a),
            Exit::Failure(cause) => Self::fail_cause(cause),
        }
    }

    /// An effect that succeeds with `Ok` and fails with `Err`.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::succeed(a),
            Err(e) => Self::fail(e),
        }
    }

    /// An effect that interrupts the fiber running it.
    pub fn interrupt() -> Self {
        Self::from_primitive(Primitive::WithContext(Box::new(|ctx: &mut FiberContext| {
            Primitive::fail_cause(Cause::Interrupt(ctx.fiber_id.clone()))
        })))
    }

    /// An effect that never completes. It can only end by interruption.
    pub fn never() -> Self {
        Self::async_callback(|callback: AsyncCallback<A, E>| drop(callback))
    }

    /// Suspend the fiber until `register`'s callback is invoked.
    pub fn async_callback<F>(register: F) -> Self
    where
        F: FnOnce(AsyncCallback<A, E>) + Send + 'static,
    {
        Self::async_interruptible(move |callback| {
            register(callback);
            None
        })
    }

    /// Suspend the fiber until `register`'s callback is invoked.
    ///
    /// If `register` returns a canceler and the suspension is ended by
    /// interruption, the canceler runs (uninterruptibly) before the fiber
    /// fails.
    pub fn async_interruptible<F>(register: F) -> Self
    where
        F: FnOnce(AsyncCallback<A, E>) -> Option<Effect<()>> + Send + 'static,
    {
        Self::from_primitive(Primitive::Async(Box::new(move |resumer: Resumer| {
            register(AsyncCallback::new(resumer)).map(Effect::into_primitive)
        })))
    }

    /// Build an effect from the running fiber's context.
    pub(crate) fn with_context<F>(f: F) -> Self
    where
        F: FnOnce(&mut FiberContext) -> Effect<A, E> + Send + 'static,
    {
        Self::from_primitive(Primitive::WithContext(Box::new(move |ctx: &mut FiberContext| {
            f(ctx).primitive
        })))
    }
}

impl<E: EffectError> Effect<(), E> {
    /// An effect that succeeds with `()`.
    pub fn unit() -> Self {
        Self::succeed(())
    }

    /// Give other fibers a chance to run.
    pub fn yield_now() -> Self {
        Self::from_primitive(Primitive::Yield)
    }

    /// Suspend the fiber for `duration` without blocking a worker.
    pub fn sleep(duration: Duration) -> Self {
        Self::with_context(move |ctx| {
            let timer = ctx.runtime.timer();
            Effect::async_interruptible(move |callback: AsyncCallback<(), E>| {
                let key = timer.schedule(duration, move || {
                    let _ = callback.succeed(());
                });
                Some(Effect::sync(move || {
                    timer.cancel(key);
                }))
            })
        })
    }
}

impl<E: EffectError> Effect<FiberId, E> {
    /// The id of the fiber running the effect.
    pub fn fiber_id() -> Self {
        Self::with_context(|ctx| Effect::succeed(ctx.fiber_id.clone()))
    }
}

impl<A: Send + 'static> Effect<A, Infallible> {
    /// View an effect that cannot fail as one with any error type.
    pub fn widen_error<E2: EffectError>(self) -> Effect<A, E2> {
        self.retag()
    }
}

// ============================================================================
// Sequencing
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: EffectError,
{
    /// Run `f` on the success value and continue with its effect.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B, E> + Send + 'static,
    {
        Effect::from_primitive(Primitive::OnSuccess(
            Box::new(self.primitive),
            Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => f(a).primitive,
                Err(cause) => Primitive::fail_cause(cause),
            }),
        ))
    }

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_primitive(Primitive::OnSuccess(
            Box::new(self.primitive),
            Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => Primitive::Succeed(Box::new(f(a))),
                Err(cause) => Primitive::fail_cause(cause),
            }),
        ))
    }

    /// Replace the success value.
    pub fn as_value<B: Send + 'static>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value)
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<(), E> {
        self.as_value(())
    }

    /// Run `self` then `that`, keeping both values.
    pub fn zip<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.flat_map(move |a| that.map(move |b| (a, b)))
    }

    /// Run `self` then `that`, keeping `that`'s value.
    pub fn zip_right<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| that)
    }

    /// Run `self` then `that`, keeping `self`'s value.
    pub fn zip_left<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.flat_map(move |a| that.as_value(a))
    }

    /// Run an effect on the success value, keeping the value.
    pub fn tap<B, F>(self, f: F) -> Effect<A, E>
    where
        B: Send + 'static,
        F: FnOnce(&A) -> Effect<B, E> + Send + 'static,
    {
        self.flat_map(move |a| {
            let effect = f(&a);
            effect.as_value(a)
        })
    }
}

// ============================================================================
// Async callbacks
// ============================================================================

/// One-shot handle that resumes a fiber suspended by
/// [`Effect::async_interruptible`].
///
/// Every method consumes the callback. Delivering to a fiber that has
/// already been resumed (or interrupted) is refused, and the value is
/// handed back so it can be offered elsewhere.
pub struct AsyncCallback<A, E = Infallible> {
    resumer: Resumer,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> fmt::Debug for AsyncCallback<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCallback").field("fiber", self.resumer.fiber_id()).finish()
    }
}

impl<A, E> AsyncCallback<A, E>
where
    A: Send + 'static,
    E: EffectError,
{
    pub(crate) fn new(resumer: Resumer) -> Self {
        Self { resumer, _marker: PhantomData }
    }

    /// Id of the suspended fiber.
    pub fn fiber_id(&self) -> &FiberId {
        self.resumer.fiber_id()
    }

    /// Whether the suspended fiber can still be resumed by this callback.
    pub fn is_pending(&self) -> bool {
        self.resumer.is_pending()
    }

    /// Resume with a value. Returns the value if the fiber is no longer
    /// waiting on this callback.
    pub fn succeed(self, value: A) -> Result<(), A> {
        let mut slot = Some(value);
        let accepted = self.resumer.resume_with(|| match slot.take() {
            Some(a) => Step::Value(Box::new(a)),
            None => Step::Failure(Cause::die_message("async value already taken")),
        });
        match (accepted, slot) {
            (false, Some(a)) => Err(a),
            _ => Ok(()),
        }
    }

    /// Resume with a typed failure. Returns whether it was delivered.
    pub fn fail(self, error: E) -> bool {
        self.fail_cause(Cause::Fail(error))
    }

    /// Resume with a failure. Returns whether it was delivered.
    pub fn fail_cause(self, cause: Cause<E>) -> bool {
        self.resumer.resume_with(move || Step::Failure(erase_cause(cause)))
    }

    /// Resume with an exit. Returns whether it was delivered.
    pub fn done(self, exit: Exit<A, E>) -> bool {
        match exit {
            Exit::Success(a) => self.succeed(a).is_ok(),
            Exit::Failure(cause) => self.fail_cause(cause),
        }
    }
}
