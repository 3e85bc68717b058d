//! Error handling, exit handling, interruption control, forking and
//! resource combinators.

use std::convert::Infallible;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::primitive::{
    downcast_value, erase_cause, share_value, typed_cause, ErasedCause, ForkTarget, Value,
};
use super::{Effect, EffectError, Primitive};
use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberCore};
use crate::flags::{FlagsPatch, RuntimeFlags};
use crate::interpreter::FiberContext;
use crate::scope::{erase_exit, Scope, ScopeExit};

/// Re-enables the interruptibility that was in effect outside an
/// [`Effect::uninterruptible_mask`] region.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    previous: RuntimeFlags,
}

impl Restore {
    /// Run `effect` with the interruptibility of the enclosing region.
    pub fn apply<A, E>(self, effect: Effect<A, E>) -> Effect<A, E>
    where
        A: Send + 'static,
        E: EffectError,
    {
        effect.with_runtime_flags(FlagsPatch::restore_interruption(self.previous))
    }
}

// ============================================================================
// Error handling
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: EffectError,
{
    /// Observe the outcome as a value. The resulting effect never fails.
    pub fn exit(self) -> Effect<Exit<A, E>> {
        Effect::from_primitive(Primitive::OnSuccessAndFailure(
            Box::new(self.primitive),
            Box::new(|value: Value| match downcast_value::<A>(value) {
                Ok(a) => Primitive::Succeed(Box::new(Exit::<A, E>::Success(a))),
                Err(cause) => Primitive::fail_cause(cause),
            }),
            Box::new(|cause: ErasedCause| {
                Primitive::Succeed(Box::new(Exit::<A, E>::Failure(typed_cause(cause))))
            }),
        ))
    }

    /// Recover from any failure, including defects and interruption that
    /// reach this handler.
    pub fn catch_cause<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: EffectError,
        F: FnOnce(Cause<E>) -> Effect<A, E2> + Send + 'static,
    {
        Effect::from_primitive(Primitive::OnFailure(
            Box::new(self.primitive),
            Box::new(move |cause: ErasedCause| f(typed_cause(cause)).primitive),
        ))
    }

    /// Recover from a typed failure. Defects and interruptions pass through.
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: EffectError,
        F: FnOnce(E) -> Effect<A, E2> + Send + 'static,
    {
        Effect::from_primitive(Primitive::OnFailure(
            Box::new(self.primitive),
            Box::new(move |cause: ErasedCause| recover_failure::<E, _>(cause, |e| f(e).primitive)),
        ))
    }

    /// Recover from the first defect when `f` accepts it.
    pub fn catch_some_defect<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce(&Defect) -> Option<Effect<A, E>> + Send + 'static,
    {
        Effect::from_primitive(Primitive::OnFailure(
            Box::new(self.primitive),
            Box::new(move |cause: ErasedCause| {
                let defect = cause.defects().first().map(|d| (*d).clone());
                match defect.and_then(|d| f(&d)) {
                    Some(handled) => handled.primitive,
                    None => Primitive::fail_cause(cause),
                }
            }),
        ))
    }

    /// Transform typed failures.
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: EffectError,
        F: FnMut(E) -> E2 + Send + 'static,
    {
        Effect::from_primitive(Primitive::OnFailure(
            Box::new(self.primitive),
            Box::new(move |cause: ErasedCause| {
                Primitive::fail_cause(erase_cause(typed_cause::<E>(cause).map(f)))
            }),
        ))
    }

    /// Turn typed failures into defects.
    pub fn or_die(self) -> Effect<A>
    where
        E: fmt::Debug,
    {
        Effect::from_primitive(Primitive::OnFailure(
            Box::new(self.primitive),
            Box::new(|cause: ErasedCause| {
                let cause: Cause<Infallible> = typed_cause::<E>(cause)
                    .filter_map(|e| Err(Defect::new(format!("{:?}", e))));
                Primitive::fail_cause(erase_cause(cause))
            }),
        ))
    }

    /// Handle both typed failure and success with effects.
    pub fn fold_effect<B, E2, F, S>(self, on_failure: F, on_success: S) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: EffectError,
        F: FnOnce(E) -> Effect<B, E2> + Send + 'static,
        S: FnOnce(A) -> Effect<B, E2> + Send + 'static,
    {
        Effect::from_primitive(Primitive::OnSuccessAndFailure(
            Box::new(self.primitive),
            Box::new(move |value: Value| match downcast_value::<A>(value) {
                Ok(a) => on_success(a).primitive,
                Err(cause) => Primitive::fail_cause(cause),
            }),
            Box::new(move |cause: ErasedCause| {
                recover_failure::<E, _>(cause, |e| on_failure(e).primitive)
            }),
        ))
    }

    /// Handle both typed failure and success with plain functions.
    pub fn fold<B, E2, F, S>(self, on_failure: F, on_success: S) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: EffectError,
        F: FnOnce(E) -> B + Send + 'static,
        S: FnOnce(A) -> B + Send + 'static,
    {
        self.fold_effect(
            move |e| Effect::succeed(on_failure(e)),
            move |a| Effect::succeed(on_success(a)),
        )
    }

    /// Discard both the value and any typed failure.
    pub fn ignore<E2: EffectError>(self) -> Effect<(), E2> {
        self.fold(|_| (), |_| ())
    }
}

/// Hand the leftmost typed failure to `handler`, or re-raise a cause that
/// has none.
fn recover_failure<E, H>(cause: ErasedCause, handler: H) -> Primitive
where
    E: EffectError,
    H: FnOnce(E) -> Primitive,
{
    match cause.failure_or_cause() {
        Ok(error) => match error.downcast::<E>() {
            Some(e) => handler(e),
            None => Primitive::fail_cause(Cause::die_message("error type mismatch")),
        },
        Err(rest) => Primitive::fail_cause(rest),
    }
}

// ============================================================================
// Exit handling
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: EffectError,
{
    /// Run `cleanup` with the exit however the effect ends, including by
    /// interruption. The cleanup itself is uninterruptible; if it fails, its
    /// cause is appended to the exit.
    pub fn on_exit<F>(self, cleanup: F) -> Effect<A, E>
    where
        F: FnOnce(&Exit<A, E>) -> Effect<()> + Send + 'static,
    {
        Effect::uninterruptible_mask(move |restore| {
            restore.apply(self).exit().widen_error().flat_map(move |exit| {
                let finalizer = panic::catch_unwind(AssertUnwindSafe(|| cleanup(&exit)))
                    .unwrap_or_else(|payload| Effect::die(Defect::from_panic(payload)));
                finalizer.exit().widen_error().flat_map(move |done| match done {
                    Exit::Success(()) => Effect::from_exit(exit),
                    Exit::Failure(cause) => {
                        Effect::from_exit(exit.then_cause(cause.map(|never| match never {})))
                    }
                })
            })
        })
    }

    /// Run `finalizer` however the effect ends.
    pub fn ensuring(self, finalizer: Effect<()>) -> Effect<A, E> {
        self.on_exit(move |_| finalizer)
    }

    /// Run `cleanup` if the effect is interrupted.
    pub fn on_interrupt(self, cleanup: Effect<()>) -> Effect<A, E> {
        self.on_exit(move |exit| {
            if exit.is_interrupted() {
                cleanup
            } else {
                Effect::unit()
            }
        })
    }

    /// Run `cleanup` with the cause if the effect fails.
    pub fn on_error<F>(self, cleanup: F) -> Effect<A, E>
    where
        F: FnOnce(&Cause<E>) -> Effect<()> + Send + 'static,
    {
        self.on_exit(move |exit| match exit {
            Exit::Failure(cause) => cleanup(cause),
            Exit::Success(_) => Effect::unit(),
        })
    }
}

// ============================================================================
// Interruption control
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: EffectError,
{
    /// Run with the runtime flags changed by `patch`.
    pub fn with_runtime_flags(self, patch: FlagsPatch) -> Effect<A, E> {
        let primitive = self.primitive;
        Effect::from_primitive(Primitive::UpdateRuntimeFlags {
            patch,
            body: Box::new(move |_| primitive),
        })
    }

    /// Run without interruption; requests are honored after the effect.
    pub fn uninterruptible(self) -> Effect<A, E> {
        self.with_runtime_flags(FlagsPatch::disable(RuntimeFlags::INTERRUPTION))
    }

    /// Run with interruption enabled.
    pub fn interruptible(self) -> Effect<A, E> {
        self.with_runtime_flags(FlagsPatch::enable(RuntimeFlags::INTERRUPTION))
    }

    /// Run `f` uninterruptibly, handing it a [`Restore`] that re-enables the
    /// outer interruptibility for the parts that should stay cancelable.
    pub fn uninterruptible_mask<F>(f: F) -> Effect<A, E>
    where
        F: FnOnce(Restore) -> Effect<A, E> + Send + 'static,
    {
        Effect::from_primitive(Primitive::UpdateRuntimeFlags {
            patch: FlagsPatch::disable(RuntimeFlags::INTERRUPTION),
            body: Box::new(move |previous| f(Restore { previous }).primitive),
        })
    }
}

// ============================================================================
// Forking
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: EffectError,
{
    fn fork_to(self, target: ForkTarget) -> Effect<Fiber<A, E>, E> {
        Effect::<Arc<FiberCore>, E>::from_primitive(Primitive::Fork {
            body: Box::new(self.primitive),
            target,
            share: share_value::<A>,
        })
        .map(Fiber::from_core)
    }

    /// Run the effect on a new fiber supervised by the current one: the
    /// child is interrupted when its parent finishes.
    pub fn fork(self) -> Effect<Fiber<A, E>, E> {
        self.fork_to(ForkTarget::Parent)
    }

    /// Run the effect on a fiber tied to the runtime's global scope.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>, E> {
        self.fork_to(ForkTarget::Global)
    }

    /// Run the effect on a fiber that is interrupted when `scope` closes.
    pub fn fork_in(self, scope: &Scope) -> Effect<Fiber<A, E>, E> {
        self.fork_to(ForkTarget::Scope(scope.clone()))
    }

    /// Run the effect on a fiber tied to the innermost
    /// [`Effect::scoped`] region.
    pub fn fork_scoped(self) -> Effect<Fiber<A, E>, E> {
        self.fork_to(ForkTarget::CurrentScope)
    }
}

// ============================================================================
// Scopes and resources
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: EffectError,
{
    /// Run `effect` with a fresh scope that is closed, with the effect's
    /// exit, as soon as the effect ends.
    pub fn scoped(effect: Effect<A, E>) -> Effect<A, E> {
        Effect::suspend(move || {
            let scope = Scope::new();
            let closing = scope.clone();
            Effect::<A, E>::from_primitive(Primitive::WithScope {
                scope,
                body: Box::new(effect.primitive),
            })
            .on_exit(move |exit| closing.close(erase_exit(exit)))
        })
    }

    /// Acquire a resource uninterruptibly and register `release` in the
    /// current scope.
    pub fn acquire_release<R>(acquire: Effect<A, E>, release: R) -> Effect<A, E>
    where
        A: Clone,
        R: FnOnce(A, &ScopeExit) -> Effect<()> + Send + 'static,
    {
        acquire
            .flat_map(move |a| {
                let held = a.clone();
                Effect::add_finalizer(move |exit| release(held, exit)).as_value(a)
            })
            .uninterruptible()
    }

    /// Acquire, use, release: `release` runs exactly once however `use_`
    /// ends, and only `use_` is interruptible.
    pub fn acquire_use_release<B, U, R>(
        acquire: Effect<A, E>,
        use_: U,
        release: R,
    ) -> Effect<B, E>
    where
        A: Clone,
        B: Send + 'static,
        U: FnOnce(A) -> Effect<B, E> + Send + 'static,
        R: FnOnce(A, &Exit<B, E>) -> Effect<()> + Send + 'static,
    {
        Effect::uninterruptible_mask(move |restore| {
            acquire.flat_map(move |a| {
                let held = a.clone();
                restore
                    .apply(Effect::suspend(move || use_(a)))
                    .on_exit(move |exit| release(held, exit))
            })
        })
    }
}

impl<E: EffectError> Effect<Scope, E> {
    /// The innermost scope of the running fiber.
    pub fn scope() -> Self {
        Self::with_context(|ctx: &mut FiberContext| Effect::succeed(ctx.scope.clone()))
    }
}

impl<E: EffectError> Effect<(), E> {
    /// Register a finalizer in the innermost scope of the running fiber.
    pub fn add_finalizer<F>(finalizer: F) -> Self
    where
        F: FnOnce(&ScopeExit) -> Effect<()> + Send + 'static,
    {
        Self::with_context(move |ctx| {
            ctx.scope.add_finalizer(finalizer).as_unit().widen_error()
        })
    }
}

// ============================================================================
// Sequential iteration
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: EffectError,
{
    /// Run `f` on each item in order, collecting the results.
    pub fn for_each<I, F>(items: I, f: F) -> Effect<Vec<A>, E>
    where
        I: IntoIterator,
        I::IntoIter: Send + 'static,
        F: FnMut(I::Item) -> Effect<A, E> + Send + 'static,
    {
        let iter = items.into_iter();
        Effect::suspend(move || for_each_step(iter, f, Vec::new()))
    }

    /// Run every effect in order, collecting the results.
    pub fn all(effects: Vec<Effect<A, E>>) -> Effect<Vec<A>, E> {
        Self::for_each(effects, |effect| effect)
    }

    /// Repeat effects built by `factory` until one fails.
    pub fn forever<F>(factory: F) -> Effect<Infallible, E>
    where
        F: FnMut() -> Effect<A, E> + Send + 'static,
    {
        forever_step(factory)
    }
}

fn for_each_step<I, A, E, F>(mut iter: I, mut f: F, mut acc: Vec<A>) -> Effect<Vec<A>, E>
where
    I: Iterator + Send + 'static,
    A: Send + 'static,
    E: EffectError,
    F: FnMut(I::Item) -> Effect<A, E> + Send + 'static,
{
    match iter.next() {
        None => Effect::succeed(acc),
        Some(item) => f(item).flat_map(move |a| {
            acc.push(a);
            for_each_step(iter, f, acc)
        }),
    }
}

fn forever_step<A, E, F>(mut factory: F) -> Effect<Infallible, E>
where
    A: Send + 'static,
    E: EffectError,
    F: FnMut() -> Effect<A, E> + Send + 'static,
{
    Effect::suspend(move || {
        let next = factory();
        next.flat_map(move |_| forever_step(factory))
    })
}
