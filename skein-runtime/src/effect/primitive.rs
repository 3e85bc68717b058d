//! The primitive node set the interpreter evaluates.
//!
//! Typed [`Effect`](super::Effect) values are thin wrappers over
//! [`Primitive`]; values cross node boundaries as `Box<dyn Any + Send>` and
//! typed errors as [`AnyError`], so the interpreter never needs to know the
//! static types of the program it runs.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::cause::{AnyError, Cause, Defect};
use crate::exit::Exit;
use crate::fiber::Resumer;
use crate::flags::{FlagsPatch, RuntimeFlags};
use crate::interpreter::FiberContext;
use crate::scope::Scope;

pub(crate) type Value = Box<dyn Any + Send>;
pub(crate) type SharedValue = Arc<dyn Any + Send + Sync>;
pub(crate) type ErasedCause = Cause<AnyError>;
pub(crate) type SharedExit = Exit<SharedValue, AnyError>;

pub(crate) type Continuation = Box<dyn FnOnce(Value) -> Primitive + Send>;
pub(crate) type Recovery = Box<dyn FnOnce(ErasedCause) -> Primitive + Send>;
pub(crate) type Register = Box<dyn FnOnce(Resumer) -> Option<Primitive> + Send>;
pub(crate) type Share = fn(Value) -> Result<SharedValue, ErasedCause>;

/// Where a forked fiber's lifetime is anchored.
pub(crate) enum ForkTarget {
    /// The forking fiber's own scope: the child lives at most as long as
    /// its parent.
    Parent,
    /// The innermost scope opened with `Effect::scoped`.
    CurrentScope,
    /// The runtime's global scope (daemon fibers).
    Global,
    /// An explicit scope.
    Scope(Scope),
}

pub(crate) enum Primitive {
    Succeed(Value),
    Fail(Box<dyn FnOnce() -> ErasedCause + Send>),
    Sync(Box<dyn FnOnce() -> Value + Send>),
    Suspend(Box<dyn FnOnce() -> Primitive + Send>),
    OnSuccess(Box<Primitive>, Continuation),
    OnFailure(Box<Primitive>, Recovery),
    OnSuccessAndFailure(Box<Primitive>, Continuation, Recovery),
    /// `register` may return a canceler, run uninterruptibly when the
    /// suspension ends by interruption.
    Async(Register),
    Fork {
        body: Box<Primitive>,
        target: ForkTarget,
        share: Share,
    },
    /// `body` receives the flags in effect before the patch.
    UpdateRuntimeFlags {
        patch: FlagsPatch,
        body: Box<dyn FnOnce(RuntimeFlags) -> Primitive + Send>,
    },
    WithContext(Box<dyn FnOnce(&mut FiberContext) -> Primitive + Send>),
    WithScope {
        scope: Scope,
        body: Box<Primitive>,
    },
    Yield,
}

impl Primitive {
    pub(crate) fn unit() -> Self {
        Primitive::Succeed(Box::new(()))
    }

    pub(crate) fn fail_cause(cause: ErasedCause) -> Self {
        Primitive::Fail(Box::new(move || cause))
    }

    fn tag(&self) -> &'static str {
        match self {
            Primitive::Succeed(_) => "Succeed",
            Primitive::Fail(_) => "Fail",
            Primitive::Sync(_) => "Sync",
            Primitive::Suspend(_) => "Suspend",
            Primitive::OnSuccess(..) => "OnSuccess",
            Primitive::OnFailure(..) => "OnFailure",
            Primitive::OnSuccessAndFailure(..) => "OnSuccessAndFailure",
            Primitive::Async(_) => "Async",
            Primitive::Fork { .. } => "Fork",
            Primitive::UpdateRuntimeFlags { .. } => "UpdateRuntimeFlags",
            Primitive::WithContext(_) => "WithContext",
            Primitive::WithScope { .. } => "WithScope",
            Primitive::Yield => "Yield",
        }
    }
}

impl fmt::Debug for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// What the interpreter does next.
pub(crate) enum Step {
    Eval(Primitive),
    Value(Value),
    Failure(ErasedCause),
}

/// Recover a typed value; a mismatch is a defect in the runtime itself.
pub(crate) fn downcast_value<A: 'static>(value: Value) -> Result<A, ErasedCause> {
    value
        .downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| Cause::die_message("value type mismatch"))
}

/// Move a fiber's final value into shareable form.
pub(crate) fn share_value<A>(value: Value) -> Result<SharedValue, ErasedCause>
where
    A: Send + Sync + 'static,
{
    downcast_value::<A>(value).map(|a| Arc::new(a) as SharedValue)
}

pub(crate) fn erase_cause<E: Send + Sync + 'static>(cause: Cause<E>) -> ErasedCause {
    cause.map(AnyError::new)
}

pub(crate) fn typed_cause<E>(cause: ErasedCause) -> Cause<E>
where
    E: Clone + Send + Sync + 'static,
{
    cause.filter_map(|error| {
        error
            .downcast::<E>()
            .ok_or_else(|| Defect::new("error type mismatch"))
    })
}

/// Convert a shared fiber exit back to its static types.
pub(crate) fn typed_exit<A, E>(exit: &SharedExit) -> Exit<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    match exit {
        Exit::Success(value) => match value.downcast_ref::<A>() {
            Some(a) => Exit::Success(a.clone()),
            None => Exit::die(Defect::new("value type mismatch")),
        },
        Exit::Failure(cause) => Exit::Failure(typed_cause(cause.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_value() {
        let v: Value = Box::new(7u8);
        assert_eq!(downcast_value::<u8>(v).ok(), Some(7));
        let v: Value = Box::new(7u8);
        assert!(downcast_value::<u16>(v).is_err());
    }

    #[test]
    fn test_cause_erasure_roundtrip() {
        let cause = Cause::fail("oops".to_string()).both(Cause::die_message("d"));
        let typed: Cause<String> = typed_cause(erase_cause(cause.clone()));
        assert_eq!(typed, cause);

        let wrong: Cause<u32> = typed_cause(erase_cause(Cause::fail("x".to_string())));
        assert!(wrong.is_die());
    }

    #[test]
    fn test_typed_exit() {
        let shared: SharedExit = Exit::Success(Arc::new(3i32));
        assert_eq!(typed_exit::<i32, String>(&shared), Exit::Success(3));
        assert!(typed_exit::<String, String>(&shared).cause().is_some());
    }
}
