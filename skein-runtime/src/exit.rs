//! # Exit Values
//!
//! [`Exit`] is the terminal result of running an effect: either the value
//! it produced or the [`Cause`] of its failure. A fiber produces exactly one
//! exit, and every observer of that fiber sees the same one.

use std::fmt;

use crate::cause::{Cause, Defect};
use crate::fiber_id::FiberId;

/// The result of running an effect to completion.
#[derive(Clone, Debug, PartialEq)]
pub enum Exit<A, E> {
    /// The effect produced a value.
    Success(A),
    /// The effect failed.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// An exit failed with a typed error.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::Fail(error))
    }

    /// An exit failed with a defect.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::Die(defect))
    }

    /// An exit interrupted by `id`.
    pub fn interrupt(id: FiberId) -> Self {
        Exit::Failure(Cause::Interrupt(id))
    }

    /// An exit failed with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// Whether this is `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// Whether this is `Failure`.
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Whether the failure contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Transform the success value.
    pub fn map<B, F: FnOnce(A) -> B>(self, f: F) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform every typed failure.
    pub fn map_error<E2, F: FnMut(E) -> E2>(self, f: F) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Borrowing view of the exit.
    pub fn as_ref(&self) -> Exit<&A, E>
    where
        E: Clone,
    {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.clone()),
        }
    }

    /// Forget the success value.
    pub fn as_unit(&self) -> Exit<(), E>
    where
        E: Clone,
    {
        self.as_ref().map(|_| ())
    }

    /// Convert into a `Result`, keeping the full cause on failure.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }

    /// Append `after` to the failure, or turn a success into a failure.
    pub fn then_cause(self, after: Cause<E>) -> Self {
        if after.is_empty() {
            return self;
        }
        match self {
            Exit::Success(_) => Exit::Failure(after),
            Exit::Failure(cause) => Exit::Failure(cause.then(after)),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

impl<A: fmt::Debug, E: fmt::Display> fmt::Display for Exit<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Success(a) => write!(f, "Success({:?})", a),
            Exit::Failure(cause) => write!(f, "Failure({})", cause),
        }
    }
}
