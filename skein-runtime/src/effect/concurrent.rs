//! Racing, parallel composition and timeouts.
//!
//! Every combinator here forks its operands as children of the calling
//! fiber from inside an uninterruptible region, restores interruptibility
//! only around the user effects, and interrupts (and awaits) whatever is
//! still running before it returns. No operand outlives the combinator.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Effect, EffectError};
use crate::cause::Cause;
use crate::deferred::Deferred;
use crate::exit::Exit;
use crate::fiber::interrupt_all;

struct RaceState<E> {
    lost: usize,
    cause: Cause<E>,
}

struct ParState<A, E> {
    slots: Vec<Option<A>>,
    remaining: usize,
    failed: bool,
    cause: Cause<E>,
}

enum Pair<A, B> {
    Left(A),
    Right(B),
}

// ============================================================================
// Racing
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Clone + Send + 'static,
    E: EffectError,
{
    /// The first of `self` and `that` to succeed wins and the other is
    /// interrupted. If both fail, the failure combines both causes.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E> {
        Self::race_all(vec![self, that])
    }

    /// The first effect to succeed wins; the rest are interrupted. Fails
    /// with every cause combined in parallel if all of them fail.
    pub fn race_all(effects: Vec<Effect<A, E>>) -> Effect<A, E> {
        if effects.is_empty() {
            return Effect::die_message("race_all of no effects");
        }
        Effect::suspend(move || {
            let total = effects.len();
            let winner: Deferred<A, E> = Deferred::new();
            let state = Arc::new(Mutex::new(RaceState { lost: 0, cause: Cause::Empty }));
            let result = winner.clone();

            Effect::uninterruptible_mask(move |restore| {
                Effect::for_each(effects, move |effect| {
                    let winner = winner.clone();
                    let state = state.clone();
                    restore
                        .apply(effect)
                        .exit()
                        .flat_map(move |exit| match exit {
                            Exit::Success(a) => winner.succeed(a).as_unit(),
                            Exit::Failure(cause) => {
                                let all_lost = {
                                    let mut state = state.lock();
                                    state.lost += 1;
                                    state.cause = mem::take(&mut state.cause).both(cause);
                                    (state.lost == total).then(|| mem::take(&mut state.cause))
                                };
                                match all_lost {
                                    Some(cause) => winner.fail_cause(cause).as_unit(),
                                    None => Effect::unit(),
                                }
                            }
                        })
                        .fork()
                })
                .widen_error()
                .flat_map(move |racers| restore.apply(result.await_value()).ensuring(interrupt_all(racers)))
            })
        })
    }

    /// The first of `self` and `that` to finish, successfully or not, wins.
    pub fn race_first(self, that: Effect<A, E>) -> Effect<A, E> {
        self.exit()
            .race(that.exit())
            .widen_error()
            .flat_map(Effect::from_exit)
    }

    /// Succeed with `None` if the effect has not finished within
    /// `duration`, interrupting it.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some).race_first(Effect::sleep(duration).as_value(None))
    }
}

// ============================================================================
// Parallel composition
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: EffectError,
{
    /// Run every effect concurrently, collecting results in input order.
    ///
    /// The first failure interrupts the remaining effects. The resulting
    /// cause combines every sibling failure with `Both`, leaving out the
    /// interruptions this combinator caused itself.
    pub fn all_par(effects: Vec<Effect<A, E>>) -> Effect<Vec<A>, E> {
        Effect::suspend(move || {
            let total = effects.len();
            if total == 0 {
                return Effect::succeed(Vec::new());
            }
            let state = Arc::new(Mutex::new(ParState {
                slots: (0..total).map(|_| None).collect(),
                remaining: total,
                failed: false,
                cause: Cause::Empty,
            }));
            let done: Deferred<()> = Deferred::new();
            let settled = state.clone();
            let awaited = done.clone();

            Effect::uninterruptible_mask(move |restore| {
                Effect::for_each(effects.into_iter().enumerate(), move |(index, effect)| {
                    let state = state.clone();
                    let done = done.clone();
                    restore
                        .apply(effect)
                        .exit()
                        .flat_map(move |exit| {
                            let finished = {
                                let mut state = state.lock();
                                match exit {
                                    Exit::Success(a) => {
                                        state.slots[index] = Some(a);
                                        state.remaining -= 1;
                                        state.remaining == 0
                                    }
                                    Exit::Failure(cause) => {
                                        let first = !state.failed;
                                        if first || !cause.is_interrupted_only() {
                                            state.cause = mem::take(&mut state.cause).both(cause);
                                        }
                                        state.failed = true;
                                        first
                                    }
                                }
                            };
                            if finished {
                                done.succeed(()).as_unit()
                            } else {
                                Effect::unit()
                            }
                        })
                        .fork()
                })
                .widen_error()
                .flat_map(move |fibers| {
                    restore.apply(awaited.await_value()).exit().widen_error().flat_map(
                        move |outcome| {
                            interrupt_all(fibers).widen_error().flat_map(move |_| {
                                let mut state = settled.lock();
                                match outcome {
                                    Exit::Failure(cause) => {
                                        Effect::fail_cause(cause.map(|never| match never {}))
                                    }
                                    Exit::Success(()) if state.failed => {
                                        Effect::fail_cause(mem::take(&mut state.cause))
                                    }
                                    Exit::Success(()) => Effect::succeed(
                                        state.slots.drain(..).flatten().collect(),
                                    ),
                                }
                            })
                        },
                    )
                })
            })
        })
    }

    /// Run `f` on every item concurrently, collecting results in input
    /// order. Fails fast like [`Effect::all_par`].
    pub fn for_each_par<I, F>(items: I, f: F) -> Effect<Vec<A>, E>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Effect<A, E>,
    {
        Self::all_par(items.into_iter().map(f).collect())
    }

    /// Run `self` and `that` concurrently, failing fast.
    pub fn zip_par<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        let pair = vec![self.map(Pair::Left), that.map(Pair::Right)];
        Effect::all_par(pair).flat_map(|mut results| match (results.pop(), results.pop()) {
            (Some(Pair::Right(b)), Some(Pair::Left(a))) => Effect::succeed((a, b)),
            _ => Effect::die_message("zip_par lost a result"),
        })
    }
}
