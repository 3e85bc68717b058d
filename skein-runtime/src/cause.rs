//! # Cause Algebra
//!
//! A [`Cause`] records *why* an effect did not produce a value, without
//! losing information when several things go wrong at once.
//!
//! ## Design
//!
//! - `Fail(E)`: an expected, typed failure from the error channel.
//! - `Die(Defect)`: an unexpected defect (a caught panic, a violated
//!   invariant).
//! - `Interrupt(FiberId)`: cooperative cancellation, attributed to the fiber
//!   that requested it.
//! - `Then(a, b)`: `b` happened after `a` (a finalizer failing after the body
//!   already failed).
//! - `Both(a, b)`: `a` and `b` happened concurrently (two forked siblings
//!   failing together).
//!
//! `Empty` is the identity of both compositions. The smart constructors
//! [`Cause::then`] and [`Cause::both`] drop empty operands so values built
//! through them never contain `Empty` nodes.
//!
//! Equality linearizes a cause into a sequence of parallel groups:
//! sequential order matters, order inside a parallel group does not. Display
//! keeps the construction order of both.

use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::Arc;

use crate::fiber_id::FiberId;

/// The payload of a `Die` cause.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    /// Create a defect with a message.
    pub fn new(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self { message: message.into() }
    }

    /// Build a defect from a caught panic payload.
    ///
    /// `panic!` payloads are `&'static str` or `String`; anything else is
    /// reported generically.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        Self::new(message)
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Defect").field(&self.message()).finish()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for Defect {}

/// A type-erased, cheaply cloneable error value.
///
/// The interpreter moves failures between fibers without knowing their
/// static type; typed APIs recover `E` with [`AnyError::downcast_ref`].
#[derive(Clone)]
pub struct AnyError(Arc<dyn Any + Send + Sync>);

impl AnyError {
    /// Erase an error value.
    pub fn new<E: Send + Sync + 'static>(error: E) -> Self {
        Self(Arc::new(error))
    }

    /// Borrow the error as `E`, if that is its type.
    pub fn downcast_ref<E: 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Recover an owned `E`, cloning only when the value is shared.
    pub fn downcast<E: Clone + Send + Sync + 'static>(self) -> Option<E> {
        let typed = self.0.downcast::<E>().ok()?;
        Some(Arc::try_unwrap(typed).unwrap_or_else(|shared| (*shared).clone()))
    }
}

impl fmt::Debug for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AnyError(..)")
    }
}

/// Why an effect failed.
///
/// Every traversal walks the tree with an explicit work list, so causes
/// accumulated from many finalizers or siblings can be arbitrarily deep.
pub enum Cause<E> {
    /// Nothing went wrong; identity of `Then` and `Both`.
    Empty,
    /// Expected, typed failure.
    Fail(E),
    /// Unexpected defect.
    Die(Defect),
    /// Cooperative interruption by the given fiber.
    Interrupt(FiberId),
    /// Sequential composition.
    Then(Link<E>, Link<E>),
    /// Parallel composition.
    Both(Link<E>, Link<E>),
}

/// An owned child of a `Then` or `Both` node.
///
/// Dropping a link dismantles the subtree iteratively.
pub struct Link<E>(Box<Cause<E>>);

impl<E> Link<E> {
    /// Box a cause as a child node.
    pub fn new(cause: Cause<E>) -> Self {
        Link(Box::new(cause))
    }

    /// Take the child back out.
    pub fn into_inner(mut self) -> Cause<E> {
        mem::take(&mut *self.0)
    }
}

impl<E> Deref for Link<E> {
    type Target = Cause<E>;

    fn deref(&self) -> &Cause<E> {
        &self.0
    }
}

impl<E> Drop for Link<E> {
    fn drop(&mut self) {
        if !matches!(*self.0, Cause::Then(..) | Cause::Both(..)) {
            return;
        }
        let mut pending = vec![mem::take(&mut *self.0)];
        while let Some(mut cause) = pending.pop() {
            if let Cause::Then(a, b) | Cause::Both(a, b) = &mut cause {
                pending.push(mem::take(&mut *a.0));
                pending.push(mem::take(&mut *b.0));
            }
        }
    }
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

impl<E> Cause<E> {
    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    /// A defect with a message.
    pub fn die_message(message: impl Into<String>) -> Self {
        Cause::Die(Defect::new(message))
    }

    /// An interruption by `id`.
    pub fn interrupt(id: FiberId) -> Self {
        Cause::Interrupt(id)
    }

    /// `self`, then `other`.
    ///
    /// Only a top-level `Empty` is dropped; operands built through the smart
    /// constructors never hold a nested one.
    pub fn then(self, other: Cause<E>) -> Self {
        match (self, other) {
            (Cause::Empty, other) => other,
            (this, Cause::Empty) => this,
            (this, other) => Cause::Then(Link::new(this), Link::new(other)),
        }
    }

    /// `self` and `other`, concurrently.
    pub fn both(self, other: Cause<E>) -> Self {
        match (self, other) {
            (Cause::Empty, other) => other,
            (this, Cause::Empty) => this,
            (this, other) => Cause::Both(Link::new(this), Link::new(other)),
        }
    }

    /// Whether the cause contains no failure, defect, or interruption.
    pub fn is_empty(&self) -> bool {
        self.leaves().next().is_none()
    }

    /// Whether the cause contains a typed failure.
    pub fn is_failure(&self) -> bool {
        self.first_failure().is_some()
    }

    /// Whether the cause contains a defect.
    pub fn is_die(&self) -> bool {
        self.leaves().any(|leaf| matches!(leaf, Leaf::Die(_)))
    }

    /// Whether the cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        self.leaves().any(|leaf| matches!(leaf, Leaf::Interrupt(_)))
    }

    /// Whether the cause consists of interruptions and nothing else.
    pub fn is_interrupted_only(&self) -> bool {
        let mut saw_interrupt = false;
        let only = self.leaves().all(|leaf| {
            saw_interrupt = true;
            matches!(leaf, Leaf::Interrupt(_))
        });
        only && saw_interrupt
    }

    /// Every typed failure, left to right.
    pub fn failures(&self) -> Vec<&E> {
        self.leaves()
            .filter_map(|leaf| match leaf {
                Leaf::Fail(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    /// The leftmost typed failure.
    pub fn first_failure(&self) -> Option<&E> {
        self.leaves().find_map(|leaf| match leaf {
            Leaf::Fail(e) => Some(e),
            _ => None,
        })
    }

    /// Every defect, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        self.leaves()
            .filter_map(|leaf| match leaf {
                Leaf::Die(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    /// Union of every interrupting fiber id.
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        let mut out = BTreeSet::new();
        for leaf in self.leaves() {
            match leaf {
                Leaf::Interrupt(FiberId::Composite(set)) => out.extend(set.iter().cloned()),
                Leaf::Interrupt(id) => {
                    out.insert(id.clone());
                }
                _ => {}
            }
        }
        out
    }

    /// The interruptors folded into a single (possibly composite) id.
    pub fn interruptor(&self) -> FiberId {
        FiberId::combine_all(self.interruptors())
    }

    /// Transform every typed failure.
    pub fn map<E2, F: FnMut(E) -> E2>(self, mut f: F) -> Cause<E2> {
        self.rebuild(|e| Cause::Fail(f(e)))
    }

    /// Replace every typed failure with the result of `f`; a failure `f`
    /// rejects becomes a defect.
    pub fn filter_map<E2, F>(self, mut f: F) -> Cause<E2>
    where
        F: FnMut(E) -> Result<E2, Defect>,
    {
        self.rebuild(|e| match f(e) {
            Ok(e) => Cause::Fail(e),
            Err(d) => Cause::Die(d),
        })
    }

    /// Drop every typed failure, keeping defects and interruptions.
    pub fn strip_failures(self) -> Cause<E> {
        self.rebuild(|_| Cause::Empty)
    }

    /// The first typed failure if there is one, otherwise the cause itself
    /// (which then contains no typed failure).
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        if self.first_failure().is_none() {
            return Err(self);
        }
        let mut pending = vec![self];
        while let Some(cause) = pending.pop() {
            match cause {
                Cause::Fail(e) => return Ok(e),
                Cause::Then(a, b) | Cause::Both(a, b) => {
                    pending.push(b.into_inner());
                    pending.push(a.into_inner());
                }
                Cause::Empty | Cause::Die(_) | Cause::Interrupt(_) => {}
            }
        }
        Err(Cause::Empty)
    }

    /// Re-type a cause that holds no typed failures.
    ///
    /// Failures, if any, are kept as defects carrying `message`.
    pub fn retype<E2>(self, message: &str) -> Cause<E2> {
        self.filter_map(|_| Err(Defect::new(message)))
    }

    fn leaves(&self) -> Leaves<'_, E> {
        Leaves { pending: vec![self] }
    }

    /// Rebuild the tree bottom-up through the smart constructors, replacing
    /// each typed failure with `on_fail(e)`.
    fn rebuild<E2, F>(self, mut on_fail: F) -> Cause<E2>
    where
        F: FnMut(E) -> Cause<E2>,
    {
        enum Task<T> {
            Visit(Cause<T>),
            Then,
            Both,
        }

        let mut tasks = vec![Task::Visit(self)];
        let mut done: Vec<Cause<E2>> = Vec::new();
        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(Cause::Empty) => done.push(Cause::Empty),
                Task::Visit(Cause::Fail(e)) => done.push(on_fail(e)),
                Task::Visit(Cause::Die(d)) => done.push(Cause::Die(d)),
                Task::Visit(Cause::Interrupt(id)) => done.push(Cause::Interrupt(id)),
                Task::Visit(Cause::Then(a, b)) => {
                    tasks.push(Task::Then);
                    tasks.push(Task::Visit(b.into_inner()));
                    tasks.push(Task::Visit(a.into_inner()));
                }
                Task::Visit(Cause::Both(a, b)) => {
                    tasks.push(Task::Both);
                    tasks.push(Task::Visit(b.into_inner()));
                    tasks.push(Task::Visit(a.into_inner()));
                }
                Task::Then | Task::Both => {
                    let right = done.pop().unwrap_or_default();
                    let left = done.pop().unwrap_or_default();
                    done.push(match task {
                        Task::Then => left.then(right),
                        _ => left.both(right),
                    });
                }
            }
        }
        done.pop().unwrap_or_default()
    }

    /// Sequential steps, each a group of leaves that happened in parallel.
    ///
    /// Groups are merged smaller-into-larger; order inside a group is not
    /// kept.
    fn linearize(&self) -> Vec<Vec<Leaf<'_, E>>> {
        enum Task<'n, T> {
            Visit(&'n Cause<T>),
            Then,
            Both,
        }

        let mut tasks = vec![Task::Visit(self)];
        let mut done: Vec<VecDeque<Vec<Leaf<'_, E>>>> = Vec::new();
        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(Cause::Empty) => done.push(VecDeque::new()),
                Task::Visit(Cause::Fail(e)) => done.push(VecDeque::from([vec![Leaf::Fail(e)]])),
                Task::Visit(Cause::Die(d)) => done.push(VecDeque::from([vec![Leaf::Die(d)]])),
                Task::Visit(Cause::Interrupt(id)) => {
                    done.push(VecDeque::from([vec![Leaf::Interrupt(id)]]))
                }
                Task::Visit(Cause::Then(a, b)) => {
                    tasks.push(Task::Then);
                    tasks.push(Task::Visit(&**b));
                    tasks.push(Task::Visit(&**a));
                }
                Task::Visit(Cause::Both(a, b)) => {
                    tasks.push(Task::Both);
                    tasks.push(Task::Visit(&**b));
                    tasks.push(Task::Visit(&**a));
                }
                Task::Then | Task::Both => {
                    let right = done.pop().unwrap_or_default();
                    let left = done.pop().unwrap_or_default();
                    done.push(match task {
                        Task::Then => concat_steps(left, right),
                        _ => zip_steps(left, right),
                    });
                }
            }
        }
        done.pop().map(Vec::from).unwrap_or_default()
    }

    /// Write the tree in construction order. `debug` selects the
    /// `Then(a, b)` form over `(a ; b)`.
    fn render<'a>(
        &'a self,
        f: &mut fmt::Formatter<'_>,
        debug: bool,
        mut leaf: impl FnMut(&mut fmt::Formatter<'_>, Leaf<'a, E>) -> fmt::Result,
    ) -> fmt::Result {
        enum Piece<'n, T> {
            Node(&'n Cause<T>),
            Text(&'static str),
        }

        let mut pending = vec![Piece::Node(self)];
        while let Some(piece) = pending.pop() {
            let node = match piece {
                Piece::Text(text) => {
                    f.write_str(text)?;
                    continue;
                }
                Piece::Node(node) => node,
            };
            let (a, b, open, sep) = match (node, debug) {
                (Cause::Empty, _) => {
                    f.write_str("Empty")?;
                    continue;
                }
                (Cause::Fail(e), _) => {
                    leaf(f, Leaf::Fail(e))?;
                    continue;
                }
                (Cause::Die(d), _) => {
                    leaf(f, Leaf::Die(d))?;
                    continue;
                }
                (Cause::Interrupt(id), _) => {
                    leaf(f, Leaf::Interrupt(id))?;
                    continue;
                }
                (Cause::Then(a, b), false) => (a, b, "(", " ; "),
                (Cause::Both(a, b), false) => (a, b, "(", " | "),
                (Cause::Then(a, b), true) => (a, b, "Then(", ", "),
                (Cause::Both(a, b), true) => (a, b, "Both(", ", "),
            };
            f.write_str(open)?;
            pending.extend([
                Piece::Text(")"),
                Piece::Node(&**b),
                Piece::Text(sep),
                Piece::Node(&**a),
            ]);
        }
        Ok(())
    }
}

fn concat_steps<T>(mut left: VecDeque<T>, mut right: VecDeque<T>) -> VecDeque<T> {
    if left.len() >= right.len() {
        left.extend(right);
        left
    } else {
        while let Some(step) = left.pop_back() {
            right.push_front(step);
        }
        right
    }
}

fn zip_steps<T>(left: VecDeque<Vec<T>>, right: VecDeque<Vec<T>>) -> VecDeque<Vec<T>> {
    let (mut base, other) = if left.len() >= right.len() { (left, right) } else { (right, left) };
    for (slot, mut group) in base.iter_mut().zip(other) {
        if group.len() > slot.len() {
            mem::swap(slot, &mut group);
        }
        slot.extend(group);
    }
    base
}

impl<E: Clone> Clone for Cause<E> {
    fn clone(&self) -> Self {
        enum Task<'n, T> {
            Visit(&'n Cause<T>),
            Then,
            Both,
        }

        let mut tasks = vec![Task::Visit(self)];
        let mut done: Vec<Cause<E>> = Vec::new();
        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(Cause::Empty) => done.push(Cause::Empty),
                Task::Visit(Cause::Fail(e)) => done.push(Cause::Fail(e.clone())),
                Task::Visit(Cause::Die(d)) => done.push(Cause::Die(d.clone())),
                Task::Visit(Cause::Interrupt(id)) => done.push(Cause::Interrupt(id.clone())),
                Task::Visit(Cause::Then(a, b)) => {
                    tasks.push(Task::Then);
                    tasks.push(Task::Visit(&**b));
                    tasks.push(Task::Visit(&**a));
                }
                Task::Visit(Cause::Both(a, b)) => {
                    tasks.push(Task::Both);
                    tasks.push(Task::Visit(&**b));
                    tasks.push(Task::Visit(&**a));
                }
                Task::Then | Task::Both => {
                    let right = Link::new(done.pop().unwrap_or_default());
                    let left = Link::new(done.pop().unwrap_or_default());
                    done.push(match task {
                        Task::Then => Cause::Then(left, right),
                        _ => Cause::Both(left, right),
                    });
                }
            }
        }
        done.pop().unwrap_or_default()
    }
}

/// Pre-order, left-to-right walk over the leaves of a cause.
struct Leaves<'a, E> {
    pending: Vec<&'a Cause<E>>,
}

impl<'a, E> Iterator for Leaves<'a, E> {
    type Item = Leaf<'a, E>;

    fn next(&mut self) -> Option<Leaf<'a, E>> {
        while let Some(cause) = self.pending.pop() {
            match cause {
                Cause::Empty => {}
                Cause::Fail(e) => return Some(Leaf::Fail(e)),
                Cause::Die(d) => return Some(Leaf::Die(d)),
                Cause::Interrupt(id) => return Some(Leaf::Interrupt(id)),
                Cause::Then(a, b) | Cause::Both(a, b) => {
                    self.pending.push(&**b);
                    self.pending.push(&**a);
                }
            }
        }
        None
    }
}

#[derive(Debug)]
enum Leaf<'a, E> {
    Fail(&'a E),
    Die(&'a Defect),
    Interrupt(&'a FiberId),
}

impl<E: PartialEq> PartialEq for Leaf<'_, E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Leaf::Fail(a), Leaf::Fail(b)) => a == b,
            (Leaf::Die(a), Leaf::Die(b)) => a == b,
            (Leaf::Interrupt(a), Leaf::Interrupt(b)) => a == b,
            _ => false,
        }
    }
}

/// Multiset equality without requiring `Hash` or `Ord` on `E`.
fn same_group<E: PartialEq>(a: &[Leaf<'_, E>], b: &[Leaf<'_, E>]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    a.iter().all(|leaf| {
        let hit = b
            .iter()
            .enumerate()
            .find(|(i, candidate)| !used[*i] && *candidate == leaf)
            .map(|(i, _)| i);
        match hit {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        let left = self.linearize();
        let right = other.linearize();
        left.len() == right.len()
            && left.iter().zip(right.iter()).all(|(a, b)| same_group(a, b))
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, false, |f, leaf| match leaf {
            Leaf::Fail(e) => write!(f, "Fail({})", e),
            Leaf::Die(d) => write!(f, "Die({})", d),
            Leaf::Interrupt(id) => write!(f, "Interrupt({})", id),
        })
    }
}

impl<E: fmt::Debug> fmt::Debug for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, true, |f, leaf| match leaf {
            Leaf::Fail(e) => write!(f, "Fail({:?})", e),
            Leaf::Die(d) => write!(f, "Die({:?})", d),
            Leaf::Interrupt(id) => write!(f, "Interrupt({:?})", id),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fid(n: u64) -> FiberId {
        FiberId::Runtime { id: n, started_at_millis: 0 }
    }

    #[test]
    fn test_empty_is_identity() {
        let c: Cause<&str> = Cause::fail("boom");
        assert_eq!(c.clone().then(Cause::Empty), c);
        assert_eq!(Cause::Empty.then(c.clone()), c);
        assert_eq!(c.clone().both(Cause::Empty), c);
        assert!(matches!(Cause::<&str>::Empty.both(Cause::Empty), Cause::Empty));
    }

    #[test]
    fn test_both_is_order_insensitive() {
        let a: Cause<i32> = Cause::fail(1);
        let b: Cause<i32> = Cause::die_message("x");
        assert_eq!(a.clone().both(b.clone()), b.clone().both(a.clone()));
        assert_ne!(a.clone().then(b.clone()), b.then(a));
    }

    #[test]
    fn test_associativity() {
        let a: Cause<i32> = Cause::fail(1);
        let b: Cause<i32> = Cause::fail(2);
        let c: Cause<i32> = Cause::interrupt(fid(3));
        assert_eq!(
            a.clone().then(b.clone()).then(c.clone()),
            a.clone().then(b.clone().then(c.clone()))
        );
        assert_eq!(
            a.clone().both(b.clone()).both(c.clone()),
            a.both(b.both(c))
        );
    }

    #[test]
    fn test_display_preserves_order() {
        let c: Cause<&str> = Cause::fail("a").both(Cause::fail("b"));
        assert_eq!(c.to_string(), "(Fail(a) | Fail(b))");
        let c: Cause<&str> = Cause::fail("a").then(Cause::interrupt(fid(4)));
        assert_eq!(c.to_string(), "(Fail(a) ; Interrupt(#4))");
    }

    #[test]
    fn test_queries() {
        let c: Cause<&str> = Cause::fail("a")
            .then(Cause::die_message("d"))
            .both(Cause::interrupt(fid(1)));
        assert_eq!(c.failures(), vec![&"a"]);
        assert_eq!(c.defects().len(), 1);
        assert!(c.is_interrupted());
        assert!(!c.is_interrupted_only());
        assert_eq!(c.interruptors(), BTreeSet::from([fid(1)]));

        let only: Cause<&str> = Cause::interrupt(fid(1)).both(Cause::interrupt(fid(2)));
        assert!(only.is_interrupted_only());
        assert_eq!(only.interruptor(), fid(1).combine(fid(2)));
    }

    #[test]
    fn test_failure_or_cause() {
        let c: Cause<&str> = Cause::die_message("d").then(Cause::fail("a"));
        assert_eq!(c.failure_or_cause(), Ok("a"));

        let c: Cause<&str> = Cause::interrupt(fid(9));
        assert_eq!(c.clone().failure_or_cause(), Err(c));
    }

    #[test]
    fn test_strip_and_map() {
        let c: Cause<i32> = Cause::fail(1).both(Cause::die_message("d"));
        assert_eq!(c.clone().strip_failures(), Cause::die_message("d"));
        assert_eq!(c.map(|n| n * 10).first_failure(), Some(&10));
    }

    #[test]
    fn test_defect_from_panic() {
        let payload = std::panic::catch_unwind(|| panic!("kaboom")).unwrap_err();
        assert_eq!(Defect::from_panic(payload).message(), "kaboom");

        let payload = std::panic::catch_unwind(|| panic!("{}", 42)).unwrap_err();
        assert_eq!(Defect::from_panic(payload).message(), "42");
    }

    #[test]
    fn test_any_error_roundtrip() {
        let err = AnyError::new(String::from("bad"));
        assert_eq!(err.downcast_ref::<String>().map(String::as_str), Some("bad"));
        assert!(err.downcast_ref::<i32>().is_none());
        let shared = err.clone();
        assert_eq!(err.downcast::<String>().as_deref(), Some("bad"));
        assert_eq!(shared.downcast::<i32>(), None);
    }

    #[test]
    fn test_deep_sequential_chain() {
        let depth = 100_000;
        let chain = (0..depth).fold(Cause::<u32>::Empty, |acc, n| acc.then(Cause::fail(n)));
        assert!(!chain.is_empty());
        assert_eq!(chain.failures().len(), depth as usize);
        assert_eq!(chain.first_failure(), Some(&0));

        let copy = chain.clone();
        assert_eq!(copy, chain);
        assert!(chain.to_string().starts_with("(((("));
        assert!(format!("{:?}", copy).starts_with("Then(Then("));

        let widened = copy.map(u64::from);
        assert_eq!(widened.failures().last(), Some(&&u64::from(depth - 1)));
        assert!(widened.strip_failures().is_empty());
        assert_eq!(chain.failure_or_cause(), Ok(0));
    }

    #[test]
    fn test_deep_parallel_and_mixed_trees() {
        let wide = (0..100_000u64).fold(Cause::<&str>::Empty, |acc, n| {
            acc.both(Cause::interrupt(fid(n % 7)))
        });
        assert!(wide.is_interrupted_only());
        assert_eq!(wide.interruptors().len(), 7);

        let mixed = (0..100_000u32).fold(Cause::<u32>::Empty, |acc, n| {
            let leaf = if n % 2 == 0 { Cause::die_message("d") } else { Cause::fail(n) };
            if n % 3 == 0 { leaf.both(acc) } else { acc.then(leaf) }
        });
        assert_eq!(mixed.defects().len(), 50_000);
        let retyped: Cause<String> = mixed.strip_failures().retype("unexpected");
        assert!(!retyped.is_failure());
        assert_eq!(retyped.defects().len(), 50_000);
    }

    #[test]
    fn test_smart_constructors_drop_only_top_level_empty() {
        let a: Cause<i32> = Cause::fail(1);
        assert!(matches!(a.clone().then(Cause::Empty), Cause::Fail(1)));
        assert!(matches!(Cause::Empty.both(a.clone()), Cause::Fail(1)));

        // A hand-built empty tree still reports empty.
        let hollow: Cause<i32> = Cause::Then(Link::new(Cause::Empty), Link::new(Cause::Empty));
        assert!(hollow.is_empty());
        assert_eq!(hollow, Cause::Empty);
        assert!(matches!(hollow.both(a), Cause::Both(..)));
    }
}
