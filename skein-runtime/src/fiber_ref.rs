//! # Fiber References
//!
//! A [`FiberRef`] is a variable whose value is private to each fiber. The
//! values of every ref a fiber has touched live in its [`FiberRefs`]
//! snapshot, which is threaded through the interpreter as part of the
//! fiber's context.
//!
//! ## Design
//!
//! - Forking copies the snapshot through each ref's `fork` function; after
//!   that, parent and child never see each other's writes.
//! - Joining a child folds the child's values back into the joiner through
//!   each ref's `join` function, but only for refs the child actually wrote
//!   after it was forked.
//! - The snapshot map is an `Arc<FxHashMap>` so fork is a pointer copy until
//!   the first write (copy-on-write via `Arc::make_mut`).
//!
//! Each write stamps the entry with a fresh global version. At fork time
//! every entry remembers the version it started from (`base`); a child entry
//! whose version still equals its base was never written.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::effect::{Effect, EffectError};

type RefValue = Arc<dyn Any + Send + Sync>;
type ForkFn = Box<dyn Fn(&RefValue) -> RefValue + Send + Sync>;
type JoinFn = Box<dyn Fn(&RefValue, &RefValue) -> RefValue + Send + Sync>;

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

struct RefOps {
    initial: RefValue,
    fork: ForkFn,
    join: JoinFn,
}

#[derive(Clone)]
struct RefEntry {
    value: RefValue,
    version: u64,
    /// Version at the time this snapshot was forked; 0 for refs first
    /// written after the fork.
    base: u64,
    ops: Arc<RefOps>,
}

/// Immutable per-fiber map from ref identity to value.
#[derive(Clone, Default)]
pub struct FiberRefs {
    entries: Arc<FxHashMap<u64, RefEntry>>,
}

impl FiberRefs {
    /// An empty snapshot: every ref reads its initial value.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of refs with an explicit value.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no ref has an explicit value.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read `fiber_ref`, falling back to its initial value.
    pub fn get<T>(&self, fiber_ref: &FiberRef<T>) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries
            .get(&fiber_ref.id)
            .and_then(|entry| entry.value.downcast_ref::<T>())
            .cloned()
            .unwrap_or_else(|| fiber_ref.initial.clone())
    }

    /// Write `fiber_ref` in this snapshot.
    pub fn set<T>(&mut self, fiber_ref: &FiberRef<T>, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        let entries = Arc::make_mut(&mut self.entries);
        let base = entries.get(&fiber_ref.id).map_or(0, |entry| entry.base);
        entries.insert(
            fiber_ref.id,
            RefEntry {
                value: Arc::new(value),
                version: next_version(),
                base,
                ops: fiber_ref.ops.clone(),
            },
        );
    }

    /// Builder-style [`FiberRefs::set`].
    pub fn with<T>(mut self, fiber_ref: &FiberRef<T>, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.set(fiber_ref, value);
        self
    }

    /// The snapshot a child fiber starts with.
    pub fn fork(&self) -> Self {
        if self.entries.is_empty() {
            return self.clone();
        }
        let entries = self
            .entries
            .iter()
            .map(|(id, entry)| {
                let forked = RefEntry {
                    value: (entry.ops.fork)(&entry.value),
                    version: entry.version,
                    base: entry.version,
                    ops: entry.ops.clone(),
                };
                (*id, forked)
            })
            .collect();
        Self { entries: Arc::new(entries) }
    }

    /// Fold a joined child's writes into this snapshot.
    pub fn join(&mut self, child: &FiberRefs) {
        if Arc::ptr_eq(&self.entries, &child.entries) {
            return;
        }
        let changed: Vec<(u64, &RefEntry)> = child
            .entries
            .iter()
            .filter(|(_, entry)| entry.version != entry.base)
            .map(|(id, entry)| (*id, entry))
            .collect();
        if changed.is_empty() {
            return;
        }
        let entries = Arc::make_mut(&mut self.entries);
        for (id, theirs) in changed {
            let (ours, base) = match entries.get(&id) {
                Some(entry) => (entry.value.clone(), entry.base),
                None => (theirs.ops.initial.clone(), 0),
            };
            entries.insert(
                id,
                RefEntry {
                    value: (theirs.ops.join)(&ours, &theirs.value),
                    version: next_version(),
                    base,
                    ops: theirs.ops.clone(),
                },
            );
        }
    }
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRefs").field("len", &self.len()).finish()
    }
}

/// A fiber-scoped variable.
pub struct FiberRef<T> {
    id: u64,
    initial: T,
    ops: Arc<RefOps>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone> Clone for FiberRef<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            initial: self.initial.clone(),
            ops: self.ops.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for FiberRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef").field("id", &self.id).finish()
    }
}

impl<T> FiberRef<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A ref whose children start with the parent's value and whose joined
    /// value is the child's.
    pub fn new(initial: T) -> Self {
        Self::build(
            initial,
            Box::new(|value: &RefValue| value.clone()),
            Box::new(|_: &RefValue, child: &RefValue| child.clone()),
        )
    }

    /// A ref with custom fork and join behavior.
    pub fn with_combine<F, J>(initial: T, fork: F, join: J) -> Self
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
        J: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        let fork: ForkFn = Box::new(move |value: &RefValue| match value.downcast_ref::<T>() {
            Some(t) => Arc::new(fork(t)) as RefValue,
            None => value.clone(),
        });
        let join: JoinFn = Box::new(move |parent: &RefValue, child: &RefValue| {
            match (parent.downcast_ref::<T>(), child.downcast_ref::<T>()) {
                (Some(p), Some(c)) => Arc::new(join(p, c)) as RefValue,
                _ => child.clone(),
            }
        });
        Self::build(initial, fork, join)
    }

    fn build(initial: T, fork: ForkFn, join: JoinFn) -> Self {
        let ops = RefOps {
            initial: Arc::new(initial.clone()),
            fork,
            join,
        };
        Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            initial,
            ops: Arc::new(ops),
            _marker: PhantomData,
        }
    }

    /// The value new snapshots read.
    pub fn initial(&self) -> &T {
        &self.initial
    }

    /// Read the current fiber's value.
    pub fn get(&self) -> Effect<T> {
        let this = self.clone();
        Effect::with_context(move |ctx| Effect::succeed(ctx.refs.get(&this)))
    }

    /// Replace the current fiber's value.
    pub fn set(&self, value: T) -> Effect<()> {
        let this = self.clone();
        Effect::with_context(move |ctx| {
            ctx.refs.set(&this, value);
            Effect::unit()
        })
    }

    /// Replace the value, returning the previous one.
    pub fn get_and_set(&self, value: T) -> Effect<T> {
        self.modify(move |old| (old, value))
    }

    /// Apply `f` to the value.
    pub fn update<F>(&self, f: F) -> Effect<()>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        self.modify(move |old| ((), f(old)))
    }

    /// Apply `f`, storing its second result and returning its first.
    pub fn modify<B, F>(&self, f: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(T) -> (B, T) + Send + 'static,
    {
        let this = self.clone();
        Effect::with_context(move |ctx| {
            let (out, next) = f(ctx.refs.get(&this));
            ctx.refs.set(&this, next);
            Effect::succeed(out)
        })
    }

    /// Run `effect` with the ref set to `value`, restoring the previous
    /// value afterwards however `effect` ends.
    pub fn locally<A, E>(&self, value: T, effect: Effect<A, E>) -> Effect<A, E>
    where
        A: Send + 'static,
        E: EffectError,
    {
        let this = self.clone();
        Effect::with_context(move |ctx| {
            let previous = ctx.refs.get(&this);
            ctx.refs.set(&this, value);
            effect.ensuring(this.set(previous))
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_falls_back_to_initial() {
        let r = FiberRef::new(5u32);
        let refs = FiberRefs::empty();
        assert_eq!(refs.get(&r), 5);
        let refs = refs.with(&r, 9);
        assert_eq!(refs.get(&r), 9);
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_fork_is_a_snapshot() {
        let r = FiberRef::new(String::from("parent"));
        let mut parent = FiberRefs::empty().with(&r, "before".to_string());
        let mut child = parent.fork();
        parent.set(&r, "after".to_string());
        assert_eq!(child.get(&r), "before");
        child.set(&r, "child".to_string());
        assert_eq!(parent.get(&r), "after");
    }

    #[test]
    fn test_join_only_changed_entries() {
        let a = FiberRef::with_combine(0i64, |v| *v, |p, c| p + c);
        let b = FiberRef::new(1i64);
        let mut parent = FiberRefs::empty().with(&a, 10).with(&b, 1);
        let child = parent.fork();

        // Unchanged child: parent's later write survives the join.
        parent.set(&b, 7);
        parent.join(&child);
        assert_eq!(parent.get(&b), 7);
        assert_eq!(parent.get(&a), 10);

        let mut child = parent.fork();
        child.set(&a, 5);
        parent.join(&child);
        assert_eq!(parent.get(&a), 15);
        assert_eq!(parent.get(&b), 7);
    }

    #[test]
    fn test_fork_function_applied() {
        let depth = FiberRef::with_combine(0u32, |d| d + 1, |p, _| *p);
        let parent = FiberRefs::empty().with(&depth, 0);
        let child = parent.fork();
        assert_eq!(child.get(&depth), 1);
        assert_eq!(child.fork().get(&depth), 2);
    }

    #[test]
    fn test_join_ref_created_in_child() {
        let r = FiberRef::with_combine(100u32, |v| *v, |p, c| p + c);
        let mut parent = FiberRefs::empty();
        let mut child = parent.fork();
        child.set(&r, 1);
        parent.join(&child);
        assert_eq!(parent.get(&r), 101);
    }
}
