//! # Fiber Identity
//!
//! Every fiber carries a process-unique [`FiberId`]: a sequence number
//! paired with the wall-clock millisecond the fiber was created.
//!
//! Interruption can originate from several fibers at once (two ancestors
//! racing to cancel the same child, a scope closing while a timeout fires),
//! so ids also form a small algebra: [`FiberId::combine`] unions ids into a
//! [`FiberId::Composite`] and [`FiberId::None`] is its identity.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a fiber, or of the set of fibers that jointly caused an
/// interruption.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum FiberId {
    /// No fiber. Used for interruption requested from outside the runtime.
    #[default]
    None,
    /// A single runtime fiber.
    Runtime {
        /// Process-unique sequence number.
        id: u64,
        /// Creation time, milliseconds since the Unix epoch.
        started_at_millis: u64,
    },
    /// Union of several ids. Never contains `None` or nested composites.
    Composite(BTreeSet<FiberId>),
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Allocate a fresh runtime id.
    pub fn next() -> Self {
        let started_at_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        FiberId::Runtime {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            started_at_millis,
        }
    }

    /// Union of two ids.
    pub fn combine(self, other: FiberId) -> FiberId {
        let mut set = self.into_set();
        set.extend(other.into_set());
        FiberId::from_set(set)
    }

    /// Union of any number of ids.
    pub fn combine_all<I: IntoIterator<Item = FiberId>>(ids: I) -> FiberId {
        ids.into_iter().fold(FiberId::None, FiberId::combine)
    }

    /// Sequence numbers of every runtime id contained in this id.
    pub fn ids(&self) -> BTreeSet<u64> {
        match self {
            FiberId::None => BTreeSet::new(),
            FiberId::Runtime { id, .. } => BTreeSet::from([*id]),
            FiberId::Composite(set) => set.iter().flat_map(FiberId::ids).collect(),
        }
    }

    /// Whether this id is `None`.
    pub fn is_none(&self) -> bool {
        matches!(self, FiberId::None)
    }

    /// Whether `other` (a single runtime id) is part of this id.
    pub fn contains(&self, other: &FiberId) -> bool {
        match (self, other) {
            (_, FiberId::None) => false,
            (FiberId::Composite(set), FiberId::Runtime { .. }) => set.contains(other),
            (FiberId::Composite(set), FiberId::Composite(others)) => others.is_subset(set),
            _ => self == other,
        }
    }

    fn into_set(self) -> BTreeSet<FiberId> {
        match self {
            FiberId::None => BTreeSet::new(),
            id @ FiberId::Runtime { .. } => BTreeSet::from([id]),
            FiberId::Composite(set) => set,
        }
    }

    fn from_set(mut set: BTreeSet<FiberId>) -> FiberId {
        match set.len() {
            0 => FiberId::None,
            1 => set.pop_first().unwrap_or_default(),
            _ => FiberId::Composite(set),
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberId::None => write!(f, "#none"),
            FiberId::Runtime { id, .. } => write!(f, "#{}", id),
            FiberId::Composite(set) => {
                let parts: Vec<String> = set.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join("+"))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
