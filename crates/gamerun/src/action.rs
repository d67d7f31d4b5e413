//! # Action Registry
//!
//! Issues correlation ids for host operations the guest treats as
//! asynchronous (timers, state save/load/delete). The registry only counts;
//! it keeps no record of which ids are still pending. Completion delivery is
//! the event queue's job.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

/// Correlation token for an asynchronous host operation.
///
/// Echoed back in the completion event so the guest can match it with the
/// request that produced it.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl ActionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "action-{}", self.0)
    }
}

/// Monotonic id source, one per session.
///
/// Interior mutability via AtomicU64 lets capability calls allocate ids
/// through a shared reference, both from the guest call stack and from any
/// host task holding the adapter.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    next: AtomicU64,
}

impl ActionRegistry {
    /// Creates a registry whose first id is 0.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Returns a fresh id. Ids are never reused within one registry.
    pub fn next_id(&self) -> ActionId {
        ActionId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}
