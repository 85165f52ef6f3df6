//! Correlation identifiers
//!
//! A `CorrelationId` is attached to every submission and echoed back by the
//! vendor session on each message that belongs to it. Identifiers are
//! generated locally and never reused while the process is alive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque tag linking a submitted request or subscription to its responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Wrap a raw identifier value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw identifier value
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Monotonic, thread-safe source of fresh correlation identifiers
///
/// Zero is never handed out so that a default-initialised id can never
/// collide with a live one.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    next: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start handing out identifiers from `first` (clamped to at least 1)
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    /// Allocate the next identifier
    pub fn next_id(&self) -> CorrelationId {
        let mut value = self.next.fetch_add(1, Ordering::Relaxed);
        if value == 0 {
            // wrapped around u64::MAX
            value = self.next.fetch_add(1, Ordering::Relaxed);
        }
        CorrelationId(value)
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
