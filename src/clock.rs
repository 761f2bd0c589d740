//! Clock & ID generator: the single source of truth for time and identity.
//!
//! No other component reads the OS clock directly — every timestamp that
//! crosses a component boundary is produced here and passed explicitly.
//! IDs are sortable (time-prefixed) and collision-resistant (random suffix),
//! which is what makes the graph store's `previous_in_chain` lookup
//! (lexicographic on id) correspond to temporal order.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Wall-clock + monotonic time source.
///
/// Cloning a `Clock` is cheap and shares the same monotonic counter, so two
/// clones can never hand out the same (millis, counter) pair.
#[derive(Debug, Clone)]
pub struct Clock {
    counter: std::sync::Arc<AtomicU64>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            counter: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current wall-clock time (UTC).
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Monotonically increasing counter, unique per process regardless of
    /// wall-clock resolution or NTP adjustments.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Generate a sortable, collision-resistant ID with the given type prefix.
    ///
    /// Format: `{prefix}-{millis_since_epoch:016x}-{tick:08x}-{rand:08x}`.
    /// Lexicographic string ordering of IDs sharing a prefix matches creation
    /// order, which `previous_in_chain` relies on. Gaps between IDs are
    /// expected and never assumed to be a fixed sampling interval.
    pub fn new_id(&self, prefix: &str) -> String {
        let millis = self.now().timestamp_millis().max(0) as u64;
        let tick = self.tick();
        let rand_suffix: u32 = rand::thread_rng().r#gen();
        format!("{prefix}-{millis:016x}-{tick:08x}-{rand_suffix:08x}")
    }
}

/// A task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A thought identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThoughtId(pub String);

impl std::fmt::Display for ThoughtId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A correlation/trace identifier, shared by the six trace components of one thought.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A deferral record identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeferralId(pub String);

impl std::fmt::Display for DeferralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
