use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Unique identifier for one session (one connection's protocol state).
///
/// Session ids key the server-side subscription registry, so they must be
/// unique across every connection a process ever accepts, not just the
/// currently open ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new unique session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Allocator for call correlation ids.
///
/// Call ids are carried *in-band* inside protocol envelopes as JSON
/// numbers; they only need to be unique among the calls pending on one
/// session, so a per-session counter suffices.
#[derive(Debug, Default)]
pub(crate) struct CallIdSequence(AtomicU64);

impl CallIdSequence {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
