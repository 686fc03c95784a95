//! Monotonic ref generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generates the refs attached to outbound messages.
///
/// Refs are decimal strings of a strictly increasing counter, unique for the
/// lifetime of the generator.
#[derive(Debug, Default)]
pub struct RefGenerator {
    counter: AtomicU64,
}

impl RefGenerator {
    /// Create a generator whose first ref is `"1"`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next ref.
    pub fn next_ref(&self) -> String {
        (self.counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// The most recently issued ref, if any.
    #[must_use]
    pub fn last_ref(&self) -> Option<String> {
        match self.counter.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n.to_string()),
        }
    }
}
