//! Ordered record of engine callbacks.

use parking_lot::Mutex;
use std::sync::Arc;

/// A thread-safe, cloneable list of events in the order they happened.
///
/// Scripted steps push `"run:<name>"` and `"rollback:<name>"`; terminal
/// handlers usually push `"done"` or `"error"`.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Snapshot of every event so far
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Number of events equal to `entry`
    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().iter().filter(|e| *e == entry).count()
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Assert the journal holds exactly `expected`, in order
    pub fn assert_entries(&self, expected: &[&str]) {
        let actual = self.entries();
        assert_eq!(
            actual, expected,
            "journal mismatch\n  actual:   {:?}\n  expected: {:?}",
            actual, expected
        );
    }
}
