//! Testing utilities for the Stratus control plane.
//!
//! Provides scripted flow steps that record what the engine asked them to
//! do, a shared [`Journal`] to assert on that order, fixture helpers for
//! module directories, and a tracing setup for tests.

pub mod fixtures;
pub mod flows;
pub mod journal;

pub use flows::{FailingFlow, FailingRollbackFlow, RecordingFlow, SuspendingFlow};
pub use journal::Journal;

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`, defaulting to `debug` for Stratus crates.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stratus=debug,warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
