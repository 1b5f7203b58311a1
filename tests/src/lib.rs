//! Shared collaborators for the cross-crate tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stratus::deploy::{DeployResult, PlaybookInvocation, PlaybookRunner};
use stratus_test_utils::Journal;

/// Playbook runner that records `start:<host>` and `end:<host>` around each
/// run and tracks how many runs were active at once
pub struct HostRunner {
    journal: Journal,
    hold: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl HostRunner {
    /// Runner that holds every run for `hold`
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            journal: Journal::new(),
            hold,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Recorded run boundaries
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Most runs observed in progress at the same time
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybookRunner for HostRunner {
    async fn run(&self, invocation: &PlaybookInvocation) -> DeployResult<()> {
        let host = invocation
            .extra_vars
            .get("host")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.journal.record(format!("start:{}", host));
        tokio::time::sleep(self.hold).await;
        self.journal.record(format!("end:{}", host));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
