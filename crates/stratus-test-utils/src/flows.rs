//! Scripted [`Flow`] implementations.

use async_trait::async_trait;
use stratus_core::{CoreError, Flow, FlowContext, FlowTrigger};
use tokio::sync::mpsc;

use crate::Journal;

/// Records its run and rollback, then advances and compensates successfully
#[derive(Debug, Clone)]
pub struct RecordingFlow {
    name: String,
    journal: Journal,
}

impl RecordingFlow {
    pub fn new(name: impl Into<String>, journal: &Journal) -> Self {
        Self {
            name: name.into(),
            journal: journal.clone(),
        }
    }
}

#[async_trait]
impl Flow for RecordingFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
        self.journal.record(format!("run:{}", self.name));
        let _ = trigger.next();
    }

    async fn rollback(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
        self.journal.record(format!("rollback:{}", self.name));
        let _ = trigger.rollback();
    }
}

/// Records its run and fails it with the configured error
#[derive(Debug, Clone)]
pub struct FailingFlow {
    name: String,
    journal: Journal,
    error: CoreError,
}

impl FailingFlow {
    pub fn new(name: impl Into<String>, journal: &Journal, error: CoreError) -> Self {
        Self {
            name: name.into(),
            journal: journal.clone(),
            error,
        }
    }
}

#[async_trait]
impl Flow for FailingFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
        self.journal.record(format!("run:{}", self.name));
        let _ = trigger.fail(self.error.clone());
    }

    async fn rollback(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
        self.journal.record(format!("rollback:{}", self.name));
        let _ = trigger.rollback();
    }
}

/// Advances normally but fails its own compensation
#[derive(Debug, Clone)]
pub struct FailingRollbackFlow {
    name: String,
    journal: Journal,
    error: CoreError,
}

impl FailingRollbackFlow {
    pub fn new(name: impl Into<String>, journal: &Journal, error: CoreError) -> Self {
        Self {
            name: name.into(),
            journal: journal.clone(),
            error,
        }
    }
}

#[async_trait]
impl Flow for FailingRollbackFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
        self.journal.record(format!("run:{}", self.name));
        let _ = trigger.next();
    }

    async fn rollback(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
        self.journal.record(format!("rollback:{}", self.name));
        let _ = trigger.rollback_with_error(self.error.clone());
    }
}

/// Returns from `run` without firing, handing its trigger to the test.
///
/// The chain stays suspended until the test fires the trigger received from
/// the channel returned by [`SuspendingFlow::new`].
#[derive(Debug)]
pub struct SuspendingFlow {
    name: String,
    journal: Journal,
    triggers: mpsc::UnboundedSender<FlowTrigger>,
}

impl SuspendingFlow {
    pub fn new(
        name: impl Into<String>,
        journal: &Journal,
    ) -> (Self, mpsc::UnboundedReceiver<FlowTrigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let flow = Self {
            name: name.into(),
            journal: journal.clone(),
            triggers: tx,
        };
        (flow, rx)
    }
}

#[async_trait]
impl Flow for SuspendingFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
        self.journal.record(format!("run:{}", self.name));
        let _ = self.triggers.send(trigger);
    }

    async fn rollback(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
        self.journal.record(format!("rollback:{}", self.name));
        let _ = trigger.rollback();
    }
}
