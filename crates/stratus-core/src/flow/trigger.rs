use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::error;

use crate::CoreError;

/// Which half of a step a trigger was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPhase {
    /// Issued to `Flow::run`
    Run,
    /// Issued to `Flow::rollback`
    Rollback,
}

impl fmt::Display for TriggerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerPhase::Run => write!(f, "run"),
            TriggerPhase::Rollback => write!(f, "rollback"),
        }
    }
}

/// What a step reported back to the engine
#[derive(Debug)]
pub(crate) enum Signal {
    Next,
    Fail(CoreError),
    RolledBack,
    RollbackFailed(CoreError),
}

struct TriggerInner {
    chain: String,
    step: String,
    index: usize,
    phase: TriggerPhase,
    tx: Mutex<Option<oneshot::Sender<Signal>>>,
}

/// Handle a step uses to advance, fail, or report compensation to its chain.
///
/// A trigger fires at most once. It may be cloned and moved to another task
/// so that a step can return and report later, once an external reply
/// arrives. Firing a second time, firing the wrong kind for the phase, or
/// firing after the chain stopped waiting yields
/// [`CoreError::ProtocolViolation`].
#[derive(Clone)]
pub struct FlowTrigger {
    inner: Arc<TriggerInner>,
}

impl FlowTrigger {
    pub(crate) fn new(
        chain: &str,
        step: &str,
        index: usize,
        phase: TriggerPhase,
    ) -> (Self, oneshot::Receiver<Signal>) {
        let (tx, rx) = oneshot::channel();
        let trigger = Self {
            inner: Arc::new(TriggerInner {
                chain: chain.to_string(),
                step: step.to_string(),
                index,
                phase,
                tx: Mutex::new(Some(tx)),
            }),
        };
        (trigger, rx)
    }

    /// Advance to the next step
    pub fn next(&self) -> Result<(), CoreError> {
        self.fire(TriggerPhase::Run, "next", Signal::Next)
    }

    /// Abort forward execution and start compensating completed steps
    pub fn fail(&self, err: CoreError) -> Result<(), CoreError> {
        self.fire(TriggerPhase::Run, "fail", Signal::Fail(err))
    }

    /// Report that this step's compensation finished
    pub fn rollback(&self) -> Result<(), CoreError> {
        self.fire(TriggerPhase::Rollback, "rollback", Signal::RolledBack)
    }

    /// Report that this step's compensation itself failed; rollback halts
    pub fn rollback_with_error(&self, err: CoreError) -> Result<(), CoreError> {
        self.fire(
            TriggerPhase::Rollback,
            "rollback_with_error",
            Signal::RollbackFailed(err),
        )
    }

    /// Name of the chain this trigger belongs to
    pub fn chain_name(&self) -> &str {
        &self.inner.chain
    }

    /// Name of the step this trigger was issued to
    pub fn step_name(&self) -> &str {
        &self.inner.step
    }

    /// Position of the step in its chain
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Phase this trigger was issued for
    pub fn phase(&self) -> TriggerPhase {
        self.inner.phase
    }

    /// Whether the trigger has already fired
    pub fn is_fired(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    pub(crate) fn downgrade(&self) -> WeakTrigger {
        WeakTrigger(Arc::downgrade(&self.inner))
    }

    fn fire(&self, expected: TriggerPhase, op: &str, signal: Signal) -> Result<(), CoreError> {
        if self.inner.phase != expected {
            return Err(self.violation(format!(
                "{}() called on a {} trigger",
                op, self.inner.phase
            )));
        }

        let sender = self.inner.tx.lock().take();
        match sender {
            Some(tx) => tx
                .send(signal)
                .map_err(|_| self.violation(format!("{}() called after the chain stopped waiting", op))),
            None => Err(self.violation(format!("{}() called on a trigger that already fired", op))),
        }
    }

    fn violation(&self, detail: String) -> CoreError {
        let message = format!(
            "chain '{}' step '{}' (#{}): {}",
            self.inner.chain, self.inner.step, self.inner.index, detail
        );
        error!(
            chain = %self.inner.chain,
            step = %self.inner.step,
            index = self.inner.index,
            "Flow protocol violation: {}",
            detail
        );
        CoreError::ProtocolViolation(message)
    }
}

impl fmt::Debug for FlowTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTrigger")
            .field("chain", &self.inner.chain)
            .field("step", &self.inner.step)
            .field("index", &self.inner.index)
            .field("phase", &self.inner.phase)
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// Non-owning reference to a pending trigger.
///
/// Holding it does not keep the trigger alive, so the engine can still tell
/// when a step dropped every clone of its trigger without firing it.
#[derive(Clone)]
pub(crate) struct WeakTrigger(Weak<TriggerInner>);

impl WeakTrigger {
    pub(crate) fn upgrade(&self) -> Option<FlowTrigger> {
        self.0.upgrade().map(|inner| FlowTrigger { inner })
    }
}
