use async_trait::async_trait;
use std::fmt;

use super::{FlowContext, FlowTrigger};
use crate::CoreError;

/// One unit of forward work plus its compensating action.
///
/// `run` must eventually fire its trigger exactly once with `next()` or
/// `fail()`. It may do so before returning, or hand a clone of the trigger to
/// whatever delivers the external reply and return early; the chain stays
/// suspended until the trigger fires.
///
/// `rollback` is only invoked for steps whose `run` advanced the chain, and
/// must fire `rollback()` or `rollback_with_error()`.
#[async_trait]
pub trait Flow: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Forward action
    async fn run(&self, trigger: FlowTrigger, data: &mut FlowContext);

    /// Compensating action. Steps with nothing to undo keep the default.
    async fn rollback(&self, trigger: FlowTrigger, data: &mut FlowContext) {
        let _ = data;
        let _ = trigger.rollback();
    }
}

type StepFn = Box<dyn Fn(&mut FlowContext) -> Result<(), CoreError> + Send + Sync>;

/// A synchronous step built from closures.
///
/// The run closure's result decides between `next()` and `fail()`; the
/// optional rollback closure's result between `rollback()` and
/// `rollback_with_error()`.
pub struct FnFlow {
    name: String,
    run: StepFn,
    rollback: Option<StepFn>,
}

impl FnFlow {
    /// Create a step from a run closure
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut FlowContext) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
            rollback: None,
        }
    }

    /// Attach a compensating closure
    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: Fn(&mut FlowContext) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.rollback = Some(Box::new(rollback));
        self
    }
}

impl fmt::Debug for FnFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFlow")
            .field("name", &self.name)
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}

#[async_trait]
impl Flow for FnFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, trigger: FlowTrigger, data: &mut FlowContext) {
        let _ = match (self.run)(data) {
            Ok(()) => trigger.next(),
            Err(e) => trigger.fail(e),
        };
    }

    async fn rollback(&self, trigger: FlowTrigger, data: &mut FlowContext) {
        let outcome = match &self.rollback {
            Some(rollback) => rollback(data),
            None => Ok(()),
        };
        let _ = match outcome {
            Ok(()) => trigger.rollback(),
            Err(e) => trigger.rollback_with_error(e),
        };
    }
}
