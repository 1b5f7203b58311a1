//! Pure state machine behind [`FlowChain`](super::FlowChain).
//!
//! The machine knows nothing about steps beyond their names; it only decides
//! which step to invoke next given what the previous one reported.

use crate::CoreError;

/// Position of a chain execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainState {
    /// Running step `cursor` forward
    Forward {
        /// Index of the step currently running or about to run
        cursor: usize,
    },
    /// Compensating step `cursor`
    RollingBack {
        /// Index of the step currently being rolled back
        cursor: usize,
    },
    /// Every step advanced
    Completed,
    /// Forward execution failed and rollback finished or halted
    Failed,
}

impl ChainState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainState::Completed | ChainState::Failed)
    }
}

/// What the engine must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainAction {
    /// Invoke `run` on the step at this index
    Run(usize),
    /// Invoke `rollback` on the step at this index
    Rollback(usize),
    /// Fire the done handler
    Done,
    /// Fire the error handler with this error
    Error(CoreError),
}

/// Forward/rollback state machine over an ordered list of step names
#[derive(Debug, Clone)]
pub struct ChainMachine {
    steps: Vec<String>,
    state: ChainState,
    started: bool,
    failure: Option<CoreError>,
}

impl ChainMachine {
    /// Create a machine for steps with the given names
    pub fn new(steps: Vec<String>) -> Self {
        Self {
            steps,
            state: ChainState::Forward { cursor: 0 },
            started: false,
            failure: None,
        }
    }

    /// Current state
    pub fn state(&self) -> &ChainState {
        &self.state
    }

    /// The step failure that triggered rollback, if any
    pub fn failure(&self) -> Option<&CoreError> {
        self.failure.as_ref()
    }

    /// Begin execution
    pub fn start(&mut self) -> Result<ChainAction, CoreError> {
        if self.started {
            return Err(CoreError::ProtocolViolation(
                "chain machine already started".to_string(),
            ));
        }
        self.started = true;

        if self.steps.is_empty() {
            self.state = ChainState::Completed;
            return Ok(ChainAction::Done);
        }
        Ok(ChainAction::Run(0))
    }

    /// The running step called `next()`
    pub fn on_next(&mut self) -> Result<ChainAction, CoreError> {
        let cursor = self.forward_cursor("next")?;
        let next = cursor + 1;
        if next == self.steps.len() {
            self.state = ChainState::Completed;
            Ok(ChainAction::Done)
        } else {
            self.state = ChainState::Forward { cursor: next };
            Ok(ChainAction::Run(next))
        }
    }

    /// The running step called `fail()`
    pub fn on_fail(&mut self, cause: CoreError) -> Result<ChainAction, CoreError> {
        let cursor = self.forward_cursor("fail")?;
        let failure = CoreError::StepFailure {
            step: self.steps[cursor].clone(),
            index: cursor,
            cause: Box::new(cause),
        };

        // Only steps before the failing one completed their run
        if cursor == 0 {
            self.state = ChainState::Failed;
            return Ok(ChainAction::Error(failure));
        }
        self.failure = Some(failure);
        self.state = ChainState::RollingBack { cursor: cursor - 1 };
        Ok(ChainAction::Rollback(cursor - 1))
    }

    /// The step being compensated called `rollback()`
    pub fn on_rollback_done(&mut self) -> Result<ChainAction, CoreError> {
        let cursor = self.rollback_cursor("rollback")?;
        if cursor == 0 {
            self.state = ChainState::Failed;
            return Ok(ChainAction::Error(self.take_failure()));
        }
        self.state = ChainState::RollingBack { cursor: cursor - 1 };
        Ok(ChainAction::Rollback(cursor - 1))
    }

    /// The step being compensated called `rollback_with_error()`.
    ///
    /// Rollback halts here; earlier steps are left as they are.
    pub fn on_rollback_failed(&mut self, cause: CoreError) -> Result<ChainAction, CoreError> {
        let cursor = self.rollback_cursor("rollback_with_error")?;
        self.state = ChainState::Failed;
        Ok(ChainAction::Error(CoreError::CompensationFailure {
            step: self.steps[cursor].clone(),
            index: cursor,
            original: Box::new(self.take_failure()),
            cause: Box::new(cause),
        }))
    }

    fn forward_cursor(&self, op: &str) -> Result<usize, CoreError> {
        match (&self.state, self.started) {
            (ChainState::Forward { cursor }, true) => Ok(*cursor),
            (state, _) => Err(CoreError::ProtocolViolation(format!(
                "{}() is not valid in state {:?}",
                op, state
            ))),
        }
    }

    fn rollback_cursor(&self, op: &str) -> Result<usize, CoreError> {
        match &self.state {
            ChainState::RollingBack { cursor } => Ok(*cursor),
            state => Err(CoreError::ProtocolViolation(format!(
                "{}() is not valid in state {:?}",
                op, state
            ))),
        }
    }

    fn take_failure(&mut self) -> CoreError {
        self.failure
            .take()
            .unwrap_or_else(|| CoreError::Other("rollback finished without a recorded failure".to_string()))
    }
}
