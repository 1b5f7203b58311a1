use thiserror::Error;

/// Core error type for the Stratus orchestration engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A flow step reported failure through its trigger
    #[error("Step '{step}' (#{index}) failed: {cause}")]
    StepFailure {
        /// Name of the failing step
        step: String,
        /// Position of the failing step in its chain
        index: usize,
        /// Error reported by the step
        cause: Box<CoreError>,
    },

    /// Compensation of a previously completed step failed; rollback halted there
    #[error("Compensation of step '{step}' (#{index}) failed: {cause}; original failure: {original}")]
    CompensationFailure {
        /// Name of the step whose rollback failed
        step: String,
        /// Position of that step in its chain
        index: usize,
        /// The failure that started the rollback
        original: Box<CoreError>,
        /// The error reported by the rollback itself
        cause: Box<CoreError>,
    },

    /// A trigger or completion was used out of turn
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The scheduler refused a submission
    #[error("Scheduler rejected task: {0}")]
    SchedulerRejection(String),

    /// The action performed by a step failed
    #[error("External operation failed: {0}")]
    ExternalOperationFailure(String),

    /// Invalid argument supplied by a caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A completion was dropped without being resolved
    #[error("Completion dropped without resolution: {0}")]
    CompletionDropped(String),

    /// A task body or step panicked
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Shorthand for an [`CoreError::ExternalOperationFailure`]
    pub fn external(message: impl Into<String>) -> Self {
        CoreError::ExternalOperationFailure(message.into())
    }

    /// Returns true if this error came out of a rollback that could not finish
    pub fn is_compensation_failure(&self) -> bool {
        matches!(self, CoreError::CompensationFailure { .. })
    }

    /// The error a step originally reported, unwrapping chain-level wrappers
    pub fn root_cause(&self) -> &CoreError {
        match self {
            CoreError::StepFailure { cause, .. } => cause.root_cause(),
            CoreError::CompensationFailure { original, .. } => original.root_cause(),
            other => other,
        }
    }

    /// Builds a readable message from a panic payload
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        CoreError::TaskPanicked(message)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::ProtocolViolation("next twice".to_string()), "Protocol violation: next twice"),
            (CoreError::SchedulerRejection("shut down".to_string()), "Scheduler rejected task: shut down"),
            (CoreError::ExternalOperationFailure("ssh".to_string()), "External operation failed: ssh"),
            (CoreError::InvalidArgument("level".to_string()), "Invalid argument: level"),
            (CoreError::CompletionDropped("op".to_string()), "Completion dropped without resolution: op"),
            (CoreError::TaskPanicked("boom".to_string()), "Task panicked: boom"),
            (CoreError::ConfigurationError("cfg".to_string()), "Configuration error: cfg"),
            (CoreError::IOError("io".to_string()), "Input/output error: io"),
            (CoreError::SerializationError("ser".to_string()), "Serialization error: ser"),
            (CoreError::Other("other".to_string()), "other"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_composite_error_mentions_both_causes() {
        let original = CoreError::StepFailure {
            step: "attach-nic".to_string(),
            index: 2,
            cause: Box::new(CoreError::external("agent unreachable")),
        };
        let error = CoreError::CompensationFailure {
            step: "allocate-ip".to_string(),
            index: 1,
            original: Box::new(original),
            cause: Box::new(CoreError::external("ip still in use")),
        };

        let msg = error.to_string();
        assert!(msg.contains("allocate-ip"));
        assert!(msg.contains("ip still in use"));
        assert!(msg.contains("agent unreachable"));
        assert!(error.is_compensation_failure());
        assert_eq!(error.root_cause(), &CoreError::external("agent unreachable"));
    }

    #[test]
    fn test_from_panic_payloads() {
        let err = CoreError::from_panic(Box::new("static str"));
        assert_eq!(err, CoreError::TaskPanicked("static str".to_string()));

        let err = CoreError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err, CoreError::TaskPanicked("owned".to_string()));

        let err = CoreError::from_panic(Box::new(42u8));
        assert_eq!(err, CoreError::TaskPanicked("unknown panic payload".to_string()));
    }

    #[test]
    fn test_from_io_error() {
        let io_error = IoError::new(ErrorKind::NotFound, "file not found");
        let error: CoreError = io_error.into();

        match error {
            CoreError::IOError(msg) => assert!(msg.contains("file not found")),
            _ => panic!("Expected IOError variant"),
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();
        assert!(matches!(error, CoreError::SerializationError(_)));
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "plain".into();
        assert_eq!(error, CoreError::Other("plain".to_string()));
    }
}
