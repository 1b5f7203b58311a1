use std::path::PathBuf;
use stratus_core::CoreError;
use thiserror::Error;

/// Errors raised while deploying modules or running playbooks
#[derive(Error, Debug)]
pub enum DeployError {
    /// The module path is missing or not a directory
    #[error("Cannot find module {0}: not existing or not a directory")]
    ModuleNotFound(PathBuf),

    /// The deployed module does not contain the requested playbook
    #[error("Cannot find playbook '{playbook}' in module '{module}'; module files are {files:?}")]
    PlaybookNotFound {
        /// Requested playbook file name
        playbook: String,
        /// Module that was searched
        module: String,
        /// Top-level files present in the module
        files: Vec<String>,
    },

    /// No deployment of the module has been seen
    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The playbook runner exited unsuccessfully or could not start
    #[error("Command failed: {0}")]
    Command(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reported by the orchestration engine
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for deployment operations
pub type DeployResult<T> = Result<T, DeployError>;

impl From<DeployError> for CoreError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::Core(core) => core,
            other => CoreError::ExternalOperationFailure(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for DeployError {
    fn from(err: config::ConfigError) -> Self {
        DeployError::Config(err.to_string())
    }
}
