//! # stratus-deploy
//!
//! Module deployment and playbook execution built on the Stratus
//! scheduler and flow chains.
//!
//! - [`ModuleDeployer`] copies module directories into place when their
//!   content fingerprints change, one deployment per module at a time.
//! - [`PlaybookFacade`] runs playbooks against hosts, one run per host at a
//!   time.
//! - [`ModuleRegistry`] remembers what was deployed and whether a module
//!   changed since a dependent step last looked.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Command-line interface
pub mod cli;

/// Deployment configuration
pub mod config;

/// Serialized module deployment
pub mod deployer;

/// Error types
pub mod error;

/// Content fingerprints
pub mod fingerprint;

/// Playbook execution
pub mod playbook;

/// Per-module deployment state
pub mod registry;

mod steps;

pub use config::{DebugMode, DeployConfig, LibModule};
pub use deployer::{module_signature, DeployOutcome, ModuleDeployer};
pub use error::{DeployError, DeployResult};
pub use fingerprint::{fingerprint, DeployDecision, FingerprintSet};
pub use playbook::{
    host_signature, CommandPlaybookRunner, PlaybookFacade, PlaybookInvocation, PlaybookRequest,
    PlaybookRunner,
};
pub use registry::{ModuleRecord, ModuleRegistry};
