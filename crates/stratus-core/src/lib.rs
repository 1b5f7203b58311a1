//!
//! Stratus Core - execution primitives for the Stratus control plane
//!
//! This crate provides the [`Completion`] callback contract used by every
//! asynchronous operation, and the [`FlowChain`] engine that runs ordered
//! steps with reverse-order compensation on failure.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Single-use success/failure callbacks
pub mod completion;

/// Error types
pub mod error;

/// Flow steps and chains
pub mod flow;

pub use completion::{Completion, CompletionReceiver};
pub use error::CoreError;
pub use flow::{
    CancelHandle, ChainAction, ChainMachine, ChainState, FlowChain, FlowContext, FlowTrigger,
    FnFlow, Flow, TriggerPhase,
};

/// Result alias used throughout Stratus
pub type CoreResult<T> = Result<T, CoreError>;
