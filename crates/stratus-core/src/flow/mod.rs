//! Saga-style flow chains.
//!
//! A [`FlowChain`] runs its [`Flow`] steps in order. Each step reports back
//! through a single-shot [`FlowTrigger`]; a failure compensates the steps
//! that already advanced, in reverse order, before the error handler fires.

mod chain;
mod context;
mod machine;
mod step;
mod trigger;

pub use chain::{CancelHandle, FlowChain};
pub use context::FlowContext;
pub use machine::{ChainAction, ChainMachine, ChainState};
pub use step::{FnFlow, Flow};
pub use trigger::{FlowTrigger, TriggerPhase};
