//! Skyrocket Workflow
//!
//! The workflow data model and its state machine:
//!
//! - [`Workflow`]: a DAG of [`Firework`]s stored as parent/child adjacency
//!   tables keyed by firework id
//! - [`Launch`]: one attempt at running a firework, with its state history
//! - [`FwAction`]: the declarative result of a run, applied to the graph
//!   through [`Workflow::apply_action`]
//! - [`validate`]: structural and dataflow checks run before persistence
//!
//! Everything here is synchronous and in-memory. Persistence and the
//! reservation protocol live in the store and launchpad crates.

mod action;
mod error;
mod firework;
mod graph;
mod launch;
mod state;
mod task;
mod transitions;
pub mod validate;
mod workflow;

pub use action::FwAction;
pub use error::WorkflowError;
pub use firework::{DEFAULT_FW_NAME, Firework, TASKS_KEY};
pub use graph::Links;
pub use launch::{Launch, StateHistoryEntry};
pub use skyrocket_dictmod::Mode;
pub use state::{ParseStateError, State};
pub use task::TaskDef;
pub use transitions::Updated;
pub use validate::validate;
pub use workflow::{DEFAULT_WF_NAME, Workflow};

/// Firework identifier. Negative ids are placeholders awaiting a permanent id.
pub type FwId = i64;

pub type LaunchId = i64;
