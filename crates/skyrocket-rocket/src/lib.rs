//! Skyrocket Rocket
//!
//! The worker side of Skyrocket. A [`Rocket`] checks out one firework from
//! a launchpad, runs its tasks in order inside a launch directory while a
//! heartbeat keeps the launch alive, and checks the combined action back
//! in. [`rapidfire`] keeps launching rockets until there is no more work.
//!
//! Tasks are looked up by their `_fw_name` in a [`TaskRegistry`]; the
//! built-in ones live in [`tasks`].

mod error;
mod heartbeat;
mod host;
mod rapidfire;
mod rocket;
mod task;
pub mod tasks;

pub use error::RocketError;
pub use host::HostInfo;
pub use rapidfire::{LAUNCHER_PREFIX, RapidFireOptions, create_datestamp_dir, rapidfire};
pub use rocket::{FW_ACTION_JSON, FW_JSON, Rocket, RocketStatus};
pub use task::{Task, TaskContext, TaskRegistry};
