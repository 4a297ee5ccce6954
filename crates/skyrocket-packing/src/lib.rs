//! Skyrocket Packing
//!
//! Runs several rockets inside one batch allocation. A [`Coordinator`]
//! owns the launchpad and listens on loopback TCP; each worker reaches it
//! through a [`PackedLaunchPad`] and only reports the launch it is running,
//! while the coordinator sends the heartbeats for all of them.
//!
//! [`launch_multiprocess`] splits the allocation's nodes between the
//! workers, starts them as processes or in-process tasks and waits for
//! them to drain the available work.

mod client;
mod error;
mod nodes;
pub mod protocol;
mod server;
mod supervisor;

/// Index of a worker within one packed allocation.
pub type WorkerId = u32;

pub use client::PackedLaunchPad;
pub use error::PackingError;
pub use nodes::{SubJob, exclude_node, read_nodefile, split_node_lists};
pub use server::Coordinator;
pub use supervisor::{MultiLaunchOptions, PackedWorker, WorkerMode, launch_multiprocess};
