//! Skyrocket Queue
//!
//! Submits worker jobs to a batch queue. A [`QueueAdapter`] knows how to
//! submit a job script and count queued jobs; [`CommandQueueAdapter`] does
//! both through shell commands. [`queue_rapidfire`] keeps the queue topped
//! up, optionally reserving a firework for every job so that each job runs
//! exactly the firework it was submitted for.

mod adapter;
mod error;
mod launcher;

pub use adapter::{CommandQueueAdapter, QueueAdapter};
pub use error::QueueError;
pub use launcher::{BLOCK_PREFIX, QueueLaunchOptions, launch_rocket_to_queue, queue_rapidfire};
