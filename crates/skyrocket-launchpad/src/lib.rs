//! Skyrocket LaunchPad
//!
//! The coordinator holding the authoritative state of all workflows:
//!
//! - submission ([`LaunchPad::add_wf`]) with validation and id assignment
//! - the reservation protocol ([`LaunchPadClient::checkout_fw`],
//!   [`LaunchPad::reserve_fw`]): pick the best matching READY firework and
//!   compare-and-swap it into RUNNING or RESERVED
//! - the launch lifecycle: heartbeats, completion and action application
//!   with rollback to a FIZZLED launch when the action cannot be applied
//! - admin transitions and the maintenance loop reaping lost runs and stale
//!   reservations
//!
//! Rockets only see the [`LaunchPadClient`] trait, which remote stubs
//! implement as well.

mod admin;
mod client;
mod clock;
mod error;
mod launchpad;
mod maintenance;

pub use admin::MAX_RESET_WITHOUT_PASSWORD;
pub use client::LaunchPadClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::LaunchPadError;
pub use launchpad::LaunchPad;
pub use maintenance::LostRuns;
