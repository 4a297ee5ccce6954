use std::path::PathBuf;

use skyrocket_launchpad::LaunchPadError;
use skyrocket_rocket::RocketError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
  #[error(transparent)]
  LaunchPad(#[from] LaunchPadError),

  #[error(transparent)]
  Rocket(#[from] RocketError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("queue command `{cmd}` failed: {message}")]
  Command { cmd: String, message: String },

  #[error("could not parse output of `{cmd}`: {output:?}")]
  Parse { cmd: String, output: String },

  #[error("queue still failing after {attempts} attempts: {last}")]
  RetriesExhausted { attempts: u32, last: Box<QueueError> },
}
