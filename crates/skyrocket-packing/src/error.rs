use std::path::PathBuf;

use skyrocket_launchpad::LaunchPadError;
use skyrocket_rocket::RocketError;
use thiserror::Error;

use crate::WorkerId;

#[derive(Debug, Error)]
pub enum PackingError {
  #[error(transparent)]
  LaunchPad(#[from] LaunchPadError),

  #[error(transparent)]
  Rocket(#[from] RocketError),

  #[error("coordinator transport error: {0}")]
  Transport(#[from] std::io::Error),

  #[error("malformed coordinator message: {0}")]
  Message(#[from] serde_json::Error),

  #[error("I/O error at {path}: {source}")]
  File {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("coordinator rejected the password")]
  AuthenticationFailed,

  #[error("coordinator closed the connection")]
  ConnectionClosed,

  #[error("unexpected coordinator response: {0}")]
  UnexpectedResponse(String),

  #[error("can't allocate nodes, {nnodes} can't be divided by {num_jobs}")]
  NodeSplit { nnodes: usize, num_jobs: usize },

  #[error("worker {worker_id} failed: {message}")]
  Worker { worker_id: WorkerId, message: String },
}

impl From<PackingError> for LaunchPadError {
  fn from(e: PackingError) -> Self {
    match e {
      PackingError::LaunchPad(inner) => inner,
      other => LaunchPadError::Remote(other.to_string()),
    }
  }
}
