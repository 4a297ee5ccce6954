use std::path::PathBuf;

use skyrocket_dictmod::DictModError;
use skyrocket_launchpad::LaunchPadError;
use skyrocket_workflow::WorkflowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RocketError {
  #[error(transparent)]
  LaunchPad(#[from] LaunchPadError),

  #[error(transparent)]
  Workflow(#[from] WorkflowError),

  #[error("spec modification failed: {0}")]
  DictMod(#[from] DictModError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid JSON in {path}: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unknown task type: {0}")]
  UnknownTask(String),

  #[error("invalid parameters for {task}: {message}")]
  InvalidParams { task: String, message: String },

  /// A task ran but reported failure.
  #[error("{task} failed: {message}")]
  TaskFailed { task: String, message: String },

  #[error("cannot recover launch {launch_id}: {message}")]
  Recovery { launch_id: i64, message: String },
}

impl RocketError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    RocketError::Io {
      path: path.into(),
      source,
    }
  }
}
