use skyrocket_store::StoreError;
use skyrocket_workflow::WorkflowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchPadError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Workflow(#[from] WorkflowError),

  #[error("reset refused: {0}")]
  ResetRefused(String),

  /// An error reported by a launchpad behind an RPC boundary.
  #[error("remote launchpad error: {0}")]
  Remote(String),
}

impl LaunchPadError {
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      LaunchPadError::Store(StoreError::NotFound(_))
        | LaunchPadError::Workflow(WorkflowError::FireworkNotFound(_) | WorkflowError::LaunchNotFound(_))
    )
  }
}
