use skyrocket_dictmod::DictModError;
use thiserror::Error;

use crate::{FwId, LaunchId, State};

#[derive(Debug, Error)]
pub enum WorkflowError {
  /// The workflow breaks a structural or dataflow invariant.
  #[error("{reason} (entity: {entity})")]
  Validation { reason: String, entity: String },

  #[error("firework not found: {0}")]
  FireworkNotFound(FwId),

  #[error("launch not found: {0}")]
  LaunchNotFound(LaunchId),

  #[error("invalid task definition in firework {fw_id}: {message}")]
  InvalidTask { fw_id: FwId, message: String },

  #[error("fw_id {fw_id}: detour only works if all children of detours are not READY to run and have not already run")]
  DetourOnStartedChildren { fw_id: FwId },

  #[error("fireworks to append must use a negative fw_id, got {0}")]
  PlaceholderIdRequired(FwId),

  #[error("cannot use duplicated fw_ids when dynamically adding workflows: {0:?}")]
  DuplicateUpdate(Vec<FwId>),

  #[error("firework {fw_id} cannot go from {from} to {to}")]
  InvalidTransition { fw_id: FwId, from: State, to: State },

  #[error("failed to apply mod_spec to firework {fw_id}: {source}")]
  ModSpec {
    fw_id: FwId,
    #[source]
    source: DictModError,
  },
}

impl WorkflowError {
  pub fn validation(reason: impl Into<String>, entity: impl ToString) -> Self {
    WorkflowError::Validation {
      reason: reason.into(),
      entity: entity.to_string(),
    }
  }
}
