//! Skyrocket Store
//!
//! Persistence for the launchpad. Each workflow is one document carrying its
//! fireworks and their launches, so every mutation of a workflow is a single
//! document rewrite. Rewrites are version-checked: [`Store::commit_workflow`]
//! fails with [`StoreError::ConcurrentConflict`] when another writer got
//! there first, which is the compare-and-swap the reservation protocol
//! relies on.
//!
//! Alongside the documents each backend keeps a firework index (state,
//! priority, spec) and a launch index, updated in the same write, to find
//! dispatch candidates and to resolve ids to their workflow.

mod error;
mod memory;
mod sqlite;
mod types;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{FireworkRecord, LaunchRecord, StoredWorkflow};

use async_trait::async_trait;
use skyrocket_workflow::{FwId, LaunchId, State, Workflow};

/// Storage for workflow documents and their indexes.
#[async_trait]
pub trait Store: Send + Sync {
  /// Insert a new workflow at version 1. Fails if the workflow or any of its
  /// fireworks already exists.
  async fn insert_workflow(&self, wf: &Workflow) -> Result<(), StoreError>;

  /// Get a workflow document by id.
  async fn get_workflow(&self, wf_id: &str) -> Result<StoredWorkflow, StoreError>;

  /// Replace a workflow document if it is still at `expected_version`.
  /// Returns the new version.
  async fn commit_workflow(&self, wf: &Workflow, expected_version: i64) -> Result<i64, StoreError>;

  /// Id of the workflow holding a firework.
  async fn wf_id_for_fw(&self, fw_id: FwId) -> Result<String, StoreError>;

  /// Id of the workflow holding a launch, archived or not.
  async fn wf_id_for_launch(&self, launch_id: LaunchId) -> Result<String, StoreError>;

  /// Fireworks in any of `states` (all when empty), in dispatch order.
  async fn find_fireworks(&self, states: &[State]) -> Result<Vec<FireworkRecord>, StoreError>;

  /// Non-archived launches in any of `states` (all when empty).
  async fn find_launches(&self, states: &[State]) -> Result<Vec<LaunchRecord>, StoreError>;

  /// All workflow ids, oldest first.
  async fn wf_ids(&self) -> Result<Vec<String>, StoreError>;

  /// Reserve `count` consecutive firework ids.
  async fn allocate_fw_ids(&self, count: usize) -> Result<Vec<FwId>, StoreError>;

  /// Reserve one launch id.
  async fn allocate_launch_id(&self) -> Result<LaunchId, StoreError>;

  /// Remove every document and restart the id counters.
  async fn reset(&self) -> Result<(), StoreError>;
}
