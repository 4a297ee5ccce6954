use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Workflow;

/// Declarative result of running a firework.
///
/// The launchpad applies it to the owning workflow once the launch reaches
/// COMPLETED: spec updates flow to the children (or all descendants with
/// `propagate`), and `detours`/`additions` graft new sub-workflows below the
/// firework.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FwAction {
  pub stored_data: Map<String, Value>,
  pub exit: bool,
  pub update_spec: Map<String, Value>,
  pub mod_spec: Vec<Map<String, Value>>,
  pub additions: Vec<Workflow>,
  pub detours: Vec<Workflow>,
  pub defuse_children: bool,
  pub defuse_workflow: bool,
  pub propagate: bool,
}

impl FwAction {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_stored_data(mut self, key: impl Into<String>, value: Value) -> Self {
    self.stored_data.insert(key.into(), value);
    self
  }

  pub fn with_update_spec(mut self, update_spec: Map<String, Value>) -> Self {
    self.update_spec = update_spec;
    self
  }

  pub fn with_mod_spec(mut self, mod_spec: Vec<Map<String, Value>>) -> Self {
    self.mod_spec = mod_spec;
    self
  }

  pub fn with_addition(mut self, wf: Workflow) -> Self {
    self.additions.push(wf);
    self
  }

  pub fn with_detour(mut self, wf: Workflow) -> Self {
    self.detours.push(wf);
    self
  }

  /// Whether the rocket should stop running further tasks of the firework.
  pub fn skip_remaining_tasks(&self) -> bool {
    self.exit
      || !self.detours.is_empty()
      || !self.additions.is_empty()
      || self.defuse_children
      || self.defuse_workflow
  }

  pub fn is_empty(&self) -> bool {
    self == &FwAction::default()
  }
}
