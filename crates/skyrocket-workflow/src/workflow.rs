use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::graph::Links;
use crate::{Firework, FwId, Launch, LaunchId, State, WorkflowError};

pub const DEFAULT_WF_NAME: &str = "unnamed WF";

/// A DAG of fireworks with adjacency tables keyed by firework id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WorkflowDocument", into = "WorkflowDocument")]
pub struct Workflow {
  pub wf_id: String,
  pub name: String,
  pub metadata: Map<String, Value>,
  pub created_on: DateTime<Utc>,
  pub updated_on: DateTime<Utc>,
  pub(crate) fws: BTreeMap<FwId, Firework>,
  pub(crate) links: Links,
}

/// Canonical serialized form: a firework list plus child links.
#[derive(Serialize, Deserialize)]
struct WorkflowDocument {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  wf_id: Option<String>,
  fws: Vec<Firework>,
  #[serde(default)]
  links: BTreeMap<FwId, Vec<FwId>>,
  #[serde(default)]
  name: Option<String>,
  #[serde(default)]
  metadata: Map<String, Value>,
  #[serde(default)]
  created_on: Option<DateTime<Utc>>,
  #[serde(default)]
  updated_on: Option<DateTime<Utc>>,
  /// Rolled-up state; written for readers, ignored on load.
  #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
  state: Option<State>,
}

impl TryFrom<WorkflowDocument> for Workflow {
  type Error = WorkflowError;

  fn try_from(doc: WorkflowDocument) -> Result<Self, Self::Error> {
    let mut wf = Workflow::new(doc.fws, doc.links, doc.name.unwrap_or_else(|| DEFAULT_WF_NAME.to_string()))?;
    if let Some(wf_id) = doc.wf_id {
      wf.wf_id = wf_id;
    }
    wf.metadata = doc.metadata;
    if let Some(created_on) = doc.created_on {
      wf.created_on = created_on;
    }
    if let Some(updated_on) = doc.updated_on {
      wf.updated_on = updated_on;
    }
    Ok(wf)
  }
}

impl From<Workflow> for WorkflowDocument {
  fn from(wf: Workflow) -> Self {
    let state = Some(wf.state());
    WorkflowDocument {
      wf_id: Some(wf.wf_id),
      links: wf.links.as_map().clone(),
      fws: wf.fws.into_values().collect(),
      name: Some(wf.name),
      metadata: wf.metadata,
      created_on: Some(wf.created_on),
      updated_on: Some(wf.updated_on),
      state,
    }
  }
}

impl Workflow {
  /// Assemble a workflow. Firework ids must be unique and every linked id
  /// must be one of the fireworks; fireworks missing from `links` become
  /// unlinked nodes.
  pub fn new(
    fireworks: Vec<Firework>,
    links: BTreeMap<FwId, Vec<FwId>>,
    name: impl Into<String>,
  ) -> Result<Self, WorkflowError> {
    if fireworks.is_empty() {
      return Err(WorkflowError::validation(
        "Workflow cannot be empty (must contain at least 1 FW)",
        "fws",
      ));
    }

    let mut fws = BTreeMap::new();
    for fw in fireworks {
      if fws.contains_key(&fw.fw_id) {
        return Err(WorkflowError::validation(crate::validate::ERR_DUPLICATE_ID, fw.fw_id));
      }
      fws.insert(fw.fw_id, fw);
    }

    let mut graph = Links::new(links);
    if let Some(unknown) = graph.nodes().find(|id| !fws.contains_key(id)) {
      return Err(WorkflowError::validation(crate::validate::ERR_UNKNOWN_ENDPOINT, unknown));
    }
    for fw_id in fws.keys() {
      graph.add_node(*fw_id);
    }

    let now = Utc::now();
    Ok(Self {
      wf_id: uuid::Uuid::new_v4().to_string(),
      name: name.into(),
      metadata: Map::new(),
      created_on: now,
      updated_on: now,
      fws,
      links: graph,
    })
  }

  /// A single-firework workflow named after the firework.
  pub fn from_firework(fw: Firework) -> Self {
    let name = fw.name.clone();
    let fw_id = fw.fw_id;
    let now = Utc::now();
    let mut links = Links::default();
    links.add_node(fw_id);
    Self {
      wf_id: uuid::Uuid::new_v4().to_string(),
      name,
      metadata: Map::new(),
      created_on: now,
      updated_on: now,
      fws: BTreeMap::from([(fw_id, fw)]),
      links,
    }
  }

  pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
    self.metadata = metadata;
    self
  }

  pub fn links(&self) -> &Links {
    &self.links
  }

  pub fn fireworks(&self) -> impl Iterator<Item = &Firework> {
    self.fws.values()
  }

  pub fn fw_ids(&self) -> Vec<FwId> {
    self.fws.keys().copied().collect()
  }

  pub fn contains(&self, fw_id: FwId) -> bool {
    self.fws.contains_key(&fw_id)
  }

  pub fn firework(&self, fw_id: FwId) -> Result<&Firework, WorkflowError> {
    self.fws.get(&fw_id).ok_or(WorkflowError::FireworkNotFound(fw_id))
  }

  pub fn firework_mut(&mut self, fw_id: FwId) -> Result<&mut Firework, WorkflowError> {
    self.fws.get_mut(&fw_id).ok_or(WorkflowError::FireworkNotFound(fw_id))
  }

  pub fn fw_states(&self) -> BTreeMap<FwId, State> {
    self.fws.iter().map(|(id, fw)| (*id, fw.state)).collect()
  }

  pub fn root_fw_ids(&self) -> Vec<FwId> {
    self.links.roots()
  }

  pub fn leaf_fw_ids(&self) -> Vec<FwId> {
    self.links.leaves()
  }

  /// The firework owning `launch_id`, searching active launches first and
  /// then archived ones.
  pub fn fw_id_for_launch(&self, launch_id: LaunchId) -> Option<FwId> {
    self
      .fws
      .values()
      .find(|fw| fw.launch(launch_id).is_some())
      .or_else(|| self.fws.values().find(|fw| fw.any_launch(launch_id).is_some()))
      .map(|fw| fw.fw_id)
  }

  pub fn launch(&self, launch_id: LaunchId) -> Option<&Launch> {
    let fw_id = self.fw_id_for_launch(launch_id)?;
    self.fws.get(&fw_id)?.any_launch(launch_id)
  }

  /// All launch ids recorded in this workflow, active and archived.
  pub fn launch_ids(&self) -> BTreeSet<LaunchId> {
    self
      .fws
      .values()
      .flat_map(|fw| fw.launches.iter().chain(fw.archived_launches.iter()))
      .map(|l| l.launch_id)
      .collect()
  }

  /// Negative ids still awaiting a permanent id.
  pub fn placeholder_ids(&self) -> Vec<FwId> {
    self.fws.keys().copied().filter(|id| *id < 0).collect()
  }

  /// Rename fireworks according to `old_new`, including the `fw_id` stored
  /// on their launches.
  pub fn reassign_ids(&mut self, old_new: &BTreeMap<FwId, FwId>) {
    if old_new.is_empty() {
      return;
    }
    let fws = std::mem::take(&mut self.fws);
    self.fws = fws
      .into_iter()
      .map(|(id, mut fw)| {
        let new_id = old_new.get(&id).copied().unwrap_or(id);
        fw.fw_id = new_id;
        for launch in fw.launches.iter_mut().chain(fw.archived_launches.iter_mut()) {
          launch.fw_id = new_id;
        }
        (new_id, fw)
      })
      .collect();
    self.links = self.links.reassign(old_new);
  }

  /// Rolled-up workflow state.
  pub fn state(&self) -> State {
    let states = || self.fws.values().map(|fw| fw.state);
    let leaves = self.leaf_fw_ids();

    if leaves
      .iter()
      .all(|id| self.fws.get(id).is_some_and(|fw| fw.state == State::Completed))
    {
      return State::Completed;
    }
    if states().all(|s| s == State::Archived) {
      return State::Archived;
    }
    if states().any(|s| s == State::Defused) {
      return State::Defused;
    }
    if states().any(|s| s == State::Paused) {
      return State::Paused;
    }

    let fizzled: Vec<FwId> = self
      .fws
      .values()
      .filter(|fw| fw.state == State::Fizzled)
      .map(|fw| fw.fw_id)
      .collect();
    if !fizzled.is_empty() {
      let blocking = fizzled.iter().any(|id| {
        let children = self.links.children(*id);
        children.is_empty()
          || !children
            .iter()
            .all(|c| self.fws.get(c).is_some_and(Firework::allows_fizzled_parents))
      });
      return if blocking { State::Fizzled } else { State::Running };
    }

    if states().any(|s| s == State::Completed || s == State::Running) {
      return State::Running;
    }
    if states().any(|s| s == State::Reserved) {
      return State::Reserved;
    }
    State::Ready
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn fw(id: FwId) -> Firework {
    Firework::new(id, vec![], Map::new()).with_name(format!("fw{id}"))
  }

  fn chain() -> Workflow {
    Workflow::new(
      vec![fw(1), fw(2), fw(3)],
      BTreeMap::from([(1, vec![2]), (2, vec![3])]),
      "chain",
    )
    .unwrap()
  }

  #[test]
  fn test_document_round_trip() {
    let wf = chain();
    let doc = serde_json::to_value(&wf).unwrap();
    assert_eq!(doc["links"]["1"], json!([2]));
    assert_eq!(doc["state"], json!("READY"));
    assert_eq!(doc["fws"].as_array().unwrap().len(), 3);

    let back: Workflow = serde_json::from_value(doc).unwrap();
    assert_eq!(back, wf);
  }

  #[test]
  fn test_submission_document_without_optional_fields() {
    let wf: Workflow = serde_json::from_value(json!({
      "fws": [{"fw_id": -1, "spec": {}}, {"fw_id": -2, "spec": {}}],
      "links": {"-1": [-2]}
    }))
    .unwrap();
    assert_eq!(wf.name, DEFAULT_WF_NAME);
    assert_eq!(wf.root_fw_ids(), vec![-1]);
    assert_eq!(wf.placeholder_ids(), vec![-2, -1]);
    assert!(!wf.wf_id.is_empty());
  }

  #[test]
  fn test_duplicate_and_unknown_ids_rejected() {
    assert!(Workflow::new(vec![fw(1), fw(1)], BTreeMap::new(), "dup").is_err());
    assert!(Workflow::new(vec![fw(1)], BTreeMap::from([(1, vec![9])]), "bad").is_err());
    assert!(Workflow::new(vec![], BTreeMap::new(), "empty").is_err());
  }

  #[test]
  fn test_reassign_ids_moves_launch_owners() {
    let mut wf = Workflow::new(vec![fw(-1), fw(-2)], BTreeMap::from([(-1, vec![-2])]), "wf").unwrap();
    wf.reassign_ids(&BTreeMap::from([(-1, 5), (-2, 6)]));
    assert_eq!(wf.fw_ids(), vec![5, 6]);
    assert_eq!(wf.links().children(5), &[6]);
    assert_eq!(wf.firework(6).unwrap().fw_id, 6);
  }

  #[test]
  fn test_rolled_up_state() {
    let mut wf = chain();
    let set = |wf: &mut Workflow, states: [State; 3]| {
      for (id, state) in (1..=3).zip(states) {
        wf.fws.get_mut(&id).unwrap().state = state;
      }
    };

    set(&mut wf, [State::Ready, State::Waiting, State::Waiting]);
    assert_eq!(wf.state(), State::Ready);
    set(&mut wf, [State::Reserved, State::Waiting, State::Waiting]);
    assert_eq!(wf.state(), State::Reserved);
    set(&mut wf, [State::Completed, State::Ready, State::Waiting]);
    assert_eq!(wf.state(), State::Running);
    set(&mut wf, [State::Completed, State::Fizzled, State::Waiting]);
    assert_eq!(wf.state(), State::Fizzled);
    set(&mut wf, [State::Completed, State::Fizzled, State::Paused]);
    assert_eq!(wf.state(), State::Paused);
    set(&mut wf, [State::Defused, State::Fizzled, State::Paused]);
    assert_eq!(wf.state(), State::Defused);
    set(&mut wf, [State::Archived, State::Archived, State::Archived]);
    assert_eq!(wf.state(), State::Archived);
    set(&mut wf, [State::Fizzled, State::Fizzled, State::Completed]);
    assert_eq!(wf.state(), State::Completed);
  }

  #[test]
  fn test_fizzled_parent_excused_by_children() {
    let mut wf = chain();
    wf.fws.get_mut(&1).unwrap().state = State::Fizzled;
    wf.fws
      .get_mut(&2)
      .unwrap()
      .spec
      .insert("_allow_fizzled_parents".into(), json!(true));
    assert_eq!(wf.state(), State::Running);
  }
}
