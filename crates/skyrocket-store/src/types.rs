use serde_json::{Map, Value, json};
use skyrocket_workflow::{Firework, FwId, LaunchId, State, Workflow};

/// A workflow document together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWorkflow {
  pub workflow: Workflow,
  pub version: i64,
}

/// Index entry for one firework, kept in step with its workflow document.
#[derive(Debug, Clone, PartialEq)]
pub struct FireworkRecord {
  pub fw_id: FwId,
  pub wf_id: String,
  pub name: String,
  pub state: State,
  pub priority: f64,
  pub spec: Map<String, Value>,
}

impl FireworkRecord {
  pub fn from_firework(wf_id: &str, fw: &Firework) -> Self {
    Self {
      fw_id: fw.fw_id,
      wf_id: wf_id.to_string(),
      name: fw.name.clone(),
      state: fw.state,
      priority: fw.priority(),
      spec: fw.spec.clone(),
    }
  }

  /// The document worker queries are evaluated against.
  pub fn query_document(&self) -> Value {
    json!({
      "fw_id": self.fw_id,
      "name": self.name,
      "state": self.state,
      "spec": self.spec,
    })
  }
}

/// Index entry for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
  pub launch_id: LaunchId,
  pub fw_id: FwId,
  pub wf_id: String,
  pub state: State,
  /// Moved aside by a rerun.
  pub archived: bool,
}

/// Derive the index rows of a workflow.
pub(crate) fn index(wf: &Workflow) -> (Vec<FireworkRecord>, Vec<LaunchRecord>) {
  let mut fireworks = Vec::new();
  let mut launches = Vec::new();
  for fw in wf.fireworks() {
    fireworks.push(FireworkRecord::from_firework(&wf.wf_id, fw));
    let active = fw.launches.iter().map(|l| (l, false));
    let archived = fw.archived_launches.iter().map(|l| (l, true));
    for (launch, archived) in active.chain(archived) {
      launches.push(LaunchRecord {
        launch_id: launch.launch_id,
        fw_id: fw.fw_id,
        wf_id: wf.wf_id.clone(),
        state: launch.state,
        archived,
      });
    }
  }
  (fireworks, launches)
}

/// Dispatch order: higher `_priority` first, then the smaller id.
pub(crate) fn dispatch_order(a: &FireworkRecord, b: &FireworkRecord) -> std::cmp::Ordering {
  b.priority.total_cmp(&a.priority).then(a.fw_id.cmp(&b.fw_id))
}
