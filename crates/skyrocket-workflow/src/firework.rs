use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{FwId, Launch, LaunchId, State, TaskDef, WorkflowError};

pub const DEFAULT_FW_NAME: &str = "Unnamed FW";

/// Spec key holding the serialized task list.
pub const TASKS_KEY: &str = "_tasks";

/// A dispatchable unit of work: an ordered task list plus a spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firework {
  pub fw_id: FwId,
  #[serde(default = "default_name")]
  pub name: String,
  #[serde(default)]
  pub spec: Map<String, Value>,
  #[serde(default = "default_state")]
  pub state: State,
  #[serde(default = "Utc::now")]
  pub created_on: DateTime<Utc>,
  #[serde(default = "Utc::now")]
  pub updated_on: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub launches: Vec<Launch>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub archived_launches: Vec<Launch>,
}

fn default_name() -> String {
  DEFAULT_FW_NAME.to_string()
}

fn default_state() -> State {
  State::Waiting
}

impl Firework {
  pub fn new(fw_id: FwId, tasks: Vec<TaskDef>, mut spec: Map<String, Value>) -> Self {
    let tasks = tasks
      .into_iter()
      .filter_map(|task| serde_json::to_value(task).ok())
      .collect();
    spec.insert(TASKS_KEY.to_string(), Value::Array(tasks));
    let now = Utc::now();
    Self {
      fw_id,
      name: default_name(),
      spec,
      state: State::Waiting,
      created_on: now,
      updated_on: now,
      launches: Vec::new(),
      archived_launches: Vec::new(),
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// Decode the task list stored in the spec.
  pub fn tasks(&self) -> Result<Vec<TaskDef>, WorkflowError> {
    match self.spec.get(TASKS_KEY) {
      None => Ok(Vec::new()),
      Some(tasks) => serde_json::from_value(tasks.clone()).map_err(|e| WorkflowError::InvalidTask {
        fw_id: self.fw_id,
        message: e.to_string(),
      }),
    }
  }

  pub fn set_state(&mut self, state: State) {
    self.state = state;
    self.updated_on = Utc::now();
  }

  /// `_priority` from the spec, `0` when absent.
  pub fn priority(&self) -> f64 {
    self
      .spec
      .get("_priority")
      .and_then(Value::as_f64)
      .unwrap_or(0.0)
  }

  pub fn allows_fizzled_parents(&self) -> bool {
    self
      .spec
      .get("_allow_fizzled_parents")
      .and_then(Value::as_bool)
      .unwrap_or(false)
  }

  pub fn launch(&self, launch_id: LaunchId) -> Option<&Launch> {
    self.launches.iter().find(|l| l.launch_id == launch_id)
  }

  pub fn launch_mut(&mut self, launch_id: LaunchId) -> Option<&mut Launch> {
    self.launches.iter_mut().find(|l| l.launch_id == launch_id)
  }

  /// Find a launch among both active and archived launches.
  pub fn any_launch(&self, launch_id: LaunchId) -> Option<&Launch> {
    self
      .launches
      .iter()
      .chain(self.archived_launches.iter())
      .find(|l| l.launch_id == launch_id)
  }

  /// The launch currently holding the firework, if any.
  pub fn active_launch(&self) -> Option<&Launch> {
    self.launches.iter().rev().find(|l| l.state.is_active())
  }

  /// The launch that decides the firework's state: the one with the highest
  /// rank, or the most recently finished COMPLETED launch when there are
  /// several.
  pub fn representative_launch(&self) -> Option<&Launch> {
    let completed = self
      .launches
      .iter()
      .filter(|l| l.state == State::Completed)
      .max_by_key(|l| l.time_end());
    if completed.is_some() {
      return completed;
    }
    let mut best: Option<&Launch> = None;
    for launch in &self.launches {
      if launch.state.rank() > best.map_or(State::Archived.rank(), |b| b.state.rank()) {
        best = Some(launch);
      }
    }
    best
  }

  /// Document form used for worker query matching.
  pub fn query_document(&self) -> Value {
    serde_json::json!({
      "fw_id": self.fw_id,
      "name": self.name,
      "state": self.state,
      "spec": self.spec,
    })
  }

  /// Move all launches aside and return to WAITING. The owning workflow must
  /// refresh the firework afterwards.
  pub(crate) fn archive_launches(&mut self) {
    if self.state == State::Fizzled {
      let details = self
        .launches
        .last()
        .and_then(|l| l.action.as_ref())
        .and_then(|a| a.stored_data.get("_exception"))
        .and_then(|e| e.get("_details"))
        .filter(|d| !d.is_null())
        .cloned();
      match details {
        Some(details) => {
          self.spec.insert("_exception_details".to_string(), details);
        }
        None => {
          self.spec.remove("_exception_details");
        }
      }
    }
    let launches = std::mem::take(&mut self.launches);
    for launch in launches {
      if !self.archived_launches.iter().any(|l| l.launch_id == launch.launch_id) {
        self.archived_launches.push(launch);
      }
    }
    self.set_state(State::Waiting);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, TimeZone};
  use serde_json::json;
  use skyrocket_config::FWorker;

  fn launch(id: LaunchId, state: State, end_secs: i64) -> Launch {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut l = Launch::new(id, 1, State::Running, "", FWorker::default(), "", "", start);
    if state != State::Running {
      l.set_state(state, start + Duration::seconds(end_secs));
    }
    l
  }

  #[test]
  fn test_tasks_live_in_spec() {
    let fw = Firework::new(
      1,
      vec![TaskDef::new("ScriptTask", json!({"script": "ls"}).as_object().cloned().unwrap())],
      Map::new(),
    );
    assert_eq!(fw.spec[TASKS_KEY][0]["_fw_name"], json!("ScriptTask"));
    let tasks = fw.tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].params["script"], json!("ls"));
  }

  #[test]
  fn test_deserialize_minimal_document() {
    let fw: Firework = serde_json::from_value(json!({"fw_id": -1, "spec": {"x": 1}})).unwrap();
    assert_eq!(fw.state, State::Waiting);
    assert_eq!(fw.name, DEFAULT_FW_NAME);
    assert!(fw.tasks().unwrap().is_empty());
  }

  #[test]
  fn test_representative_launch_prefers_latest_completed() {
    let mut fw = Firework::new(1, vec![], Map::new());
    fw.launches = vec![
      launch(1, State::Completed, 10),
      launch(2, State::Completed, 30),
      launch(3, State::Fizzled, 40),
    ];
    assert_eq!(fw.representative_launch().unwrap().launch_id, 2);

    fw.launches = vec![launch(4, State::Fizzled, 10), launch(5, State::Running, 0)];
    assert_eq!(fw.representative_launch().unwrap().launch_id, 5);

    fw.launches.clear();
    assert!(fw.representative_launch().is_none());
  }

  #[test]
  fn test_archive_launches_records_exception_details() {
    let mut fw = Firework::new(1, vec![], Map::new());
    let mut l = launch(1, State::Fizzled, 5);
    l.action = Some(crate::FwAction::new().with_stored_data(
      "_exception",
      json!({"_stacktrace": "boom", "_details": {"code": 3}}),
    ));
    fw.launches.push(l);
    fw.state = State::Fizzled;

    fw.archive_launches();
    assert_eq!(fw.state, State::Waiting);
    assert!(fw.launches.is_empty());
    assert_eq!(fw.archived_launches.len(), 1);
    assert_eq!(fw.spec["_exception_details"], json!({"code": 3}));
  }
}
