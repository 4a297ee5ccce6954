use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use skyrocket_workflow::FwAction;

use crate::{RocketError, Task, TaskContext};

/// Records data on the launch and hands named values to the children.
///
/// `inputs` are copied from the spec into the stored data. Each name in
/// `outputs` is read from the combined data and passed on through
/// `update_spec`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreDataTask {
  stored_data: Map<String, Value>,
  inputs: Vec<String>,
  outputs: Vec<String>,
}

#[async_trait]
impl Task for StoreDataTask {
  async fn run(&self, spec: &Map<String, Value>, _ctx: &TaskContext) -> Result<FwAction, RocketError> {
    let mut stored = self.stored_data.clone();
    for input in &self.inputs {
      let value = spec.get(input).ok_or_else(|| RocketError::TaskFailed {
        task: "StoreDataTask".to_string(),
        message: format!("input {input} is not in the spec"),
      })?;
      stored.insert(input.clone(), value.clone());
    }

    let mut update_spec = Map::new();
    for output in &self.outputs {
      let value = stored.get(output).ok_or_else(|| RocketError::TaskFailed {
        task: "StoreDataTask".to_string(),
        message: format!("output {output} was not produced"),
      })?;
      update_spec.insert(output.clone(), value.clone());
    }

    Ok(FwAction {
      stored_data: stored,
      update_spec,
      ..FwAction::default()
    })
  }
}

/// Returns a fixed `update_spec`/`mod_spec` for the children.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModSpecTask {
  update_spec: Map<String, Value>,
  mod_spec: Vec<Map<String, Value>>,
  propagate: bool,
}

#[async_trait]
impl Task for ModSpecTask {
  async fn run(&self, _spec: &Map<String, Value>, _ctx: &TaskContext) -> Result<FwAction, RocketError> {
    Ok(FwAction {
      update_spec: self.update_spec.clone(),
      mod_spec: self.mod_spec.clone(),
      propagate: self.propagate,
      ..FwAction::default()
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::path::PathBuf;

  fn ctx() -> TaskContext {
    TaskContext {
      fw_id: 1,
      launch_id: 1,
      launch_dir: PathBuf::from("."),
      nodes: Vec::new(),
      sub_nproc: None,
    }
  }

  #[tokio::test]
  async fn test_store_data_forwards_outputs() {
    let task: StoreDataTask = serde_json::from_value(json!({
      "stored_data": {"energy": -1.5},
      "inputs": ["structure"],
      "outputs": ["energy", "structure"],
    }))
    .unwrap();
    let spec = json!({"structure": "fcc"}).as_object().cloned().unwrap();
    let action = task.run(&spec, &ctx()).await.unwrap();
    assert_eq!(action.stored_data["structure"], json!("fcc"));
    assert_eq!(action.update_spec["energy"], json!(-1.5));
    assert_eq!(action.update_spec["structure"], json!("fcc"));
  }

  #[tokio::test]
  async fn test_store_data_missing_input() {
    let task: StoreDataTask = serde_json::from_value(json!({"inputs": ["x"]})).unwrap();
    assert!(task.run(&Map::new(), &ctx()).await.is_err());
  }

  #[tokio::test]
  async fn test_mod_spec_task() {
    let task: ModSpecTask = serde_json::from_value(json!({"mod_spec": [{"_push": {"log": "a"}}]})).unwrap();
    let action = task.run(&Map::new(), &ctx()).await.unwrap();
    assert_eq!(action.mod_spec.len(), 1);
    assert!(!action.skip_remaining_tasks());
  }
}
