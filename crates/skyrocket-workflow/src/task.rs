use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{FwId, WorkflowError};

/// A task as stored in a firework's `_tasks` list: the `_fw_name` type tag
/// plus the task's own parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
  #[serde(rename = "_fw_name")]
  pub name: String,
  #[serde(flatten)]
  pub params: Map<String, Value>,
}

impl TaskDef {
  pub fn new(name: impl Into<String>, params: Map<String, Value>) -> Self {
    Self {
      name: name.into(),
      params,
    }
  }

  /// Data keys this task reads, from its `inputs` parameter.
  pub fn inputs(&self, fw_id: FwId) -> Result<Vec<String>, WorkflowError> {
    self.string_list("inputs", fw_id)
  }

  /// Data keys this task produces, from its `outputs` parameter.
  pub fn outputs(&self, fw_id: FwId) -> Result<Vec<String>, WorkflowError> {
    self.string_list("outputs", fw_id)
  }

  fn string_list(&self, field: &str, fw_id: FwId) -> Result<Vec<String>, WorkflowError> {
    match self.params.get(field) {
      None | Some(Value::Null) => Ok(Vec::new()),
      Some(Value::Array(items)) => items
        .iter()
        .map(|item| {
          item.as_str().map(str::to_string).ok_or_else(|| WorkflowError::InvalidTask {
            fw_id,
            message: format!("{field} entries must be strings in task {}", self.name),
          })
        })
        .collect(),
      Some(_) => Err(WorkflowError::InvalidTask {
        fw_id,
        message: format!("{field} must be a list in task {}", self.name),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_tag_and_params_flatten() {
    let task: TaskDef = serde_json::from_value(json!({
      "_fw_name": "ScriptTask",
      "script": "echo hi",
      "outputs": ["x"]
    }))
    .unwrap();
    assert_eq!(task.name, "ScriptTask");
    assert_eq!(task.params["script"], json!("echo hi"));
    assert_eq!(task.outputs(1).unwrap(), vec!["x".to_string()]);
    assert!(task.inputs(1).unwrap().is_empty());

    let back = serde_json::to_value(&task).unwrap();
    assert_eq!(back["_fw_name"], json!("ScriptTask"));
  }

  #[test]
  fn test_inputs_must_be_a_list() {
    let task = TaskDef::new("T", json!({"inputs": "x"}).as_object().cloned().unwrap());
    assert!(matches!(task.inputs(7), Err(WorkflowError::InvalidTask { fw_id: 7, .. })));
  }
}
