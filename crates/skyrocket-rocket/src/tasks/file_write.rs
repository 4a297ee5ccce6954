use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use skyrocket_workflow::FwAction;

use crate::{RocketError, Task, TaskContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileToWrite {
  pub filename: String,
  pub contents: String,
}

/// Writes files into the launch directory, or into `dest` relative to it.
#[derive(Debug, Clone, Deserialize)]
pub struct FileWriteTask {
  files_to_write: Vec<FileToWrite>,
  #[serde(default)]
  dest: Option<String>,
}

#[async_trait]
impl Task for FileWriteTask {
  async fn run(&self, _spec: &Map<String, Value>, ctx: &TaskContext) -> Result<FwAction, RocketError> {
    let dir = match &self.dest {
      Some(dest) => ctx.launch_dir.join(dest),
      None => ctx.launch_dir.clone(),
    };
    tokio::fs::create_dir_all(&dir)
      .await
      .map_err(|e| RocketError::io(&dir, e))?;
    for file in &self.files_to_write {
      let path = dir.join(&file.filename);
      tokio::fs::write(&path, &file.contents)
        .await
        .map_err(|e| RocketError::io(&path, e))?;
    }
    Ok(FwAction::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_writes_into_dest() {
    let dir = tempfile::tempdir().unwrap();
    let task: FileWriteTask = serde_json::from_value(json!({
      "files_to_write": [{"filename": "a.txt", "contents": "alpha"}],
      "dest": "sub",
    }))
    .unwrap();
    let ctx = TaskContext {
      fw_id: 1,
      launch_id: 1,
      launch_dir: dir.path().to_path_buf(),
      nodes: Vec::new(),
      sub_nproc: None,
    };
    let action = task.run(&Map::new(), &ctx).await.unwrap();
    assert!(action.is_empty());
    assert_eq!(std::fs::read_to_string(dir.path().join("sub/a.txt")).unwrap(), "alpha");
  }
}
