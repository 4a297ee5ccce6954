use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use skyrocket_config::{FWorker, Timings};
use skyrocket_dictmod::{Mode, apply_mod_with};
use skyrocket_launchpad::LaunchPadClient;
use skyrocket_workflow::{Firework, FwAction, FwId, LaunchId, State};
use tracing::{debug, error, info, instrument, warn};

use crate::heartbeat::Heartbeat;
use crate::{HostInfo, RocketError, TaskContext, TaskRegistry};

/// Self-describing record of the firework, written before any task runs.
pub const FW_JSON: &str = "FW.json";

/// Written by tasks that cannot return an action directly. Replaces the
/// action of the task that wrote it and is removed once read.
pub const FW_ACTION_JSON: &str = "FWAction.json";

/// How a rocket run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RocketStatus {
  Completed,
  Fizzled,
  NoWork,
}

/// Combined output of the tasks run so far. Stored with a fizzled launch
/// under `_recovery` so a later launch can resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Aggregate {
  #[serde(rename = "_all_stored_data")]
  stored_data: Map<String, Value>,
  #[serde(rename = "_all_update_spec")]
  update_spec: Map<String, Value>,
  #[serde(rename = "_all_mod_spec")]
  mod_spec: Vec<Map<String, Value>>,
}

impl Aggregate {
  fn absorb(&mut self, action: &FwAction) {
    self.stored_data.extend(action.stored_data.clone());
    self.update_spec.extend(action.update_spec.clone());
    self.mod_spec.extend(action.mod_spec.iter().cloned());
  }
}

/// Checks out one firework, runs its tasks in a launch directory and
/// reports the outcome.
#[derive(Clone)]
pub struct Rocket {
  launchpad: Arc<dyn LaunchPadClient>,
  worker: FWorker,
  registry: Arc<TaskRegistry>,
  ping_interval: Duration,
  host: HostInfo,
  nodes: Vec<String>,
  sub_nproc: Option<usize>,
  mod_mode: Mode,
}

impl Rocket {
  pub fn new(launchpad: Arc<dyn LaunchPadClient>, worker: FWorker, registry: Arc<TaskRegistry>) -> Self {
    Self {
      launchpad,
      worker,
      registry,
      ping_interval: Timings::default().ping_interval(),
      host: HostInfo::detect(),
      nodes: Vec::new(),
      sub_nproc: None,
      mod_mode: Mode::Strict,
    }
  }

  pub fn with_ping_interval(mut self, interval: Duration) -> Self {
    self.ping_interval = interval;
    self
  }

  pub fn with_host(mut self, host: HostInfo) -> Self {
    self.host = host;
    self
  }

  /// Nodes and process count handed to tasks when running packed.
  pub fn with_nodes(mut self, nodes: Vec<String>, sub_nproc: Option<usize>) -> Self {
    self.nodes = nodes;
    self.sub_nproc = sub_nproc;
    self
  }

  /// Mode for the `mod_spec` of task actions, applied to the spec seen by
  /// later tasks.
  pub fn with_mod_mode(mut self, mode: Mode) -> Self {
    self.mod_mode = mode;
    self
  }

  pub fn worker(&self) -> &FWorker {
    &self.worker
  }

  pub fn launchpad(&self) -> &Arc<dyn LaunchPadClient> {
    &self.launchpad
  }

  /// Run one firework (the given one, or the best READY match) in
  /// `launch_dir`.
  ///
  /// Task failures are not errors: they fizzle the launch and return
  /// [`RocketStatus::Fizzled`]. Errors are reserved for failures to talk to
  /// the launchpad.
  #[instrument(skip(self, launch_dir), fields(worker = %self.worker.name, dir = %launch_dir.display()))]
  pub async fn run(&self, launch_dir: &Path, fw_id: Option<FwId>) -> Result<RocketStatus, RocketError> {
    let dir = launch_dir.to_string_lossy();
    let checkout = self
      .launchpad
      .checkout_fw(&self.worker, &self.host.host, &self.host.ip, &dir, fw_id)
      .await?;
    let Some((fw, launch_id)) = checkout else {
      info!("no fireworks are ready to run");
      return Ok(RocketStatus::NoWork);
    };
    info!(fw_id = fw.fw_id, launch_id, "running firework");

    match self.execute(&fw, launch_id, launch_dir).await {
      Ok(status) => Ok(status),
      Err(e @ RocketError::LaunchPad(_)) => Err(e),
      Err(e) => {
        error!(fw_id = fw.fw_id, launch_id, error = %e, "launch failed outside a task");
        if !self.launchpad.heartbeat_locally() {
          self.launchpad.track_running(None).await?;
        }
        let action = FwAction {
          exit: true,
          ..FwAction::default()
        }
        .with_stored_data("_message", json!("runtime error during task"))
        .with_stored_data("_task", Value::Null)
        .with_stored_data("_exception", json!({"_stacktrace": e.to_string(), "_details": null}));
        self
          .launchpad
          .complete_launch(launch_id, Some(action), State::Fizzled)
          .await?;
        Ok(RocketStatus::Fizzled)
      }
    }
  }

  async fn execute(&self, fw: &Firework, launch_id: LaunchId, base_dir: &Path) -> Result<RocketStatus, RocketError> {
    let launch_dir = self.resolve_launch_dir(fw, launch_id, base_dir).await?;
    let (starting_task, mut aggregate) = self.recover(fw, &launch_dir).await?;

    write_json(&launch_dir.join(FW_JSON), fw).await?;

    let mut spec = fw.spec.clone();
    spec.insert("_fw_env".to_string(), Value::Object(self.worker.env.clone()));
    let ctx = TaskContext {
      fw_id: fw.fw_id,
      launch_id,
      launch_dir: launch_dir.clone(),
      nodes: self.nodes.clone(),
      sub_nproc: self.sub_nproc,
    };

    let heartbeat = Heartbeat::start(self.launchpad.clone(), launch_id, self.ping_interval).await;
    let mut last = FwAction::default();

    for (n, def) in fw.tasks()?.into_iter().enumerate().skip(starting_task) {
      info!(fw_id = fw.fw_id, task = %def.name, n, "task started");
      let result = match self.registry.build(&def) {
        Ok(task) => task.run(&spec, &ctx).await,
        Err(e) => Err(e),
      };
      let mut action = match result {
        Ok(action) => action,
        Err(e) => {
          warn!(fw_id = fw.fw_id, task = %def.name, error = %e, "task failed");
          heartbeat.stop().await;
          let mut action = FwAction {
            exit: true,
            ..FwAction::default()
          }
          .with_stored_data("_message", json!("runtime error during task"))
          .with_stored_data("_task", serde_json::to_value(&def).unwrap_or(Value::Null))
          .with_stored_data(
            "_exception",
            json!({"_stacktrace": e.to_string(), "_details": null, "_failed_task_n": n}),
          )
          .with_stored_data("_recovery", serde_json::to_value(&aggregate).unwrap_or(Value::Null));
          self.decorate(&mut action, &spec, fw, &launch_dir);
          self
            .launchpad
            .complete_launch(launch_id, Some(action), State::Fizzled)
            .await?;
          return Ok(RocketStatus::Fizzled);
        }
      };

      let action_file = launch_dir.join(FW_ACTION_JSON);
      if tokio::fs::try_exists(&action_file).await.unwrap_or(false) {
        debug!(path = %action_file.display(), "reading action from file");
        action = read_json(&action_file).await?;
        tokio::fs::remove_file(&action_file)
          .await
          .map_err(|e| RocketError::io(&action_file, e))?;
      }

      aggregate.absorb(&action);
      spec.extend(action.update_spec.clone());
      for modification in &action.mod_spec {
        apply_mod_with(modification, &mut spec, self.mod_mode)?;
      }
      info!(fw_id = fw.fw_id, task = %def.name, "task completed");

      let skip = action.skip_remaining_tasks();
      last = action;
      if skip {
        break;
      }
    }

    heartbeat.stop().await;

    let mut action = FwAction {
      stored_data: aggregate.stored_data,
      update_spec: aggregate.update_spec,
      mod_spec: aggregate.mod_spec,
      ..last
    };
    self.decorate(&mut action, &spec, fw, &launch_dir);
    self
      .launchpad
      .complete_launch(launch_id, Some(action), State::Completed)
      .await?;
    Ok(RocketStatus::Completed)
  }

  /// Honour `_launch_dir`, telling the launchpad when the directory moves.
  async fn resolve_launch_dir(
    &self,
    fw: &Firework,
    launch_id: LaunchId,
    base_dir: &Path,
  ) -> Result<PathBuf, RocketError> {
    let Some(requested) = fw.spec.get("_launch_dir").and_then(Value::as_str) else {
      tokio::fs::create_dir_all(base_dir)
        .await
        .map_err(|e| RocketError::io(base_dir, e))?;
      return Ok(base_dir.to_path_buf());
    };

    let launch_dir = base_dir.join(requested);
    tokio::fs::create_dir_all(&launch_dir)
      .await
      .map_err(|e| RocketError::io(&launch_dir, e))?;
    if launch_dir != base_dir {
      self
        .launchpad
        .change_launch_dir(launch_id, &launch_dir.to_string_lossy())
        .await?;
      // Only succeeds when the directory is empty.
      if tokio::fs::remove_dir(base_dir).await.is_ok() {
        debug!(dir = %base_dir.display(), "removed unused launch directory");
      }
    }
    Ok(launch_dir)
  }

  /// Resume point and prior output when the spec asks to recover a
  /// fizzled launch.
  async fn recover(&self, fw: &Firework, launch_dir: &Path) -> Result<(usize, Aggregate), RocketError> {
    let Some(recover) = fw.spec.get("_recover_launch").and_then(Value::as_object) else {
      return Ok((0, Aggregate::default()));
    };
    let launch_id = recover
      .get("_launch_id")
      .and_then(Value::as_i64)
      .ok_or_else(|| RocketError::Recovery {
        launch_id: 0,
        message: "_recover_launch needs an integer _launch_id".to_string(),
      })?;

    let previous = self.launchpad.get_launch(launch_id).await?;
    let stored = previous.action.map(|a| a.stored_data).unwrap_or_default();
    let starting_task = stored
      .get("_exception")
      .and_then(|e| e.get("_failed_task_n"))
      .and_then(Value::as_u64)
      .unwrap_or(0) as usize;
    let aggregate = match stored.get("_recovery") {
      Some(recovery) => serde_json::from_value(recovery.clone()).map_err(|e| RocketError::Recovery {
        launch_id,
        message: e.to_string(),
      })?,
      None => {
        return Err(RocketError::Recovery {
          launch_id,
          message: "launch has no recovery data".to_string(),
        });
      }
    };

    info!(fw_id = fw.fw_id, launch_id, starting_task, dir = %previous.launch_dir, "recovering launch");
    let previous_dir = PathBuf::from(&previous.launch_dir);
    if recover.get("_recover_mode").and_then(Value::as_str) == Some("cp") && previous_dir != launch_dir {
      copy_tree(previous_dir, launch_dir.to_path_buf()).await?;
    }
    Ok((starting_task, aggregate))
  }

  /// Add the `_pass_job_info` and `_preserve_fworker` updates.
  fn decorate(&self, action: &mut FwAction, spec: &Map<String, Value>, fw: &Firework, launch_dir: &Path) {
    if spec.get("_pass_job_info").is_some_and(truthy) {
      let mut job_info = spec
        .get("_job_info")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
      job_info.push(json!({
        "fw_id": fw.fw_id,
        "name": fw.name,
        "launch_dir": launch_dir.to_string_lossy(),
      }));
      let mut modification = Map::new();
      modification.insert("_push_all".to_string(), json!({ "_job_info": job_info }));
      action.mod_spec.push(modification);
    }
    if spec.get("_preserve_fworker").is_some_and(truthy) {
      action
        .update_spec
        .insert("_fworker".to_string(), json!(self.worker.name));
    }
  }
}

fn truthy(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
    Value::String(s) => !s.is_empty(),
    Value::Array(a) => !a.is_empty(),
    Value::Object(o) => !o.is_empty(),
  }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RocketError> {
  let bytes = serde_json::to_vec_pretty(value).map_err(|source| RocketError::Json {
    path: path.to_path_buf(),
    source,
  })?;
  tokio::fs::write(path, bytes)
    .await
    .map_err(|e| RocketError::io(path, e))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, RocketError> {
  let bytes = tokio::fs::read(path).await.map_err(|e| RocketError::io(path, e))?;
  serde_json::from_slice(&bytes).map_err(|source| RocketError::Json {
    path: path.to_path_buf(),
    source,
  })
}

/// Copy the files of `from` into `to`, keeping files that already exist.
async fn copy_tree(from: PathBuf, to: PathBuf) -> Result<(), RocketError> {
  fn copy(from: &Path, to: &Path) -> Result<(), RocketError> {
    std::fs::create_dir_all(to).map_err(|e| RocketError::io(to, e))?;
    for entry in std::fs::read_dir(from).map_err(|e| RocketError::io(from, e))? {
      let entry = entry.map_err(|e| RocketError::io(from, e))?;
      let target = to.join(entry.file_name());
      let file_type = entry.file_type().map_err(|e| RocketError::io(entry.path(), e))?;
      if file_type.is_dir() {
        copy(&entry.path(), &target)?;
      } else if !target.exists() {
        std::fs::copy(entry.path(), &target).map_err(|e| RocketError::io(&target, e))?;
      }
    }
    Ok(())
  }

  let source = from.clone();
  tokio::task::spawn_blocking(move || copy(&from, &to))
    .await
    .map_err(|e| RocketError::io(source, std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_truthy() {
    assert!(truthy(&json!(true)));
    assert!(truthy(&json!(1)));
    assert!(!truthy(&json!(0)));
    assert!(!truthy(&json!("")));
    assert!(!truthy(&Value::Null));
  }

  #[test]
  fn test_aggregate_absorbs_in_order() {
    let mut aggregate = Aggregate::default();
    let first = FwAction::new().with_stored_data("a", json!(1));
    let second = FwAction::new()
      .with_stored_data("a", json!(2))
      .with_mod_spec(vec![json!({"_push": {"log": "x"}}).as_object().cloned().unwrap()]);
    aggregate.absorb(&first);
    aggregate.absorb(&second);
    assert_eq!(aggregate.stored_data["a"], json!(2));
    assert_eq!(aggregate.mod_spec.len(), 1);

    let stored = serde_json::to_value(&aggregate).unwrap();
    assert!(stored.get("_all_stored_data").is_some());
  }
}
