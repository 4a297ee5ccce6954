//! The task contract and the registry that turns stored task definitions
//! into runnable tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use skyrocket_workflow::{FwAction, FwId, LaunchId, TaskDef};

use crate::RocketError;
use crate::tasks::{FileWriteTask, ModSpecTask, ScriptTask, StoreDataTask};

/// What a task knows about the launch it runs in.
#[derive(Debug, Clone)]
pub struct TaskContext {
  pub fw_id: FwId,
  pub launch_id: LaunchId,
  /// Working directory of the launch. Tasks resolve relative paths here.
  pub launch_dir: PathBuf,
  /// Nodes assigned to this worker when running packed.
  pub nodes: Vec<String>,
  /// Processes available to the task when running packed.
  pub sub_nproc: Option<usize>,
}

/// A unit of work inside a firework.
///
/// A task receives the firework spec as it stands after the earlier tasks
/// of the same firework ran, and returns an action (possibly empty). An
/// error fizzles the launch.
#[async_trait]
pub trait Task: Send + Sync {
  async fn run(&self, spec: &Map<String, Value>, ctx: &TaskContext) -> Result<FwAction, RocketError>;
}

type Constructor = dyn Fn(&Map<String, Value>) -> Result<Box<dyn Task>, RocketError> + Send + Sync;

/// Maps `_fw_name` type tags to task constructors.
#[derive(Clone, Default)]
pub struct TaskRegistry {
  constructors: HashMap<String, Arc<Constructor>>,
}

impl TaskRegistry {
  /// An empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry with the built-in tasks.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register_params::<ScriptTask>("ScriptTask");
    registry.register_params::<FileWriteTask>("FileWriteTask");
    registry.register_params::<StoreDataTask>("StoreDataTask");
    registry.register_params::<ModSpecTask>("ModSpecTask");
    registry
  }

  pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
  where
    F: Fn(&Map<String, Value>) -> Result<Box<dyn Task>, RocketError> + Send + Sync + 'static,
  {
    self.constructors.insert(name.into(), Arc::new(constructor));
  }

  /// Register a task whose parameters deserialize straight into it.
  pub fn register_params<T>(&mut self, name: &str)
  where
    T: Task + DeserializeOwned + 'static,
  {
    let task = name.to_string();
    self.register(name, move |params| {
      let parsed: T = serde_json::from_value(Value::Object(params.clone())).map_err(|e| {
        RocketError::InvalidParams {
          task: task.clone(),
          message: e.to_string(),
        }
      })?;
      Ok(Box::new(parsed))
    });
  }

  pub fn contains(&self, name: &str) -> bool {
    self.constructors.contains_key(name)
  }

  /// Instantiate the task described by `def`.
  pub fn build(&self, def: &TaskDef) -> Result<Box<dyn Task>, RocketError> {
    let constructor = self
      .constructors
      .get(&def.name)
      .ok_or_else(|| RocketError::UnknownTask(def.name.clone()))?;
    constructor(&def.params)
  }
}
