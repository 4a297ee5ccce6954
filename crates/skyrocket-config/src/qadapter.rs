use serde::{Deserialize, Serialize};

/// Contents of `my_qadapter.yaml`.
///
/// `submit_cmd` receives the path of the generated job script as its last
/// argument and must print the queue's job id on stdout. `njobs_cmd` must
/// print the number of this user's jobs currently in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAdapterConfig {
  pub submit_cmd: String,
  pub njobs_cmd: String,
  /// Command placed in the job script to start a worker.
  #[serde(default = "default_rocket_cmd")]
  pub rocket_cmd: String,
  /// Lines written before `rocket_cmd` (scheduler directives, modules).
  #[serde(default)]
  pub preamble: Vec<String>,
  #[serde(default = "default_script_name")]
  pub script_name: String,
  /// Pending jobs to keep in the queue; `0` means no limit.
  #[serde(default)]
  pub max_jobs: usize,
}

fn default_rocket_cmd() -> String {
  "skyrocket rlaunch singleshot".to_string()
}

fn default_script_name() -> String {
  "skyrocket_queue.sh".to_string()
}
