use async_trait::async_trait;
use serde_json::Value;
use skyrocket_config::FWorker;
use skyrocket_workflow::{Firework, FwAction, FwId, Launch, LaunchId, State};

use crate::LaunchPadError;

/// The part of the launchpad a rocket needs. Implemented by [`crate::LaunchPad`]
/// itself and by RPC stubs that forward to one.
#[async_trait]
pub trait LaunchPadClient: Send + Sync {
  /// Check out a READY firework matching `worker` (or the given `fw_id`)
  /// and start a RUNNING launch for it.
  async fn checkout_fw(
    &self,
    worker: &FWorker,
    host: &str,
    ip: &str,
    launch_dir: &str,
    fw_id: Option<FwId>,
  ) -> Result<Option<(Firework, LaunchId)>, LaunchPadError>;

  async fn complete_launch(
    &self,
    launch_id: LaunchId,
    action: Option<FwAction>,
    state: State,
  ) -> Result<(), LaunchPadError>;

  async fn ping_launch(&self, launch_id: LaunchId, checkpoint: Option<Value>) -> Result<(), LaunchPadError>;

  async fn change_launch_dir(&self, launch_id: LaunchId, launch_dir: &str) -> Result<(), LaunchPadError>;

  async fn get_launch(&self, launch_id: LaunchId) -> Result<Launch, LaunchPadError>;

  async fn run_exists(&self, worker: &FWorker) -> Result<bool, LaunchPadError>;

  async fn future_run_exists(&self, worker: &FWorker) -> Result<bool, LaunchPadError>;

  /// Register (or clear, with `None`) the launch this process is running
  /// with whoever sends heartbeats on its behalf.
  async fn track_running(&self, _launch_id: Option<LaunchId>) -> Result<(), LaunchPadError> {
    Ok(())
  }

  /// Whether rockets should send their own heartbeats.
  fn heartbeat_locally(&self) -> bool {
    true
  }
}
