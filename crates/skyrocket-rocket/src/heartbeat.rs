use std::sync::Arc;
use std::time::Duration;

use skyrocket_launchpad::LaunchPadClient;
use skyrocket_workflow::LaunchId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Background task pinging a launch until stopped.
pub(crate) struct Heartbeat {
  launchpad: Arc<dyn LaunchPadClient>,
  launch_id: LaunchId,
  cancel: CancellationToken,
  handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
  /// Ping every `interval` when the rocket heartbeats itself; otherwise
  /// hand the launch to whoever does.
  pub(crate) async fn start(
    launchpad: Arc<dyn LaunchPadClient>,
    launch_id: LaunchId,
    interval: Duration,
  ) -> Self {
    let cancel = CancellationToken::new();
    let handle = if launchpad.heartbeat_locally() {
      let (lp, token) = (launchpad.clone(), cancel.clone());
      Some(tokio::spawn(async move {
        loop {
          tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
              match lp.ping_launch(launch_id, None).await {
                Ok(()) => debug!(launch_id, "heartbeat"),
                Err(e) => warn!(launch_id, error = %e, "heartbeat failed"),
              }
            }
          }
        }
      }))
    } else {
      if let Err(e) = launchpad.track_running(Some(launch_id)).await {
        warn!(launch_id, error = %e, "could not register running launch");
      }
      None
    };

    Self {
      launchpad,
      launch_id,
      cancel,
      handle,
    }
  }

  /// Stop pinging and send one last ping.
  pub(crate) async fn stop(mut self) {
    self.cancel.cancel();
    match self.handle.take() {
      Some(handle) => {
        if let Err(e) = handle.await {
          warn!(launch_id = self.launch_id, error = %e, "heartbeat task panicked");
        }
        if let Err(e) = self.launchpad.ping_launch(self.launch_id, None).await {
          warn!(launch_id = self.launch_id, error = %e, "final ping failed");
        }
      }
      None => {
        if let Err(e) = self.launchpad.track_running(None).await {
          warn!(launch_id = self.launch_id, error = %e, "could not clear running launch");
        }
      }
    }
  }
}

impl Drop for Heartbeat {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}
