//! Operator-facing transitions: rerun, defuse, pause, reignite, archive,
//! spec edits and reset.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use skyrocket_workflow::{FwId, Mode, State, Updated, Workflow, WorkflowError};
use tracing::{info, instrument, warn};

use crate::{LaunchPad, LaunchPadError};

/// Upper bound on the workflow count for a reset without a password.
pub const MAX_RESET_WITHOUT_PASSWORD: usize = 25;

impl LaunchPad {
  async fn update_fw<F>(&self, fw_id: FwId, mut mutate: F) -> Result<Updated, LaunchPadError>
  where
    F: FnMut(&mut Workflow, Mode) -> Result<Updated, WorkflowError> + Send,
  {
    let wf_id = self.retry("wf_id_for_fw", || self.store.wf_id_for_fw(fw_id)).await?;
    let mode = self.mode();
    self.update_wf(&wf_id, |wf| Ok(mutate(wf, mode)?)).await
  }

  /// Archive the launches of a firework so it runs again, and rerun the
  /// descendants that had already started. WAITING fireworks are left as
  /// they are.
  #[instrument(skip(self))]
  pub async fn rerun_fw(&self, fw_id: FwId) -> Result<Updated, LaunchPadError> {
    let updated = self
      .update_fw(fw_id, |wf, mode| {
        let state = wf.firework(fw_id)?.state;
        match state {
          State::Archived | State::Defused => Err(WorkflowError::InvalidTransition {
            fw_id,
            from: state,
            to: State::Ready,
          }),
          State::Waiting => Ok(Updated::new()),
          _ => wf.rerun_fw(fw_id, mode),
        }
      })
      .await?;
    info!(fw_id, updated = updated.len(), "rerun firework");
    Ok(updated)
  }

  #[instrument(skip(self))]
  pub async fn defuse_fw(&self, fw_id: FwId) -> Result<Updated, LaunchPadError> {
    self.update_fw(fw_id, |wf, mode| wf.defuse_fw(fw_id, mode)).await
  }

  #[instrument(skip(self))]
  pub async fn pause_fw(&self, fw_id: FwId) -> Result<Updated, LaunchPadError> {
    self.update_fw(fw_id, |wf, _| wf.pause_fw(fw_id)).await
  }

  #[instrument(skip(self))]
  pub async fn reignite_fw(&self, fw_id: FwId) -> Result<Updated, LaunchPadError> {
    self.update_fw(fw_id, |wf, mode| wf.reignite_fw(fw_id, mode)).await
  }

  /// Defuse every unfinished firework of the workflow holding `fw_id`.
  #[instrument(skip(self))]
  pub async fn defuse_wf(&self, fw_id: FwId) -> Result<Updated, LaunchPadError> {
    self.update_fw(fw_id, |wf, mode| wf.defuse_all(mode)).await
  }

  #[instrument(skip(self))]
  pub async fn pause_wf(&self, fw_id: FwId) -> Result<Updated, LaunchPadError> {
    self.update_fw(fw_id, |wf, _| wf.pause_all()).await
  }

  #[instrument(skip(self))]
  pub async fn reignite_wf(&self, fw_id: FwId) -> Result<Updated, LaunchPadError> {
    self.update_fw(fw_id, |wf, mode| wf.reignite_all(mode)).await
  }

  #[instrument(skip(self))]
  pub async fn archive_wf(&self, fw_id: FwId) -> Result<Updated, LaunchPadError> {
    let updated = self.update_fw(fw_id, |wf, mode| wf.archive(mode)).await?;
    info!(fw_id, "archived workflow");
    Ok(updated)
  }

  /// Merge `doc` into the spec of each firework.
  #[instrument(skip(self, doc))]
  pub async fn update_spec(&self, fw_ids: &[FwId], doc: &Map<String, Value>) -> Result<(), LaunchPadError> {
    let mut by_wf: BTreeMap<String, Vec<FwId>> = BTreeMap::new();
    for fw_id in fw_ids {
      let wf_id = self.retry("wf_id_for_fw", || self.store.wf_id_for_fw(*fw_id)).await?;
      by_wf.entry(wf_id).or_default().push(*fw_id);
    }
    for (wf_id, ids) in by_wf {
      self
        .update_wf(&wf_id, |wf| {
          for fw_id in &ids {
            wf.firework_mut(*fw_id)?.spec.extend(doc.clone());
          }
          Ok(())
        })
        .await?;
    }
    Ok(())
  }

  /// Delete everything. `password` must be today's date (`YYYY-MM-DD`),
  /// unless `require_password` is false and the store holds at most
  /// [`MAX_RESET_WITHOUT_PASSWORD`] workflows.
  pub async fn reset(&self, password: Option<&str>, require_password: bool) -> Result<(), LaunchPadError> {
    let today = self.clock.now().format("%Y-%m-%d").to_string();
    if password != Some(today.as_str()) {
      if require_password {
        return Err(LaunchPadError::ResetRefused(
          "the password must be today's date (YYYY-MM-DD)".to_string(),
        ));
      }
      let count = self.get_wf_ids().await?.len();
      if count > MAX_RESET_WITHOUT_PASSWORD {
        return Err(LaunchPadError::ResetRefused(format!(
          "{count} workflows exceed the limit of {MAX_RESET_WITHOUT_PASSWORD} for a reset without password"
        )));
      }
    }
    self.retry("reset", || self.store.reset()).await?;
    warn!("launchpad reset");
    Ok(())
  }
}
