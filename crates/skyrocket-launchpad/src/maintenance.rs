//! Failure detection and the maintenance loop.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use skyrocket_workflow::{FwAction, FwId, LaunchId, State};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{LaunchPad, LaunchPadClient, LaunchPadError};

/// Result of [`LaunchPad::detect_lostruns`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LostRuns {
  /// RUNNING launches without a heartbeat within the expiration.
  pub launch_ids: Vec<LaunchId>,
  /// Fireworks owning those launches.
  pub fw_ids: Vec<FwId>,
  /// Fireworks whose launch COMPLETED while they did not; refreshed.
  pub inconsistent_fw_ids: Vec<FwId>,
}

/// `now - expiration`, or `None` when that predates the calendar.
fn expiry_cutoff(now: DateTime<Utc>, expiration: Duration) -> Option<DateTime<Utc>> {
  chrono::Duration::from_std(expiration)
    .ok()
    .and_then(|d| now.checked_sub_signed(d))
}

impl LaunchPad {
  /// Find RUNNING launches whose last heartbeat is older than `expiration`
  /// (the configured run expiration by default). With `fizzle` they are
  /// marked FIZZLED; with `rerun` their fireworks are rerun as well.
  #[instrument(skip(self))]
  pub async fn detect_lostruns(
    &self,
    expiration: Option<Duration>,
    fizzle: bool,
    rerun: bool,
  ) -> Result<LostRuns, LaunchPadError> {
    let expiration = expiration.unwrap_or_else(|| self.config.timings.run_expiration());
    let cutoff = expiry_cutoff(self.clock.now(), expiration);
    let mut lost = LostRuns::default();

    let running = self
      .retry("find_launches", || self.store.find_launches(&[State::Running]))
      .await?;
    for record in running {
      let wf = self.load(&record.wf_id).await?.workflow;
      let Some(launch) = wf.launch(record.launch_id) else {
        continue;
      };
      let last_seen = launch.last_pinged().or_else(|| launch.time_start());
      if last_seen.zip(cutoff).is_some_and(|(t, cutoff)| t < cutoff) {
        warn!(launch_id = record.launch_id, fw_id = record.fw_id, "lost run detected");
        lost.launch_ids.push(record.launch_id);
        lost.fw_ids.push(record.fw_id);
      }
    }

    for (launch_id, fw_id) in lost.launch_ids.iter().zip(&lost.fw_ids) {
      if fizzle || rerun {
        let action = FwAction::new().with_stored_data(
          "_exception",
          json!({
            "_stacktrace": format!("lost run: no heartbeat for {}s", expiration.as_secs()),
            "_details": null,
          }),
        );
        self.complete_launch(*launch_id, Some(action), State::Fizzled).await?;
      }
      if rerun {
        self.rerun_fw(*fw_id).await?;
      }
    }

    let completed = self
      .retry("find_launches", || self.store.find_launches(&[State::Completed]))
      .await?;
    for record in completed {
      let wf = self.load(&record.wf_id).await?.workflow;
      let Ok(fw) = wf.firework(record.fw_id) else {
        continue;
      };
      if matches!(
        fw.state,
        State::Completed | State::Archived | State::Defused | State::Paused
      ) {
        continue;
      }
      warn!(fw_id = record.fw_id, state = %fw.state, "firework inconsistent with its completed launch");
      let mode = self.mode();
      let fw_id = record.fw_id;
      self
        .update_wf(&record.wf_id, |wf| Ok(wf.refresh(fw_id, mode)?))
        .await?;
      lost.inconsistent_fw_ids.push(fw_id);
    }

    Ok(lost)
  }

  /// Find RESERVED launches whose reservation is older than `expiration`
  /// (the configured reservation expiration by default). With `rerun` the
  /// reservations are cancelled and the fireworks return to READY.
  #[instrument(skip(self))]
  pub async fn detect_unreserved(
    &self,
    expiration: Option<Duration>,
    rerun: bool,
  ) -> Result<Vec<LaunchId>, LaunchPadError> {
    let expiration = expiration.unwrap_or_else(|| self.config.timings.reservation_expiration());
    let cutoff = expiry_cutoff(self.clock.now(), expiration);
    let mut stale = Vec::new();

    let reserved = self
      .retry("find_launches", || self.store.find_launches(&[State::Reserved]))
      .await?;
    for record in reserved {
      let wf = self.load(&record.wf_id).await?.workflow;
      let Some(launch) = wf.launch(record.launch_id) else {
        continue;
      };
      let since = launch.reservation_updated_on().or_else(|| launch.time_reserved());
      if since.zip(cutoff).is_some_and(|(t, cutoff)| t < cutoff) {
        stale.push(record.launch_id);
      }
    }

    if rerun {
      for launch_id in &stale {
        self.cancel_reservation(*launch_id).await?;
      }
    }
    Ok(stale)
  }

  /// One maintenance sweep: fizzle lost runs and cancel stale
  /// reservations.
  pub async fn maintain_once(&self) -> Result<(LostRuns, Vec<LaunchId>), LaunchPadError> {
    let lost = self.detect_lostruns(None, true, false).await?;
    let unreserved = self.detect_unreserved(None, true).await?;
    if !lost.launch_ids.is_empty() || !unreserved.is_empty() || !lost.inconsistent_fw_ids.is_empty() {
      info!(
        lost = lost.launch_ids.len(),
        inconsistent = lost.inconsistent_fw_ids.len(),
        unreserved = unreserved.len(),
        "maintenance sweep"
      );
    }
    Ok((lost, unreserved))
  }

  /// Sweep every `maintain_interval` until `cancel` fires.
  pub async fn maintain(&self, cancel: CancellationToken) {
    let interval = self.config.timings.maintain_interval();
    info!(interval_secs = interval.as_secs(), "maintenance loop started");

    loop {
      if let Err(err) = self.maintain_once().await {
        error!(error = %err, "maintenance sweep failed");
      }
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("maintenance loop shutting down");
          break;
        }
        _ = tokio::time::sleep(interval) => {}
      }
    }
  }
}
