use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skyrocket_config::FWorker;

use crate::{FwAction, FwId, LaunchId, State};

/// One entry of a launch's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
  pub state: State,
  pub created_on: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_on: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub checkpoint: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reservation_id: Option<String>,
}

/// A single attempt at running a firework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Launch {
  pub launch_id: LaunchId,
  pub fw_id: FwId,
  pub state: State,
  pub launch_dir: String,
  pub fworker: FWorker,
  pub host: String,
  pub ip: String,
  #[serde(default)]
  pub state_history: Vec<StateHistoryEntry>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub action: Option<FwAction>,
}

impl Launch {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    launch_id: LaunchId,
    fw_id: FwId,
    state: State,
    launch_dir: impl Into<String>,
    fworker: FWorker,
    host: impl Into<String>,
    ip: impl Into<String>,
    now: DateTime<Utc>,
  ) -> Self {
    let mut launch = Self {
      launch_id,
      fw_id,
      state,
      launch_dir: launch_dir.into(),
      fworker,
      host: host.into(),
      ip: ip.into(),
      state_history: Vec::new(),
      action: None,
    };
    launch.record_state(state, now);
    launch
  }

  /// Move to `state`, appending a history entry when it differs from the
  /// last one. Entry times never go backwards.
  pub fn set_state(&mut self, state: State, now: DateTime<Utc>) {
    self.state = state;
    self.record_state(state, now);
  }

  fn record_state(&mut self, state: State, now: DateTime<Utc>) {
    let last = self.state_history.last();
    if last.is_some_and(|entry| entry.state == state) {
      return;
    }
    let created_on = last.map_or(now, |entry| entry.created_on.max(now));
    let checkpoint = match state {
      State::Completed => None,
      _ => last.and_then(|entry| entry.checkpoint.clone()),
    };
    self.state_history.push(StateHistoryEntry {
      state,
      created_on,
      updated_on: None,
      checkpoint,
      reservation_id: None,
    });
    if state.is_active() {
      self.touch_history(created_on, None);
    }
  }

  /// Heartbeat: refresh the last entry's `updated_on` in place.
  pub fn touch_history(&mut self, now: DateTime<Utc>, checkpoint: Option<Value>) {
    if let Some(entry) = self.state_history.last_mut() {
      if checkpoint.is_some() {
        entry.checkpoint = checkpoint;
      }
      entry.updated_on = Some(now);
    }
  }

  /// Attach a queue reservation id to the first RESERVED entry lacking one.
  pub fn set_reservation_id(&mut self, reservation_id: impl Into<String>) -> bool {
    match self
      .state_history
      .iter_mut()
      .find(|entry| entry.state == State::Reserved && entry.reservation_id.is_none())
    {
      Some(entry) => {
        entry.reservation_id = Some(reservation_id.into());
        true
      }
      None => false,
    }
  }

  pub fn reservation_id(&self) -> Option<&str> {
    self
      .state_history
      .iter()
      .find_map(|entry| entry.reservation_id.as_deref())
  }

  fn first_entry(&self, state: State) -> Option<&StateHistoryEntry> {
    self.state_history.iter().find(|entry| entry.state == state)
  }

  pub fn time_start(&self) -> Option<DateTime<Utc>> {
    self.first_entry(State::Running).map(|entry| entry.created_on)
  }

  /// Entry time of the last COMPLETED or FIZZLED entry.
  pub fn time_end(&self) -> Option<DateTime<Utc>> {
    self
      .state_history
      .iter()
      .rev()
      .find(|entry| entry.state.is_finished())
      .map(|entry| entry.created_on)
  }

  pub fn time_reserved(&self) -> Option<DateTime<Utc>> {
    self.first_entry(State::Reserved).map(|entry| entry.created_on)
  }

  pub fn last_pinged(&self) -> Option<DateTime<Utc>> {
    self.first_entry(State::Running).and_then(|entry| entry.updated_on)
  }

  /// Last heartbeat of the RESERVED entry.
  pub fn reservation_updated_on(&self) -> Option<DateTime<Utc>> {
    self.first_entry(State::Reserved).and_then(|entry| entry.updated_on)
  }

  pub fn runtime_secs(&self) -> Option<f64> {
    let start = self.time_start()?;
    let end = self.time_end()?;
    Some((end - start).num_milliseconds() as f64 / 1000.0)
  }

  /// Seconds spent RESERVED; runs until `now` while the launch has not
  /// started.
  pub fn reservedtime_secs(&self, now: DateTime<Utc>) -> Option<f64> {
    let reserved = self.time_reserved()?;
    let end = self.time_start().unwrap_or(now);
    Some((end - reserved).num_milliseconds() as f64 / 1000.0)
  }
}
