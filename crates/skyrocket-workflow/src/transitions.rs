//! State transitions and graph mutation on a loaded [`Workflow`].
//!
//! Every operation returns the set of firework ids whose documents changed,
//! so callers know what to persist.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use skyrocket_dictmod::{Mode, apply_mod_with};
use tracing::debug;

use crate::{FwAction, FwId, Launch, LaunchId, State, Workflow, WorkflowError};

pub type Updated = BTreeSet<FwId>;

impl Workflow {
  /// Recompute the state of `fw_id` from its parents and launches, cascading
  /// into children when the firework finishes.
  pub fn refresh(&mut self, fw_id: FwId, mode: Mode) -> Result<Updated, WorkflowError> {
    let mut updated = Updated::new();
    let fw = self.firework(fw_id)?;
    let prev = fw.state;
    if matches!(prev, State::Defused | State::Archived | State::Paused) {
      return Ok(updated);
    }

    let allow_fizzled = fw.allows_fizzled_parents();
    let parents = self.links.parents(fw_id).to_vec();
    let mut blocked = false;
    let mut fizzled_parents = Vec::new();
    for parent in &parents {
      match self.firework(*parent)?.state {
        State::Completed => {}
        State::Fizzled if allow_fizzled => fizzled_parents.push(*parent),
        _ => blocked = true,
      }
    }

    let (state, action) = if blocked {
      (State::Waiting, None)
    } else {
      let fw = self.firework(fw_id)?;
      match fw.representative_launch() {
        Some(launch) if launch.state == State::Completed => (State::Completed, launch.action.clone()),
        Some(launch) => (launch.state, None),
        None => (State::Ready, None),
      }
    };

    if !blocked && !fizzled_parents.is_empty() && !self.firework(fw_id)?.spec.contains_key("_fizzled_parents") {
      let docs: Vec<Value> = fizzled_parents
        .iter()
        .filter_map(|p| self.fws.get(p))
        .filter_map(|p| serde_json::to_value(p).ok())
        .collect();
      self
        .firework_mut(fw_id)?
        .spec
        .insert("_fizzled_parents".to_string(), Value::Array(docs));
      updated.insert(fw_id);
    }

    if state != prev {
      debug!(fw_id, from = %prev, to = %state, "firework state changed");
      self.firework_mut(fw_id)?.set_state(state);
      updated.insert(fw_id);

      if state == State::Completed
        && let Some(action) = action
      {
        updated.extend(self.apply_action(&action, fw_id, mode)?);
      }
      if state.is_finished() {
        for child in self.links.children(fw_id).to_vec() {
          updated.extend(self.refresh(child, mode)?);
        }
      }
    }

    self.updated_on = Utc::now();
    Ok(updated)
  }

  /// Apply the action of a completed firework to its children (or to all
  /// descendants with `propagate`) and graft detours and additions below it.
  pub fn apply_action(&mut self, action: &FwAction, fw_id: FwId, mode: Mode) -> Result<Updated, WorkflowError> {
    let mut updated = Updated::new();
    let targets = if action.propagate {
      self.links.descendants(fw_id)
    } else {
      self.links.children(fw_id).to_vec()
    };

    if !action.update_spec.is_empty() {
      for target in &targets {
        let fw = self.firework_mut(*target)?;
        fw.spec.extend(action.update_spec.clone());
        updated.insert(*target);
      }
    }

    if !action.mod_spec.is_empty() {
      for target in &targets {
        let fw = self.firework_mut(*target)?;
        for modification in &action.mod_spec {
          apply_mod_with(modification, &mut fw.spec, mode).map_err(|source| WorkflowError::ModSpec {
            fw_id: *target,
            source,
          })?;
        }
        updated.insert(*target);
      }
    }

    if action.defuse_children {
      for child in self.links.children(fw_id).to_vec() {
        self.firework_mut(child)?.set_state(State::Defused);
        updated.insert(child);
      }
    }

    if action.defuse_workflow {
      for fw in self.fws.values_mut() {
        if !fw.state.is_finished() {
          fw.set_state(State::Defused);
          updated.insert(fw.fw_id);
        }
      }
    }

    for detour in &action.detours {
      updated.extend(self.append_wf(detour.clone(), &[fw_id], true, false, mode)?);
    }
    for addition in &action.additions {
      updated.extend(self.append_wf(addition.clone(), &[fw_id], false, false, mode)?);
    }

    Ok(updated)
  }

  /// Graft `new_wf` below `parent_ids`. Its fireworks must use negative
  /// placeholder ids. With `detour`, the parents' existing children move
  /// below the leaves of `new_wf`.
  pub fn append_wf(
    &mut self,
    new_wf: Workflow,
    parent_ids: &[FwId],
    detour: bool,
    pull_spec_mods: bool,
    mode: Mode,
  ) -> Result<Updated, WorkflowError> {
    for parent in parent_ids {
      self.firework(*parent)?;
    }

    let mut moved = Vec::new();
    if detour {
      for parent in parent_ids {
        for child in self.links.children(*parent) {
          if *child < 0 {
            continue;
          }
          if self.firework(*child)?.state.rank() > State::Waiting.rank() {
            return Err(WorkflowError::DetourOnStartedChildren { fw_id: *parent });
          }
          moved.push((*parent, *child));
        }
      }
    }

    if let Some(id) = new_wf.fws.keys().find(|id| **id >= 0) {
      return Err(WorkflowError::PlaceholderIdRequired(*id));
    }
    let clashes: Vec<FwId> = new_wf.fws.keys().copied().filter(|id| self.contains(*id)).collect();
    if !clashes.is_empty() {
      return Err(WorkflowError::DuplicateUpdate(clashes));
    }

    let roots = new_wf.root_fw_ids();
    let leaves = new_wf.leaf_fw_ids();
    let new_links = new_wf.links.as_map().clone();
    let mut new_fws = new_wf.fws;

    if pull_spec_mods {
      for parent in parent_ids {
        let Some(action) = self
          .firework(*parent)?
          .representative_launch()
          .filter(|l| l.state == State::Completed)
          .and_then(|l| l.action.clone())
        else {
          continue;
        };
        for root in &roots {
          let Some(fw) = new_fws.get_mut(root) else {
            continue;
          };
          fw.spec.extend(action.update_spec.clone());
          for modification in &action.mod_spec {
            apply_mod_with(modification, &mut fw.spec, mode)
              .map_err(|source| WorkflowError::ModSpec { fw_id: *root, source })?;
          }
        }
      }
    }

    let new_ids: Vec<FwId> = new_fws.keys().copied().collect();
    for (id, mut fw) in new_fws {
      fw.state = State::Waiting;
      self.fws.insert(id, fw);
      self.links.add_node(id);
    }
    for (parent, children) in new_links {
      for child in children {
        self.links.add_edge(parent, child);
      }
    }

    for (parent, child) in &moved {
      for leaf in &leaves {
        self.links.add_edge(*leaf, *child);
      }
      self.links.remove_edge(*parent, *child);
    }
    for parent in parent_ids {
      for root in &roots {
        self.links.add_edge(*parent, *root);
      }
    }

    let mut updated: Updated = new_ids.iter().copied().collect();
    updated.extend(moved.iter().map(|(parent, _)| *parent));
    for id in new_ids {
      updated.extend(self.refresh(id, mode)?);
    }
    Ok(updated)
  }

  /// Archive the launches of `fw_id` and re-derive its state, then do the
  /// same for every child that has left WAITING.
  pub fn rerun_fw(&mut self, fw_id: FwId, mode: Mode) -> Result<Updated, WorkflowError> {
    let mut updated = Updated::from([fw_id]);
    self.firework_mut(fw_id)?.archive_launches();
    updated.extend(self.refresh(fw_id, mode)?);

    for child in self.links.children(fw_id).to_vec() {
      if self.firework(child)?.state != State::Waiting {
        updated.extend(self.rerun_fw(child, mode)?);
      }
    }
    Ok(updated)
  }

  /// Take a firework out of consideration. Running or finished work is
  /// rerun first so that no launch stays active.
  pub fn defuse_fw(&mut self, fw_id: FwId, mode: Mode) -> Result<Updated, WorkflowError> {
    let mut updated = Updated::new();
    let state = self.firework(fw_id)?.state;
    if !matches!(state, State::Defused | State::Waiting | State::Ready | State::Fizzled) {
      updated.extend(self.rerun_fw(fw_id, mode)?);
    }
    self.firework_mut(fw_id)?.set_state(State::Defused);
    updated.insert(fw_id);
    Ok(updated)
  }

  pub fn pause_fw(&mut self, fw_id: FwId) -> Result<Updated, WorkflowError> {
    let fw = self.firework_mut(fw_id)?;
    if !matches!(fw.state, State::Waiting | State::Ready) {
      return Err(WorkflowError::InvalidTransition {
        fw_id,
        from: fw.state,
        to: State::Paused,
      });
    }
    fw.set_state(State::Paused);
    Ok(Updated::from([fw_id]))
  }

  /// Resume a DEFUSED or PAUSED firework.
  pub fn reignite_fw(&mut self, fw_id: FwId, mode: Mode) -> Result<Updated, WorkflowError> {
    let fw = self.firework_mut(fw_id)?;
    if !matches!(fw.state, State::Defused | State::Paused) {
      return Err(WorkflowError::InvalidTransition {
        fw_id,
        from: fw.state,
        to: State::Waiting,
      });
    }
    fw.set_state(State::Waiting);
    let mut updated = Updated::from([fw_id]);
    updated.extend(self.refresh(fw_id, mode)?);
    Ok(updated)
  }

  /// Defuse every firework that has not COMPLETED or been ARCHIVED.
  pub fn defuse_all(&mut self, mode: Mode) -> Result<Updated, WorkflowError> {
    let mut updated = Updated::new();
    for fw_id in self.fw_ids() {
      if !matches!(self.firework(fw_id)?.state, State::Completed | State::Archived) {
        updated.extend(self.defuse_fw(fw_id, mode)?);
      }
    }
    Ok(updated)
  }

  /// Pause every WAITING or READY firework.
  pub fn pause_all(&mut self) -> Result<Updated, WorkflowError> {
    let mut updated = Updated::new();
    for fw_id in self.fw_ids() {
      if matches!(self.firework(fw_id)?.state, State::Waiting | State::Ready) {
        updated.extend(self.pause_fw(fw_id)?);
      }
    }
    Ok(updated)
  }

  pub fn reignite_all(&mut self, mode: Mode) -> Result<Updated, WorkflowError> {
    let mut updated = Updated::new();
    for fw_id in self.fw_ids() {
      if matches!(self.firework(fw_id)?.state, State::Defused | State::Paused) {
        updated.extend(self.reignite_fw(fw_id, mode)?);
      }
    }
    Ok(updated)
  }

  /// Rerun whatever has started, then mark every firework ARCHIVED.
  pub fn archive(&mut self, mode: Mode) -> Result<Updated, WorkflowError> {
    let mut updated = Updated::new();
    for fw_id in self.fw_ids() {
      if !matches!(
        self.firework(fw_id)?.state,
        State::Archived | State::Defused | State::Waiting
      ) {
        updated.extend(self.rerun_fw(fw_id, mode)?);
      }
    }
    for fw in self.fws.values_mut() {
      fw.set_state(State::Archived);
      updated.insert(fw.fw_id);
    }
    Ok(updated)
  }

  /// Attach `launch` to a READY firework, or reuse the RESERVED launch of a
  /// reserved one. Returns the id of the launch now holding the firework.
  pub fn start_launch(
    &mut self,
    fw_id: FwId,
    launch: Launch,
    now: DateTime<Utc>,
    mode: Mode,
  ) -> Result<(LaunchId, Updated), WorkflowError> {
    let fw = self.firework_mut(fw_id)?;
    let launch_id = match fw.state {
      State::Ready => {
        let launch_id = launch.launch_id;
        fw.launches.push(launch);
        launch_id
      }
      State::Reserved => {
        let Some(reserved) = fw.launches.iter_mut().find(|l| l.state == State::Reserved) else {
          return Err(WorkflowError::InvalidTransition {
            fw_id,
            from: State::Reserved,
            to: launch.state,
          });
        };
        reserved.launch_dir = launch.launch_dir;
        reserved.fworker = launch.fworker;
        reserved.host = launch.host;
        reserved.ip = launch.ip;
        reserved.set_state(launch.state, now);
        reserved.launch_id
      }
      from => {
        return Err(WorkflowError::InvalidTransition {
          fw_id,
          from,
          to: launch.state,
        });
      }
    };
    let mut updated = self.refresh(fw_id, mode)?;
    updated.insert(fw_id);
    Ok((launch_id, updated))
  }

  /// Record the outcome of a launch and re-derive the workflow from it.
  pub fn complete_launch(
    &mut self,
    launch_id: LaunchId,
    action: Option<FwAction>,
    state: State,
    now: DateTime<Utc>,
    mode: Mode,
  ) -> Result<Updated, WorkflowError> {
    let fw_id = self.active_owner(launch_id)?;
    let launch = self
      .firework_mut(fw_id)?
      .launch_mut(launch_id)
      .ok_or(WorkflowError::LaunchNotFound(launch_id))?;
    launch.action = action;
    launch.set_state(state, now);

    let mut updated = self.refresh(fw_id, mode)?;
    updated.insert(fw_id);
    Ok(updated)
  }

  /// Archive a RESERVED launch so its firework returns to READY.
  pub fn cancel_reservation(&mut self, launch_id: LaunchId, now: DateTime<Utc>, mode: Mode) -> Result<Updated, WorkflowError> {
    let fw_id = self.active_owner(launch_id)?;
    let launch = self
      .firework_mut(fw_id)?
      .launch_mut(launch_id)
      .ok_or(WorkflowError::LaunchNotFound(launch_id))?;
    if launch.state != State::Reserved {
      return Err(WorkflowError::InvalidTransition {
        fw_id,
        from: launch.state,
        to: State::Archived,
      });
    }
    launch.set_state(State::Archived, now);

    let mut updated = self.refresh(fw_id, mode)?;
    updated.insert(fw_id);
    Ok(updated)
  }

  /// Heartbeat for a RUNNING launch, optionally storing a checkpoint.
  /// Launches in any other state are left alone; returns whether the
  /// launch was touched.
  pub fn ping_launch(&mut self, launch_id: LaunchId, now: DateTime<Utc>, checkpoint: Option<Value>) -> Result<bool, WorkflowError> {
    let fw_id = self.active_owner(launch_id)?;
    let launch = self
      .firework_mut(fw_id)?
      .launch_mut(launch_id)
      .ok_or(WorkflowError::LaunchNotFound(launch_id))?;
    if launch.state != State::Running {
      return Ok(false);
    }
    launch.touch_history(now, checkpoint);
    Ok(true)
  }

  pub fn change_launch_dir(&mut self, launch_id: LaunchId, launch_dir: impl Into<String>) -> Result<FwId, WorkflowError> {
    let fw_id = self.active_owner(launch_id)?;
    self
      .firework_mut(fw_id)?
      .launch_mut(launch_id)
      .ok_or(WorkflowError::LaunchNotFound(launch_id))?
      .launch_dir = launch_dir.into();
    Ok(fw_id)
  }

  pub fn set_reservation_id(&mut self, launch_id: LaunchId, reservation_id: &str) -> Result<FwId, WorkflowError> {
    let fw_id = self.active_owner(launch_id)?;
    let launch = self
      .firework_mut(fw_id)?
      .launch_mut(launch_id)
      .ok_or(WorkflowError::LaunchNotFound(launch_id))?;
    if !launch.set_reservation_id(reservation_id) {
      return Err(WorkflowError::InvalidTransition {
        fw_id,
        from: launch.state,
        to: State::Reserved,
      });
    }
    Ok(fw_id)
  }

  fn active_owner(&self, launch_id: LaunchId) -> Result<FwId, WorkflowError> {
    self
      .fws
      .values()
      .find(|fw| fw.launch(launch_id).is_some())
      .map(|fw| fw.fw_id)
      .ok_or(WorkflowError::LaunchNotFound(launch_id))
  }
}
