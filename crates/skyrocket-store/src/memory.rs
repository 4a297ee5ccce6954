use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use skyrocket_workflow::{FwId, LaunchId, State, Workflow};

use crate::types::{dispatch_order, index};
use crate::{FireworkRecord, LaunchRecord, Store, StoreError, StoredWorkflow};

#[derive(Default)]
struct Inner {
  workflows: HashMap<String, StoredWorkflow>,
  /// Insertion order of workflow ids.
  order: Vec<String>,
  fireworks: BTreeMap<FwId, FireworkRecord>,
  launches: BTreeMap<LaunchId, LaunchRecord>,
  last_fw_id: FwId,
  last_launch_id: LaunchId,
}

impl Inner {
  fn write_index(&mut self, wf: &Workflow) {
    self.fireworks.retain(|_, r| r.wf_id != wf.wf_id);
    self.launches.retain(|_, r| r.wf_id != wf.wf_id);
    let (fireworks, launches) = index(wf);
    self.fireworks.extend(fireworks.into_iter().map(|r| (r.fw_id, r)));
    self.launches.extend(launches.into_iter().map(|r| (r.launch_id, r)));
  }
}

/// Process-local store. Documents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
    self
      .inner
      .lock()
      .map_err(|e| StoreError::Backend(format!("memory store lock poisoned: {e}")))
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn insert_workflow(&self, wf: &Workflow) -> Result<(), StoreError> {
    let mut inner = self.lock()?;
    if inner.workflows.contains_key(&wf.wf_id) {
      return Err(StoreError::AlreadyExists(format!("workflow {}", wf.wf_id)));
    }
    if let Some(fw_id) = wf.fw_ids().into_iter().find(|id| inner.fireworks.contains_key(id)) {
      return Err(StoreError::AlreadyExists(format!("firework {fw_id}")));
    }
    inner.write_index(wf);
    inner.order.push(wf.wf_id.clone());
    inner.workflows.insert(
      wf.wf_id.clone(),
      StoredWorkflow {
        workflow: wf.clone(),
        version: 1,
      },
    );
    Ok(())
  }

  async fn get_workflow(&self, wf_id: &str) -> Result<StoredWorkflow, StoreError> {
    self
      .lock()?
      .workflows
      .get(wf_id)
      .cloned()
      .ok_or_else(|| StoreError::NotFound(format!("workflow {wf_id}")))
  }

  async fn commit_workflow(&self, wf: &Workflow, expected_version: i64) -> Result<i64, StoreError> {
    let mut inner = self.lock()?;
    let stored = inner
      .workflows
      .get_mut(&wf.wf_id)
      .ok_or_else(|| StoreError::NotFound(format!("workflow {}", wf.wf_id)))?;
    if stored.version != expected_version {
      return Err(StoreError::ConcurrentConflict {
        wf_id: wf.wf_id.clone(),
        expected: expected_version,
      });
    }
    stored.workflow = wf.clone();
    stored.version += 1;
    let version = stored.version;
    inner.write_index(wf);
    Ok(version)
  }

  async fn wf_id_for_fw(&self, fw_id: FwId) -> Result<String, StoreError> {
    self
      .lock()?
      .fireworks
      .get(&fw_id)
      .map(|r| r.wf_id.clone())
      .ok_or_else(|| StoreError::NotFound(format!("firework {fw_id}")))
  }

  async fn wf_id_for_launch(&self, launch_id: LaunchId) -> Result<String, StoreError> {
    self
      .lock()?
      .launches
      .get(&launch_id)
      .map(|r| r.wf_id.clone())
      .ok_or_else(|| StoreError::NotFound(format!("launch {launch_id}")))
  }

  async fn find_fireworks(&self, states: &[State]) -> Result<Vec<FireworkRecord>, StoreError> {
    let inner = self.lock()?;
    let mut found: Vec<FireworkRecord> = inner
      .fireworks
      .values()
      .filter(|r| states.is_empty() || states.contains(&r.state))
      .cloned()
      .collect();
    found.sort_by(dispatch_order);
    Ok(found)
  }

  async fn find_launches(&self, states: &[State]) -> Result<Vec<LaunchRecord>, StoreError> {
    let inner = self.lock()?;
    Ok(
      inner
        .launches
        .values()
        .filter(|r| !r.archived && (states.is_empty() || states.contains(&r.state)))
        .cloned()
        .collect(),
    )
  }

  async fn wf_ids(&self) -> Result<Vec<String>, StoreError> {
    Ok(self.lock()?.order.clone())
  }

  async fn allocate_fw_ids(&self, count: usize) -> Result<Vec<FwId>, StoreError> {
    let mut inner = self.lock()?;
    let first = inner.last_fw_id + 1;
    inner.last_fw_id += count as FwId;
    Ok((first..=inner.last_fw_id).collect())
  }

  async fn allocate_launch_id(&self) -> Result<LaunchId, StoreError> {
    let mut inner = self.lock()?;
    inner.last_launch_id += 1;
    Ok(inner.last_launch_id)
  }

  async fn reset(&self) -> Result<(), StoreError> {
    *self.lock()? = Inner::default();
    Ok(())
  }
}
