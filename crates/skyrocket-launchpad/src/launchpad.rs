use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};
use skyrocket_config::{BackendConfig, FWorker, LaunchPadConfig};
use skyrocket_store::{MemoryStore, SqliteStore, Store, StoreError, StoredWorkflow};
use skyrocket_workflow::{
  Firework, FwAction, FwId, Launch, LaunchId, Mode, State, Updated, Workflow, WorkflowError, validate,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{Clock, LaunchPadClient, LaunchPadError, SystemClock};

const MAX_BACKOFF_DOUBLINGS: u32 = 8;
const MAX_CONFLICT_BACKOFF_MS: u64 = 500;

/// The coordinator and only writer of workflow state.
///
/// Every mutation loads one workflow document, applies a transition from
/// `skyrocket-workflow` and commits it back with a version check. A lost
/// race reloads and tries again.
#[derive(Clone)]
pub struct LaunchPad {
  pub(crate) store: Arc<dyn Store>,
  pub(crate) config: LaunchPadConfig,
  pub(crate) clock: Arc<dyn Clock>,
}

impl LaunchPad {
  pub fn new(store: Arc<dyn Store>, config: LaunchPadConfig) -> Self {
    Self {
      store,
      config,
      clock: Arc::new(SystemClock),
    }
  }

  /// Open the backend named in `config`.
  pub async fn from_config(config: LaunchPadConfig) -> Result<Self, LaunchPadError> {
    let store: Arc<dyn Store> = match &config.backend {
      BackendConfig::Memory => Arc::new(MemoryStore::new()),
      BackendConfig::Sqlite { url } => Arc::new(SqliteStore::connect(url).await?),
    };
    Ok(Self::new(store, config))
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn config(&self) -> &LaunchPadConfig {
    &self.config
  }

  /// How unknown `mod_spec` operators are treated, per `strict_mod_spec`.
  pub fn mode(&self) -> Mode {
    if self.config.strict_mod_spec {
      Mode::Strict
    } else {
      Mode::Lenient
    }
  }

  /// Run a store call, retrying transient failures with exponential backoff.
  pub(crate) async fn retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
  {
    let mut delay = Duration::from_millis(self.config.backend_backoff_ms);
    let mut attempt = 0;
    loop {
      match call().await {
        Err(e) if e.is_transient() && attempt < self.config.backend_retries => {
          attempt += 1;
          warn!(op, attempt, error = %e, "store call failed; retrying");
          tokio::time::sleep(delay).await;
          delay *= 2;
        }
        result => return result,
      }
    }
  }

  pub(crate) async fn load(&self, wf_id: &str) -> Result<StoredWorkflow, LaunchPadError> {
    Ok(self.retry("get_workflow", || self.store.get_workflow(wf_id)).await?)
  }

  pub(crate) async fn load_by_fw(&self, fw_id: FwId) -> Result<StoredWorkflow, LaunchPadError> {
    let wf_id = self.retry("wf_id_for_fw", || self.store.wf_id_for_fw(fw_id)).await?;
    self.load(&wf_id).await
  }

  pub(crate) async fn load_by_launch(&self, launch_id: LaunchId) -> Result<StoredWorkflow, LaunchPadError> {
    let wf_id = self
      .retry("wf_id_for_launch", || self.store.wf_id_for_launch(launch_id))
      .await?;
    self.load(&wf_id).await
  }

  /// Give fresh positive ids to placeholder fireworks.
  async fn renumber(&self, wf: &mut Workflow) -> Result<BTreeMap<FwId, FwId>, LaunchPadError> {
    let placeholders = wf.placeholder_ids();
    if placeholders.is_empty() {
      return Ok(BTreeMap::new());
    }
    let ids = self
      .retry("allocate_fw_ids", || self.store.allocate_fw_ids(placeholders.len()))
      .await?;
    let old_new: BTreeMap<FwId, FwId> = placeholders.into_iter().zip(ids).collect();
    wf.reassign_ids(&old_new);
    Ok(old_new)
  }

  /// Sleep a random slice of a window that doubles with every lost
  /// compare-and-swap, so writers racing on one workflow spread out.
  async fn conflict_backoff(&self, losses: u32) {
    let base = self.config.conflict_backoff_ms.max(1);
    let window = base
      .saturating_mul(1 << losses.min(MAX_BACKOFF_DOUBLINGS))
      .min(MAX_CONFLICT_BACKOFF_MS);
    let millis = rand::thread_rng().gen_range(0..=window);
    tokio::time::sleep(Duration::from_millis(millis)).await;
  }

  /// Load, mutate and commit the workflow `wf_id`, starting over when
  /// another writer commits in between. Every lost race means some other
  /// writer made progress, so this keeps trying until it wins.
  pub(crate) async fn update_wf<T, F>(&self, wf_id: &str, mut mutate: F) -> Result<T, LaunchPadError>
  where
    T: Send,
    F: FnMut(&mut Workflow) -> Result<T, LaunchPadError> + Send,
  {
    let mut losses = 0u32;
    loop {
      let StoredWorkflow { mut workflow, version } = self.load(wf_id).await?;
      let out = mutate(&mut workflow)?;
      self.renumber(&mut workflow).await?;
      match self
        .retry("commit_workflow", || self.store.commit_workflow(&workflow, version))
        .await
      {
        Ok(_) => return Ok(out),
        Err(StoreError::ConcurrentConflict { .. }) => {
          losses += 1;
          debug!(wf_id, losses, "workflow changed underneath; retrying");
          self.conflict_backoff(losses).await;
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  // Submission and queries

  /// Validate and insert a workflow. Every firework gets a freshly
  /// allocated id and the workflow a fresh `wf_id`; returns the old to new
  /// id mapping.
  #[instrument(skip(self, wf), fields(name = %wf.name))]
  pub async fn add_wf(&self, mut wf: Workflow) -> Result<BTreeMap<FwId, FwId>, LaunchPadError> {
    validate(&wf)?;

    let old_ids = wf.fw_ids();
    let new_ids = self
      .retry("allocate_fw_ids", || self.store.allocate_fw_ids(old_ids.len()))
      .await?;
    let old_new: BTreeMap<FwId, FwId> = old_ids.into_iter().zip(new_ids).collect();
    wf.reassign_ids(&old_new);
    wf.wf_id = uuid::Uuid::new_v4().to_string();

    let mode = self.mode();
    for fw_id in wf.fw_ids() {
      wf.refresh(fw_id, mode)?;
    }

    self.retry("insert_workflow", || self.store.insert_workflow(&wf)).await?;
    info!(wf_id = %wf.wf_id, fireworks = old_new.len(), "added workflow");
    Ok(old_new)
  }

  /// Add a single firework as its own workflow.
  pub async fn add_fw(&self, fw: Firework) -> Result<FwId, LaunchPadError> {
    let old = fw.fw_id;
    let old_new = self.add_wf(Workflow::from_firework(fw)).await?;
    old_new
      .get(&old)
      .copied()
      .ok_or(LaunchPadError::Workflow(WorkflowError::FireworkNotFound(old)))
  }

  /// Graft `new_wf` below existing fireworks. See [`Workflow::append_wf`].
  #[instrument(skip(self, new_wf))]
  pub async fn append_wf(
    &self,
    new_wf: Workflow,
    parent_fw_ids: &[FwId],
    detour: bool,
    pull_spec_mods: bool,
  ) -> Result<Updated, LaunchPadError> {
    let first = parent_fw_ids
      .first()
      .copied()
      .ok_or_else(|| WorkflowError::validation("append_wf needs at least one parent", "parent_fw_ids"))?;
    let wf_id = self.retry("wf_id_for_fw", || self.store.wf_id_for_fw(first)).await?;
    let mode = self.mode();
    self
      .update_wf(&wf_id, |wf| {
        let updated = wf.append_wf(new_wf.clone(), parent_fw_ids, detour, pull_spec_mods, mode)?;
        validate(wf)?;
        Ok(updated)
      })
      .await
  }

  pub async fn get_fw_by_id(&self, fw_id: FwId) -> Result<Firework, LaunchPadError> {
    let stored = self.load_by_fw(fw_id).await?;
    Ok(stored.workflow.firework(fw_id)?.clone())
  }

  pub async fn get_wf_by_fw_id(&self, fw_id: FwId) -> Result<Workflow, LaunchPadError> {
    Ok(self.load_by_fw(fw_id).await?.workflow)
  }

  pub async fn get_wf_by_id(&self, wf_id: &str) -> Result<Workflow, LaunchPadError> {
    Ok(self.load(wf_id).await?.workflow)
  }

  pub async fn get_launch_by_id(&self, launch_id: LaunchId) -> Result<Launch, LaunchPadError> {
    let stored = self.load_by_launch(launch_id).await?;
    stored
      .workflow
      .launch(launch_id)
      .cloned()
      .ok_or(LaunchPadError::Workflow(WorkflowError::LaunchNotFound(launch_id)))
  }

  /// Firework ids in any of `states` (all when empty), in dispatch order.
  pub async fn get_fw_ids(&self, states: &[State]) -> Result<Vec<FwId>, LaunchPadError> {
    let records = self.retry("find_fireworks", || self.store.find_fireworks(states)).await?;
    Ok(records.into_iter().map(|r| r.fw_id).collect())
  }

  pub async fn get_wf_ids(&self) -> Result<Vec<String>, LaunchPadError> {
    Ok(self.retry("wf_ids", || self.store.wf_ids()).await?)
  }

  /// The queue reservation id of the firework's active launch.
  pub async fn get_reservation_id_from_fw_id(&self, fw_id: FwId) -> Result<Option<String>, LaunchPadError> {
    let fw = self.get_fw_by_id(fw_id).await?;
    Ok(
      fw.launches
        .iter()
        .rev()
        .find_map(|l| l.reservation_id().map(str::to_string)),
    )
  }

  // Reservation and dispatch

  /// Reserve a READY firework for a queue job. The launch starts RESERVED.
  #[instrument(skip(self, worker), fields(worker = %worker.name))]
  pub async fn reserve_fw(
    &self,
    worker: &FWorker,
    host: &str,
    ip: &str,
    launch_dir: &str,
  ) -> Result<Option<(Firework, LaunchId)>, LaunchPadError> {
    self.dispatch(worker, host, ip, launch_dir, None, State::Reserved).await
  }

  /// Walk the candidates in dispatch order and compare-and-swap the first
  /// one that is still free into `state`. A lost race moves on to the next
  /// candidate; the list is refreshed once exhausted. Reports no work only
  /// when nothing matching the worker is left.
  async fn dispatch(
    &self,
    worker: &FWorker,
    host: &str,
    ip: &str,
    launch_dir: &str,
    fw_id: Option<FwId>,
    state: State,
  ) -> Result<Option<(Firework, LaunchId)>, LaunchPadError> {
    let states: &[State] = match fw_id {
      Some(_) => &[State::Ready, State::Reserved],
      None => &[State::Ready],
    };

    let mut launch_id = None;
    let mut losses = 0u32;
    // Candidates of the last pass in which every one was already taken.
    let mut all_taken: Option<Vec<FwId>> = None;
    loop {
      let candidates: Vec<_> = self
        .retry("find_fireworks", || self.store.find_fireworks(states))
        .await?
        .into_iter()
        .filter(|r| fw_id.is_none_or(|id| id == r.fw_id))
        .filter(|r| worker.matches(&r.query_document()))
        .collect();
      let ids: Vec<FwId> = candidates.iter().map(|r| r.fw_id).collect();
      if candidates.is_empty() || all_taken.as_ref() == Some(&ids) {
        return Ok(None);
      }

      let mut raced = false;
      for candidate in candidates {
        let StoredWorkflow { mut workflow, version } = match self.load(&candidate.wf_id).await {
          Ok(stored) => stored,
          Err(e) if e.is_not_found() => continue,
          Err(e) => return Err(e),
        };
        let id = match launch_id {
          Some(id) => id,
          None => {
            let id = self.retry("allocate_launch_id", || self.store.allocate_launch_id()).await?;
            launch_id = Some(id);
            id
          }
        };
        let now = self.clock.now();
        let launch = Launch::new(id, candidate.fw_id, state, launch_dir, worker.clone(), host, ip, now);
        let started = match workflow.start_launch(candidate.fw_id, launch, now, self.mode()) {
          Ok((started, _)) => started,
          Err(WorkflowError::InvalidTransition { .. }) => {
            debug!(fw_id = candidate.fw_id, "candidate already taken");
            continue;
          }
          Err(e) => return Err(e.into()),
        };

        match self
          .retry("commit_workflow", || self.store.commit_workflow(&workflow, version))
          .await
        {
          Ok(_) => {
            info!(fw_id = candidate.fw_id, launch_id = started, %state, "checked out firework");
            let fw = workflow.firework(candidate.fw_id)?.clone();
            return Ok(Some((fw, started)));
          }
          Err(StoreError::ConcurrentConflict { .. }) => {
            raced = true;
            losses += 1;
            debug!(fw_id = candidate.fw_id, losses, "lost checkout race");
            self.conflict_backoff(losses).await;
          }
          Err(e) => return Err(e.into()),
        }
      }
      all_taken = (!raced).then_some(ids);
    }
  }

  // Launch lifecycle

  #[instrument(skip(self, action))]
  async fn finish_launch(
    &self,
    launch_id: LaunchId,
    action: Option<FwAction>,
    state: State,
  ) -> Result<Updated, LaunchPadError> {
    let wf_id = self
      .retry("wf_id_for_launch", || self.store.wf_id_for_launch(launch_id))
      .await?;
    let mode = self.mode();
    let clock = self.clock.clone();

    self
      .update_wf(&wf_id, |wf| {
        let current = wf.launch(launch_id).map(|l| l.state);
        if current == Some(state) && state.is_finished() {
          warn!(launch_id, %state, "launch already finished; ignoring repeated completion");
          return Ok(Updated::new());
        }

        let pre_image = wf.clone();
        let now = clock.now();
        let applied = match wf.complete_launch(launch_id, action.clone(), state, now, mode) {
          Ok(updated) => validate(wf).map(|_| updated),
          Err(e) => Err(e),
        };
        match applied {
          Ok(updated) => Ok(updated),
          Err(e) if state == State::Completed => {
            error!(launch_id, error = %e, "applying action failed; fizzling launch");
            *wf = pre_image;
            let fizzle = action
              .clone()
              .unwrap_or_default()
              .with_stored_data(
                "_exception",
                json!({"_stacktrace": e.to_string(), "_details": {"_error": "action application failed"}}),
              );
            Ok(wf.complete_launch(launch_id, Some(fizzle), State::Fizzled, now, mode)?)
          }
          Err(e) => Err(e.into()),
        }
      })
      .await
  }

  pub async fn cancel_reservation(&self, launch_id: LaunchId) -> Result<Updated, LaunchPadError> {
    let wf_id = self
      .retry("wf_id_for_launch", || self.store.wf_id_for_launch(launch_id))
      .await?;
    let (mode, now) = (self.mode(), self.clock.now());
    let updated = self
      .update_wf(&wf_id, |wf| Ok(wf.cancel_reservation(launch_id, now, mode)?))
      .await?;
    info!(launch_id, "cancelled reservation");
    Ok(updated)
  }

  /// Attach the queue job id of a RESERVED launch.
  pub async fn set_reservation_id(&self, launch_id: LaunchId, reservation_id: &str) -> Result<(), LaunchPadError> {
    let wf_id = self
      .retry("wf_id_for_launch", || self.store.wf_id_for_launch(launch_id))
      .await?;
    self
      .update_wf(&wf_id, |wf| Ok(wf.set_reservation_id(launch_id, reservation_id)?))
      .await?;
    Ok(())
  }

  /// Whether `fw` can still become runnable: it is runnable or running now,
  /// or it waits only on fireworks that can.
  fn could_run(wf: &Workflow, fw_id: FwId) -> bool {
    let Ok(fw) = wf.firework(fw_id) else {
      return false;
    };
    match fw.state {
      State::Ready | State::Reserved | State::Running | State::Completed => true,
      State::Fizzled => false,
      State::Waiting => {
        let allow_fizzled = fw.allows_fizzled_parents();
        wf.links().parents(fw_id).iter().all(|p| {
          let parent_fizzled = wf.firework(*p).is_ok_and(|p| p.state == State::Fizzled);
          (allow_fizzled && parent_fizzled) || Self::could_run(wf, *p)
        })
      }
      State::Defused | State::Paused | State::Archived => false,
    }
  }
}

#[async_trait]
impl LaunchPadClient for LaunchPad {
  #[instrument(skip(self, worker), fields(worker = %worker.name))]
  async fn checkout_fw(
    &self,
    worker: &FWorker,
    host: &str,
    ip: &str,
    launch_dir: &str,
    fw_id: Option<FwId>,
  ) -> Result<Option<(Firework, LaunchId)>, LaunchPadError> {
    self.dispatch(worker, host, ip, launch_dir, fw_id, State::Running).await
  }

  async fn complete_launch(
    &self,
    launch_id: LaunchId,
    action: Option<FwAction>,
    state: State,
  ) -> Result<(), LaunchPadError> {
    let updated = self.finish_launch(launch_id, action, state).await?;
    info!(launch_id, %state, updated = updated.len(), "launch finished");
    Ok(())
  }

  async fn ping_launch(&self, launch_id: LaunchId, checkpoint: Option<Value>) -> Result<(), LaunchPadError> {
    let wf_id = self
      .retry("wf_id_for_launch", || self.store.wf_id_for_launch(launch_id))
      .await?;
    let running = self
      .load(&wf_id)
      .await?
      .workflow
      .launch(launch_id)
      .is_some_and(|l| l.state == State::Running);
    if !running {
      debug!(launch_id, "launch is not running; ignoring ping");
      return Ok(());
    }
    let now = self.clock.now();
    self
      .update_wf(&wf_id, |wf| Ok(wf.ping_launch(launch_id, now, checkpoint.clone())?))
      .await?;
    debug!(launch_id, "ping");
    Ok(())
  }

  async fn change_launch_dir(&self, launch_id: LaunchId, launch_dir: &str) -> Result<(), LaunchPadError> {
    let wf_id = self
      .retry("wf_id_for_launch", || self.store.wf_id_for_launch(launch_id))
      .await?;
    self
      .update_wf(&wf_id, |wf| Ok(wf.change_launch_dir(launch_id, launch_dir)?))
      .await?;
    Ok(())
  }

  async fn get_launch(&self, launch_id: LaunchId) -> Result<Launch, LaunchPadError> {
    self.get_launch_by_id(launch_id).await
  }

  async fn run_exists(&self, worker: &FWorker) -> Result<bool, LaunchPadError> {
    let ready = self
      .retry("find_fireworks", || self.store.find_fireworks(&[State::Ready]))
      .await?;
    Ok(ready.iter().any(|r| worker.matches(&r.query_document())))
  }

  async fn future_run_exists(&self, worker: &FWorker) -> Result<bool, LaunchPadError> {
    if self.run_exists(worker).await? {
      return Ok(true);
    }
    let waiting = self
      .retry("find_fireworks", || self.store.find_fireworks(&[State::Waiting]))
      .await?;
    for record in waiting.iter().filter(|r| worker.matches(&r.query_document())) {
      let wf = self.load(&record.wf_id).await?.workflow;
      if Self::could_run(&wf, record.fw_id) {
        return Ok(true);
      }
    }
    Ok(false)
  }
}
