use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use skyrocket_config::FWorker;
use skyrocket_launchpad::LaunchPad;
use skyrocket_rocket::{HostInfo, RapidFireOptions, Rocket, TaskRegistry, rapidfire};
use skyrocket_workflow::Mode;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::nodes::{SubJob, exclude_node, split_node_lists};
use crate::{Coordinator, PackedLaunchPad, PackingError, WorkerId};

/// Pause between starting two worker processes.
const STAGGER: Duration = Duration::from_millis(150);

/// One rapidfire loop inside a packed allocation.
pub struct PackedWorker {
  pub worker_id: WorkerId,
  pub addr: SocketAddr,
  pub password: String,
  pub fworker: FWorker,
  pub registry: Arc<TaskRegistry>,
  pub host: HostInfo,
  pub job: SubJob,
  pub rapidfire: RapidFireOptions,
  /// Wait before asking whether siblings still run something.
  pub drain_poll: Duration,
  pub mod_mode: Mode,
}

impl PackedWorker {
  /// Connect to the coordinator and run rapidfire through it.
  ///
  /// With `nlaunches == 0` the loop is restarted as long as another worker
  /// still runs a launch, since its completion may unlock more work.
  #[instrument(skip(self), fields(worker_id = self.worker_id))]
  pub async fn run(&self) -> Result<usize, PackingError> {
    let client = Arc::new(PackedLaunchPad::connect(self.addr, &self.password, self.worker_id).await?);
    let sub_nproc = (self.job.sub_nproc > 0).then_some(self.job.sub_nproc);
    let rocket = Rocket::new(client.clone(), self.fworker.clone(), self.registry.clone())
      .with_host(self.host.clone())
      .with_nodes(self.job.nodes.clone(), sub_nproc)
      .with_mod_mode(self.mod_mode);

    let mut launched = rapidfire(&rocket, &self.rapidfire).await?;
    while self.rapidfire.nlaunches == 0 {
      tokio::time::sleep(self.drain_poll).await;
      if !client.any_running().await? {
        break;
      }
      info!(secs = self.rapidfire.sleep_time.as_secs_f64(), "other workers still running; sleeping before resubmitting");
      tokio::time::sleep(self.rapidfire.sleep_time).await;
      launched += rapidfire(&rocket, &self.rapidfire).await?;
    }
    info!(launched, "packed worker finished");
    Ok(launched)
  }
}

/// How [`launch_multiprocess`] starts its workers.
#[derive(Debug, Clone)]
pub enum WorkerMode {
  /// Tokio tasks inside this process.
  Serial,
  /// One OS process per worker: `program args.. rlaunch packed-worker ...`.
  Process { program: PathBuf, args: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct MultiLaunchOptions {
  pub num_jobs: usize,
  pub mode: WorkerMode,
  /// Contents of the allocation's nodefile, if any.
  pub nodes: Option<Vec<String>>,
  pub ppn: usize,
  pub exclude_current_node: bool,
  /// Per-worker rapidfire settings; `launch_dir` is shared by all workers.
  pub rapidfire: RapidFireOptions,
  pub drain_poll: Duration,
}

impl MultiLaunchOptions {
  pub fn new(num_jobs: usize, mode: WorkerMode, rapidfire: RapidFireOptions) -> Self {
    Self {
      num_jobs,
      mode,
      nodes: None,
      ppn: 1,
      exclude_current_node: false,
      rapidfire,
      drain_poll: Duration::from_millis(1500),
    }
  }
}

/// Run `num_jobs` rapidfire workers against one coordinator owning
/// `launchpad`, wait for all of them, then shut the coordinator down.
#[instrument(skip_all, fields(num_jobs = opts.num_jobs))]
pub async fn launch_multiprocess(
  launchpad: Arc<LaunchPad>,
  fworker: FWorker,
  registry: Arc<TaskRegistry>,
  host: HostInfo,
  opts: &MultiLaunchOptions,
) -> Result<(), PackingError> {
  let mut nodes = opts.nodes.clone();
  if opts.exclude_current_node {
    if let Some(list) = nodes.as_mut() {
      if exclude_node(list, &host.host) {
        info!(host = %host.host, "removed the current node from the compute nodes");
      } else {
        info!(host = %host.host, "current node is not in the node list");
      }
    }
  }
  let jobs = split_node_lists(opts.num_jobs, nodes.as_deref(), opts.ppn)?;

  let packing = launchpad.config().packing.clone();
  let mod_mode = launchpad.mode();
  let coordinator = Arc::new(Coordinator::bind(launchpad, &packing).await?);
  let addr = coordinator.local_addr()?;
  let cancel = CancellationToken::new();
  let server = tokio::spawn(coordinator.serve(cancel.clone()));

  let outcome = match &opts.mode {
    WorkerMode::Serial => {
      let mut handles = Vec::with_capacity(jobs.len());
      for (worker_id, job) in (0..).zip(jobs) {
        let worker = PackedWorker {
          worker_id,
          addr,
          password: packing.password.clone(),
          fworker: fworker.clone(),
          registry: registry.clone(),
          host: host.clone(),
          job,
          rapidfire: opts.rapidfire.clone(),
          drain_poll: opts.drain_poll,
          mod_mode,
        };
        handles.push((worker_id, tokio::spawn(async move { worker.run().await })));
      }
      join_tasks(handles).await
    }
    WorkerMode::Process { program, args } => match spawn_workers(program, args, addr.port(), jobs, opts).await {
      Ok(children) => join_processes(children).await,
      Err(e) => Err(e),
    },
  };

  cancel.cancel();
  match server.await {
    Ok(result) => result?,
    Err(e) => warn!(error = %e, "coordinator task panicked"),
  }
  outcome
}

/// Start one `packed-worker` process per job. Children started before a
/// failed spawn are killed when dropped.
async fn spawn_workers(
  program: &Path,
  args: &[String],
  port: u16,
  jobs: Vec<SubJob>,
  opts: &MultiLaunchOptions,
) -> Result<Vec<(WorkerId, Child)>, PackingError> {
  let mut children = Vec::with_capacity(jobs.len());
  for (worker_id, job) in (0..).zip(jobs) {
    let mut cmd = Command::new(program);
    cmd
      .args(args)
      .args(worker_args(worker_id, port, &job, opts))
      .stdin(Stdio::null())
      .kill_on_drop(true);
    let child = cmd.spawn().map_err(|e| PackingError::Worker {
      worker_id,
      message: format!("could not start {}: {e}", program.display()),
    })?;
    info!(worker_id, pid = child.id(), "started worker process");
    children.push((worker_id, child));
    tokio::time::sleep(STAGGER).await;
  }
  Ok(children)
}

/// Command line of a `packed-worker` process.
fn worker_args(worker_id: WorkerId, port: u16, job: &SubJob, opts: &MultiLaunchOptions) -> Vec<String> {
  let rf = &opts.rapidfire;
  let mut args = vec![
    "rlaunch".to_string(),
    "packed-worker".to_string(),
    "--port".to_string(),
    port.to_string(),
    "--worker-id".to_string(),
    worker_id.to_string(),
    "--launch-dir".to_string(),
    rf.launch_dir.display().to_string(),
    "--nlaunches".to_string(),
    rf.nlaunches.to_string(),
    "--sleep".to_string(),
    rf.sleep_time.as_secs().to_string(),
    "--sub-nproc".to_string(),
    job.sub_nproc.to_string(),
  ];
  if let Some(timeout) = rf.timeout {
    args.extend(["--timeout".to_string(), timeout.as_secs().to_string()]);
  }
  for node in &job.nodes {
    args.extend(["--node".to_string(), node.clone()]);
  }
  args
}

async fn join_tasks(handles: Vec<(WorkerId, JoinHandle<Result<usize, PackingError>>)>) -> Result<(), PackingError> {
  let mut first_error = None;
  for (worker_id, handle) in handles {
    let failure = match handle.await {
      Ok(Ok(_)) => None,
      Ok(Err(e)) => Some(e.to_string()),
      Err(e) => Some(format!("worker task panicked: {e}")),
    };
    if let Some(message) = failure {
      error!(worker_id, %message, "worker failed");
      first_error.get_or_insert(PackingError::Worker { worker_id, message });
    }
  }
  first_error.map_or(Ok(()), Err)
}

async fn join_processes(children: Vec<(WorkerId, Child)>) -> Result<(), PackingError> {
  let mut first_error = None;
  for (worker_id, mut child) in children {
    let failure = match child.wait().await {
      Ok(status) if status.success() => None,
      Ok(status) => Some(format!("exited with {status}")),
      Err(e) => Some(e.to_string()),
    };
    if let Some(message) = failure {
      error!(worker_id, %message, "worker process failed");
      first_error.get_or_insert(PackingError::Worker { worker_id, message });
    }
  }
  first_error.map_or(Ok(()), Err)
}
