use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use skyrocket_config::{FWorker, Timings};
use skyrocket_launchpad::{LaunchPad, LaunchPadClient};
use skyrocket_rocket::{HostInfo, LAUNCHER_PREFIX, create_datestamp_dir};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::{QueueAdapter, QueueError};

/// Prefix of the directory grouping the jobs of one `queue_rapidfire` run.
pub const BLOCK_PREFIX: &str = "block_";

#[derive(Debug, Clone)]
pub struct QueueLaunchOptions {
  /// Directory under which the `block_*` directory is created.
  pub launch_dir: PathBuf,
  /// Command each job runs; reserved jobs get `--fw-id N` appended.
  pub rocket_cmd: String,
  /// Stop submitting while this many jobs are queued; `0` means no limit.
  pub njobs_queue: usize,
  /// Jobs to submit. `0` submits until no work can appear any more and a
  /// negative value keeps going until `timeout`.
  pub nlaunches: i64,
  /// Reserve a firework for each job before submitting it.
  pub reserve: bool,
  pub sleep_time: Duration,
  pub timeout: Option<Duration>,
  /// Attempts for a failing queue command before giving up.
  pub retry_attempts: u32,
  /// Initial wait between attempts; doubled on every retry.
  pub retry_backoff: Duration,
}

impl QueueLaunchOptions {
  pub fn new(launch_dir: impl Into<PathBuf>, rocket_cmd: impl Into<String>, timings: &Timings) -> Self {
    Self {
      launch_dir: launch_dir.into(),
      rocket_cmd: rocket_cmd.into(),
      njobs_queue: 0,
      nlaunches: 0,
      reserve: false,
      sleep_time: timings.queue_update_interval(),
      timeout: None,
      retry_attempts: timings.queue_retry_attempts,
      retry_backoff: Duration::from_secs(30),
    }
  }
}

async fn with_retries<T, F, Fut>(attempts: u32, backoff: Duration, mut call: F) -> Result<T, QueueError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, QueueError>>,
{
  let attempts = attempts.max(1);
  let mut delay = backoff;
  let mut attempt = 1;
  loop {
    match call().await {
      Ok(value) => return Ok(value),
      Err(e @ QueueError::LaunchPad(_)) => return Err(e),
      Err(e) if attempt >= attempts => {
        return Err(QueueError::RetriesExhausted {
          attempts,
          last: Box::new(e),
        });
      }
      Err(e) => {
        warn!(attempt, error = %e, "queue command failed; retrying");
        tokio::time::sleep(delay).await;
        delay *= 2;
        attempt += 1;
      }
    }
  }
}

/// Submit one job from `launcher_dir`.
///
/// With `reserve`, a READY firework is reserved first and the job is told
/// to run exactly that firework; returns `None` when there is nothing to
/// reserve. A failed submission cancels the reservation.
#[instrument(skip(launchpad, adapter, worker, opts), fields(worker = %worker.name, reserve = opts.reserve))]
pub async fn launch_rocket_to_queue(
  launchpad: &LaunchPad,
  adapter: &dyn QueueAdapter,
  worker: &FWorker,
  host: &HostInfo,
  launcher_dir: &Path,
  opts: &QueueLaunchOptions,
) -> Result<Option<String>, QueueError> {
  if !opts.reserve {
    let submit = || adapter.submit_to_queue(launcher_dir, &opts.rocket_cmd);
    return Ok(Some(with_retries(opts.retry_attempts, opts.retry_backoff, submit).await?));
  }

  let dir = launcher_dir.to_string_lossy();
  let Some((fw, launch_id)) = launchpad.reserve_fw(worker, &host.host, &host.ip, &dir).await? else {
    return Ok(None);
  };

  let rocket_cmd = format!("{} --fw-id {}", opts.rocket_cmd, fw.fw_id);
  let submit = || adapter.submit_to_queue(launcher_dir, &rocket_cmd);
  match with_retries(opts.retry_attempts, opts.retry_backoff, submit).await {
    Ok(job_id) => {
      launchpad.set_reservation_id(launch_id, &job_id).await?;
      info!(fw_id = fw.fw_id, launch_id, job_id = %job_id, "reserved firework for queue job");
      Ok(Some(job_id))
    }
    Err(e) => {
      warn!(fw_id = fw.fw_id, launch_id, error = %e, "submission failed; cancelling reservation");
      launchpad.cancel_reservation(launch_id).await?;
      Err(e)
    }
  }
}

/// Keep the queue topped up with worker jobs until the stop condition of
/// `opts` is met. Returns the number of submitted jobs.
#[instrument(skip_all, fields(worker = %worker.name, njobs_queue = opts.njobs_queue))]
pub async fn queue_rapidfire(
  launchpad: &LaunchPad,
  adapter: &dyn QueueAdapter,
  worker: &FWorker,
  opts: &QueueLaunchOptions,
) -> Result<usize, QueueError> {
  let host = HostInfo::detect();
  let started = Instant::now();
  let time_ok = || opts.timeout.is_none_or(|t| started.elapsed() < t);
  let block_dir = create_datestamp_dir(&opts.launch_dir, BLOCK_PREFIX).await?;
  info!(block = %block_dir.display(), "submitting jobs");
  let mut submitted: usize = 0;

  while time_ok() {
    let mut njobs = with_retries(opts.retry_attempts, opts.retry_backoff, || adapter.get_njobs_in_queue()).await?;

    while (opts.njobs_queue == 0 || njobs < opts.njobs_queue) && time_ok() {
      if !launchpad.run_exists(worker).await? {
        break;
      }
      let launcher_dir = create_datestamp_dir(&block_dir, LAUNCHER_PREFIX).await?;
      match launch_rocket_to_queue(launchpad, adapter, worker, &host, &launcher_dir, opts).await? {
        Some(_) => {
          submitted += 1;
          njobs += 1;
        }
        None => {
          // Only succeeds when the directory is empty.
          let _ = tokio::fs::remove_dir(&launcher_dir).await;
          break;
        }
      }
      if opts.nlaunches > 0 && submitted as i64 >= opts.nlaunches {
        info!(submitted, "reached requested number of jobs");
        return Ok(submitted);
      }
    }

    if opts.nlaunches == 0 && !launchpad.future_run_exists(worker).await? {
      break;
    }
    tokio::time::sleep(opts.sleep_time).await;
  }

  info!(submitted, "queue launcher finished");
  Ok(submitted)
}
