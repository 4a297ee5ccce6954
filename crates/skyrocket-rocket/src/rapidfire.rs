use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use skyrocket_config::Timings;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::{Rocket, RocketError, RocketStatus};

/// Prefix of the per-rocket directories created by [`rapidfire`].
pub const LAUNCHER_PREFIX: &str = "launcher_";

const DATESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S-%6f";

/// Pause before rechecking for work after a rocket finished, so that
/// fireworks unlocked by the last completion become visible.
const RECHECK_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Clone)]
pub struct RapidFireOptions {
  /// Directory under which the `launcher_*` directories are created.
  pub launch_dir: PathBuf,
  /// Launches to perform. `0` runs until no work can appear any more and
  /// a negative value runs until `max_loops`.
  pub nlaunches: i64,
  /// Sleep cycles before giving up; negative for unbounded.
  pub max_loops: i64,
  pub sleep_time: Duration,
  /// Stop starting new rockets after this long.
  pub timeout: Option<Duration>,
}

impl RapidFireOptions {
  pub fn new(launch_dir: impl Into<PathBuf>) -> Self {
    Self {
      launch_dir: launch_dir.into(),
      nlaunches: 0,
      max_loops: -1,
      sleep_time: Timings::default().rapidfire_sleep(),
      timeout: None,
    }
  }
}

/// Create a fresh `<prefix><timestamp>` directory under `base`.
pub async fn create_datestamp_dir(base: &Path, prefix: &str) -> Result<PathBuf, RocketError> {
  tokio::fs::create_dir_all(base)
    .await
    .map_err(|e| RocketError::io(base, e))?;
  loop {
    let dir = base.join(format!("{prefix}{}", Utc::now().format(DATESTAMP_FORMAT)));
    match tokio::fs::create_dir(&dir).await {
      Ok(()) => return Ok(dir),
      Err(e) if e.kind() == ErrorKind::AlreadyExists => tokio::task::yield_now().await,
      Err(e) => return Err(RocketError::io(&dir, e)),
    }
  }
}

/// Keep launching rockets, each in its own launcher directory, until the
/// stop condition of `opts` is met. Returns the number of launches.
#[instrument(skip(rocket, opts), fields(worker = %rocket.worker().name, nlaunches = opts.nlaunches))]
pub async fn rapidfire(rocket: &Rocket, opts: &RapidFireOptions) -> Result<usize, RocketError> {
  let launchpad = rocket.launchpad();
  let started = Instant::now();
  let time_ok = || opts.timeout.is_none_or(|t| started.elapsed() < t);
  let mut launched: usize = 0;
  let mut loops: i64 = 0;

  'outer: while loops != opts.max_loops && time_ok() {
    let mut skip_check = false;
    while (skip_check || launchpad.run_exists(rocket.worker()).await?) && time_ok() {
      let dir = create_datestamp_dir(&opts.launch_dir, LAUNCHER_PREFIX).await?;
      match rocket.run(&dir, None).await {
        Ok(RocketStatus::NoWork) => {
          if tokio::fs::remove_dir(&dir).await.is_ok() {
            debug!(dir = %dir.display(), "removed empty launcher directory");
          }
        }
        Ok(RocketStatus::Completed | RocketStatus::Fizzled) => launched += 1,
        // A launch whose completion was lost stays RUNNING until the
        // lost-run check picks it up.
        Err(e @ RocketError::LaunchPad(_)) => {
          error!(dir = %dir.display(), error = %e, "rocket could not report to the launchpad; continuing");
          launched += 1;
        }
        Err(e) => return Err(e),
      }
      if opts.nlaunches > 0 && launched as i64 == opts.nlaunches {
        break 'outer;
      }
      skip_check = launchpad.run_exists(rocket.worker()).await?;
      if !skip_check {
        tokio::time::sleep(RECHECK_DELAY).await;
      }
    }

    if opts.nlaunches == 0 {
      if !launchpad.future_run_exists(rocket.worker()).await? {
        break;
      }
    } else if opts.nlaunches > 0 && launched as i64 >= opts.nlaunches {
      break;
    }
    info!(secs = opts.sleep_time.as_secs_f64(), "sleeping before checking for work");
    tokio::time::sleep(opts.sleep_time).await;
    loops += 1;
  }

  info!(launched, "rapidfire finished");
  Ok(launched)
}
