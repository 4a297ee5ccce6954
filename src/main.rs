use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skyrocket_config::Config;
use skyrocket_launchpad::LaunchPad;
use skyrocket_packing::{MultiLaunchOptions, PackedWorker, SubJob, WorkerMode, launch_multiprocess, read_nodefile};
use skyrocket_queue::{CommandQueueAdapter, QueueLaunchOptions, queue_rapidfire};
use skyrocket_rocket::{HostInfo, RapidFireOptions, Rocket, RocketStatus, TaskRegistry, rapidfire};
use skyrocket_workflow::{Firework, FwId, Mode, Workflow};

/// Skyrocket - a workflow engine for fleets of batch workers
#[derive(Parser)]
#[command(name = "skyrocket")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Directory holding my_launchpad.yaml, my_fworker.yaml and my_qadapter.yaml
  #[arg(long, global = true)]
  config_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run fireworks on this machine
  Rlaunch {
    #[command(subcommand)]
    mode: RlaunchMode,
  },

  /// Run fireworks in several packed workers of one allocation
  Mlaunch(MultiArgs),

  /// Submit worker jobs to a batch queue
  Qlaunch {
    #[command(subcommand)]
    mode: QlaunchMode,
  },

  /// Manage the launchpad
  Lpad {
    #[command(subcommand)]
    command: LpadCommand,
  },
}

#[derive(Args)]
struct LaunchDirArg {
  /// Base directory for launches (default: current directory)
  #[arg(long)]
  launch_dir: Option<PathBuf>,
}

#[derive(Args)]
struct LoopArgs {
  /// Launches to perform; 0 runs until no work is left, -1 forever
  #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
  nlaunches: i64,

  /// Seconds to sleep when no work is ready
  #[arg(long)]
  sleep: Option<u64>,

  /// Stop starting new launches after this many seconds
  #[arg(long)]
  timeout: Option<u64>,
}

#[derive(Args)]
struct MultiArgs {
  /// Number of packed workers
  num_jobs: usize,

  #[command(flatten)]
  dir: LaunchDirArg,

  #[command(flatten)]
  loops: LoopArgs,

  /// File listing the allocation's nodes
  #[arg(long)]
  nodefile: Option<PathBuf>,

  /// Processors per node
  #[arg(long, default_value_t = 1)]
  ppn: usize,

  /// Run the workers as tasks in this process
  #[arg(long)]
  serial_mode: bool,

  /// Don't use the launching node as a compute node
  #[arg(long)]
  exclude_current_node: bool,
}

#[derive(Subcommand)]
enum RlaunchMode {
  /// Run a single firework
  Singleshot {
    /// Run this firework instead of the best ready one
    #[arg(long)]
    fw_id: Option<FwId>,

    #[command(flatten)]
    dir: LaunchDirArg,
  },

  /// Keep running fireworks until there is no more work
  Rapidfire {
    #[command(flatten)]
    dir: LaunchDirArg,

    #[command(flatten)]
    loops: LoopArgs,

    /// Sleep cycles before giving up; -1 for unbounded
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    max_loops: i64,
  },

  /// Run fireworks in several packed workers of one allocation
  Multi(MultiArgs),

  /// One worker of a packed allocation (started by `multi`)
  #[command(hide = true)]
  PackedWorker {
    #[arg(long)]
    port: u16,

    #[arg(long)]
    worker_id: u32,

    #[arg(long = "node")]
    nodes: Vec<String>,

    #[arg(long, default_value_t = 0)]
    sub_nproc: usize,

    #[command(flatten)]
    dir: LaunchDirArg,

    #[command(flatten)]
    loops: LoopArgs,
  },
}

#[derive(Subcommand)]
enum QlaunchMode {
  /// Keep the queue topped up with worker jobs
  Rapidfire {
    #[command(flatten)]
    dir: LaunchDirArg,

    /// Stop submitting while this many jobs are queued (default: max_jobs of the adapter)
    #[arg(long)]
    njobs_queue: Option<usize>,

    /// Jobs to submit; 0 submits until no work is left, -1 until the timeout
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    nlaunches: i64,

    /// Reserve a firework for every submitted job
    #[arg(long)]
    reserve: bool,

    /// Seconds between queue polls
    #[arg(long)]
    sleep: Option<u64>,

    #[arg(long)]
    timeout: Option<u64>,
  },
}

#[derive(Subcommand)]
enum LpadCommand {
  /// Add a workflow (or a single firework) from a JSON or YAML file
  Add { file: PathBuf },

  /// Print the workflow containing a firework
  GetWf { fw_id: FwId },

  /// Rerun a firework and the descendants that already started
  Rerun { fw_id: FwId },

  /// Defuse a firework
  Defuse { fw_id: FwId },

  /// Pause a WAITING or READY firework
  Pause { fw_id: FwId },

  /// Resume a paused or defused firework
  Reignite { fw_id: FwId },

  /// Archive the workflow containing a firework
  ArchiveWf { fw_id: FwId },

  /// Find running launches without a recent heartbeat
  DetectLostruns {
    /// Seconds without a heartbeat (default: the run expiration)
    #[arg(long)]
    time: Option<u64>,

    /// Mark lost runs FIZZLED
    #[arg(long)]
    fizzle: bool,

    /// Rerun the fireworks of lost runs
    #[arg(long)]
    rerun: bool,
  },

  /// Find stale reservations
  DetectUnreserved {
    /// Seconds a reservation may last (default: the reservation expiration)
    #[arg(long)]
    time: Option<u64>,

    /// Cancel them so the fireworks become READY again
    #[arg(long)]
    rerun: bool,
  },

  /// Fizzle lost runs and cancel stale reservations
  Maintain {
    /// Keep sweeping until interrupted
    #[arg(long)]
    infinite: bool,
  },

  /// Delete all workflows
  Reset {
    /// Today's date as YYYY-MM-DD
    #[arg(long)]
    password: Option<String>,

    /// Allow a reset without the password when few workflows exist
    #[arg(long)]
    force: bool,
  },
}

/// What a successful command did, mapped to the exit code.
enum Outcome {
  Done,
  NoWork,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing();

  let rt = match tokio::runtime::Runtime::new() {
    Ok(rt) => rt,
    Err(e) => {
      eprintln!("error: failed to start runtime: {e}");
      return ExitCode::FAILURE;
    }
  };

  match rt.block_on(run(cli)) {
    Ok(Outcome::Done) => ExitCode::SUCCESS,
    Ok(Outcome::NoWork) => ExitCode::from(2),
    Err(e) => {
      eprintln!("error: {e:#}");
      ExitCode::FAILURE
    }
  }
}

fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skyrocket=info,sqlx=warn"));
  tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run(cli: Cli) -> Result<Outcome> {
  let config = Config::discover(cli.config_dir.as_deref()).context("failed to load configuration")?;
  if let Some(dir) = &config.config_dir {
    info!(dir = %dir.display(), "loaded configuration");
  }

  match cli.command {
    Commands::Rlaunch { mode } => rlaunch(&config, mode).await,
    Commands::Mlaunch(args) => multi(&config, args).await,
    Commands::Qlaunch { mode } => qlaunch(&config, mode).await,
    Commands::Lpad { command } => lpad(&config, command).await,
  }
}

async fn open_launchpad(config: &Config) -> Result<Arc<LaunchPad>> {
  let lp = LaunchPad::from_config(config.launchpad.clone())
    .await
    .context("failed to open the launchpad")?;
  Ok(Arc::new(lp))
}

fn launch_dir(arg: LaunchDirArg) -> Result<PathBuf> {
  match arg.launch_dir {
    Some(dir) => Ok(dir),
    None => std::env::current_dir().context("failed to determine the current directory"),
  }
}

fn rapidfire_options(config: &Config, dir: PathBuf, loops: &LoopArgs) -> RapidFireOptions {
  let mut opts = RapidFireOptions::new(dir);
  opts.nlaunches = loops.nlaunches;
  opts.sleep_time = loops
    .sleep
    .map(Duration::from_secs)
    .unwrap_or_else(|| config.launchpad.timings.rapidfire_sleep());
  opts.timeout = loops.timeout.map(Duration::from_secs);
  opts
}

fn mod_mode(config: &Config) -> Mode {
  if config.launchpad.strict_mod_spec {
    Mode::Strict
  } else {
    Mode::Lenient
  }
}

fn rocket(config: &Config, launchpad: Arc<LaunchPad>) -> Rocket {
  Rocket::new(launchpad, config.fworker.clone(), Arc::new(TaskRegistry::with_builtins()))
    .with_ping_interval(config.launchpad.timings.ping_interval())
    .with_mod_mode(mod_mode(config))
}

async fn rlaunch(config: &Config, mode: RlaunchMode) -> Result<Outcome> {
  match mode {
    RlaunchMode::Singleshot { fw_id, dir } => {
      let dir = launch_dir(dir)?;
      let rocket = rocket(config, open_launchpad(config).await?);
      let status = rocket.run(&dir, fw_id).await.context("rocket launch failed")?;
      info!(?status, "singleshot finished");
      Ok(match status {
        RocketStatus::NoWork => Outcome::NoWork,
        RocketStatus::Completed | RocketStatus::Fizzled => Outcome::Done,
      })
    }
    RlaunchMode::Rapidfire { dir, loops, max_loops } => {
      let mut opts = rapidfire_options(config, launch_dir(dir)?, &loops);
      opts.max_loops = max_loops;
      let rocket = rocket(config, open_launchpad(config).await?);
      let launched = rapidfire(&rocket, &opts).await.context("rapidfire failed")?;
      Ok(if launched == 0 { Outcome::NoWork } else { Outcome::Done })
    }
    RlaunchMode::Multi(args) => multi(config, args).await,
    RlaunchMode::PackedWorker {
      port,
      worker_id,
      nodes,
      sub_nproc,
      dir,
      loops,
    } => {
      let worker = PackedWorker {
        worker_id,
        addr: SocketAddr::from(([127, 0, 0, 1], port)),
        password: config.launchpad.packing.password.clone(),
        fworker: config.fworker.clone(),
        registry: Arc::new(TaskRegistry::with_builtins()),
        host: HostInfo::detect(),
        job: SubJob { nodes, sub_nproc },
        rapidfire: rapidfire_options(config, launch_dir(dir)?, &loops),
        drain_poll: Duration::from_millis(1500),
        mod_mode: mod_mode(config),
      };
      worker
        .run()
        .await
        .with_context(|| format!("packed worker {worker_id} failed"))?;
      Ok(Outcome::Done)
    }
  }
}

async fn multi(config: &Config, args: MultiArgs) -> Result<Outcome> {
  let mode = if args.serial_mode {
    WorkerMode::Serial
  } else {
    let program = std::env::current_exe().context("failed to locate the skyrocket executable")?;
    let args = match &config.config_dir {
      Some(dir) => vec!["--config-dir".to_string(), dir.display().to_string()],
      None => Vec::new(),
    };
    WorkerMode::Process { program, args }
  };

  let rapidfire = rapidfire_options(config, launch_dir(args.dir)?, &args.loops);
  let mut opts = MultiLaunchOptions::new(args.num_jobs, mode, rapidfire);
  opts.ppn = args.ppn;
  opts.exclude_current_node = args.exclude_current_node || config.launchpad.packing.exclude_current_node;
  if let Some(nodefile) = &args.nodefile {
    opts.nodes = Some(read_nodefile(nodefile).await.context("failed to read the nodefile")?);
  }

  launch_multiprocess(
    open_launchpad(config).await?,
    config.fworker.clone(),
    Arc::new(TaskRegistry::with_builtins()),
    HostInfo::detect(),
    &opts,
  )
  .await
  .context("multi launch failed")?;
  Ok(Outcome::Done)
}

async fn qlaunch(config: &Config, mode: QlaunchMode) -> Result<Outcome> {
  let QlaunchMode::Rapidfire {
    dir,
    njobs_queue,
    nlaunches,
    reserve,
    sleep,
    timeout,
  } = mode;
  let Some(qadapter) = config.qadapter.clone() else {
    bail!("no queue adapter configured (my_qadapter.yaml)");
  };

  let timings = &config.launchpad.timings;
  let mut opts = QueueLaunchOptions::new(launch_dir(dir)?, qadapter.rocket_cmd.clone(), timings);
  opts.njobs_queue = njobs_queue.unwrap_or(qadapter.max_jobs);
  opts.nlaunches = nlaunches;
  opts.reserve = reserve;
  if let Some(secs) = sleep {
    opts.sleep_time = Duration::from_secs(secs);
  }
  opts.timeout = timeout.map(Duration::from_secs);

  let launchpad = open_launchpad(config).await?;
  let adapter = CommandQueueAdapter::new(qadapter);
  let submitted = queue_rapidfire(&launchpad, &adapter, &config.fworker, &opts)
    .await
    .context("queue launch failed")?;
  Ok(if submitted == 0 { Outcome::NoWork } else { Outcome::Done })
}

/// Read a workflow document, or a single firework, as JSON or YAML.
async fn load_workflow(path: &Path) -> Result<Workflow> {
  let text = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read workflow file: {}", path.display()))?;
  let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"));
  let doc: serde_json::Value = if is_yaml {
    serde_yaml::from_str(&text).with_context(|| format!("failed to parse YAML: {}", path.display()))?
  } else {
    serde_json::from_str(&text).with_context(|| format!("failed to parse JSON: {}", path.display()))?
  };

  if doc.get("fws").is_some() {
    serde_json::from_value(doc).with_context(|| format!("invalid workflow: {}", path.display()))
  } else {
    let fw: Firework =
      serde_json::from_value(doc).with_context(|| format!("invalid firework: {}", path.display()))?;
    Ok(Workflow::from_firework(fw))
  }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

async fn lpad(config: &Config, command: LpadCommand) -> Result<Outcome> {
  let lp = open_launchpad(config).await?;
  match command {
    LpadCommand::Add { file } => {
      let wf = load_workflow(&file).await?;
      let old_new = lp.add_wf(wf).await.context("failed to add workflow")?;
      print_json(&old_new)?;
    }
    LpadCommand::GetWf { fw_id } => {
      let wf = lp.get_wf_by_fw_id(fw_id).await.context("failed to load workflow")?;
      print_json(&wf)?;
    }
    LpadCommand::Rerun { fw_id } => print_json(&lp.rerun_fw(fw_id).await.context("rerun failed")?)?,
    LpadCommand::Defuse { fw_id } => print_json(&lp.defuse_fw(fw_id).await.context("defuse failed")?)?,
    LpadCommand::Pause { fw_id } => print_json(&lp.pause_fw(fw_id).await.context("pause failed")?)?,
    LpadCommand::Reignite { fw_id } => print_json(&lp.reignite_fw(fw_id).await.context("reignite failed")?)?,
    LpadCommand::ArchiveWf { fw_id } => print_json(&lp.archive_wf(fw_id).await.context("archive failed")?)?,
    LpadCommand::DetectLostruns { time, fizzle, rerun } => {
      let lost = lp
        .detect_lostruns(time.map(Duration::from_secs), fizzle, rerun)
        .await
        .context("lost run detection failed")?;
      print_json(&serde_json::json!({
        "launch_ids": lost.launch_ids,
        "fw_ids": lost.fw_ids,
        "inconsistent_fw_ids": lost.inconsistent_fw_ids,
      }))?;
    }
    LpadCommand::DetectUnreserved { time, rerun } => {
      let stale = lp
        .detect_unreserved(time.map(Duration::from_secs), rerun)
        .await
        .context("reservation check failed")?;
      print_json(&stale)?;
    }
    LpadCommand::Maintain { infinite } => {
      if infinite {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
          if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
          }
        });
        lp.maintain(cancel).await;
      } else {
        lp.maintain_once().await.context("maintenance failed")?;
      }
    }
    LpadCommand::Reset { password, force } => {
      lp.reset(password.as_deref(), !force).await.context("reset failed")?;
      info!("launchpad reset");
    }
  }
  Ok(Outcome::Done)
}
