//! Skyrocket Config
//!
//! Configuration is an immutable [`Config`] value assembled once at startup
//! and handed to constructors. It is read from up to three YAML files in a
//! config directory:
//!
//! - `my_launchpad.yaml` -> [`LaunchPadConfig`] (backend, timings, packing)
//! - `my_fworker.yaml` -> [`FWorker`]
//! - `my_qadapter.yaml` -> [`QueueAdapterConfig`]
//!
//! Missing files fall back to defaults (the queue adapter has none and stays
//! unset).

mod error;
mod fworker;
mod launchpad;
mod qadapter;
mod query;
mod timings;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

pub use error::ConfigError;
pub use fworker::{Category, DEFAULT_FWORKER_NAME, FWorker, NO_CATEGORY};
pub use launchpad::{BackendConfig, LaunchPadConfig, PackingConfig};
pub use qadapter::QueueAdapterConfig;
pub use query::matches_query;
pub use timings::{
  MAINTAIN_INTERVAL_SECS, PING_TIME_SECS, QUEUE_RETRY_ATTEMPTS, QUEUE_UPDATE_INTERVAL_SECS,
  RAPIDFIRE_SLEEP_SECS, RESERVATION_EXPIRATION_SECS, RUN_EXPIRATION_FACTOR, Timings,
};

/// Environment variable naming the config directory.
pub const CONFIG_DIR_ENV: &str = "CONFIG_FILE_DIR";
pub const LAUNCHPAD_FILE: &str = "my_launchpad.yaml";
pub const FWORKER_FILE: &str = "my_fworker.yaml";
pub const QADAPTER_FILE: &str = "my_qadapter.yaml";

/// The fully assembled configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
  pub launchpad: LaunchPadConfig,
  pub fworker: FWorker,
  pub qadapter: Option<QueueAdapterConfig>,
  /// Directory the files were read from, if any.
  pub config_dir: Option<PathBuf>,
}

impl Config {
  /// Pick the config directory: an explicit path, then `CONFIG_FILE_DIR`,
  /// then the working directory when it holds a config file, then
  /// `~/.skyrocket` when it exists.
  pub fn resolve_dir(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_dir_from(
      explicit,
      std::env::var_os(CONFIG_DIR_ENV).map(PathBuf::from),
      std::env::current_dir().ok(),
      dirs::home_dir(),
    )
  }

  /// Load the config files from `dir`. `None` yields defaults.
  pub fn load(dir: Option<&Path>) -> Result<Self, ConfigError> {
    let Some(dir) = dir else {
      return Ok(Self::default());
    };

    let launchpad = read_optional(&dir.join(LAUNCHPAD_FILE))?.unwrap_or_default();
    let fworker = read_optional(&dir.join(FWORKER_FILE))?.unwrap_or_default();
    let qadapter = read_optional(&dir.join(QADAPTER_FILE))?;

    let launchpad: LaunchPadConfig = launchpad;
    if launchpad.packing.password.is_empty() {
      return Err(ConfigError::Invalid(
        "packing.password must not be empty".to_string(),
      ));
    }

    Ok(Self {
      launchpad,
      fworker,
      qadapter,
      config_dir: Some(dir.to_path_buf()),
    })
  }

  /// Resolve the directory and load from it.
  pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
    let dir = Self::resolve_dir(explicit);
    Self::load(dir.as_deref())
  }
}

fn resolve_dir_from(
  explicit: Option<&Path>,
  env: Option<PathBuf>,
  cwd: Option<PathBuf>,
  home: Option<PathBuf>,
) -> Option<PathBuf> {
  if let Some(dir) = explicit {
    return Some(dir.to_path_buf());
  }
  if let Some(dir) = env.filter(|d| !d.as_os_str().is_empty()) {
    return Some(dir);
  }
  let has_config = |dir: &Path| {
    [LAUNCHPAD_FILE, FWORKER_FILE, QADAPTER_FILE]
      .iter()
      .any(|file| dir.join(file).is_file())
  };
  if let Some(cwd) = cwd.filter(|d| has_config(d.as_path())) {
    return Some(cwd);
  }
  home.map(|h| h.join(".skyrocket")).filter(|d| d.is_dir())
}

/// Read and parse a YAML file, `None` when it does not exist.
pub fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
  let text = match std::fs::read_to_string(path) {
    Ok(text) => text,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(source) => {
      return Err(ConfigError::Io {
        path: path.to_path_buf(),
        source,
      });
    }
  };
  serde_yaml::from_str(&text)
    .map(Some)
    .map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
}
