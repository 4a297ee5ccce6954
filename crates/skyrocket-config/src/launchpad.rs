use serde::{Deserialize, Serialize};

use crate::timings::Timings;

/// Where the launchpad keeps its documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
  /// Process-local store; contents vanish with the process.
  Memory,
  /// SQLite database, e.g. `sqlite://launchpad.db?mode=rwc`.
  Sqlite { url: String },
}

impl Default for BackendConfig {
  fn default() -> Self {
    BackendConfig::Sqlite {
      url: "sqlite://skyrocket.db?mode=rwc".to_string(),
    }
  }
}

/// Settings for the packing coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackingConfig {
  /// Loopback port of the coordinator. `0` picks a free port.
  pub port: u16,
  pub password: String,
  pub exclude_current_node: bool,
}

impl Default for PackingConfig {
  fn default() -> Self {
    Self {
      port: 0,
      password: "123".to_string(),
      exclude_current_node: false,
    }
  }
}

/// Contents of `my_launchpad.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchPadConfig {
  pub backend: BackendConfig,
  /// Reject unknown operators in `mod_spec` documents.
  pub strict_mod_spec: bool,
  /// Initial window for the random sleep after a lost compare-and-swap;
  /// doubled on every further loss.
  pub conflict_backoff_ms: u64,
  /// Attempts for a store call that fails with a backend error.
  pub backend_retries: u32,
  /// Initial backoff between backend retries; doubled on every attempt.
  pub backend_backoff_ms: u64,
  pub timings: Timings,
  pub packing: PackingConfig,
}

impl Default for LaunchPadConfig {
  fn default() -> Self {
    Self {
      backend: BackendConfig::default(),
      strict_mod_spec: true,
      conflict_backoff_ms: 5,
      backend_retries: 3,
      backend_backoff_ms: 50,
      timings: Timings::default(),
      packing: PackingConfig::default(),
    }
  }
}

impl LaunchPadConfig {
  /// An in-memory launchpad with default settings.
  pub fn in_memory() -> Self {
    Self {
      backend: BackendConfig::Memory,
      ..Self::default()
    }
  }
}
