use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const PING_TIME_SECS: u64 = 3600;
pub const RUN_EXPIRATION_FACTOR: u64 = 4;
pub const MAINTAIN_INTERVAL_SECS: u64 = 120;
pub const RAPIDFIRE_SLEEP_SECS: u64 = 60;
pub const QUEUE_UPDATE_INTERVAL_SECS: u64 = 15;
pub const QUEUE_RETRY_ATTEMPTS: u32 = 10;
pub const RESERVATION_EXPIRATION_SECS: u64 = 60 * 60 * 24 * 14;

/// Heartbeat, expiration and polling intervals.
///
/// `run_expiration_secs` defaults to four ping intervals when left unset, so
/// shortening `ping_interval_secs` alone also shortens the lost-run window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
  pub ping_interval_secs: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub run_expiration_secs: Option<u64>,
  pub maintain_interval_secs: u64,
  pub rapidfire_sleep_secs: u64,
  pub queue_update_interval_secs: u64,
  pub queue_retry_attempts: u32,
  pub reservation_expiration_secs: u64,
}

impl Default for Timings {
  fn default() -> Self {
    Self {
      ping_interval_secs: PING_TIME_SECS,
      run_expiration_secs: None,
      maintain_interval_secs: MAINTAIN_INTERVAL_SECS,
      rapidfire_sleep_secs: RAPIDFIRE_SLEEP_SECS,
      queue_update_interval_secs: QUEUE_UPDATE_INTERVAL_SECS,
      queue_retry_attempts: QUEUE_RETRY_ATTEMPTS,
      reservation_expiration_secs: RESERVATION_EXPIRATION_SECS,
    }
  }
}

impl Timings {
  pub fn ping_interval(&self) -> Duration {
    Duration::from_secs(self.ping_interval_secs)
  }

  pub fn run_expiration(&self) -> Duration {
    Duration::from_secs(
      self
        .run_expiration_secs
        .unwrap_or(self.ping_interval_secs * RUN_EXPIRATION_FACTOR),
    )
  }

  pub fn maintain_interval(&self) -> Duration {
    Duration::from_secs(self.maintain_interval_secs)
  }

  pub fn rapidfire_sleep(&self) -> Duration {
    Duration::from_secs(self.rapidfire_sleep_secs)
  }

  pub fn queue_update_interval(&self) -> Duration {
    Duration::from_secs(self.queue_update_interval_secs)
  }

  pub fn reservation_expiration(&self) -> Duration {
    Duration::from_secs(self.reservation_expiration_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let timings = Timings::default();
    assert_eq!(timings.ping_interval(), Duration::from_secs(3600));
    assert_eq!(timings.run_expiration(), Duration::from_secs(4 * 3600));
    assert_eq!(timings.reservation_expiration(), Duration::from_secs(14 * 24 * 3600));
  }

  #[test]
  fn test_run_expiration_follows_ping_interval() {
    let timings: Timings = serde_yaml::from_str("ping_interval_secs: 1").unwrap();
    assert_eq!(timings.run_expiration(), Duration::from_secs(4));
    assert_eq!(timings.maintain_interval(), Duration::from_secs(120));

    let explicit: Timings = serde_yaml::from_str("ping_interval_secs: 1\nrun_expiration_secs: 10").unwrap();
    assert_eq!(explicit.run_expiration(), Duration::from_secs(10));
  }
}
