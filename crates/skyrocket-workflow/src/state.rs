use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by fireworks and launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
  Archived,
  Fizzled,
  Defused,
  Paused,
  Waiting,
  Ready,
  Reserved,
  Running,
  Completed,
}

impl State {
  pub const ALL: [State; 9] = [
    State::Archived,
    State::Fizzled,
    State::Defused,
    State::Paused,
    State::Waiting,
    State::Ready,
    State::Reserved,
    State::Running,
    State::Completed,
  ];

  /// Rank used to pick representative launches and roll up workflow state.
  pub fn rank(self) -> i8 {
    match self {
      State::Archived => -2,
      State::Fizzled => -1,
      State::Defused | State::Paused => 0,
      State::Waiting => 1,
      State::Ready => 2,
      State::Reserved => 3,
      State::Running => 4,
      State::Completed => 5,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      State::Archived => "ARCHIVED",
      State::Fizzled => "FIZZLED",
      State::Defused => "DEFUSED",
      State::Paused => "PAUSED",
      State::Waiting => "WAITING",
      State::Ready => "READY",
      State::Reserved => "RESERVED",
      State::Running => "RUNNING",
      State::Completed => "COMPLETED",
    }
  }

  /// RUNNING or RESERVED: a launch currently holds the firework.
  pub fn is_active(self) -> bool {
    matches!(self, State::Running | State::Reserved)
  }

  /// COMPLETED or FIZZLED: the launch has ended.
  pub fn is_finished(self) -> bool {
    matches!(self, State::Completed | State::Fizzled)
  }
}

impl fmt::Display for State {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown state: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for State {
  type Err = ParseStateError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    State::ALL
      .into_iter()
      .find(|state| state.as_str().eq_ignore_ascii_case(s))
      .ok_or_else(|| ParseStateError(s.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ranks_order_the_lifecycle() {
    assert!(State::Archived.rank() < State::Fizzled.rank());
    assert_eq!(State::Defused.rank(), State::Paused.rank());
    assert!(State::Waiting.rank() < State::Ready.rank());
    assert!(State::Running.rank() < State::Completed.rank());
  }

  #[test]
  fn test_parse_and_serialize() {
    assert_eq!("reserved".parse::<State>().unwrap(), State::Reserved);
    assert!("LAUNCHED".parse::<State>().is_err());
    assert_eq!(serde_json::to_string(&State::Fizzled).unwrap(), "\"FIZZLED\"");
    for state in State::ALL {
      assert_eq!(state.to_string().parse::<State>().unwrap(), state);
    }
  }
}
