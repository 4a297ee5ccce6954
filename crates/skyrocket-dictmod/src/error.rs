use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DictModError {
  #[error("{0} is not a supported action")]
  UnsupportedOperator(String),

  #[error("keyword {key} does not refer to an array")]
  NotAList { key: String },

  #[error("keyword {key} does not refer to a number")]
  NotANumber { key: String },

  #[error("path segment '{segment}' of {key} does not refer to a mapping")]
  NotAMapping { key: String, segment: String },

  #[error("keyword {key} does not exist")]
  MissingKey { key: String },

  #[error("cannot pop from empty array at {key}")]
  EmptyList { key: String },

  #[error("invalid pop direction {value} for {key}: expected 1 or -1")]
  InvalidPopDirection { key: String, value: String },

  #[error("settings for {op} must be a mapping")]
  InvalidSettings { op: String },

  #[error("rename target for {key} must be a string")]
  InvalidRenameTarget { key: String },
}
