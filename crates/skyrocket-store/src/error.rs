use thiserror::Error;

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  #[error("already exists: {0}")]
  AlreadyExists(String),

  /// The document changed since it was read.
  #[error("workflow {wf_id} was modified concurrently (expected version {expected})")]
  ConcurrentConflict { wf_id: String, expected: i64 },

  /// The backend is unavailable.
  #[error("backend unavailable: {0}")]
  Backend(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A stored value could not be decoded.
  #[error("corrupt record: {0}")]
  Corrupt(String),
}

impl StoreError {
  /// Whether retrying the same call may succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      StoreError::Backend(_) => true,
      StoreError::Database(e) => match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        // SQLITE_BUSY and SQLITE_LOCKED
        sqlx::Error::Database(db) => db.code().is_some_and(|code| code == "5" || code == "6"),
        _ => false,
      },
      _ => false,
    }
  }
}
