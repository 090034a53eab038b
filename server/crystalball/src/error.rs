//! Structured error types for the crash bucketing engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  /// Missing, unreadable or invalid bucket/weight configuration. Fatal before dispatch.
  #[error("config: {0}")]
  Config(String),

  /// A bucket or channel name has no counterpart in the other dataset.
  #[error("schema mismatch: {0}")]
  SchemaMismatch(String),

  #[error(transparent)]
  RecordParse(#[from] RecordParseError),

  #[error("worker {worker}: {reason}")]
  WorkerFailure { worker: usize, reason: String },

  /// Weighted and unweighted frequency maps disagree on which signatures exist.
  #[error("rank inconsistency: signature {0:?} is ranked by weight but has no unweighted count")]
  RankInconsistency(String),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl EngineError {
  pub fn config(msg: impl Into<String>) -> Self {
    Self::Config(msg.into())
  }

  pub fn schema_mismatch(msg: impl Into<String>) -> Self {
    Self::SchemaMismatch(msg.into())
  }

  pub fn worker(worker: usize, reason: impl Into<String>) -> Self {
    Self::WorkerFailure {
      worker,
      reason: reason.into(),
    }
  }
}

/// One record failed field extraction. Logged and skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record parse: {field}: {reason}")]
pub struct RecordParseError {
  pub field: String,
  pub reason: String,
}

impl RecordParseError {
  pub fn new(field: &str, reason: impl Into<String>) -> Self {
    Self {
      field: field.to_string(),
      reason: reason.into(),
    }
  }
}
