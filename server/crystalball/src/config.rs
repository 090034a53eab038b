//! Run configuration with sane defaults, plus loaders for bucket and weight files.

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::aggregate::DEFAULT_BATCH_SIZE;
use crate::bucket::{BucketSet, WeightTable};
use crate::error::EngineError;
use crate::rank::DEFAULT_TOP_N;
use crate::weight::DEFAULT_WEIGHT_EPSILON;

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct Config {
  /// Records classified together per window.
  pub batch_size: usize,
  /// Weight substituted when a bucket never matched on either side.
  pub weight_epsilon: f64,
  /// Length of the ranked top-crash listing.
  pub top_n: usize,
  /// Worker threads; `None` uses the available parallelism.
  pub worker_count: Option<usize>,
  /// Longest wait for any partial result before the run fails. `None` waits forever.
  pub unit_timeout: Option<Duration>,
  /// Only rank crashes from this channel; `None` ranks all channels together.
  pub rank_channel: Option<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      batch_size: DEFAULT_BATCH_SIZE,
      weight_epsilon: DEFAULT_WEIGHT_EPSILON,
      top_n: DEFAULT_TOP_N,
      worker_count: None,
      unit_timeout: None,
      rank_channel: None,
    }
  }
}

impl Config {
  pub fn workers(&self) -> usize {
    self
      .worker_count
      .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
      .unwrap_or(1)
      .max(1)
  }
}

fn read_config_file(path: &Path, what: &str) -> Result<String, EngineError> {
  fs::read_to_string(path)
    .map_err(|e| EngineError::config(format!("{} {}: {}", what, path.display(), e)))
}

/// Load an ordered `[{name, query, weight?}]` bucket file.
pub fn load_buckets(path: &Path) -> Result<BucketSet, EngineError> {
  let json = read_config_file(path, "bucket file")?;
  BucketSet::from_json(&json)
}

/// Load a flat `[{name, weight}]` weight file.
pub fn load_weights(path: &Path) -> Result<WeightTable, EngineError> {
  let json = read_config_file(path, "weight file")?;
  WeightTable::from_json(&json)
}
