//! Weight engine: derive per-bucket reweighting factors that project one
//! channel's bucket distribution onto another's.

use std::collections::BTreeMap;

use crate::bucket::WeightTable;
use crate::error::EngineError;

/// Substituted when either side never matched a bucket, so the weight is
/// neither zero nor infinite.
pub const DEFAULT_WEIGHT_EPSILON: f64 = 0.0001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
  pub count: u64,
  pub percent_matched: f64,
}

/// Bucket counts of one channel taken from a previously produced report.
pub type Snapshot = BTreeMap<String, BucketSnapshot>;

/// `weight = from.percentMatched / to.percentMatched` for every bucket of `to`.
///
/// Fails with `SchemaMismatch` as soon as a `to` bucket is missing from `from`,
/// and with `Config` when `epsilon` is not finite and > 0.
pub fn compute_weights(
  from: &Snapshot,
  to: &Snapshot,
  epsilon: f64,
) -> Result<WeightTable, EngineError> {
  if !(epsilon.is_finite() && epsilon > 0.0) {
    return Err(EngineError::config(format!(
      "weight epsilon must be finite and > 0, got {}",
      epsilon
    )));
  }
  let mut table = WeightTable::new();
  for (name, target) in to {
    let source = from.get(name).ok_or_else(|| {
      EngineError::schema_mismatch(format!("bucket {:?} missing from source snapshot", name))
    })?;
    let weight = bucket_weight(source.percent_matched, target.percent_matched, epsilon);
    tracing::debug!(bucket = %name, weight, "computed bucket weight");
    table.insert(name, weight)?;
  }
  Ok(table)
}

fn bucket_weight(from: f64, to: f64, epsilon: f64) -> f64 {
  if from == 0.0 || to == 0.0 {
    return epsilon;
  }
  let weight = from / to;
  if weight.is_finite() && weight > 0.0 {
    weight
  } else {
    epsilon
  }
}
