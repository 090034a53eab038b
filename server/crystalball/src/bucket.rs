//! Buckets (named predicates), bucket sets and weight tables.
//!
//! Both a `BucketSet` and a `WeightTable` are built once per run and are
//! read-only afterwards; workers receive them behind an `Arc`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

use crate::error::EngineError;
use crate::matcher::Predicate;
use crate::record::Record;

pub const INTEL: i64 = 0x8086;
pub const NVIDIA: i64 = 0x10de;

/// Bucket definition as it appears in a bucket config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketDef {
  pub name: String,
  pub query: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub weight: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Bucket {
  pub name: String,
  pub predicate: Predicate,
  /// Default weight when no weight table overrides it.
  pub weight: f64,
  query: Value,
}

impl Bucket {
  pub fn compile(def: &BucketDef) -> Result<Self, EngineError> {
    if def.name.is_empty() {
      return Err(EngineError::config("bucket name must not be empty"));
    }
    let predicate = Predicate::compile(&def.query)
      .map_err(|e| EngineError::config(format!("bucket {:?}: {}", def.name, e)))?;
    let weight = def.weight.unwrap_or(1.0);
    check_weight(&def.name, weight)?;
    Ok(Self {
      name: def.name.clone(),
      predicate,
      weight,
      query: def.query.clone(),
    })
  }

  pub fn matches(&self, record: &Record) -> bool {
    self.predicate.matches(record)
  }
}

/// Ordered set of buckets with unique names. Buckets may overlap.
#[derive(Debug, Clone, Default)]
pub struct BucketSet {
  buckets: Vec<Bucket>,
}

impl BucketSet {
  pub fn compile(defs: &[BucketDef]) -> Result<Self, EngineError> {
    let mut seen = HashSet::new();
    let mut buckets = Vec::with_capacity(defs.len());
    for def in defs {
      if !seen.insert(def.name.as_str()) {
        return Err(EngineError::config(format!("duplicate bucket name {:?}", def.name)));
      }
      buckets.push(Bucket::compile(def)?);
    }
    Ok(Self { buckets })
  }

  pub fn from_json(json: &str) -> Result<Self, EngineError> {
    let defs: Vec<BucketDef> = serde_json::from_str(json)
      .map_err(|e| EngineError::config(format!("bucket config: {}", e)))?;
    Self::compile(&defs)
  }

  /// The platform/GPU buckets the crash dashboards started with.
  pub fn default_gpu_buckets() -> Self {
    let defs = vec![
      def("Linux", json!({"platform": "Linux"})),
      def(
        "Windows, Single Intel GPU",
        json!({"platform": "Windows NT", "gpu0_vendor": INTEL, "gpu_count": 1}),
      ),
      def(
        "Windows, Single NVIDIA GPU",
        json!({"platform": "Windows NT", "gpu0_vendor": NVIDIA, "gpu_count": 1}),
      ),
      def(
        "Windows, Intel + NVIDIA GPU",
        json!({"platform": "Windows NT", "gpu0_vendor": INTEL, "gpu1_vendor": NVIDIA, "gpu_count": 2}),
      ),
    ];
    // Static definitions; compile cannot fail on them.
    Self::compile(&defs).unwrap_or_default()
  }

  pub fn len(&self) -> usize {
    self.buckets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buckets.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
    self.buckets.iter()
  }

  pub fn get(&self, index: usize) -> Option<&Bucket> {
    self.buckets.get(index)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.buckets.iter().map(|b| b.name.as_str())
  }

  pub fn contains(&self, name: &str) -> bool {
    self.buckets.iter().any(|b| b.name == name)
  }

  /// Stable hex digest of names, queries and weights. Two workers configured
  /// with the same set report the same fingerprint.
  pub fn fingerprint(&self) -> String {
    let mut hasher = blake3::Hasher::new();
    for bucket in &self.buckets {
      hasher.update(bucket.name.as_bytes());
      hasher.update(b"|");
      hasher.update(bucket.query.to_string().as_bytes());
      hasher.update(b"|");
      hasher.update(&bucket.weight.to_le_bytes());
      hasher.update(b"\n");
    }
    let hex = hasher.finalize().to_hex();
    hex[..32].to_string()
  }
}

fn def(name: &str, query: Value) -> BucketDef {
  BucketDef {
    name: name.to_string(),
    query,
    weight: None,
  }
}

fn check_weight(name: &str, weight: f64) -> Result<(), EngineError> {
  if weight.is_finite() && weight > 0.0 {
    Ok(())
  } else {
    Err(EngineError::config(format!(
      "bucket {:?}: weight must be finite and > 0, got {}",
      name, weight
    )))
  }
}

/// One entry of a weight file: `[{"name": .., "weight": ..}]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketWeight {
  pub name: String,
  pub weight: f64,
}

/// Per-bucket reweighting factors. An empty table is a no-op.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightTable {
  weights: BTreeMap<String, f64>,
}

impl WeightTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_entries(entries: Vec<BucketWeight>) -> Result<Self, EngineError> {
    let mut weights = BTreeMap::new();
    for entry in entries {
      check_weight(&entry.name, entry.weight)?;
      if weights.insert(entry.name.clone(), entry.weight).is_some() {
        return Err(EngineError::config(format!("duplicate weight for {:?}", entry.name)));
      }
    }
    Ok(Self { weights })
  }

  pub fn from_json(json: &str) -> Result<Self, EngineError> {
    let entries: Vec<BucketWeight> = serde_json::from_str(json)
      .map_err(|e| EngineError::config(format!("weight file: {}", e)))?;
    Self::from_entries(entries)
  }

  pub fn to_entries(&self) -> Vec<BucketWeight> {
    self
      .weights
      .iter()
      .map(|(name, weight)| BucketWeight {
        name: name.clone(),
        weight: *weight,
      })
      .collect()
  }

  pub(crate) fn insert(&mut self, name: &str, weight: f64) -> Result<(), EngineError> {
    check_weight(name, weight)?;
    self.weights.insert(name.to_string(), weight);
    Ok(())
  }

  pub fn get(&self, name: &str) -> Option<f64> {
    self.weights.get(name).copied()
  }

  pub fn len(&self) -> usize {
    self.weights.len()
  }

  pub fn is_empty(&self) -> bool {
    self.weights.is_empty()
  }

  /// Every weighted bucket must exist in `buckets`.
  pub fn check_against(&self, buckets: &BucketSet) -> Result<(), EngineError> {
    match self.weights.keys().find(|name| !buckets.contains(name)) {
      Some(name) => Err(EngineError::schema_mismatch(format!(
        "weight table names bucket {:?} which is not configured",
        name
      ))),
      None => Ok(()),
    }
  }

  /// Effective weight of `bucket`: the table entry, else the bucket's own default.
  pub fn weight_of(&self, bucket: &Bucket) -> f64 {
    self.get(&bucket.name).unwrap_or(bucket.weight)
  }
}
