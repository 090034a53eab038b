//! Per-channel bucket count reports (JSON) and update-mode merging.
//!
//! ```json
//! { "release": { "totalCount": 3, "matchedCount": 3,
//!   "buckets": [ { "name": "Linux", "count": 2, "percent": 0.66, "percentMatched": 0.66 } ] } }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::aggregate::{ChannelAggregate, ChannelAggregates};
use crate::bucket::BucketSet;
use crate::error::EngineError;
use crate::merge::Merge;
use crate::weight::{BucketSnapshot, Snapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketReport {
  pub name: String,
  pub count: u64,
  /// Share of all records in the channel.
  #[serde(default, deserialize_with = "null_as_zero")]
  pub percent: f64,
  /// Share of all bucket hits in the channel.
  #[serde(default, deserialize_with = "null_as_zero")]
  pub percent_matched: f64,
}

/// Older reports wrote `null` where a ratio divided by zero.
fn null_as_zero<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
  Ok(Option::<f64>::deserialize(d)?.unwrap_or(0.0))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelReport {
  pub total_count: u64,
  pub matched_count: u64,
  pub buckets: Vec<BucketReport>,
}

impl ChannelReport {
  /// Buckets are listed in `order`; names not in `order` follow alphabetically.
  pub fn from_aggregate(agg: &ChannelAggregate, order: &[String]) -> Self {
    let mut names: Vec<&str> = order
      .iter()
      .map(String::as_str)
      .filter(|n| agg.bucket_counts.contains_key(*n))
      .collect();
    names.extend(
      agg
        .bucket_counts
        .keys()
        .map(String::as_str)
        .filter(|n| !order.iter().any(|o| o == n)),
    );

    let buckets = names
      .into_iter()
      .map(|name| {
        let count = agg.bucket_count(name);
        BucketReport {
          name: name.to_string(),
          count,
          percent: ratio(count, agg.total_count),
          percent_matched: ratio(count, agg.matched_count),
        }
      })
      .collect();

    Self {
      total_count: agg.total_count,
      matched_count: agg.matched_count,
      buckets,
    }
  }

  pub fn to_aggregate(&self) -> ChannelAggregate {
    ChannelAggregate {
      total_count: self.total_count,
      matched_count: self.matched_count,
      bucket_counts: self.buckets.iter().map(|b| (b.name.clone(), b.count)).collect(),
    }
  }

  pub fn bucket_names(&self) -> BTreeSet<&str> {
    self.buckets.iter().map(|b| b.name.as_str()).collect()
  }

  pub fn bucket(&self, name: &str) -> Option<&BucketReport> {
    self.buckets.iter().find(|b| b.name == name)
  }

  pub fn snapshot(&self) -> Snapshot {
    self
      .buckets
      .iter()
      .map(|b| {
        (
          b.name.clone(),
          BucketSnapshot {
            count: b.count,
            percent_matched: b.percent_matched,
          },
        )
      })
      .collect()
  }

  fn order(&self) -> Vec<String> {
    self.buckets.iter().map(|b| b.name.clone()).collect()
  }
}

fn ratio(count: u64, of: u64) -> f64 {
  if of == 0 {
    0.0
  } else {
    count as f64 / of as f64
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Report {
  pub channels: BTreeMap<String, ChannelReport>,
}

impl Report {
  pub fn from_aggregates(aggregates: &ChannelAggregates, buckets: &BucketSet) -> Self {
    let order: Vec<String> = buckets.names().map(str::to_string).collect();
    Self::ordered(aggregates, &order)
  }

  fn ordered(aggregates: &ChannelAggregates, order: &[String]) -> Self {
    Self {
      channels: aggregates
        .iter()
        .map(|(channel, agg)| (channel.clone(), ChannelReport::from_aggregate(agg, order)))
        .collect(),
    }
  }

  pub fn to_aggregates(&self) -> ChannelAggregates {
    self
      .channels
      .iter()
      .map(|(channel, r)| (channel.clone(), r.to_aggregate()))
      .collect()
  }

  pub fn channel(&self, name: &str) -> Option<&ChannelReport> {
    self.channels.get(name)
  }

  /// Bucket snapshot of one channel, for the weight engine.
  pub fn snapshot(&self, channel: &str) -> Result<Snapshot, EngineError> {
    self
      .channel(channel)
      .map(ChannelReport::snapshot)
      .ok_or_else(|| EngineError::schema_mismatch(format!("channel {:?} not in report", channel)))
  }

  /// Add these counts to `old`, recomputing the ratios.
  ///
  /// Every channel of both reports must carry the same bucket names, and every
  /// channel of `self` must already exist in `old`; anything else is a
  /// `SchemaMismatch` and nothing is merged. Channels only in `old` are kept
  /// as they are.
  pub fn update(&self, old: &Report) -> Result<Report, EngineError> {
    if let Some(channel) = self.channels.keys().find(|c| !old.channels.contains_key(*c)) {
      return Err(EngineError::schema_mismatch(format!(
        "channel {:?} is not in the existing report",
        channel
      )));
    }

    let mut all = self.channels.iter().chain(old.channels.iter());
    if let Some((first_channel, first)) = all.next() {
      let reference = first.bucket_names();
      for (channel, report) in all {
        let names = report.bucket_names();
        if names != reference {
          let missing: Vec<&&str> = reference.symmetric_difference(&names).collect();
          return Err(EngineError::schema_mismatch(format!(
            "bucket names of channel {:?} differ from channel {:?}: {:?}",
            channel, first_channel, missing
          )));
        }
      }
    }

    let order = self
      .channels
      .values()
      .chain(old.channels.values())
      .next()
      .map(ChannelReport::order)
      .unwrap_or_default();

    let mut merged = old.to_aggregates();
    Merge::merge(&mut merged, self.to_aggregates());
    Ok(Self::ordered(&merged, &order))
  }

  pub fn load(path: &Path) -> Result<Self, EngineError> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
  }

  /// Write to a sibling temp file, then rename over `path`.
  pub fn write(&self, path: &Path) -> Result<(), EngineError> {
    let tmp = path.with_extension("tmp");
    {
      let mut out = BufWriter::new(fs::File::create(&tmp)?);
      serde_json::to_writer_pretty(&mut out, self)?;
      out.write_all(b"\n")?;
      out.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
  }

  /// Merge into the report at `path` (if it exists) and write the result.
  /// On a schema mismatch the existing file is left untouched.
  pub fn update_file(&self, path: &Path) -> Result<Report, EngineError> {
    let merged = if path.exists() {
      self.update(&Report::load(path)?)?
    } else {
      tracing::warn!(path = %path.display(), "no existing report to update, writing fresh");
      self.clone()
    };
    merged.write(path)?;
    Ok(merged)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn agg(total: u64, matched: u64, counts: &[(&str, u64)]) -> ChannelAggregate {
    ChannelAggregate {
      total_count: total,
      matched_count: matched,
      bucket_counts: counts.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
    }
  }

  fn report(channel: &str, a: ChannelAggregate) -> Report {
    let order = vec!["A".to_string(), "B".to_string(), "C".to_string()];
    Report::ordered(&BTreeMap::from([(channel.to_string(), a)]), &order)
  }

  #[test]
  fn ratios_use_total_and_matched() {
    let r = report("release", agg(10, 4, &[("A", 3), ("B", 2)]));
    let a = r.channel("release").unwrap().bucket("A").unwrap();
    assert_eq!(a.percent, 0.3);
    assert_eq!(a.percent_matched, 0.75);
  }

  #[test]
  fn empty_channel_has_zero_ratios() {
    let r = report("release", agg(0, 0, &[("A", 0)]));
    let a = r.channel("release").unwrap().bucket("A").unwrap();
    assert_eq!(a.percent, 0.0);
    assert_eq!(a.percent_matched, 0.0);
  }

  #[test]
  fn json_shape_is_camel_case() {
    let r = report("release", agg(2, 1, &[("A", 1)]));
    let v = serde_json::to_value(&r).unwrap();
    assert_eq!(v["release"]["totalCount"], 2);
    assert_eq!(v["release"]["buckets"][0]["percentMatched"], 1.0);
  }

  #[test]
  fn null_ratios_load_as_zero() {
    let r: Report = serde_json::from_str(
      r#"{"beta":{"totalCount":0,"matchedCount":0,"buckets":[{"name":"A","count":0,"percent":null,"percentMatched":null}]}}"#,
    )
    .unwrap();
    assert_eq!(r.channel("beta").unwrap().buckets[0].percent_matched, 0.0);
  }

  #[test]
  fn update_sums_counts() {
    let old = report("release", agg(10, 5, &[("A", 3), ("B", 2)]));
    let new = report("release", agg(6, 3, &[("A", 1), ("B", 2)]));
    let merged = new.update(&old).unwrap();
    let ch = merged.channel("release").unwrap();
    assert_eq!(ch.total_count, 16);
    assert_eq!(ch.matched_count, 8);
    assert_eq!(ch.bucket("A").unwrap().count, 4);
    assert_eq!(ch.bucket("B").unwrap().percent_matched, 0.5);
  }

  #[test]
  fn update_rejects_different_bucket_names() {
    let old = report("release", agg(10, 5, &[("A", 3), ("B", 2)]));
    let new = report("release", agg(6, 3, &[("A", 1), ("C", 2)]));
    let err = new.update(&old).unwrap_err();
    assert!(matches!(err, EngineError::SchemaMismatch(_)));
  }

  #[test]
  fn update_rejects_channel_missing_from_old_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    let old = report("release", agg(4, 2, &[("A", 2)]));
    old.write(&path).unwrap();
    let before = fs::read_to_string(&path).unwrap();

    let new = report("nightly", agg(6, 3, &[("A", 3)]));
    let err = new.update_file(&path).unwrap_err();
    assert!(matches!(err, EngineError::SchemaMismatch(_)));
    assert!(err.to_string().contains("nightly"));
    assert_eq!(fs::read_to_string(&path).unwrap(), before);
  }

  #[test]
  fn update_keeps_channels_only_in_old_report() {
    let mut old = report("beta", agg(4, 2, &[("A", 2)]));
    old.channels.extend(report("release", agg(1, 1, &[("A", 1)])).channels);
    let new = report("release", agg(6, 3, &[("A", 3)]));
    let merged = new.update(&old).unwrap();
    assert_eq!(merged.channels.len(), 2);
    assert_eq!(merged.channel("beta"), old.channel("beta"));
    assert_eq!(merged.channel("release").unwrap().total_count, 7);
  }

  #[test]
  fn snapshot_of_missing_channel_is_schema_mismatch() {
    let r = report("release", agg(1, 1, &[("A", 1)]));
    assert!(r.snapshot("release").is_ok());
    assert!(matches!(r.snapshot("nightly"), Err(EngineError::SchemaMismatch(_))));
  }
}
