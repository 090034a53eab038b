//! Weighted top-crash ranking.
//!
//! Every record that survives bucketing bumps its signature's unweighted count
//! by one and its weighted count by the summed weights of the buckets it
//! matched. The report compares both orderings and annotates each weighted
//! entry with how far reweighting moved it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::aggregate::WindowSink;
use crate::bucket::{BucketSet, WeightTable};
use crate::error::{EngineError, RecordParseError};
use crate::merge::Merge;
use crate::record::{self, Record};

pub const DEFAULT_TOP_N: usize = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketTally {
  pub weighted: f64,
  pub unweighted: u64,
}

impl Merge for BucketTally {
  fn merge(&mut self, other: Self) {
    self.weighted += other.weighted;
    self.unweighted += other.unweighted;
  }
}

/// Frequencies and last-seen metadata for one crash signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashEntry {
  pub signature: String,
  pub weighted_count: f64,
  pub unweighted_count: u64,
  pub last_seen: Option<DateTime<Utc>>,
  pub last_uuid: Option<String>,
  pub per_bucket: BTreeMap<String, BucketTally>,
}

impl CrashEntry {
  pub fn new(signature: &str) -> Self {
    Self {
      signature: signature.to_string(),
      weighted_count: 0.0,
      unweighted_count: 0,
      last_seen: None,
      last_uuid: None,
      per_bucket: BTreeMap::new(),
    }
  }

  /// Keeps the max by (timestamp, uuid), the same order `merge` uses, so the
  /// result does not depend on where units split the stream.
  fn observe(&mut self, ts: Option<DateTime<Utc>>, uuid: &str) {
    if ts.is_none() {
      return;
    }
    if (ts, Some(uuid)) > (self.last_seen, self.last_uuid.as_deref()) {
      self.last_seen = ts;
      self.last_uuid = Some(uuid.to_string());
    }
  }
}

impl Merge for CrashEntry {
  fn merge(&mut self, other: Self) {
    self.weighted_count += other.weighted_count;
    self.unweighted_count += other.unweighted_count;
    Merge::merge(&mut self.per_bucket, other.per_bucket);
    // Max by (timestamp, uuid): independent of which partial arrives first.
    let newer = (other.last_seen, other.last_uuid.as_deref())
      > (self.last_seen, self.last_uuid.as_deref());
    if newer {
      self.last_seen = other.last_seen;
      self.last_uuid = other.last_uuid;
    }
  }
}

/// Crash entries keyed by signature.
pub type CrashTable = BTreeMap<String, CrashEntry>;

/// Accumulates a `CrashTable` from classified records.
#[derive(Debug, Clone)]
pub struct WeightedRanker {
  names: Vec<String>,
  weights: Vec<f64>,
  channel: Option<String>,
  table: CrashTable,
  skipped: u64,
}

impl WeightedRanker {
  pub fn new(buckets: &BucketSet, weights: &WeightTable) -> Self {
    Self {
      names: buckets.names().map(str::to_string).collect(),
      weights: buckets.iter().map(|b| weights.weight_of(b)).collect(),
      channel: None,
      table: CrashTable::new(),
      skipped: 0,
    }
  }

  /// Only rank records from `channel`.
  pub fn for_channel(mut self, channel: Option<String>) -> Self {
    self.channel = channel;
    self
  }

  /// Fold one record given the indices of the buckets it matched.
  pub fn record(&mut self, record: &Record, matched: &[usize]) {
    let bucketed = !self.names.is_empty();
    if bucketed && matched.is_empty() {
      return;
    }
    let (signature, uuid) = match required_fields(record) {
      Ok(fields) => fields,
      Err(e) => {
        self.skipped += 1;
        tracing::warn!(error = %e, "skipping record in ranking");
        return;
      }
    };

    let weight: f64 = if bucketed {
      matched.iter().filter_map(|&i| self.weights.get(i)).sum()
    } else {
      1.0
    };

    let entry = self
      .table
      .entry(signature.to_string())
      .or_insert_with(|| CrashEntry::new(signature));
    entry.unweighted_count += 1;
    entry.weighted_count += weight;
    entry.observe(record.crash_time(), uuid);
    for &i in matched {
      if let (Some(name), Some(&w)) = (self.names.get(i), self.weights.get(i)) {
        let tally = entry.per_bucket.entry(name.clone()).or_default();
        tally.weighted += w;
        tally.unweighted += 1;
      }
    }
  }

  pub fn skipped(&self) -> u64 {
    self.skipped
  }

  pub fn into_table(self) -> CrashTable {
    self.table
  }
}

fn required_fields(record: &Record) -> Result<(&str, &str), RecordParseError> {
  let signature = record
    .signature()
    .ok_or_else(|| RecordParseError::new(record::SIGNATURE, "missing"))?;
  let uuid = record
    .uuid()
    .ok_or_else(|| RecordParseError::new(record::UUID, "missing"))?;
  Ok((signature, uuid))
}

impl WindowSink for WeightedRanker {
  fn absorb(&mut self, _buckets: &BucketSet, record: &Record, channel: &str, matched: &[usize]) {
    if self.channel.as_deref().map_or(true, |c| c == channel) {
      self.record(record, matched);
    }
  }
}

/// One line of the weighted top-N listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedCrash {
  pub rank: usize,
  pub signature: String,
  pub weighted_count: f64,
  pub unweighted_count: u64,
  pub unweighted_rank: usize,
  /// `rank - unweighted_rank`: negative when reweighting promoted the signature.
  pub rank_shift: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_seen: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_uuid: Option<String>,
  pub per_bucket: BTreeMap<String, BucketTally>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopCrashReport {
  pub total_signatures: usize,
  pub crashes: Vec<RankedCrash>,
}

/// Rank by weighted count (descending, ties by signature) and annotate each
/// of the first `top_n` with its position in the unweighted ordering.
pub fn top_crashes(table: &CrashTable, top_n: usize) -> Result<TopCrashReport, EngineError> {
  let mut unweighted: Vec<&CrashEntry> = table.values().filter(|e| e.unweighted_count > 0).collect();
  unweighted.sort_by(|a, b| {
    b.unweighted_count
      .cmp(&a.unweighted_count)
      .then_with(|| a.signature.cmp(&b.signature))
  });
  let unweighted_index: HashMap<&str, usize> = unweighted
    .iter()
    .enumerate()
    .map(|(i, e)| (e.signature.as_str(), i))
    .collect();

  let mut weighted: Vec<&CrashEntry> = table.values().collect();
  weighted.sort_by(|a, b| by_weight_desc(a, b));

  let crashes = weighted
    .into_iter()
    .take(top_n)
    .enumerate()
    .map(|(rank, entry)| -> Result<RankedCrash, EngineError> {
      let unweighted_rank = *unweighted_index
        .get(entry.signature.as_str())
        .ok_or_else(|| EngineError::RankInconsistency(entry.signature.clone()))?;
      Ok(RankedCrash {
        rank,
        signature: entry.signature.clone(),
        weighted_count: entry.weighted_count,
        unweighted_count: entry.unweighted_count,
        unweighted_rank,
        rank_shift: rank as i64 - unweighted_rank as i64,
        last_seen: entry.last_seen,
        last_uuid: entry.last_uuid.clone(),
        per_bucket: entry.per_bucket.clone(),
      })
    })
    .collect::<Result<Vec<_>, EngineError>>()?;

  Ok(TopCrashReport {
    total_signatures: table.len(),
    crashes,
  })
}

fn by_weight_desc(a: &CrashEntry, b: &CrashEntry) -> Ordering {
  b.weighted_count
    .total_cmp(&a.weighted_count)
    .then_with(|| a.signature.cmp(&b.signature))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn ts(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 1, 1, hour, 0, 0).unwrap()
  }

  fn crash(sig: &str, uuid: &str, os: &str, hour: u32) -> Record {
    Record::new()
      .with("channel", "release")
      .with("signature", sig)
      .with("uuid", uuid)
      .with("os", os)
      .with("crash_time", ts(hour))
  }

  fn buckets() -> BucketSet {
    BucketSet::from_json(
      r#"[{"name":"A","query":{"os":"a"}},{"name":"B","query":{"os":"b"}},{"name":"AB","query":{"os":{"$nin":["c"]}}}]"#,
    )
    .unwrap()
  }

  #[test]
  fn weighted_count_sums_matched_bucket_weights() {
    let set = buckets();
    let table = WeightTable::from_json(r#"[{"name":"A","weight":2},{"name":"AB","weight":0.5}]"#).unwrap();
    let mut ranker = WeightedRanker::new(&set, &table);
    ranker.record(&crash("S", "u1", "a", 1), &[0, 2]);
    let entry = &ranker.into_table()["S"];
    assert_eq!(entry.unweighted_count, 1);
    assert_eq!(entry.weighted_count, 2.5);
    assert_eq!(entry.per_bucket["A"], BucketTally { weighted: 2.0, unweighted: 1 });
    assert_eq!(entry.per_bucket["AB"], BucketTally { weighted: 0.5, unweighted: 1 });
  }

  #[test]
  fn unmatched_records_are_excluded_when_bucketed() {
    let set = buckets();
    let mut ranker = WeightedRanker::new(&set, &WeightTable::new());
    ranker.record(&crash("S", "u1", "c", 1), &[]);
    assert!(ranker.into_table().is_empty());
  }

  #[test]
  fn no_buckets_means_unit_weight() {
    let mut ranker = WeightedRanker::new(&BucketSet::default(), &WeightTable::new());
    ranker.record(&crash("S", "u1", "c", 1), &[]);
    ranker.record(&crash("S", "u2", "c", 2), &[]);
    let entry = &ranker.into_table()["S"];
    assert_eq!(entry.unweighted_count, 2);
    assert_eq!(entry.weighted_count, 2.0);
  }

  #[test]
  fn last_seen_keeps_latest_and_ties_take_larger_uuid() {
    let mut ranker = WeightedRanker::new(&BucketSet::default(), &WeightTable::new());
    ranker.record(&crash("S", "u1", "a", 5), &[]);
    ranker.record(&crash("S", "u2", "a", 3), &[]);
    ranker.record(&crash("S", "u3", "a", 5), &[]);
    let entry = &ranker.into_table()["S"];
    assert_eq!(entry.last_seen, Some(ts(5)));
    assert_eq!(entry.last_uuid.as_deref(), Some("u3"));
  }

  #[test]
  fn records_missing_signature_are_skipped() {
    let mut ranker = WeightedRanker::new(&BucketSet::default(), &WeightTable::new());
    ranker.record(&Record::new().with("uuid", "u1"), &[]);
    assert_eq!(ranker.skipped(), 1);
    assert!(ranker.into_table().is_empty());
  }

  #[test]
  fn merge_last_seen_is_commutative() {
    let mut a = CrashEntry::new("S");
    a.unweighted_count = 1;
    a.observe(Some(ts(4)), "ua");
    let mut b = CrashEntry::new("S");
    b.unweighted_count = 2;
    b.observe(Some(ts(4)), "ub");

    let mut ab = a.clone();
    ab.merge(b.clone());
    let mut ba = b;
    ba.merge(a);
    assert_eq!(ab, ba);
    assert_eq!(ab.unweighted_count, 3);
    assert_eq!(ab.last_uuid.as_deref(), Some("ub"));
  }

  #[test]
  fn timestamp_tie_in_stream_agrees_with_merge() {
    let mut stream = CrashEntry::new("S");
    stream.observe(Some(ts(4)), "ub");
    stream.observe(Some(ts(4)), "ua");
    stream.observe(None, "uz");

    let mut first = CrashEntry::new("S");
    first.observe(Some(ts(4)), "ub");
    let mut second = CrashEntry::new("S");
    second.observe(Some(ts(4)), "ua");
    second.merge(first);

    assert_eq!(stream.last_uuid.as_deref(), Some("ub"));
    assert_eq!(second.last_uuid, stream.last_uuid);
    assert_eq!(second.last_seen, stream.last_seen);
  }

  #[test]
  fn reweighting_swaps_order_with_rank_shift() {
    let set = BucketSet::from_json(r#"[{"name":"One","query":{"os":"a"}},{"name":"Two","query":{"os":"b"}}]"#)
      .unwrap();
    let table = WeightTable::from_json(r#"[{"name":"Two","weight":2}]"#).unwrap();
    let mut ranker = WeightedRanker::new(&set, &table);
    for i in 0..10 {
      ranker.record(&crash("S1", &format!("a{}", i), "a", 1), &[0]);
    }
    for i in 0..8 {
      ranker.record(&crash("S2", &format!("b{}", i), "b", 1), &[1]);
    }

    let report = top_crashes(&ranker.into_table(), DEFAULT_TOP_N).unwrap();
    assert_eq!(report.total_signatures, 2);
    let s2 = &report.crashes[0];
    let s1 = &report.crashes[1];
    assert_eq!(s2.signature, "S2");
    assert_eq!(s2.weighted_count, 16.0);
    assert_eq!(s2.rank_shift, -1);
    assert_eq!(s1.signature, "S1");
    assert_eq!(s1.rank_shift, 1);
  }

  #[test]
  fn top_n_truncates() {
    let mut ranker = WeightedRanker::new(&BucketSet::default(), &WeightTable::new());
    for (i, sig) in ["a", "b", "c", "d"].iter().enumerate() {
      for n in 0..=i {
        ranker.record(&crash(sig, &format!("{}{}", sig, n), "x", 1), &[]);
      }
    }
    let report = top_crashes(&ranker.into_table(), 2).unwrap();
    let sigs: Vec<&str> = report.crashes.iter().map(|c| c.signature.as_str()).collect();
    assert_eq!(sigs, vec!["d", "c"]);
    assert!(report.crashes.iter().all(|c| c.rank_shift == 0));
  }

  #[test]
  fn weighted_entry_without_unweighted_count_is_an_error() {
    let mut table = CrashTable::new();
    let mut ghost = CrashEntry::new("ghost");
    ghost.weighted_count = 3.0;
    table.insert("ghost".into(), ghost);
    let err = top_crashes(&table, 5).unwrap_err();
    assert!(matches!(err, EngineError::RankInconsistency(ref s) if s == "ghost"));
  }
}
