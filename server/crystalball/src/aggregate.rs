//! Windowed aggregation: records are buffered into fixed-size windows, each
//! full window is classified against every bucket, folded into the running
//! counters, then discarded. Peak memory is one window regardless of input size,
//! and the window size never changes the final counts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bucket::BucketSet;
use crate::merge::Merge;
use crate::record::Record;

pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Counters for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAggregate {
  pub total_count: u64,
  /// Bucket hits, summed over all buckets. With overlapping buckets this may
  /// exceed `total_count`; `percentMatched` ratios always sum to 1.
  pub matched_count: u64,
  /// Per-bucket matches. Buckets overlap, so the sum may exceed `total_count`.
  pub bucket_counts: BTreeMap<String, u64>,
}

impl ChannelAggregate {
  /// Zeroed counters with an entry for every bucket, so reports list
  /// never-matched buckets too.
  pub fn for_buckets(buckets: &BucketSet) -> Self {
    Self {
      total_count: 0,
      matched_count: 0,
      bucket_counts: buckets.names().map(|n| (n.to_string(), 0)).collect(),
    }
  }

  fn absorb(&mut self, buckets: &BucketSet, matched: &[usize]) {
    self.total_count += 1;
    self.matched_count += matched.len() as u64;
    for bucket in matched.iter().filter_map(|&i| buckets.get(i)) {
      *self.bucket_counts.entry(bucket.name.clone()).or_insert(0) += 1;
    }
  }

  pub fn bucket_count(&self, name: &str) -> u64 {
    self.bucket_counts.get(name).copied().unwrap_or(0)
  }
}

impl Merge for ChannelAggregate {
  fn merge(&mut self, other: Self) {
    self.total_count += other.total_count;
    self.matched_count += other.matched_count;
    Merge::merge(&mut self.bucket_counts, other.bucket_counts);
  }
}

/// Aggregates keyed by channel.
pub type ChannelAggregates = BTreeMap<String, ChannelAggregate>;

/// Receives every classified record of a window.
pub trait WindowSink {
  /// `matched` holds the indices (into `buckets`) of every bucket the record satisfied.
  fn absorb(&mut self, buckets: &BucketSet, record: &Record, channel: &str, matched: &[usize]);
}

impl WindowSink for ChannelAggregates {
  fn absorb(&mut self, buckets: &BucketSet, _record: &Record, channel: &str, matched: &[usize]) {
    self
      .entry(channel.to_string())
      .or_insert_with(|| ChannelAggregate::for_buckets(buckets))
      .absorb(buckets, matched);
  }
}

impl<A: WindowSink, B: WindowSink> WindowSink for (A, B) {
  fn absorb(&mut self, buckets: &BucketSet, record: &Record, channel: &str, matched: &[usize]) {
    self.0.absorb(buckets, record, channel, matched);
    self.1.absorb(buckets, record, channel, matched);
  }
}

/// Evaluate every bucket against a whole window, bucket by bucket.
/// Returns, per record, the indices of the buckets it matched.
pub fn classify(buckets: &BucketSet, window: &[Record]) -> Vec<Vec<usize>> {
  let mut matches = vec![Vec::new(); window.len()];
  for (index, bucket) in buckets.iter().enumerate() {
    for (record, hits) in window.iter().zip(matches.iter_mut()) {
      if bucket.matches(record) {
        hits.push(index);
      }
    }
  }
  matches
}

/// Ingestion counters for one aggregation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
  pub accepted: u64,
  /// Records without a channel.
  pub dropped: u64,
  pub windows: u64,
}

pub struct WindowedAggregator<'a, S> {
  buckets: &'a BucketSet,
  batch_size: usize,
  window: Vec<Record>,
  sink: S,
  stats: WindowStats,
}

impl<'a, S: WindowSink> WindowedAggregator<'a, S> {
  pub fn new(buckets: &'a BucketSet, batch_size: usize, sink: S) -> Self {
    let batch_size = batch_size.max(1);
    Self {
      buckets,
      batch_size,
      window: Vec::with_capacity(batch_size.min(DEFAULT_BATCH_SIZE)),
      sink,
      stats: WindowStats::default(),
    }
  }

  pub fn push(&mut self, record: Record) {
    if record.channel().is_none() {
      // Very old clients never reported a channel.
      self.stats.dropped += 1;
      tracing::trace!(uuid = record.uuid().unwrap_or(""), "dropping record without channel");
      return;
    }
    self.stats.accepted += 1;
    self.window.push(record);
    if self.window.len() >= self.batch_size {
      self.flush();
    }
  }

  fn flush(&mut self) {
    if self.window.is_empty() {
      return;
    }
    let matches = classify(self.buckets, &self.window);
    for (record, matched) in self.window.iter().zip(matches.iter()) {
      if let Some(channel) = record.channel() {
        self.sink.absorb(self.buckets, record, channel, matched);
      }
    }
    self.stats.windows += 1;
    tracing::trace!(records = self.window.len(), "window flushed");
    self.window.clear();
  }

  /// Flush the trailing partial window and hand back the sink.
  pub fn finish(mut self) -> (S, WindowStats) {
    self.flush();
    (self.sink, self.stats)
  }
}

/// Aggregate a record stream into per-channel counters.
pub fn ingest(
  records: impl IntoIterator<Item = Record>,
  buckets: &BucketSet,
  batch_size: usize,
) -> ChannelAggregates {
  let mut agg = WindowedAggregator::new(buckets, batch_size, ChannelAggregates::new());
  for record in records {
    agg.push(record);
  }
  agg.finish().0
}
