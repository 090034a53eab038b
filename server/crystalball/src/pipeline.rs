//! Per-unit local pipeline: classify, count and rank one unit's records into a
//! fresh `UnitResult` that the controller later merges.

use crate::aggregate::{ChannelAggregates, WindowedAggregator};
use crate::bucket::{BucketSet, WeightTable};
use crate::config::Config;
use crate::error::{EngineError, RecordParseError};
use crate::merge::Merge;
use crate::rank::{CrashTable, WeightedRanker};
use crate::record::Record;
use crate::source::{RecordSource, WorkUnit};

/// Frozen per-run state: built once before dispatch, shared read-only by workers.
#[derive(Debug)]
pub struct RunContext {
  pub buckets: BucketSet,
  pub weights: WeightTable,
  pub config: Config,
  fingerprint: String,
}

impl RunContext {
  pub fn new(buckets: BucketSet, weights: WeightTable, config: Config) -> Result<Self, EngineError> {
    if config.batch_size == 0 {
      return Err(EngineError::config("batch_size must be at least 1"));
    }
    if !(config.weight_epsilon.is_finite() && config.weight_epsilon > 0.0) {
      return Err(EngineError::config("weight_epsilon must be finite and > 0"));
    }
    weights.check_against(&buckets)?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(buckets.fingerprint().as_bytes());
    for w in weights.to_entries() {
      hasher.update(b"|");
      hasher.update(w.name.as_bytes());
      hasher.update(&w.weight.to_le_bytes());
    }
    let fingerprint = hasher.finalize().to_hex()[..32].to_string();

    Ok(Self {
      buckets,
      weights,
      config,
      fingerprint,
    })
  }

  /// Digest of buckets and weights; partial results echo it back.
  pub fn fingerprint(&self) -> &str {
    &self.fingerprint
  }
}

/// Bookkeeping counters, summed across units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitStats {
  pub units: u64,
  pub records: u64,
  pub dropped_no_channel: u64,
  pub parse_errors: u64,
  pub rank_skipped: u64,
}

impl Merge for UnitStats {
  fn merge(&mut self, other: Self) {
    self.units += other.units;
    self.records += other.records;
    self.dropped_no_channel += other.dropped_no_channel;
    self.parse_errors += other.parse_errors;
    self.rank_skipped += other.rank_skipped;
  }
}

/// Everything one unit contributes to the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitResult {
  pub aggregates: ChannelAggregates,
  pub crashes: CrashTable,
  pub stats: UnitStats,
}

impl Merge for UnitResult {
  fn merge(&mut self, other: Self) {
    Merge::merge(&mut self.aggregates, other.aggregates);
    Merge::merge(&mut self.crashes, other.crashes);
    self.stats.merge(other.stats);
  }
}

/// Run the windowed aggregator and ranker over one record stream.
pub fn process_records(
  ctx: &RunContext,
  records: impl IntoIterator<Item = Result<Record, RecordParseError>>,
) -> UnitResult {
  let ranker = WeightedRanker::new(&ctx.buckets, &ctx.weights).for_channel(ctx.config.rank_channel.clone());
  let mut window = WindowedAggregator::new(
    &ctx.buckets,
    ctx.config.batch_size,
    (ChannelAggregates::new(), ranker),
  );

  let mut parse_errors = 0;
  for item in records {
    match item {
      Ok(record) => window.push(record),
      Err(e) => {
        parse_errors += 1;
        tracing::warn!(error = %e, "skipping unparseable record");
      }
    }
  }

  let ((aggregates, ranker), window_stats) = window.finish();
  UnitResult {
    aggregates,
    stats: UnitStats {
      units: 1,
      records: window_stats.accepted + window_stats.dropped,
      dropped_no_channel: window_stats.dropped,
      parse_errors,
      rank_skipped: ranker.skipped(),
    },
    crashes: ranker.into_table(),
  }
}

pub fn process_unit(
  ctx: &RunContext,
  source: &dyn RecordSource,
  unit: &WorkUnit,
) -> Result<UnitResult, EngineError> {
  tracing::debug!(unit = %unit, "processing unit");
  let stream = source.open(unit)?;
  let result = process_records(ctx, stream);
  tracing::debug!(
    unit = %unit,
    records = result.stats.records,
    parse_errors = result.stats.parse_errors,
    "unit done"
  );
  Ok(result)
}
