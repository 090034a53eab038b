//! Binary entrypoint: bucket counts, weighted top-crash ranking and weight diffs.
//!
//! Each positional argument is one work unit: a JSON-lines file of crash
//! records (relative to `--root` when given).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use crystalball::bucket::BucketWeight;
use crystalball::{
  config, top_crashes, BucketSet, Config, Controller, JsonLinesSource, Report, RunContext, WeightTable,
  WorkUnit,
};

/// Crash-telemetry bucketing and ranking.
#[derive(Parser)]
#[command(name = "crystalball", version, about)]
struct Cli {
  /// Logging verbosity level (trace, debug, info, warn, error).
  #[arg(long, default_value = "info", global = true)]
  log_level: String,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Count records per bucket and channel.
  Count {
    #[command(flatten)]
    run: RunArgs,
    /// Write the per-channel report here.
    #[arg(short, long)]
    out: Option<PathBuf>,
    /// Add counts to the existing report at --out instead of replacing it.
    #[arg(short, long, requires = "out")]
    update: bool,
    /// Log per-bucket percentages for every channel.
    #[arg(short, long)]
    verbose: bool,
  },
  /// Rank crash signatures by weighted frequency.
  Topcrash {
    #[command(flatten)]
    run: RunArgs,
    /// Only rank crashes from this channel.
    #[arg(long)]
    channel: Option<String>,
    /// Number of signatures to list.
    #[arg(long, default_value_t = crystalball::rank::DEFAULT_TOP_N)]
    top: usize,
  },
  /// Derive bucket weights projecting one report channel onto another.
  Weights {
    /// Report providing the source distribution.
    #[arg(long)]
    from: PathBuf,
    #[arg(long)]
    from_channel: String,
    /// Report providing the target distribution.
    #[arg(long)]
    to: PathBuf,
    #[arg(long)]
    to_channel: String,
    /// Weight used when a bucket never matched on either side.
    #[arg(long, default_value_t = crystalball::weight::DEFAULT_WEIGHT_EPSILON)]
    epsilon: f64,
    #[arg(short, long)]
    out: PathBuf,
  },
}

#[derive(Args)]
struct RunArgs {
  /// Bucket config file (`[{name, query, weight?}]`).
  #[arg(short, long)]
  buckets: Option<PathBuf>,
  /// Weight file (`[{name, weight}]`).
  #[arg(short, long)]
  weights: Option<PathBuf>,
  /// Directory the unit files are relative to.
  #[arg(long)]
  root: Option<PathBuf>,
  /// Derive platform/version/GPU fields from raw crash rows.
  #[arg(long)]
  normalize: bool,
  #[arg(long, default_value_t = crystalball::aggregate::DEFAULT_BATCH_SIZE)]
  batch_size: usize,
  /// Worker threads (default: available parallelism).
  #[arg(long)]
  workers: Option<usize>,
  /// Fail the run if no partial result arrives within this many seconds.
  #[arg(long)]
  unit_timeout_secs: Option<u64>,
  /// Work units to process.
  #[arg(required = true)]
  units: Vec<String>,
}

impl RunArgs {
  fn controller(&self, default_buckets: BucketSet, rank_channel: Option<String>, top_n: usize) -> Result<Controller> {
    let buckets = match &self.buckets {
      Some(path) => config::load_buckets(path)?,
      None => default_buckets,
    };
    let weights = match &self.weights {
      Some(path) => config::load_weights(path)?,
      None => WeightTable::new(),
    };
    let cfg = Config {
      batch_size: self.batch_size,
      top_n,
      worker_count: self.workers,
      unit_timeout: self.unit_timeout_secs.map(Duration::from_secs),
      rank_channel,
      ..Config::default()
    };
    let ctx = RunContext::new(buckets, weights, cfg).context("configuring run")?;

    let mut source = JsonLinesSource::new().normalizing(self.normalize);
    if let Some(root) = &self.root {
      source = source.with_root(root);
    }
    Ok(Controller::new(ctx, Arc::new(source)))
  }

  fn units(&self) -> Vec<WorkUnit> {
    self.units.iter().map(WorkUnit::new).collect()
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = EnvFilter::try_new(&cli.log_level)
    .with_context(|| format!("invalid log level: {}", cli.log_level))?;
  fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();

  match cli.command {
    Command::Count {
      run,
      out,
      update,
      verbose,
    } => count(run, out, update, verbose),
    Command::Topcrash { run, channel, top } => topcrash(run, channel, top),
    Command::Weights {
      from,
      from_channel,
      to,
      to_channel,
      epsilon,
      out,
    } => weights(from, from_channel, to, to_channel, epsilon, out),
  }
}

fn count(run: RunArgs, out: Option<PathBuf>, update: bool, verbose: bool) -> Result<()> {
  let controller = run.controller(BucketSet::default_gpu_buckets(), None, Config::default().top_n)?;
  let result = controller.run(run.units())?;
  let report = Report::from_aggregates(&result.aggregates, &controller.context().buckets);

  tracing::info!(records = result.stats.records, "processed records");
  if verbose {
    for (channel, r) in &report.channels {
      tracing::info!(channel = %channel, total = r.total_count, matched = r.matched_count, "channel");
      for b in &r.buckets {
        let percent = format!("{:.2}%", b.percent * 100.0);
        tracing::info!(channel = %channel, bucket = %b.name, count = b.count, percent = %percent, "bucket");
      }
    }
  }

  if let Some(path) = out {
    if update {
      report
        .update_file(&path)
        .with_context(|| format!("updating {}", path.display()))?;
      tracing::info!(path = %path.display(), "updated report");
    } else {
      report
        .write(&path)
        .with_context(|| format!("writing {}", path.display()))?;
      tracing::info!(path = %path.display(), "wrote report");
    }
  }
  Ok(())
}

fn topcrash(run: RunArgs, channel: Option<String>, top: usize) -> Result<()> {
  let controller = run.controller(BucketSet::default(), channel, top)?;
  let result = controller.run(run.units())?;
  let ranking = top_crashes(&result.crashes, controller.context().config.top_n)?;

  let stdout = std::io::stdout();
  let mut out = stdout.lock();
  serde_json::to_writer_pretty(&mut out, &ranking)?;
  std::io::Write::write_all(&mut out, b"\n")?;
  Ok(())
}

fn weights(
  from: PathBuf,
  from_channel: String,
  to: PathBuf,
  to_channel: String,
  epsilon: f64,
  out: PathBuf,
) -> Result<()> {
  let from_report = Report::load(&from).with_context(|| format!("reading {}", from.display()))?;
  let to_report = Report::load(&to).with_context(|| format!("reading {}", to.display()))?;
  let table = crystalball::compute_weights(
    &from_report.snapshot(&from_channel)?,
    &to_report.snapshot(&to_channel)?,
    epsilon,
  )?;

  let entries: Vec<BucketWeight> = table.to_entries();
  for e in &entries {
    tracing::info!(bucket = %e.name, weight = e.weight, "weight");
  }
  std::fs::write(&out, serde_json::to_string_pretty(&entries)?)
    .with_context(|| format!("writing {}", out.display()))?;
  tracing::info!(path = %out.display(), "wrote weights");
  Ok(())
}
