//! Integration tests for the crash bucketing engine.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crystalball::source::MemorySource;
use crystalball::{
  compute_weights, ingest, top_crashes, BucketSet, Config, Controller, EngineError, JsonLinesSource,
  Record, Report, RunContext, WeightTable, WorkUnit,
};

fn platform_buckets() -> BucketSet {
  BucketSet::from_json(
    r#"[
      {"name": "Linux", "query": {"platform": "Linux"}},
      {"name": "Windows", "query": {"platform": "Windows NT"}}
    ]"#,
  )
  .unwrap()
}

fn crash(channel: &str, platform: &str, sig: &str, uuid: &str) -> Record {
  Record::new()
    .with("channel", channel)
    .with("platform", platform)
    .with("signature", sig)
    .with("uuid", uuid)
}

fn write_unit(dir: &Path, name: &str, lines: &[&str]) {
  let mut f = fs::File::create(dir.join(name)).unwrap();
  for line in lines {
    writeln!(f, "{}", line).unwrap();
  }
}

#[test]
fn three_release_records_fill_two_buckets() {
  let records = vec![
    crash("release", "Linux", "A", "1"),
    crash("release", "Linux", "B", "2"),
    crash("release", "Windows NT", "A", "3"),
  ];
  let out = ingest(records, &platform_buckets(), 5000);
  let release = &out["release"];
  assert_eq!(release.total_count, 3);
  assert_eq!(release.matched_count, 3);
  assert_eq!(release.bucket_count("Linux"), 2);
  assert_eq!(release.bucket_count("Windows"), 1);
}

#[test]
fn report_update_with_same_buckets_sums_counts() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("report.json");
  let buckets = BucketSet::from_json(r#"[{"name":"A","query":{"os":"a"}},{"name":"B","query":{"os":"b"}}]"#).unwrap();
  let rec = |os: &str| Record::new().with("channel", "release").with("os", os);

  let old = Report::from_aggregates(&ingest(vec![rec("a"), rec("b")], &buckets, 10), &buckets);
  old.write(&path).unwrap();

  let new = Report::from_aggregates(&ingest(vec![rec("a"), rec("a"), rec("x")], &buckets, 10), &buckets);
  let merged = new.update_file(&path).unwrap();
  let release = merged.channel("release").unwrap();
  assert_eq!(release.total_count, 5);
  assert_eq!(release.matched_count, 4);
  assert_eq!(release.bucket("A").unwrap().count, 3);
  assert_eq!(release.bucket("B").unwrap().count, 1);
  assert_eq!(Report::load(&path).unwrap(), merged);
}

#[test]
fn report_update_with_different_buckets_fails_without_writing() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("report.json");
  let ab = BucketSet::from_json(r#"[{"name":"A","query":{"os":"a"}},{"name":"B","query":{"os":"b"}}]"#).unwrap();
  let ac = BucketSet::from_json(r#"[{"name":"A","query":{"os":"a"}},{"name":"C","query":{"os":"c"}}]"#).unwrap();
  let rec = |os: &str| Record::new().with("channel", "release").with("os", os);

  Report::from_aggregates(&ingest(vec![rec("a")], &ab, 10), &ab)
    .write(&path)
    .unwrap();
  let before = fs::read_to_string(&path).unwrap();

  let new = Report::from_aggregates(&ingest(vec![rec("c")], &ac, 10), &ac);
  let err = new.update_file(&path).unwrap_err();
  assert!(matches!(err, EngineError::SchemaMismatch(_)));
  assert_eq!(fs::read_to_string(&path).unwrap(), before);
}

#[test]
fn weighted_ranking_promotes_reweighted_signature() {
  let buckets = BucketSet::from_json(r#"[{"name":"Light","query":{"os":"a"}},{"name":"Heavy","query":{"os":"b"}}]"#)
    .unwrap();
  let weights = WeightTable::from_json(r#"[{"name":"Light","weight":1},{"name":"Heavy","weight":2}]"#).unwrap();
  let ctx = RunContext::new(buckets, weights, Config::default()).unwrap();

  let mut source = MemorySource::new();
  let mut records = Vec::new();
  for i in 0..10 {
    records.push(Record::new().with("channel", "release").with("os", "a").with("signature", "S1").with("uuid", format!("a{}", i)));
  }
  for i in 0..8 {
    records.push(Record::new().with("channel", "release").with("os", "b").with("signature", "S2").with("uuid", format!("b{}", i)));
  }
  source.insert(WorkUnit::new("day"), records);

  let result = Controller::new(ctx, Arc::new(source)).run(vec![WorkUnit::new("day")]).unwrap();
  let ranking = top_crashes(&result.crashes, 15).unwrap();

  assert_eq!(ranking.crashes[0].signature, "S2");
  assert_eq!(ranking.crashes[0].weighted_count, 16.0);
  assert_eq!(ranking.crashes[0].rank_shift, -1);
  assert_eq!(ranking.crashes[1].signature, "S1");
  assert_eq!(ranking.crashes[1].weighted_count, 10.0);
  assert_eq!(ranking.crashes[1].rank_shift, 1);
}

#[test]
fn file_units_through_worker_pool() {
  let dir = tempfile::tempdir().unwrap();
  write_unit(
    dir.path(),
    "2016-01-01.jsonl",
    &[
      r#"{"channel":"release","platform":"Linux","signature":"A","uuid":"1","crash_time":"2016-01-01T01:00:00Z"}"#,
      r#"{"channel":"release","platform":"Windows NT","signature":"B","uuid":"2","crash_time":"2016-01-01T02:00:00Z"}"#,
      r#"{"platform":"Linux","signature":"A","uuid":"3"}"#,
    ],
  );
  write_unit(
    dir.path(),
    "2016-01-02.jsonl",
    &[
      r#"{"channel":"release","platform":"Linux","signature":"A","uuid":"4","crash_time":"2016-01-02T05:00:00Z"}"#,
      r#"{"channel":"beta","platform":"Mac OS X","signature":"C","uuid":"5"}"#,
      "{broken",
    ],
  );

  let config = Config {
    worker_count: Some(2),
    batch_size: 1,
    ..Config::default()
  };
  let ctx = RunContext::new(platform_buckets(), WeightTable::new(), config).unwrap();
  let source = JsonLinesSource::new().with_root(dir.path());
  let result = Controller::new(ctx, Arc::new(source))
    .run(vec![WorkUnit::new("2016-01-01.jsonl"), WorkUnit::new("2016-01-02.jsonl")])
    .unwrap();

  assert_eq!(result.stats.units, 2);
  assert_eq!(result.stats.dropped_no_channel, 1);
  assert_eq!(result.stats.parse_errors, 1);

  let release = &result.aggregates["release"];
  assert_eq!(release.total_count, 3);
  assert_eq!(release.bucket_count("Linux"), 2);
  let beta = &result.aggregates["beta"];
  assert_eq!(beta.total_count, 1);
  assert_eq!(beta.matched_count, 0);

  // C matched no bucket, so it is not ranked.
  assert!(!result.crashes.contains_key("C"));
  let a = &result.crashes["A"];
  assert_eq!(a.unweighted_count, 2);
  assert_eq!(a.last_uuid.as_deref(), Some("4"));
}

#[test]
fn weights_from_report_channels_rebalance_ranking() {
  let buckets = platform_buckets();
  let records = vec![
    crash("release", "Linux", "L", "1"),
    crash("release", "Windows NT", "W", "2"),
    crash("release", "Windows NT", "W", "3"),
    crash("release", "Windows NT", "W", "4"),
    crash("beta", "Linux", "L", "5"),
    crash("beta", "Windows NT", "W", "6"),
  ];
  let report = Report::from_aggregates(&ingest(records, &buckets, 5000), &buckets);

  // Project beta (50/50) onto release (25/75).
  let table = compute_weights(
    &report.snapshot("release").unwrap(),
    &report.snapshot("beta").unwrap(),
    0.0001,
  )
  .unwrap();
  assert_eq!(table.get("Linux"), Some(0.5));
  assert_eq!(table.get("Windows"), Some(1.5));

  let missing = report.snapshot("nightly");
  assert!(matches!(missing, Err(EngineError::SchemaMismatch(_))));
}

#[test]
fn overlapping_buckets_report_a_matched_distribution() {
  let buckets = BucketSet::from_json(
    r#"[
      {"name": "Linux", "query": {"platform": "Linux"}},
      {"name": "Big", "query": {"mem": {"$gte": 8}}}
    ]"#,
  )
  .unwrap();
  let rec = |mem: i64| Record::new().with("channel", "release").with("platform", "Linux").with("mem", mem);
  let report = Report::from_aggregates(&ingest(vec![rec(2), rec(16)], &buckets, 5000), &buckets);

  let release = report.channel("release").unwrap();
  assert_eq!(release.total_count, 2);
  assert_eq!(release.matched_count, 3);
  let sum: f64 = release.buckets.iter().map(|b| b.percent_matched).sum();
  assert!((sum - 1.0).abs() < 1e-12, "sum {}", sum);
}
