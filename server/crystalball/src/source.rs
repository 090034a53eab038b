//! Record sources: turn one work unit into a stream of records.
//!
//! A bad line yields a `RecordParseError` item and the stream continues.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use crate::error::{EngineError, RecordParseError};
use crate::normalize;
use crate::record::Record;

/// One independent partition of the input (a day, a file). No record spans two units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnit(pub String);

impl WorkUnit {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn id(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for WorkUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

pub type RecordStream = Box<dyn Iterator<Item = Result<Record, RecordParseError>> + Send>;

/// Shared by all workers; opening a unit must not mutate the source.
pub trait RecordSource: Send + Sync {
  fn open(&self, unit: &WorkUnit) -> Result<RecordStream, EngineError>;
}

/// One JSON object per line. A unit id is a file path, relative to `root` when set.
#[derive(Debug, Clone, Default)]
pub struct JsonLinesSource {
  root: Option<PathBuf>,
  normalize: bool,
}

impl JsonLinesSource {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
    self.root = Some(root.into());
    self
  }

  /// Run raw crash rows through `normalize::normalize`.
  pub fn normalizing(mut self, on: bool) -> Self {
    self.normalize = on;
    self
  }

  fn path_of(&self, unit: &WorkUnit) -> PathBuf {
    match &self.root {
      Some(root) => root.join(unit.id()),
      None => PathBuf::from(unit.id()),
    }
  }
}

impl RecordSource for JsonLinesSource {
  fn open(&self, unit: &WorkUnit) -> Result<RecordStream, EngineError> {
    let path = self.path_of(unit);
    let file = File::open(&path).map_err(|e| {
      EngineError::Io(std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))
    })?;
    Ok(Box::new(JsonLines {
      lines: BufReader::new(file).lines(),
      line_no: 0,
      normalize: self.normalize,
      done: false,
    }))
  }
}

struct JsonLines {
  lines: Lines<BufReader<File>>,
  line_no: usize,
  normalize: bool,
  done: bool,
}

impl JsonLines {
  fn parse(&self, line: &str) -> Result<Record, RecordParseError> {
    let value: serde_json::Value = serde_json::from_str(line)
      .map_err(|e| RecordParseError::new(&format!("line {}", self.line_no), e.to_string()))?;
    let mut record = Record::from_json(&value)?;
    if self.normalize {
      normalize::normalize(&mut record)?;
    }
    Ok(record)
  }
}

impl Iterator for JsonLines {
  type Item = Result<Record, RecordParseError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    loop {
      self.line_no += 1;
      let line = match self.lines.next()? {
        Ok(l) => l,
        Err(e) => {
          // A read error will not clear up on the next line; stop here.
          self.done = true;
          return Some(Err(RecordParseError::new(
            &format!("line {}", self.line_no),
            format!("read error: {}", e),
          )));
        }
      };
      let trimmed = line.trim();
      if trimmed.is_empty() {
        continue;
      }
      return Some(self.parse(trimmed));
    }
  }
}

/// In-memory units, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
  units: HashMap<WorkUnit, Vec<Record>>,
}

impl MemorySource {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, unit: WorkUnit, records: Vec<Record>) {
    self.units.insert(unit, records);
  }

  pub fn units(&self) -> Vec<WorkUnit> {
    let mut units: Vec<WorkUnit> = self.units.keys().cloned().collect();
    units.sort();
    units
  }
}

impl RecordSource for MemorySource {
  fn open(&self, unit: &WorkUnit) -> Result<RecordStream, EngineError> {
    let records = self
      .units
      .get(unit)
      .cloned()
      .ok_or_else(|| EngineError::config(format!("unknown work unit {}", unit)))?;
    Ok(Box::new(records.into_iter().map(Ok)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn json_lines_skip_blank_and_report_bad_lines() {
    let dir = tempfile::tempdir().unwrap();
    let mut f = File::create(dir.path().join("2016-01-01.jsonl")).unwrap();
    writeln!(f, r#"{{"channel":"release","signature":"A","uuid":"u1"}}"#).unwrap();
    writeln!(f).unwrap();
    writeln!(f, "not json").unwrap();
    writeln!(f, r#"{{"channel":"beta","signature":"B","uuid":"u2"}}"#).unwrap();
    drop(f);

    let source = JsonLinesSource::new().with_root(dir.path());
    let items: Vec<_> = source.open(&WorkUnit::new("2016-01-01.jsonl")).unwrap().collect();
    assert_eq!(items.len(), 3);
    assert!(items[0].is_ok());
    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.field, "line 3");
    assert_eq!(items[2].as_ref().unwrap().channel(), Some("beta"));
  }

  #[test]
  fn missing_unit_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = JsonLinesSource::new().with_root(dir.path());
    assert!(matches!(source.open(&WorkUnit::new("nope.jsonl")), Err(EngineError::Io(_))));
  }

  #[test]
  fn normalizing_source_derives_fields() {
    let dir = tempfile::tempdir().unwrap();
    let mut f = File::create(dir.path().join("u.jsonl")).unwrap();
    writeln!(f, r#"{{"channel":"release","os_name":"Linux","version":"44.0"}}"#).unwrap();
    drop(f);

    let source = JsonLinesSource::new().with_root(dir.path()).normalizing(true);
    let rec = source.open(&WorkUnit::new("u.jsonl")).unwrap().next().unwrap().unwrap();
    assert_eq!(rec.get_str("platform"), Some("Linux"));
    assert!(rec.contains("v_v0"));
  }
}
