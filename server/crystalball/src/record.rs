//! Crash records: a dynamic map of field name to scalar value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::RecordParseError;

/// Population segment (release track).
pub const CHANNEL: &str = "channel";
pub const SIGNATURE: &str = "signature";
pub const UUID: &str = "uuid";
/// Crash timestamp, RFC 3339 on the wire.
pub const CRASH_TIME: &str = "crash_time";

/// A scalar field value. Equality is type-sensitive except that integers and
/// floats compare numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
  Bool(bool),
  Int(i64),
  Float(f64),
  Timestamp(DateTime<Utc>),
  Str(String),
}

impl FieldValue {
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Self::Int(i) => Some(*i as f64),
      Self::Float(f) => Some(*f),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::Str(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
    match self {
      Self::Timestamp(ts) => Some(*ts),
      _ => None,
    }
  }

  /// Convert a JSON scalar. `null` yields `None` (the field is treated as absent).
  pub fn from_json(field: &str, value: &Value) -> Result<Option<Self>, RecordParseError> {
    match value {
      Value::Null => Ok(None),
      Value::Bool(b) => Ok(Some(Self::Bool(*b))),
      Value::Number(n) => match n.as_i64() {
        Some(i) => Ok(Some(Self::Int(i))),
        None => n
          .as_f64()
          .map(|f| Some(Self::Float(f)))
          .ok_or_else(|| RecordParseError::new(field, format!("unrepresentable number {}", n))),
      },
      Value::String(s) => Ok(Some(Self::Str(s.clone()))),
      Value::Array(_) | Value::Object(_) => {
        Err(RecordParseError::new(field, "expected a scalar value"))
      }
    }
  }
}

impl PartialEq for FieldValue {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Self::Int(a), Self::Int(b)) => a == b,
      (Self::Bool(a), Self::Bool(b)) => a == b,
      (Self::Str(a), Self::Str(b)) => a == b,
      (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
      (a, b) => match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
      },
    }
  }
}

impl From<&str> for FieldValue {
  fn from(s: &str) -> Self {
    Self::Str(s.to_string())
  }
}

impl From<String> for FieldValue {
  fn from(s: String) -> Self {
    Self::Str(s)
  }
}

impl From<i64> for FieldValue {
  fn from(i: i64) -> Self {
    Self::Int(i)
  }
}

impl From<f64> for FieldValue {
  fn from(f: f64) -> Self {
    Self::Float(f)
  }
}

impl From<DateTime<Utc>> for FieldValue {
  fn from(ts: DateTime<Utc>) -> Self {
    Self::Timestamp(ts)
  }
}

/// One crash record. Schema is dynamic; only the fields the active predicates
/// and the ranker reference are ever inspected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
  fields: BTreeMap<String, FieldValue>,
}

impl Record {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert, mostly for tests and fixtures.
  pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
    self.insert(field, value);
    self
  }

  pub fn insert(&mut self, field: &str, value: impl Into<FieldValue>) {
    self.fields.insert(field.to_string(), value.into());
  }

  pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
    self.fields.remove(field)
  }

  pub fn get(&self, field: &str) -> Option<&FieldValue> {
    self.fields.get(field)
  }

  pub fn get_str(&self, field: &str) -> Option<&str> {
    self.get(field).and_then(FieldValue::as_str)
  }

  pub fn contains(&self, field: &str) -> bool {
    self.fields.contains_key(field)
  }

  /// Channel, if present and non-empty. Records without one are dropped by the aggregator.
  pub fn channel(&self) -> Option<&str> {
    self.get_str(CHANNEL).filter(|c| !c.is_empty())
  }

  pub fn signature(&self) -> Option<&str> {
    self.get_str(SIGNATURE)
  }

  pub fn uuid(&self) -> Option<&str> {
    self.get_str(UUID)
  }

  pub fn crash_time(&self) -> Option<DateTime<Utc>> {
    self.get(CRASH_TIME).and_then(FieldValue::as_timestamp)
  }

  pub fn len(&self) -> usize {
    self.fields.len()
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  /// Decode one JSON object into a record. `crash_time` must be RFC 3339.
  pub fn from_json(value: &Value) -> Result<Self, RecordParseError> {
    let obj = value
      .as_object()
      .ok_or_else(|| RecordParseError::new("<record>", "expected a JSON object"))?;

    let mut record = Record::new();
    for (field, raw) in obj {
      let parsed = if field == CRASH_TIME {
        match raw {
          Value::Null => None,
          Value::String(s) => {
            let ts = DateTime::parse_from_rfc3339(s)
              .map_err(|e| RecordParseError::new(CRASH_TIME, format!("invalid RFC3339: {}", e)))?
              .with_timezone(&Utc);
            Some(FieldValue::Timestamp(ts))
          }
          _ => return Err(RecordParseError::new(CRASH_TIME, "expected an RFC3339 string")),
        }
      } else {
        FieldValue::from_json(field, raw)?
      };
      if let Some(v) = parsed {
        record.fields.insert(field.clone(), v);
      }
    }
    Ok(record)
  }
}
