//! Predicate matching: a small tagged predicate tree compiled from a
//! sift/Mongo-style query object and evaluated by structural recursion.
//!
//! Query shape (one bucket):
//! ```json
//! { "platform": "Windows NT", "gpu_count": 1, "v_v0": { "$gte": 43, "$lt": 45 },
//!   "gpu0_vendor": { "$nin": [4318, 4098] } }
//! ```
//! A bare scalar is `Equals`. Several operators on one field form a conjunction.
//! A missing field fails every constraint.

use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::record::{FieldValue, Record};

/// A single test against one field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
  Equals(FieldValue),
  Gte(f64),
  Lt(f64),
  NotIn(Vec<FieldValue>),
}

impl Constraint {
  fn test(&self, value: &FieldValue) -> bool {
    match self {
      Self::Equals(expected) => value == expected,
      Self::Gte(bound) => value.as_f64().is_some_and(|v| v >= *bound),
      Self::Lt(bound) => value.as_f64().is_some_and(|v| v < *bound),
      Self::NotIn(set) => !set.iter().any(|member| member == value),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
  /// True when every child is true. An empty conjunction matches everything.
  All(Vec<Predicate>),
  Field { field: String, constraint: Constraint },
}

impl Predicate {
  pub fn field(field: &str, constraint: Constraint) -> Self {
    Self::Field {
      field: field.to_string(),
      constraint,
    }
  }

  pub fn matches(&self, record: &Record) -> bool {
    match self {
      Self::All(children) => children.iter().all(|p| p.matches(record)),
      Self::Field { field, constraint } => match record.get(field) {
        Some(value) => constraint.test(value),
        None => false,
      },
    }
  }

  /// Compile a query object into a predicate tree.
  pub fn compile(query: &Value) -> Result<Self, EngineError> {
    let obj = query
      .as_object()
      .ok_or_else(|| EngineError::config("query must be a JSON object"))?;
    compile_object(obj)
  }

  /// Every field name the predicate reads.
  pub fn fields(&self) -> Vec<&str> {
    let mut out = Vec::new();
    self.collect_fields(&mut out);
    out.sort_unstable();
    out.dedup();
    out
  }

  fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
    match self {
      Self::All(children) => children.iter().for_each(|c| c.collect_fields(out)),
      Self::Field { field, .. } => out.push(field),
    }
  }
}

fn compile_object(obj: &Map<String, Value>) -> Result<Predicate, EngineError> {
  let mut clauses = Vec::with_capacity(obj.len());
  for (field, cond) in obj {
    match cond {
      Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
        for (op, operand) in ops {
          clauses.push(Predicate::field(field, compile_operator(field, op, operand)?));
        }
      }
      other => {
        clauses.push(Predicate::field(field, Constraint::Equals(scalar(field, other)?)));
      }
    }
  }
  Ok(Predicate::All(clauses))
}

fn compile_operator(field: &str, op: &str, operand: &Value) -> Result<Constraint, EngineError> {
  match op {
    "$eq" => Ok(Constraint::Equals(scalar(field, operand)?)),
    "$gte" => Ok(Constraint::Gte(number(field, op, operand)?)),
    "$lt" => Ok(Constraint::Lt(number(field, op, operand)?)),
    "$nin" => {
      let members = operand
        .as_array()
        .ok_or_else(|| EngineError::config(format!("{}: $nin expects an array", field)))?;
      let set = members
        .iter()
        .map(|m| scalar(field, m))
        .collect::<Result<Vec<_>, _>>()?;
      Ok(Constraint::NotIn(set))
    }
    other => Err(EngineError::config(format!(
      "{}: unsupported operator {}",
      field, other
    ))),
  }
}

fn scalar(field: &str, value: &Value) -> Result<FieldValue, EngineError> {
  match FieldValue::from_json(field, value) {
    Ok(Some(v)) => Ok(v),
    Ok(None) => Err(EngineError::config(format!("{}: null is not a matchable value", field))),
    Err(e) => Err(EngineError::config(e.to_string())),
  }
}

fn number(field: &str, op: &str, value: &Value) -> Result<f64, EngineError> {
  value
    .as_f64()
    .ok_or_else(|| EngineError::config(format!("{}: {} expects a number", field, op)))
}
