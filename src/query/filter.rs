//! Filter trees evaluated against stored row values.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
  Eq,
  Ne,
  Gt,
  Gte,
  Lt,
  Lte,
}

impl CompareOp {
  pub fn parse(op: &str) -> Option<Self> {
    match op {
      "=" => Some(CompareOp::Eq),
      "!=" | "<>" => Some(CompareOp::Ne),
      ">" => Some(CompareOp::Gt),
      ">=" => Some(CompareOp::Gte),
      "<" => Some(CompareOp::Lt),
      "<=" => Some(CompareOp::Lte),
      _ => None,
    }
  }

  fn accepts(&self, ordering: Option<Ordering>) -> bool {
    match (self, ordering) {
      (CompareOp::Ne, ordering) => ordering != Some(Ordering::Equal),
      (_, None) => false,
      (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
      (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
      (CompareOp::Gte, Some(o)) => o != Ordering::Less,
      (CompareOp::Lt, Some(o)) => o == Ordering::Less,
      (CompareOp::Lte, Some(o)) => o != Ordering::Greater,
    }
  }
}

/// A predicate over a row value. Field names may be dotted paths into
/// nested objects; a row without the field never matches.
#[derive(Debug, Clone)]
pub enum Filter {
  All,
  Compare {
    field: String,
    op: CompareOp,
    value: Value,
  },
  Like {
    field: String,
    pattern: Regex,
  },
  And(Vec<Filter>),
  Or(Vec<Filter>),
}

impl Filter {
  pub fn compare(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
    Filter::Compare {
      field: field.into(),
      op,
      value,
    }
  }

  pub fn eq(field: impl Into<String>, value: Value) -> Self {
    Self::compare(field, CompareOp::Eq, value)
  }

  /// SQL `LIKE`: `%` matches any run of characters, `_` exactly one.
  pub fn like(field: impl Into<String>, pattern: &str) -> Result<Self> {
    let mut regex = String::from("^");
    for c in pattern.chars() {
      match c {
        '%' => regex.push_str(".*"),
        '_' => regex.push('.'),
        other => regex.push_str(&regex::escape(&other.to_string())),
      }
    }
    regex.push('$');

    let pattern = Regex::new(&regex).map_err(|e| eyre!("Invalid LIKE pattern: {}", e))?;
    Ok(Filter::Like {
      field: field.into(),
      pattern,
    })
  }

  /// Conjunction, collapsing the trivial cases.
  pub fn all_of(mut filters: Vec<Filter>) -> Self {
    filters.retain(|f| !matches!(f, Filter::All));
    match filters.len() {
      0 => Filter::All,
      1 => filters.remove(0),
      _ => Filter::And(filters),
    }
  }

  pub fn matches(&self, row: &Value) -> bool {
    match self {
      Filter::All => true,
      Filter::Compare { field, op, value } => match lookup(row, field) {
        Some(actual) => op.accepts(compare_loose(actual, value)),
        None => false,
      },
      Filter::Like { field, pattern } => match lookup(row, field) {
        Some(Value::Null) | None => false,
        Some(actual) => pattern.is_match(&as_text(actual)),
      },
      Filter::And(filters) => filters.iter().all(|f| f.matches(row)),
      Filter::Or(filters) => filters.iter().any(|f| f.matches(row)),
    }
  }
}

fn lookup<'a>(row: &'a Value, field: &str) -> Option<&'a Value> {
  field
    .split('.')
    .try_fold(row, |current, segment| current.get(segment))
}

/// Numbers compare numerically (numeric strings included, since URL
/// parameters arrive as text); everything else compares by its text.
fn compare_loose(left: &Value, right: &Value) -> Option<Ordering> {
  if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
    return a.partial_cmp(&b);
  }
  match (left, right) {
    (Value::Null, Value::Null) => Some(Ordering::Equal),
    (Value::Null, _) | (_, Value::Null) => None,
    _ => Some(as_text(left).cmp(&as_text(right))),
  }
}

fn as_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
    _ => None,
  }
}

fn as_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
