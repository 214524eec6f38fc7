//! Bindable SQL values and the canonical text forms stored in the value
//! tables.
//!
//! Timestamps are stored as fixed-width UTC strings so that text comparison
//! agrees with time order. The same sentinel string marks "not deleted" on
//! users and "indefinite" in retention arrays.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `strftime` pattern for every stored timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Sentinel stored in `users.deleted` (and friends) for rows that are live.
pub const NOT_DELETED: &str = "0001-01-01T00:00:00.000000Z";

/// Sentinel stored in a retention array for an indefinite timeout.
pub const RETENTION_INDEFINITE: &str = NOT_DELETED;

// ─── SqlValue ────────────────────────────────────────────────────────────────

/// A value bound to a `$N` placeholder.
///
/// Variant order matters: the derived `Ord` sorts `Null` first, which matches
/// `ASC NULLS FIRST` in generated queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
  Null,
  Integer(i64),
  Text(String),
}

impl SqlValue {
  pub fn text(s: impl Into<String>) -> Self { SqlValue::Text(s.into()) }

  pub fn from_bool(b: bool) -> Self { SqlValue::Integer(i64::from(b)) }

  pub fn from_uuid(id: Uuid) -> Self { SqlValue::Text(encode_uuid(id)) }

  pub fn from_timestamp(dt: DateTime<Utc>) -> Self {
    SqlValue::Text(encode_timestamp(dt))
  }

  /// A JSON array of UUIDs, for `json_each` membership tests.
  pub fn uuid_array(ids: &[Uuid]) -> Self {
    let items: Vec<String> = ids.iter().copied().map(encode_uuid).collect();
    SqlValue::Text(serde_json::Value::from(items).to_string())
  }

  pub fn is_null(&self) -> bool { matches!(self, SqlValue::Null) }

  pub fn as_text(&self) -> Option<&str> {
    match self {
      SqlValue::Text(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_integer(&self) -> Option<i64> {
    match self {
      SqlValue::Integer(i) => Some(*i),
      _ => None,
    }
  }
}

impl From<i64> for SqlValue {
  fn from(v: i64) -> Self { SqlValue::Integer(v) }
}

impl From<String> for SqlValue {
  fn from(v: String) -> Self { SqlValue::Text(v) }
}

impl From<&str> for SqlValue {
  fn from(v: &str) -> Self { SqlValue::Text(v.to_owned()) }
}

// ─── Canonical encodings ─────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn encode_timestamp(dt: DateTime<Utc>) -> String {
  dt.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp in any of the forms callers commonly send: RFC 3339,
/// `YYYY-MM-DD HH:MM:SS[.f]` (taken as UTC), or a bare date.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  let s = s.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
      return Some(naive.and_utc());
    }
  }
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|naive| naive.and_utc())
}

/// Postgres-compatible boolean input: `t`, `true`, `yes`, `on`, `1` and
/// their negations, case-insensitive, plus unambiguous prefixes of
/// `true`/`false`/`yes`/`no`/`off`.
pub fn parse_bool(s: &str) -> Option<bool> {
  let lower = s.trim().to_ascii_lowercase();
  match lower.as_str() {
    "on" | "1" => return Some(true),
    "of" | "off" | "0" => return Some(false),
    "" | "o" => return None,
    _ => {}
  }
  if "true".starts_with(&lower) || "yes".starts_with(&lower) {
    Some(true)
  } else if "false".starts_with(&lower) || "no".starts_with(&lower) {
    Some(false)
  } else {
    None
  }
}

/// Quote `s` as a SQL string literal.
pub fn quote_literal(s: &str) -> String { format!("'{}'", s.replace('\'', "''")) }

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timestamps_are_fixed_width() {
    let dt = parse_timestamp("2024-01-01 00:00:00").unwrap();
    assert_eq!(encode_timestamp(dt), "2024-01-01T00:00:00.000000Z");
    let dt = parse_timestamp("2024-03-05T10:11:12.5+01:00").unwrap();
    assert_eq!(encode_timestamp(dt), "2024-03-05T09:11:12.500000Z");
  }

  #[test]
  fn sentinel_sorts_before_real_times() {
    let now = encode_timestamp(Utc::now());
    assert!(NOT_DELETED < now.as_str());
  }

  #[test]
  fn bool_input_forms() {
    for t in ["t", "TRUE", "yes", "y", "on", "1", "tr"] {
      assert_eq!(parse_bool(t), Some(true), "{t}");
    }
    for f in ["f", "false", "no", "n", "of", "OFF", "0"] {
      assert_eq!(parse_bool(f), Some(false), "{f}");
    }
    for bad in ["foo", "", "o", "2"] {
      assert_eq!(parse_bool(bad), None, "{bad}");
    }
  }

  #[test]
  fn null_orders_first() {
    assert!(SqlValue::Null < SqlValue::Integer(-5));
    assert!(SqlValue::Integer(3) < SqlValue::Integer(4));
    assert!(SqlValue::text("a") < SqlValue::text("b"));
  }

  #[test]
  fn quote_doubles_single_quotes() {
    assert_eq!(quote_literal("fo'o"), "'fo''o'");
  }
}
