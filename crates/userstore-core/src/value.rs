//! Column values, consent purposes, and retention.
//!
//! A stored value carries exactly one typed payload and a non-empty list of
//! consented purposes, each with its own retention timeout. The payload's
//! Rust type is decided by the column's data type; [`Value::from_json`] and
//! [`Value::from_sql`] are the only ways in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::{
  Error, Result,
  catalog::{DataTypeKind, ScalarType},
  sql::{
    RETENTION_INDEFINITE, SqlValue, encode_timestamp, encode_uuid, parse_bool,
    parse_timestamp,
  },
};

// ─── Lifecycle ───────────────────────────────────────────────────────────────

/// Which partition of the value tables a read targets.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
  strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
  #[default]
  Live,
  SoftDeleted,
}

impl LifecycleState {
  /// Physical table holding values in this state.
  pub fn table(self) -> &'static str {
    match self {
      LifecycleState::Live => "user_column_pre_delete_values",
      LifecycleState::SoftDeleted => "user_column_post_delete_values",
    }
  }
}

// ─── Retention ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTimeout {
  #[default]
  Indefinite,
  Until(DateTime<Utc>),
}

impl RetentionTimeout {
  pub fn is_indefinite(&self) -> bool { matches!(self, RetentionTimeout::Indefinite) }

  pub fn to_stored(self) -> String {
    match self {
      RetentionTimeout::Indefinite => RETENTION_INDEFINITE.to_owned(),
      RetentionTimeout::Until(t) => encode_timestamp(t),
    }
  }

  pub fn from_stored(s: &str) -> Result<Self> {
    if s == RETENTION_INDEFINITE {
      return Ok(RetentionTimeout::Indefinite);
    }
    parse_timestamp(s)
      .map(RetentionTimeout::Until)
      .ok_or_else(|| Error::Decode(format!("bad retention timeout {s:?}")))
  }
}

/// The instant a read evaluates retention against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionCutoff {
  /// Every purpose counts as retained; used for full value dumps.
  Unbounded,
  At(DateTime<Utc>),
}

impl RetentionCutoff {
  pub fn now() -> Self { RetentionCutoff::At(Utc::now()) }

  /// A purpose is retained iff its timeout is indefinite or strictly after
  /// the cutoff.
  pub fn retains(&self, timeout: RetentionTimeout) -> bool {
    match (self, timeout) {
      (RetentionCutoff::Unbounded, _) => true,
      (_, RetentionTimeout::Indefinite) => true,
      (RetentionCutoff::At(cutoff), RetentionTimeout::Until(t)) => *cutoff < t,
    }
  }
}

// ─── Consent ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentedPurpose {
  pub purpose_id: Uuid,
  #[serde(default)]
  pub retention:  RetentionTimeout,
}

impl ConsentedPurpose {
  pub fn indefinite(purpose_id: Uuid) -> Self {
    Self { purpose_id, retention: RetentionTimeout::Indefinite }
  }
}

/// Check the consent list of a value about to be stored in `state`.
pub fn validate_consent(consented: &[ConsentedPurpose], state: LifecycleState) -> Result<()> {
  if consented.is_empty() {
    return Err(Error::InvalidValue("a value needs at least one consented purpose".into()));
  }
  let mut seen = std::collections::HashSet::new();
  for purpose in consented {
    if purpose.purpose_id.is_nil() {
      return Err(Error::InvalidValue("nil consented purpose id".into()));
    }
    if !seen.insert(purpose.purpose_id) {
      return Err(Error::InvalidValue(format!(
        "duplicate consented purpose {}",
        purpose.purpose_id
      )));
    }
    if state == LifecycleState::SoftDeleted && purpose.retention.is_indefinite() {
      return Err(Error::InvalidValue(format!(
        "soft-deleted value has indefinite retention for purpose {}",
        purpose.purpose_id
      )));
    }
  }
  Ok(())
}

/// Split a consent list into the two parallel stored arrays (JSON text).
pub fn encode_consent(consented: &[ConsentedPurpose]) -> Result<(String, String)> {
  let ids: Vec<String> = consented.iter().map(|p| encode_uuid(p.purpose_id)).collect();
  let timeouts: Vec<String> = consented.iter().map(|p| p.retention.to_stored()).collect();
  Ok((serde_json::to_string(&ids)?, serde_json::to_string(&timeouts)?))
}

/// Re-pair the two stored arrays; they must be the same length.
pub fn decode_consent(ids_json: &str, timeouts_json: &str) -> Result<Vec<ConsentedPurpose>> {
  let ids: Vec<Uuid> = serde_json::from_str(ids_json)?;
  let timeouts: Vec<String> = serde_json::from_str(timeouts_json)?;
  if ids.len() != timeouts.len() {
    return Err(Error::Decode(format!(
      "{} consented purposes but {} retention timeouts",
      ids.len(),
      timeouts.len()
    )));
  }
  ids
    .into_iter()
    .zip(timeouts)
    .map(|(purpose_id, t)| {
      Ok(ConsentedPurpose { purpose_id, retention: RetentionTimeout::from_stored(&t)? })
    })
    .collect()
}

// ─── Value ───────────────────────────────────────────────────────────────────

/// A typed column payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  String(String),
  Boolean(bool),
  Integer(i64),
  Timestamp(DateTime<Utc>),
  Uuid(Uuid),
  /// Composite payloads are kept as JSON objects whose keys are the
  /// snake_case field keys and whose leaves are in canonical text form.
  Composite(serde_json::Map<String, serde_json::Value>),
}

impl Value {
  /// Convert caller-supplied JSON into a value of `kind`.
  pub fn from_json(kind: &DataTypeKind, json: &serde_json::Value) -> Result<Self> {
    match kind {
      DataTypeKind::Composite { fields } => {
        let serde_json::Value::Object(input) = json else {
          return Err(Error::InvalidValue(format!("expected an object, got {json}")));
        };
        let mut out = serde_json::Map::new();
        for (key, _) in input {
          if !fields.iter().any(|f| &f.key() == key) {
            return Err(Error::InvalidValue(format!("unknown composite field {key:?}")));
          }
        }
        for field in fields {
          let key = field.key();
          let leaf = match input.get(&key) {
            None | Some(serde_json::Value::Null) => serde_json::Value::Null,
            Some(v) => scalar_from_json(field.field_type, v)?.to_json(),
          };
          out.insert(key, leaf);
        }
        Ok(Value::Composite(out))
      }
      other => {
        let scalar = other
          .scalar()
          .ok_or_else(|| Error::InvalidValue("unsupported data type".into()))?;
        scalar_from_json(scalar, json)
      }
    }
  }

  /// Decode a stored payload of `kind`.
  pub fn from_sql(kind: &DataTypeKind, raw: SqlValue) -> Result<Self> {
    let bad = |raw: &SqlValue| Error::Decode(format!("cannot decode {raw:?} as {kind:?}"));
    match (kind, &raw) {
      (DataTypeKind::String, SqlValue::Text(s)) => Ok(Value::String(s.clone())),
      (DataTypeKind::Boolean, SqlValue::Integer(i)) => Ok(Value::Boolean(*i != 0)),
      (DataTypeKind::Integer, SqlValue::Integer(i)) => Ok(Value::Integer(*i)),
      (DataTypeKind::Timestamp, SqlValue::Text(s)) => {
        parse_timestamp(s).map(Value::Timestamp).ok_or_else(|| bad(&raw))
      }
      (DataTypeKind::Uuid, SqlValue::Text(s)) => {
        Uuid::parse_str(s).map(Value::Uuid).map_err(|_| bad(&raw))
      }
      (DataTypeKind::Composite { .. }, SqlValue::Text(s)) => match serde_json::from_str(s)? {
        serde_json::Value::Object(map) => Ok(Value::Composite(map)),
        _ => Err(bad(&raw)),
      },
      _ => Err(bad(&raw)),
    }
  }

  pub fn to_sql(&self) -> SqlValue {
    match self {
      Value::String(s) => SqlValue::Text(s.clone()),
      Value::Boolean(b) => SqlValue::from_bool(*b),
      Value::Integer(i) => SqlValue::Integer(*i),
      Value::Timestamp(t) => SqlValue::from_timestamp(*t),
      Value::Uuid(u) => SqlValue::from_uuid(*u),
      Value::Composite(map) => SqlValue::Text(serde_json::Value::Object(map.clone()).to_string()),
    }
  }

  pub fn to_json(&self) -> serde_json::Value {
    match self {
      Value::String(s) => serde_json::Value::from(s.as_str()),
      Value::Boolean(b) => serde_json::Value::from(*b),
      Value::Integer(i) => serde_json::Value::from(*i),
      Value::Timestamp(t) => serde_json::Value::from(encode_timestamp(*t)),
      Value::Uuid(u) => serde_json::Value::from(encode_uuid(*u)),
      Value::Composite(map) => serde_json::Value::Object(map.clone()),
    }
  }
}

impl Serialize for Value {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    self.to_json().serialize(serializer)
  }
}

fn scalar_from_json(scalar: ScalarType, json: &serde_json::Value) -> Result<Value> {
  use serde_json::Value as J;
  let bad = || Error::InvalidValue(format!("{json} is not a valid {scalar}"));
  match (scalar, json) {
    (ScalarType::String, J::String(s)) => Ok(Value::String(s.clone())),
    (ScalarType::Boolean, J::Bool(b)) => Ok(Value::Boolean(*b)),
    (ScalarType::Boolean, J::String(s)) => parse_bool(s).map(Value::Boolean).ok_or_else(bad),
    (ScalarType::Integer, J::Number(n)) => n.as_i64().map(Value::Integer).ok_or_else(bad),
    (ScalarType::Integer, J::String(s)) => s.trim().parse().map(Value::Integer).map_err(|_| bad()),
    (ScalarType::Timestamp, J::String(s)) => parse_timestamp(s).map(Value::Timestamp).ok_or_else(bad),
    (ScalarType::Uuid, J::String(s)) => Uuid::parse_str(s).map(Value::Uuid).map_err(|_| bad()),
    _ => Err(bad()),
  }
}

// ─── Stored values ───────────────────────────────────────────────────────────

/// One row of a value table.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnValue {
  pub id:        Uuid,
  pub version:   i64,
  pub created:   DateTime<Utc>,
  pub updated:   DateTime<Utc>,
  pub column_id: Uuid,
  pub user_id:   Uuid,
  pub ordering:  i32,
  pub consented: Vec<ConsentedPurpose>,
  pub value:     Value,
}

/// Input for inserting a value. The column is addressed by name.
#[derive(Debug, Clone, Deserialize)]
pub struct NewColumnValue {
  pub column:    String,
  /// Array position; scalar columns always use ordering 0.
  #[serde(default)]
  pub ordering:  i32,
  pub value:     serde_json::Value,
  pub consented: Vec<ConsentedPurpose>,
}

/// Input for an optimistic-concurrency update of one value.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateColumnValue {
  pub expected_version: i64,
  pub value:            serde_json::Value,
  pub consented:        Vec<ConsentedPurpose>,
}
