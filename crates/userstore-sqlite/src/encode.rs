//! Conversions between SQLite rows and `userstore-core` types.
//!
//! Rows are first read into `Raw*` structs of plain strings and integers
//! inside the connection thread, then decoded on the async side.

use chrono::{DateTime, Utc};
use rusqlite::{
  Row, Statement,
  types::{Value as SqliteValue, ValueRef},
};
use uuid::Uuid;

use userstore_core::{
  catalog::{Catalog, ValueSlot},
  query::layout,
  rows::{UserRow, ValueRow},
  sql::{NOT_DELETED, SqlValue, encode_timestamp, encode_uuid, parse_timestamp},
  user::{BaseUser, CleanupReason, UserCleanupCandidate},
  value::{ColumnValue, ConsentedPurpose, Value, decode_consent, encode_consent},
};

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn to_sqlite(value: &SqlValue) -> SqliteValue {
  match value {
    SqlValue::Null => SqliteValue::Null,
    SqlValue::Integer(i) => SqliteValue::Integer(*i),
    SqlValue::Text(s) => SqliteValue::Text(s.clone()),
  }
}

pub fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
  match value {
    ValueRef::Null => SqlValue::Null,
    ValueRef::Integer(i) => SqlValue::Integer(i),
    ValueRef::Real(f) => SqlValue::Text(f.to_string()),
    ValueRef::Text(t) | ValueRef::Blob(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
  }
}

/// Bind `params[i]` to `$i+1`. Parameters the statement does not mention
/// are skipped.
pub fn bind(stmt: &mut Statement<'_>, params: &[SqlValue]) -> rusqlite::Result<()> {
  for (i, value) in params.iter().enumerate() {
    if let Some(index) = stmt.parameter_index(&format!("${}", i + 1))? {
      stmt.raw_bind_parameter(index, to_sqlite(value))?;
    }
  }
  Ok(())
}

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  parse_timestamp(s).ok_or_else(|| Error::DateParse(format!("invalid timestamp {s:?}")))
}

fn decode_ordering(ordering: i64) -> Result<i32> {
  i32::try_from(ordering).map_err(|_| {
    Error::Core(userstore_core::Error::Decode(format!("ordering {ordering} out of range")))
  })
}

// ─── Users ───────────────────────────────────────────────────────────────────

pub const BASE_USER_COLUMNS: &str = "id, created, updated, deleted, _version, organization_id";

/// Raw strings read from the leading `users` columns of a row.
pub struct RawBaseUser {
  pub id:              String,
  pub created:         String,
  pub updated:         String,
  pub deleted:         String,
  pub version:         i64,
  pub organization_id: String,
}

impl RawBaseUser {
  pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:              row.get(layout::USER_ID)?,
      created:         row.get(layout::USER_CREATED)?,
      updated:         row.get(layout::USER_UPDATED)?,
      deleted:         row.get(layout::USER_DELETED)?,
      version:         row.get(layout::USER_VERSION)?,
      organization_id: row.get(layout::USER_ORGANIZATION_ID)?,
    })
  }

  pub fn into_base_user(self) -> Result<BaseUser> {
    Ok(BaseUser {
      id:              decode_uuid(&self.id)?,
      organization_id: decode_uuid(&self.organization_id)?,
      version:         self.version,
      created:         decode_dt(&self.created)?,
      updated:         decode_dt(&self.updated)?,
      deleted:         match self.deleted.as_str() {
        NOT_DELETED => None,
        other => Some(decode_dt(other)?),
      },
    })
  }
}

/// The value columns of a user-query row.
pub struct RawValue {
  pub id:                 String,
  pub version:            i64,
  pub value_type:         i64,
  pub column_id:          String,
  pub ordering:           i64,
  pub purpose_ids:        String,
  pub retention_timeouts: String,
  pub slots:              Vec<SqlValue>,
  pub created:            String,
}

impl RawValue {
  /// `None` when the row carries no value (system-only reads, or a user
  /// without any requested value).
  pub fn read(row: &Row<'_>) -> rusqlite::Result<Option<Self>> {
    let Some(id) = row.get::<_, Option<String>>(layout::VALUE_ID)? else {
      return Ok(None);
    };
    let slots = (0..ValueSlot::all().count())
      .map(|i| row.get_ref(layout::VALUE_SLOTS + i).map(from_sqlite))
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Some(Self {
      id,
      version: row.get(layout::VALUE_VERSION)?,
      value_type: row.get(layout::VALUE_TYPE)?,
      column_id: row.get(layout::VALUE_COLUMN_ID)?,
      ordering: row.get(layout::VALUE_ORDERING)?,
      purpose_ids: row.get(layout::VALUE_PURPOSE_IDS)?,
      retention_timeouts: row.get(layout::VALUE_RETENTION_TIMEOUTS)?,
      slots,
      created: row.get(layout::VALUE_CREATED)?,
    }))
  }

  pub fn into_value_row(self) -> Result<ValueRow> {
    let slot = ValueSlot::from_discriminant(self.value_type)?;
    Ok(ValueRow {
      id: decode_uuid(&self.id)?,
      version: self.version,
      column_id: decode_uuid(&self.column_id)?,
      ordering: decode_ordering(self.ordering)?,
      slot,
      raw: slot_value(&self.slots, slot),
      consented: decode_consent(&self.purpose_ids, &self.retention_timeouts)?,
      created: decode_dt(&self.created)?,
    })
  }
}

fn slot_value(slots: &[SqlValue], slot: ValueSlot) -> SqlValue {
  let index = usize::try_from(slot.discriminant() - 1).unwrap_or(usize::MAX);
  slots.get(index).cloned().unwrap_or(SqlValue::Null)
}

/// One row of a user query.
pub struct RawUserRow {
  pub user:      RawBaseUser,
  pub value:     Option<RawValue>,
  pub sort_keys: Vec<SqlValue>,
}

impl RawUserRow {
  pub fn read(row: &Row<'_>, sort_keys: usize) -> rusqlite::Result<Self> {
    Ok(Self {
      user:      RawBaseUser::read(row)?,
      value:     RawValue::read(row)?,
      sort_keys: (0..sort_keys)
        .map(|i| row.get_ref(layout::SORT_KEYS + i).map(from_sqlite))
        .collect::<rusqlite::Result<Vec<_>>>()?,
    })
  }

  pub fn into_user_row(self) -> Result<UserRow> {
    Ok(UserRow {
      user:            self.user.into_base_user()?,
      value:           self.value.map(RawValue::into_value_row).transpose()?,
      sort_key_values: self.sort_keys,
    })
  }
}

// ─── Stored values ───────────────────────────────────────────────────────────

/// Every column of a value table, in the order [`RawStoredValue::read`]
/// expects.
pub fn stored_value_columns() -> String {
  let mut columns = vec![
    "id",
    "_version",
    "created",
    "updated",
    "user_id",
    "column_id",
    "value_type",
    "ordering",
    "consented_purpose_ids",
    "retention_timeouts",
  ];
  columns.extend(ValueSlot::all().map(ValueSlot::column));
  columns.join(", ")
}

const STORED_SLOTS: usize = 10;

/// A full value-table row.
#[derive(Debug, Clone)]
pub struct RawStoredValue {
  pub id:                 String,
  pub version:            i64,
  pub created:            String,
  pub updated:            String,
  pub user_id:            String,
  pub column_id:          String,
  pub value_type:         i64,
  pub ordering:           i64,
  pub purpose_ids:        String,
  pub retention_timeouts: String,
  pub slots:              Vec<SqlValue>,
}

impl RawStoredValue {
  /// A fresh row at version 1.
  pub fn new(
    user_id: Uuid,
    column_id: Uuid,
    ordering: i32,
    slot: ValueSlot,
    value: &Value,
    consented: &[ConsentedPurpose],
  ) -> Result<Self> {
    let now = encode_timestamp(Utc::now());
    let (purpose_ids, retention_timeouts) = encode_consent(consented)?;
    let mut raw = Self {
      id: encode_uuid(Uuid::new_v4()),
      version: 1,
      created: now.clone(),
      updated: now,
      user_id: encode_uuid(user_id),
      column_id: encode_uuid(column_id),
      value_type: 0,
      ordering: i64::from(ordering),
      purpose_ids,
      retention_timeouts,
      slots: Vec::new(),
    };
    raw.set_payload(slot, value.to_sql());
    Ok(raw)
  }

  pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                 row.get(0)?,
      version:            row.get(1)?,
      created:            row.get(2)?,
      updated:            row.get(3)?,
      user_id:            row.get(4)?,
      column_id:          row.get(5)?,
      value_type:         row.get(6)?,
      ordering:           row.get(7)?,
      purpose_ids:        row.get(8)?,
      retention_timeouts: row.get(9)?,
      slots:              (0..ValueSlot::all().count())
        .map(|i| row.get_ref(STORED_SLOTS + i).map(from_sqlite))
        .collect::<rusqlite::Result<Vec<_>>>()?,
    })
  }

  pub fn slot(&self) -> Result<ValueSlot> { Ok(ValueSlot::from_discriminant(self.value_type)?) }

  pub fn payload(&self) -> Result<SqlValue> { Ok(slot_value(&self.slots, self.slot()?)) }

  /// Clear every slot and store `value` in `slot`.
  pub fn set_payload(&mut self, slot: ValueSlot, value: SqlValue) {
    self.slots = ValueSlot::all()
      .map(|s| if s == slot { value.clone() } else { SqlValue::Null })
      .collect();
    self.value_type = slot.discriminant();
  }

  pub fn consented(&self) -> Result<Vec<ConsentedPurpose>> {
    Ok(decode_consent(&self.purpose_ids, &self.retention_timeouts)?)
  }

  pub fn set_consented(&mut self, consented: &[ConsentedPurpose]) -> Result<()> {
    (self.purpose_ids, self.retention_timeouts) = encode_consent(consented)?;
    Ok(())
  }

  /// Insert into `table` (one of the two value tables).
  pub fn insert(&self, conn: &rusqlite::Connection, table: &str) -> rusqlite::Result<()> {
    let placeholders: Vec<String> = (1..=STORED_SLOTS + self.slots.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
      "INSERT INTO {table} ({}) VALUES ({})",
      stored_value_columns(),
      placeholders.join(", ")
    );
    let mut values = vec![
      SqliteValue::Text(self.id.clone()),
      SqliteValue::Integer(self.version),
      SqliteValue::Text(self.created.clone()),
      SqliteValue::Text(self.updated.clone()),
      SqliteValue::Text(self.user_id.clone()),
      SqliteValue::Text(self.column_id.clone()),
      SqliteValue::Integer(self.value_type),
      SqliteValue::Integer(self.ordering),
      SqliteValue::Text(self.purpose_ids.clone()),
      SqliteValue::Text(self.retention_timeouts.clone()),
    ];
    values.extend(self.slots.iter().map(to_sqlite));
    conn.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(())
  }

  pub fn into_column_value(self, catalog: &Catalog) -> Result<ColumnValue> {
    let column_id = decode_uuid(&self.column_id)?;
    let desc = catalog
      .column_by_id(column_id)
      .ok_or(userstore_core::Error::UnknownColumnId(column_id))?;
    let value = Value::from_sql(desc.kind(), self.payload()?)?;
    Ok(ColumnValue {
      id: decode_uuid(&self.id)?,
      version: self.version,
      created: decode_dt(&self.created)?,
      updated: decode_dt(&self.updated)?,
      column_id,
      user_id: decode_uuid(&self.user_id)?,
      ordering: decode_ordering(self.ordering)?,
      consented: self.consented()?,
      value,
    })
  }
}

// ─── Cleanup candidates ──────────────────────────────────────────────────────

pub const CANDIDATE_COLUMNS: &str = "id, created, updated, deleted, user_id, reason";

pub struct RawCandidate {
  pub id:      String,
  pub created: String,
  pub updated: String,
  pub deleted: String,
  pub user_id: String,
  pub reason:  String,
}

impl RawCandidate {
  pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:      row.get(0)?,
      created: row.get(1)?,
      updated: row.get(2)?,
      deleted: row.get(3)?,
      user_id: row.get(4)?,
      reason:  row.get(5)?,
    })
  }

  pub fn into_candidate(self) -> Result<UserCleanupCandidate> {
    Ok(UserCleanupCandidate {
      id:      decode_uuid(&self.id)?,
      created: decode_dt(&self.created)?,
      updated: decode_dt(&self.updated)?,
      deleted: match self.deleted.as_str() {
        NOT_DELETED => None,
        other => Some(decode_dt(other)?),
      },
      user_id: decode_uuid(&self.user_id)?,
      reason:  self
        .reason
        .parse::<CleanupReason>()
        .map_err(|_| userstore_core::Error::Decode(format!("unknown cleanup reason {:?}", self.reason)))?,
    })
  }
}
