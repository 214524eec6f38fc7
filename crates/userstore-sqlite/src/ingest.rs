//! The write side: users, value ingestion, versioned updates and soft
//! deletes.
//!
//! Multi-statement writes run as synchronous functions over one immediate
//! transaction inside the connection thread; they return this crate's
//! `Result` so domain errors survive the trip back.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior};
use uuid::Uuid;

use userstore_core::{
  catalog::Catalog,
  sql::{NOT_DELETED, encode_timestamp, encode_uuid},
  store::UserWriter,
  user::BaseUser,
  value::{
    ColumnValue, ConsentedPurpose, LifecycleState, NewColumnValue, RetentionTimeout,
    UpdateColumnValue, Value, validate_consent,
  },
};

use crate::{
  Error, Result, SqliteStore,
  encode::{RawStoredValue, decode_uuid, stored_value_columns},
};

const LIVE: &str = "user_column_pre_delete_values";
const SOFT_DELETED: &str = "user_column_post_delete_values";

// ─── Transaction helpers ─────────────────────────────────────────────────────

/// Value rows of `table` matching `filter` (which binds `?1`), in the order
/// the row processor reads them.
pub(crate) fn select_stored(
  conn: &Connection,
  table: &str,
  filter: &str,
  arg: &str,
) -> rusqlite::Result<Vec<RawStoredValue>> {
  let sql = format!(
    "SELECT {} FROM {table} WHERE {filter} ORDER BY column_id, ordering, created, id",
    stored_value_columns()
  );
  let mut stmt = conn.prepare(&sql)?;
  stmt
    .query_map(rusqlite::params![arg], RawStoredValue::read)?
    .collect::<rusqlite::Result<Vec<_>>>()
}

/// Run a versioned `UPDATE`. Zero affected rows is a [`Error::VersionConflict`].
pub(crate) fn execute_with_version_check(
  conn: &Connection,
  sql: &str,
  params: impl rusqlite::Params,
  id: Uuid,
  expected: i64,
) -> Result<usize> {
  match conn.execute(sql, params).map_err(constraint_to_invalid)? {
    0 => Err(Error::VersionConflict { id, expected }),
    n => Ok(n),
  }
}

/// A unique slot already holding the same value is the caller's problem,
/// not a storage failure.
fn constraint_to_invalid(e: rusqlite::Error) -> Error {
  if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
    Error::Core(userstore_core::Error::InvalidValue(format!("value rejected: {e}")))
  } else {
    e.into()
  }
}

fn user_is_live(conn: &Connection, user_id: Uuid) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM users WHERE id = ?1 AND deleted = ?2",
        rusqlite::params![encode_uuid(user_id), NOT_DELETED],
        |_| Ok(()),
      )
      .optional()?
      .is_some(),
  )
}

/// Move one live row to the soft-deleted table. Its payload moves to the
/// soft-deleted slot and indefinite retention becomes `retention_until`.
pub(crate) fn move_to_soft_deleted(
  conn: &Connection,
  catalog: &Catalog,
  mut raw: RawStoredValue,
  retention_until: DateTime<Utc>,
) -> Result<()> {
  let live_id = raw.id.clone();
  let column_id = decode_uuid(&raw.column_id)?;
  let payload = raw.payload()?;
  let target = catalog
    .column_by_id(column_id)
    .and_then(|desc| desc.slot(LifecycleState::SoftDeleted))
    .map_or_else(|| raw.slot(), Ok)?;
  raw.set_payload(target, payload);

  let consented: Vec<ConsentedPurpose> = raw
    .consented()?
    .into_iter()
    .map(|p| match p.retention {
      RetentionTimeout::Indefinite => ConsentedPurpose {
        retention: RetentionTimeout::Until(retention_until),
        ..p
      },
      RetentionTimeout::Until(_) => p,
    })
    .collect();
  validate_consent(&consented, LifecycleState::SoftDeleted)?;
  raw.set_consented(&consented)?;
  raw.version += 1;
  raw.updated = encode_timestamp(Utc::now());

  raw.insert(conn, SOFT_DELETED)?;
  conn.execute(&format!("DELETE FROM {LIVE} WHERE id = ?1"), rusqlite::params![live_id])?;
  Ok(())
}

pub(crate) fn delete_user_tx(
  conn: &mut Connection,
  catalog: &Catalog,
  id: Uuid,
  retention_until: DateTime<Utc>,
) -> Result<bool> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let now = encode_timestamp(Utc::now());
  let id_str = encode_uuid(id);
  let marked = tx.execute(
    "UPDATE users SET deleted = ?1, updated = ?1, _version = _version + 1
     WHERE id = ?2 AND deleted = ?3",
    rusqlite::params![now, id_str, NOT_DELETED],
  )?;
  if marked == 0 {
    return Ok(false);
  }
  for raw in select_stored(&tx, LIVE, "user_id = ?1", &id_str)? {
    move_to_soft_deleted(&tx, catalog, raw, retention_until)?;
  }
  tx.commit()?;
  Ok(true)
}

fn insert_values_tx(conn: &mut Connection, user_id: Uuid, raws: &[RawStoredValue]) -> Result<()> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  if !user_is_live(&tx, user_id)? {
    return Err(Error::UserNotFound(user_id));
  }
  for raw in raws {
    let taken: Option<String> = tx
      .query_row(
        &format!("SELECT id FROM {LIVE} WHERE user_id = ?1 AND column_id = ?2 AND ordering = ?3"),
        rusqlite::params![raw.user_id, raw.column_id, raw.ordering],
        |row| row.get(0),
      )
      .optional()?;
    if let Some(existing) = taken {
      return Err(Error::Core(userstore_core::Error::InvalidValue(format!(
        "column {} already has value {existing} at ordering {}",
        raw.column_id, raw.ordering
      ))));
    }
    raw.insert(&tx, LIVE).map_err(constraint_to_invalid)?;
  }
  tx.commit()?;
  Ok(())
}

fn update_value_tx(
  conn: &mut Connection,
  catalog: &Catalog,
  id: Uuid,
  update: &UpdateColumnValue,
) -> Result<RawStoredValue> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let mut raw = select_stored(&tx, LIVE, "id = ?1", &encode_uuid(id))?
    .into_iter()
    .next()
    .ok_or(Error::ValueNotFound(id))?;
  if raw.version != update.expected_version {
    return Err(Error::VersionConflict { id, expected: update.expected_version });
  }
  let column_id = decode_uuid(&raw.column_id)?;
  let desc = catalog
    .column_by_id(column_id)
    .ok_or(userstore_core::Error::UnknownColumnId(column_id))?;
  let value = Value::from_json(desc.kind(), &update.value)?;
  validate_consent(&update.consented, LifecycleState::Live)?;

  raw.set_payload(raw.slot()?, value.to_sql());
  raw.set_consented(&update.consented)?;
  raw.version += 1;
  raw.updated = encode_timestamp(Utc::now());

  let mut params: Vec<rusqlite::types::Value> = vec![
    raw.version.into(),
    raw.updated.clone().into(),
    raw.purpose_ids.clone().into(),
    raw.retention_timeouts.clone().into(),
  ];
  params.extend(raw.slots.iter().map(crate::encode::to_sqlite));
  params.push(raw.id.clone().into());
  params.push(update.expected_version.into());
  let slot_sets: Vec<String> = userstore_core::catalog::ValueSlot::all()
    .enumerate()
    .map(|(i, slot)| format!("{} = ?{}", slot.column(), i + 5))
    .collect();
  let n = params.len();
  let sql = format!(
    "UPDATE {LIVE} SET _version = ?1, updated = ?2, consented_purpose_ids = ?3,
       retention_timeouts = ?4, {}
     WHERE id = ?{} AND _version = ?{}",
    slot_sets.join(", "),
    n - 1,
    n
  );
  execute_with_version_check(&tx, &sql, rusqlite::params_from_iter(params), id, update.expected_version)?;
  tx.commit()?;
  Ok(raw)
}

fn soft_delete_value_tx(
  conn: &mut Connection,
  catalog: &Catalog,
  id: Uuid,
  retention_until: DateTime<Utc>,
) -> Result<bool> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let Some(raw) = select_stored(&tx, LIVE, "id = ?1", &encode_uuid(id))?.into_iter().next() else {
    return Ok(false);
  };
  move_to_soft_deleted(&tx, catalog, raw, retention_until)?;
  tx.commit()?;
  Ok(true)
}

// ─── UserWriter impl ─────────────────────────────────────────────────────────

impl UserWriter for SqliteStore {
  type Error = Error;

  async fn create_user(&self, organization_id: Uuid) -> Result<BaseUser> {
    let now = Utc::now();
    let user = BaseUser {
      id: Uuid::new_v4(),
      organization_id,
      version: 1,
      created: now,
      updated: now,
      deleted: None,
    };

    let id_str  = encode_uuid(user.id);
    let org_str = encode_uuid(organization_id);
    let at_str  = encode_timestamp(now);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO users (id, organization_id, _version, created, updated, deleted)
           VALUES (?1, ?2, 1, ?3, ?3, ?4)",
          rusqlite::params![id_str, org_str, at_str, NOT_DELETED],
        )?;
        Ok(())
      })
      .await?;
    tracing::debug!(user_id = %user.id, %organization_id, "user created");
    Ok(user)
  }

  async fn insert_values(&self, user_id: Uuid, values: Vec<NewColumnValue>) -> Result<Vec<ColumnValue>> {
    let catalog = self.catalog.snapshot();
    let mut raws = Vec::with_capacity(values.len());
    let mut positions = HashSet::new();
    for input in &values {
      let desc = catalog
        .column_by_name(&input.column)
        .ok_or_else(|| userstore_core::Error::UnknownColumn(input.column.clone()))?;
      if desc.is_system() {
        return Err(
          userstore_core::Error::InvalidValue(format!("system column {:?} is not writable", input.column))
            .into(),
        );
      }
      if input.ordering < 0 || (!desc.is_array() && input.ordering != 0) {
        return Err(
          userstore_core::Error::InvalidValue(format!(
            "ordering {} is not valid for column {:?}",
            input.ordering, input.column
          ))
          .into(),
        );
      }
      if !positions.insert((desc.id(), input.ordering)) {
        return Err(
          userstore_core::Error::InvalidValue(format!(
            "two values for column {:?} at ordering {}",
            input.column, input.ordering
          ))
          .into(),
        );
      }
      validate_consent(&input.consented, LifecycleState::Live)?;
      let value = Value::from_json(desc.kind(), &input.value)?;
      let slot = desc
        .slot(LifecycleState::Live)
        .ok_or(userstore_core::Error::UnknownColumnId(desc.id()))?;
      raws.push(RawStoredValue::new(user_id, desc.id(), input.ordering, slot, &value, &input.consented)?);
    }

    let stored = raws.clone();
    self
      .conn
      .call(move |conn| Ok(insert_values_tx(conn, user_id, &stored)))
      .await??;
    tracing::debug!(%user_id, count = raws.len(), "values inserted");
    raws.into_iter().map(|raw| raw.into_column_value(&catalog)).collect()
  }

  async fn update_value(&self, id: Uuid, update: UpdateColumnValue) -> Result<ColumnValue> {
    let catalog = self.catalog.snapshot();
    let tx_catalog = catalog.clone();
    let raw = self
      .conn
      .call(move |conn| Ok(update_value_tx(conn, &tx_catalog, id, &update)))
      .await??;
    raw.into_column_value(&catalog)
  }

  async fn soft_delete_value(&self, id: Uuid) -> Result<bool> {
    let catalog = self.catalog.snapshot();
    let retention_until = Utc::now() + self.soft_delete_retention;
    Ok(
      self
        .conn
        .call(move |conn| Ok(soft_delete_value_tx(conn, &catalog, id, retention_until)))
        .await??,
    )
  }
}

/// Insert a raw live row, bypassing every ingestion check.
#[cfg(test)]
pub(crate) fn insert_raw_live(conn: &Connection, raw: &RawStoredValue) -> rusqlite::Result<()> {
  raw.insert(conn, LIVE)
}
