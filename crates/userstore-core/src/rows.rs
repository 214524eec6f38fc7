//! Rebuilding users from flat query rows.
//!
//! Rows arrive grouped by user, then by column, then by ordering (see
//! [`crate::query`]). The processor keeps at most one user open at a time
//! and finalises it as soon as the next user's first row is seen.
//!
//! Corrupt rows (a repeated ordering in an array column, or a second value
//! in a scalar column) never fail the read: the value is dropped, a warning
//! is logged, and the user is flagged for cleanup. A duplicate that survives
//! into a finalised user is a bug and fails the whole read.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use strum::IntoEnumIterator as _;
use uuid::Uuid;

use crate::{
  Error, Result,
  catalog::{Catalog, SystemColumn, ValueSlot},
  ordering::validate_orderings,
  sql::SqlValue,
  user::{BaseUser, CleanupReason, ColumnConsentedValue, User, UserCleanupCandidate},
  value::{ConsentedPurpose, LifecycleState, RetentionCutoff, RetentionTimeout, Value},
};

/// Ordering given to materialised system-column values.
pub const SYSTEM_ORDERING: i32 = 1;

/// One value-table row as read by a query.
#[derive(Debug, Clone)]
pub struct ValueRow {
  pub id:        Uuid,
  pub version:   i64,
  pub column_id: Uuid,
  pub ordering:  i32,
  /// Slot named by the row's `value_type`, and the raw payload read from it.
  pub slot:      ValueSlot,
  pub raw:       SqlValue,
  pub consented: Vec<ConsentedPurpose>,
  pub created:   DateTime<Utc>,
}

/// One result row: the user, at most one value, and the projected sort keys.
#[derive(Debug, Clone)]
pub struct UserRow {
  pub user:            BaseUser,
  pub value:           Option<ValueRow>,
  pub sort_key_values: Vec<SqlValue>,
}

/// Output of a processed result set.
#[derive(Debug, Default)]
pub struct Processed {
  pub users:   Vec<User>,
  pub cleanup: Vec<UserCleanupCandidate>,
}

struct OpenColumn {
  name:      String,
  array:     bool,
  orderings: HashSet<i32>,
  accepted:  Vec<ColumnConsentedValue>,
}

struct OpenUser {
  user:    User,
  /// Value ids already seen, accepted or not. Sort joins can repeat rows.
  seen:    HashSet<Uuid>,
  columns: BTreeMap<Uuid, OpenColumn>,
  current: Option<Uuid>,
}

pub struct RowProcessor<'a> {
  catalog:           &'a Catalog,
  state:             LifecycleState,
  cutoff:            RetentionCutoff,
  expected_columns:  &'a [Uuid],
  expected_purposes: &'a [Uuid],
  sort_keys:         &'a [String],

  open:     Option<OpenUser>,
  finished: HashSet<Uuid>,
  flagged:  HashSet<Uuid>,
  out:      Processed,
}

impl<'a> RowProcessor<'a> {
  pub fn new(catalog: &'a Catalog, state: LifecycleState, cutoff: RetentionCutoff) -> Self {
    Self {
      catalog,
      state,
      cutoff,
      expected_columns: &[],
      expected_purposes: &[],
      sort_keys: &[],
      open: None,
      finished: HashSet::new(),
      flagged: HashSet::new(),
      out: Processed::default(),
    }
  }

  /// Only include users with a value for at least one of `columns`.
  pub fn expect_columns(mut self, columns: &'a [Uuid]) -> Self {
    self.expected_columns = columns;
    self
  }

  /// Drop values not currently retained for every one of `purposes`.
  pub fn expect_purposes(mut self, purposes: &'a [Uuid]) -> Self {
    self.expected_purposes = purposes;
    self
  }

  /// Names of the sort-key values projected at the end of each row.
  pub fn sort_keys(mut self, keys: &'a [String]) -> Self {
    self.sort_keys = keys;
    self
  }

  pub fn push(&mut self, row: UserRow) -> Result<()> {
    let user_id = row.user.id;
    if self.open.as_ref().is_none_or(|open| open.user.id() != user_id) {
      self.finish_user()?;
      if self.finished.contains(&user_id) {
        tracing::warn!(%user_id, "rows for user are not contiguous; ignoring the rest");
        return Ok(());
      }
      self.open = Some(self.open_user(&row));
    }
    if let Some(value) = row.value {
      self.push_value(value)?;
    }
    Ok(())
  }

  pub fn finish(mut self) -> Result<Processed> {
    self.finish_user()?;
    Ok(self.out)
  }

  fn open_user(&self, row: &UserRow) -> OpenUser {
    let mut user = User::new(row.user.clone());
    user.sort_key_values = self
      .sort_keys
      .iter()
      .cloned()
      .zip(row.sort_key_values.iter().cloned())
      .collect();
    OpenUser { user, seen: HashSet::new(), columns: BTreeMap::new(), current: None }
  }

  fn push_value(&mut self, row: ValueRow) -> Result<()> {
    let (catalog, state) = (self.catalog, self.state);
    let Some(open) = self.open.as_mut() else {
      return Ok(());
    };
    if !open.seen.insert(row.id) {
      return Ok(());
    }
    let user_id = open.user.id();

    // Open the column if this row starts a new one.
    if open.current != Some(row.column_id) {
      let Some(desc) = catalog.column_by_id(row.column_id) else {
        tracing::warn!(%user_id, column_id = %row.column_id, "value for unknown column; skipping");
        return Ok(());
      };
      if desc.is_system() {
        return Err(Error::Decode(format!("value row for system column {}", desc.name())));
      }
      open.current = Some(row.column_id);
      open.columns.entry(row.column_id).or_insert_with(|| OpenColumn {
        name:      desc.name().to_owned(),
        array:     desc.is_array() || state == LifecycleState::SoftDeleted,
        orderings: HashSet::new(),
        accepted:  Vec::new(),
      });
    }
    let Some(desc) = catalog.column_by_id(row.column_id) else {
      return Ok(());
    };
    if desc.slot(state) != Some(row.slot) {
      return Err(Error::Decode(format!(
        "value {} of column {} is stored as {:?}",
        row.id,
        desc.name(),
        row.slot
      )));
    }

    let retained: Vec<ConsentedPurpose> = row
      .consented
      .iter()
      .filter(|p| self.cutoff.retains(p.retention))
      .cloned()
      .collect();
    let covered = self
      .expected_purposes
      .iter()
      .all(|want| retained.iter().any(|p| p.purpose_id == *want));
    if retained.is_empty() || !covered {
      return Ok(());
    }

    let Some(column) = open.columns.get_mut(&row.column_id) else {
      return Ok(());
    };
    let duplicate = if column.array {
      state == LifecycleState::Live && column.orderings.contains(&row.ordering)
    } else {
      !column.accepted.is_empty()
    };
    if duplicate {
      tracing::warn!(
        %user_id,
        column = %column.name,
        value_id = %row.id,
        ordering = row.ordering,
        "duplicate live value; dropping it and flagging the user for cleanup"
      );
      if self.flagged.insert(user_id) {
        self
          .out
          .cleanup
          .push(UserCleanupCandidate::new(user_id, CleanupReason::DuplicateValue));
      }
      return Ok(());
    }

    let value = Value::from_sql(desc.kind(), row.raw)?;
    column.orderings.insert(row.ordering);
    column.accepted.push(ColumnConsentedValue {
      id: row.id,
      version: row.version,
      column: column.name.clone(),
      ordering: row.ordering,
      value,
      consented_purposes: retained,
    });
    Ok(())
  }

  fn finish_user(&mut self) -> Result<()> {
    let Some(open) = self.open.take() else {
      return Ok(());
    };
    let OpenUser { mut user, columns, .. } = open;
    self.finished.insert(user.id());

    let mut has_value_for = HashSet::new();
    for (column_id, column) in columns {
      if column.accepted.is_empty() {
        continue;
      }
      has_value_for.insert(column_id);
      materialise(&mut user, column.name, column.array, column.accepted);
    }
    materialise_system_columns(&mut user);
    has_value_for.extend(SystemColumn::iter().map(SystemColumn::column_id));

    let wanted = self.expected_columns.is_empty()
      || self.expected_columns.iter().any(|c| has_value_for.contains(c));
    if !wanted {
      return Ok(());
    }
    validate_orderings(&user, self.state)?;
    self.out.users.push(user);
    Ok(())
  }
}

/// A user holding only its system-column values.
pub fn materialise_base(base: BaseUser) -> User {
  let mut user = User::new(base);
  materialise_system_columns(&mut user);
  user
}

fn materialise(user: &mut User, name: String, array: bool, accepted: Vec<ColumnConsentedValue>) {
  let purposes: Vec<Vec<Uuid>> = accepted
    .iter()
    .map(|v| v.consented_purposes.iter().map(|p| p.purpose_id).collect())
    .collect();
  let profile = if array {
    serde_json::Value::Array(accepted.iter().map(|v| v.value.to_json()).collect())
  } else {
    accepted.first().map(|v| v.value.to_json()).unwrap_or_default()
  };
  user.profile.insert(name.clone(), profile);
  user.profile_consented_purpose_ids.insert(name.clone(), purposes);
  user
    .column_values
    .insert(name, accepted.into_iter().map(|v| (v.id, v)).collect());
}

/// System columns appear in every user with a nil, indefinitely retained
/// purpose.
fn materialise_system_columns(user: &mut User) {
  for system in SystemColumn::iter() {
    materialise_system(user, system);
  }
}

fn materialise_system(user: &mut User, system: SystemColumn) {
  let value = ColumnConsentedValue {
    id:                 user.id(),
    version:            user.base.version,
    column:             system.to_string(),
    ordering:           SYSTEM_ORDERING,
    value:              user.base.system_value(system),
    consented_purposes: vec![ConsentedPurpose {
      purpose_id: Uuid::nil(),
      retention:  RetentionTimeout::Indefinite,
    }],
  };
  materialise(user, system.to_string(), false, vec![value]);
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone as _};

  use super::*;
  use crate::catalog::fixtures;

  const OPERATIONAL: Uuid = Uuid::from_u128(0x0a);
  const MARKETING: Uuid = Uuid::from_u128(0x0b);

  fn t(secs: i64) -> DateTime<Utc> { Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap() }

  fn base(n: u128) -> BaseUser {
    BaseUser {
      id:              Uuid::from_u128(n),
      organization_id: Uuid::nil(),
      version:         1,
      created:         t(0),
      updated:         t(0),
      deleted:         None,
    }
  }

  fn value(id: u128, column_id: Uuid, ordering: i32, raw: SqlValue) -> ValueRow {
    let slot = if column_id == fixtures::AGE { ValueSlot::Int } else { ValueSlot::Varchar };
    ValueRow {
      id: Uuid::from_u128(id),
      version: 1,
      column_id,
      ordering,
      slot,
      raw,
      consented: vec![ConsentedPurpose::indefinite(OPERATIONAL)],
      created: t(0),
    }
  }

  fn row(user: u128, v: Option<ValueRow>) -> UserRow {
    UserRow { user: base(user), value: v, sort_key_values: vec![] }
  }

  fn process(rows: Vec<UserRow>, processor: RowProcessor<'_>) -> Processed {
    let mut processor = processor;
    for r in rows {
      processor.push(r).unwrap();
    }
    processor.finish().unwrap()
  }

  #[test]
  fn rebuilds_users_with_profiles_and_system_values() {
    let catalog = fixtures::catalog();
    let rows = vec![
      row(1, Some(value(10, fixtures::EMAIL, 0, SqlValue::text("a@x")))),
      row(1, Some(value(11, fixtures::PHONES, 0, SqlValue::text("111")))),
      row(1, Some(value(12, fixtures::PHONES, 1, SqlValue::text("222")))),
      row(2, None),
    ];
    let out = process(rows, RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::now()));

    assert_eq!(out.users.len(), 2);
    assert!(out.cleanup.is_empty());
    let first = &out.users[0];
    assert_eq!(first.profile["email"], serde_json::json!("a@x"));
    assert_eq!(first.profile["phones"], serde_json::json!(["111", "222"]));
    assert_eq!(first.profile_consented_purpose_ids["phones"], vec![vec![OPERATIONAL]; 2]);
    assert_eq!(first.column_values["phones"].len(), 2);

    let id = &first.column_values["id"][&first.id()];
    assert_eq!(id.ordering, SYSTEM_ORDERING);
    assert_eq!(id.consented_purposes[0].purpose_id, Uuid::nil());
    assert_eq!(first.profile["id"], serde_json::json!(first.id().to_string()));
  }

  #[test]
  fn purpose_filtering() {
    let catalog = fixtures::catalog();
    let mut both = value(10, fixtures::EMAIL, 0, SqlValue::text("a@x"));
    both.consented.push(ConsentedPurpose::indefinite(MARKETING));

    for (wanted, kept) in [
      (vec![OPERATIONAL], true),
      (vec![MARKETING], true),
      (vec![OPERATIONAL, MARKETING], true),
      (vec![Uuid::from_u128(0x0c)], false),
    ] {
      let columns = [fixtures::EMAIL];
      let processor = RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::now())
        .expect_columns(&columns)
        .expect_purposes(&wanted);
      let out = process(vec![row(1, Some(both.clone()))], processor);
      assert_eq!(out.users.len(), usize::from(kept), "{wanted:?}");
    }
  }

  #[test]
  fn retention_cutoff_is_exclusive() {
    let catalog = fixtures::catalog();
    let expires = t(100);
    let mut v = value(10, fixtures::EMAIL, 0, SqlValue::text("a@x"));
    v.consented = vec![ConsentedPurpose { purpose_id: OPERATIONAL, retention: RetentionTimeout::Until(expires) }];

    for (cutoff, kept) in [
      (expires - Duration::seconds(1), true),
      (expires, false),
      (expires + Duration::seconds(1), false),
    ] {
      let out = process(
        vec![row(1, Some(v.clone()))],
        RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::At(cutoff)),
      );
      assert_eq!(out.users[0].column_values.contains_key("email"), kept, "{cutoff}");
    }

    let out = process(
      vec![row(1, Some(v))],
      RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::Unbounded),
    );
    assert!(out.users[0].column_values.contains_key("email"));
  }

  #[test]
  fn partially_expired_values_keep_only_retained_purposes() {
    let catalog = fixtures::catalog();
    let mut v = value(10, fixtures::EMAIL, 0, SqlValue::text("a@x"));
    v.consented.push(ConsentedPurpose { purpose_id: MARKETING, retention: RetentionTimeout::Until(t(1)) });
    let out = process(
      vec![row(1, Some(v))],
      RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::At(t(5))),
    );
    assert_eq!(out.users[0].profile_consented_purpose_ids["email"], vec![vec![OPERATIONAL]]);
  }

  #[test]
  fn duplicate_array_ordering_is_dropped_and_flagged() {
    let catalog = fixtures::catalog();
    let rows = vec![
      row(1, Some(value(11, fixtures::PHONES, 0, SqlValue::text("111")))),
      row(1, Some(value(12, fixtures::PHONES, 0, SqlValue::text("222")))),
      row(1, Some(value(13, fixtures::PHONES, 0, SqlValue::text("333")))),
    ];
    let out = process(rows, RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::now()));
    assert_eq!(out.users[0].profile["phones"], serde_json::json!(["111"]));
    assert_eq!(out.cleanup.len(), 1);
    assert_eq!(out.cleanup[0].user_id, Uuid::from_u128(1));
    assert_eq!(out.cleanup[0].reason, CleanupReason::DuplicateValue);
  }

  #[test]
  fn second_scalar_value_is_dropped_and_flagged() {
    let catalog = fixtures::catalog();
    let rows = vec![
      row(1, Some(value(10, fixtures::EMAIL, 0, SqlValue::text("first")))),
      row(1, Some(value(11, fixtures::EMAIL, 1, SqlValue::text("second")))),
    ];
    let out = process(rows, RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::now()));
    assert_eq!(out.users[0].profile["email"], serde_json::json!("first"));
    assert_eq!(out.users[0].column_values["email"].len(), 1);
    assert_eq!(out.cleanup.len(), 1);
  }

  #[test]
  fn soft_deleted_tolerates_duplicates() {
    let catalog = fixtures::catalog();
    let rows = vec![
      row(1, Some(value(10, fixtures::EMAIL, 0, SqlValue::text("old")))),
      row(1, Some(value(11, fixtures::EMAIL, 0, SqlValue::text("older")))),
    ];
    let out = process(
      rows,
      RowProcessor::new(&catalog, LifecycleState::SoftDeleted, RetentionCutoff::Unbounded),
    );
    assert_eq!(out.users[0].profile["email"], serde_json::json!(["old", "older"]));
    assert!(out.cleanup.is_empty());
  }

  #[test]
  fn users_without_expected_columns_are_excluded() {
    let catalog = fixtures::catalog();
    let columns = [fixtures::EMAIL];
    let rows = vec![
      row(1, Some(value(10, fixtures::EMAIL, 0, SqlValue::text("a@x")))),
      row(2, None),
    ];
    let out = process(
      rows,
      RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::now()).expect_columns(&columns),
    );
    assert_eq!(out.users.len(), 1);
    assert_eq!(out.users[0].id(), Uuid::from_u128(1));
  }

  #[test]
  fn repeated_rows_and_sort_keys() {
    let catalog = fixtures::catalog();
    let keys = vec!["age".to_owned(), "id".to_owned()];
    let sort = vec![SqlValue::Integer(30), SqlValue::from_uuid(Uuid::from_u128(1))];
    let age = value(10, fixtures::AGE, 0, SqlValue::Integer(30));
    let rows = vec![
      UserRow { user: base(1), value: Some(age.clone()), sort_key_values: sort.clone() },
      UserRow { user: base(1), value: Some(age), sort_key_values: sort },
    ];
    let out = process(
      rows,
      RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::now()).sort_keys(&keys),
    );
    assert!(out.cleanup.is_empty());
    assert_eq!(out.users[0].sort_key_values["age"], SqlValue::Integer(30));
    assert_eq!(out.users[0].profile["age"], serde_json::json!(30));
  }

  #[test]
  fn mismatched_slot_is_a_decode_error() {
    let catalog = fixtures::catalog();
    let mut v = value(10, fixtures::EMAIL, 0, SqlValue::text("a@x"));
    v.slot = ValueSlot::Jsonb;
    let mut processor = RowProcessor::new(&catalog, LifecycleState::Live, RetentionCutoff::now());
    assert!(matches!(processor.push(row(1, Some(v))), Err(Error::Decode(_))));
  }
}
