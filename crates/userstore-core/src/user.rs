//! Users as reconstructed by a read, and the cleanup queue's entries.
//!
//! A [`User`] is never stored as a unit: it is rebuilt per query from the
//! `users` row plus whichever value rows survive consent and retention
//! filtering.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  catalog::SystemColumn,
  sql::SqlValue,
  value::{ConsentedPurpose, Value},
};

// ─── Base user ───────────────────────────────────────────────────────────────

/// The row stored in `users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseUser {
  pub id:              Uuid,
  pub organization_id: Uuid,
  pub version:         i64,
  pub created:         DateTime<Utc>,
  pub updated:         DateTime<Utc>,
  /// `None` while the user is live.
  pub deleted:         Option<DateTime<Utc>>,
}

impl BaseUser {
  /// The value of a system column for this user.
  pub fn system_value(&self, column: SystemColumn) -> Value {
    match column {
      SystemColumn::Id => Value::Uuid(self.id),
      SystemColumn::Created => Value::Timestamp(self.created),
      SystemColumn::Updated => Value::Timestamp(self.updated),
      SystemColumn::OrganizationId => Value::Uuid(self.organization_id),
      SystemColumn::Version => Value::Integer(self.version),
    }
  }
}

// ─── Reconstructed user ──────────────────────────────────────────────────────

/// One accepted value of a column, with the purposes it is still retained for.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnConsentedValue {
  pub id:                 Uuid,
  pub version:            i64,
  pub column:             String,
  pub ordering:           i32,
  pub value:              Value,
  pub consented_purposes: Vec<ConsentedPurpose>,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
  #[serde(flatten)]
  pub base: BaseUser,

  /// Column name → materialised value. Array columns become JSON arrays in
  /// ordering order.
  pub profile: BTreeMap<String, serde_json::Value>,

  /// Column name → value id → accepted value.
  pub column_values: BTreeMap<String, BTreeMap<Uuid, ColumnConsentedValue>>,

  /// Column name → retained purpose ids, one list per accepted value, in
  /// ordering order.
  pub profile_consented_purpose_ids: BTreeMap<String, Vec<Vec<Uuid>>>,

  /// Values of the requested sort keys for this user, keyed by sort key.
  /// Populated by paginated reads and used to build cursors.
  #[serde(skip)]
  pub sort_key_values: BTreeMap<String, SqlValue>,
}

impl User {
  pub fn new(base: BaseUser) -> Self {
    Self {
      base,
      profile: BTreeMap::new(),
      column_values: BTreeMap::new(),
      profile_consented_purpose_ids: BTreeMap::new(),
      sort_key_values: BTreeMap::new(),
    }
  }

  pub fn id(&self) -> Uuid { self.base.id }
}

/// Everything stored for one user: live values and soft-deleted values, both
/// read without a retention cutoff.
#[derive(Debug, Clone, Serialize)]
pub struct AllUserValues {
  pub live:         User,
  pub soft_deleted: Option<User>,
}

// ─── Cleanup queue ───────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
  strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CleanupReason {
  /// Two live values collide on (column, ordering), or a scalar column has
  /// more than one live value.
  DuplicateValue,
}

/// A queued request to repair one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCleanupCandidate {
  pub id:      Uuid,
  pub created: DateTime<Utc>,
  pub updated: DateTime<Utc>,
  /// Set once a cleanup run has claimed the candidate.
  pub deleted: Option<DateTime<Utc>>,
  pub user_id: Uuid,
  pub reason:  CleanupReason,
}

impl UserCleanupCandidate {
  pub fn new(user_id: Uuid, reason: CleanupReason) -> Self {
    let now = Utc::now();
    Self { id: Uuid::new_v4(), created: now, updated: now, deleted: None, user_id, reason }
  }
}
