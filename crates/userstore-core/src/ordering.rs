//! The last check on a rebuilt user: accepted values of one column must have
//! distinct orderings.

use std::collections::HashSet;

use crate::{Error, Result, user::User, value::LifecycleState};

/// Fail with [`Error::DuplicateOrdering`] if any column of `user` holds two
/// accepted values at the same ordering. Soft-deleted reads are exempt: a
/// value can be deleted, re-consented and deleted again at one position.
pub fn validate_orderings(user: &User, state: LifecycleState) -> Result<()> {
  if state == LifecycleState::SoftDeleted {
    return Ok(());
  }
  for (column, values) in &user.column_values {
    let orderings: HashSet<i32> = values.values().map(|v| v.ordering).collect();
    if orderings.len() != values.len() {
      return Err(Error::DuplicateOrdering { user_id: user.id(), column: column.clone() });
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use uuid::Uuid;

  use super::*;
  use crate::{
    user::{BaseUser, ColumnConsentedValue},
    value::{ConsentedPurpose, Value},
  };

  fn user_with_phones(orderings: &[i32]) -> User {
    let now = Utc::now();
    let mut user = User::new(BaseUser {
      id:              Uuid::from_u128(1),
      organization_id: Uuid::nil(),
      version:         1,
      created:         now,
      updated:         now,
      deleted:         None,
    });
    let values = orderings
      .iter()
      .enumerate()
      .map(|(i, ordering)| {
        let id = Uuid::from_u128(100 + i as u128);
        (id, ColumnConsentedValue {
          id,
          version: 1,
          column: "phones".into(),
          ordering: *ordering,
          value: Value::String(format!("{i}")),
          consented_purposes: vec![ConsentedPurpose::indefinite(Uuid::from_u128(9))],
        })
      })
      .collect();
    user.column_values.insert("phones".into(), values);
    user
  }

  #[test]
  fn distinct_orderings_pass() {
    validate_orderings(&user_with_phones(&[0, 1, 2]), LifecycleState::Live).unwrap();
  }

  #[test]
  fn duplicate_ordering_fails_live_reads() {
    let err = validate_orderings(&user_with_phones(&[0, 1, 1]), LifecycleState::Live).unwrap_err();
    assert!(matches!(err, Error::DuplicateOrdering { ref column, .. } if column == "phones"));
    assert!(!err.is_caller_error());
  }

  #[test]
  fn soft_deleted_reads_are_exempt() {
    validate_orderings(&user_with_phones(&[0, 0]), LifecycleState::SoftDeleted).unwrap();
  }
}
