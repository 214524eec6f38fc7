//! Keyset pagination.
//!
//! A [`Paginator`] names one or more sort keys (the last of which must be
//! `id`, so every position is unique), a sort order, a page size and at most
//! one [`Cursor`]. Cursors are opaque to callers: base64 of the sort-key
//! values of the row they point at.
//!
//! Queries fetch `limit + 1` rows in the *inner* direction, which is the
//! requested order when paging forward and its reverse when paging backward.
//! [`Page::from_rows`] trims and restores the requested order. Pages from
//! several regions are combined with [`Page::merge`].

use std::{cmp::Ordering, str::FromStr as _};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  catalog::SystemColumn,
  sql::SqlValue,
  user::{BaseUser, User},
};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 1500;

/// The sort key every key list must end with.
pub const FINAL_SORT_KEY: &str = "id";

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
  strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortOrder {
  #[default]
  Ascending,
  Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Forward,
  Backward,
}

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// The sort-key values of one row, in sort-key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub Vec<(String, SqlValue)>);

impl Cursor {
  /// The cursor pointing at `item`.
  pub fn at<T: Keyset>(item: &T, sort_keys: &[String]) -> Self {
    Cursor(
      sort_keys
        .iter()
        .map(|k| (k.clone(), item.key_value(k).unwrap_or(SqlValue::Null)))
        .collect(),
    )
  }

  pub fn get(&self, key: &str) -> Option<&SqlValue> {
    self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
  }

  pub fn encode(&self) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&self.0)?))
  }

  pub fn decode(s: &str) -> Result<Self> {
    let bytes = URL_SAFE_NO_PAD
      .decode(s.trim())
      .map_err(|_| Error::InvalidPagination(format!("malformed cursor {s:?}")))?;
    serde_json::from_slice(&bytes)
      .map(Cursor)
      .map_err(|_| Error::InvalidPagination(format!("malformed cursor {s:?}")))
  }
}

// ─── Paginator ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paginator {
  pub sort_keys:      Vec<String>,
  pub sort_order:     SortOrder,
  pub limit:          usize,
  pub starting_after: Option<Cursor>,
  pub ending_before:  Option<Cursor>,
}

impl Default for Paginator {
  fn default() -> Self {
    Self {
      sort_keys:      vec![FINAL_SORT_KEY.to_owned()],
      sort_order:     SortOrder::Ascending,
      limit:          DEFAULT_LIMIT,
      starting_after: None,
      ending_before:  None,
    }
  }
}

/// Pagination as it arrives on the wire: comma-joined sort keys and encoded
/// cursors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaginationParams {
  pub sort_key:       Option<String>,
  pub sort_order:     Option<SortOrder>,
  pub limit:          Option<usize>,
  pub starting_after: Option<String>,
  pub ending_before:  Option<String>,
}

impl PaginationParams {
  pub fn into_paginator(self, default_limit: usize) -> Result<Paginator> {
    let sort_keys = match self.sort_key {
      Some(keys) => keys.split(',').map(|k| k.trim().to_owned()).collect(),
      None => vec![FINAL_SORT_KEY.to_owned()],
    };
    let paginator = Paginator {
      sort_keys,
      sort_order: self.sort_order.unwrap_or_default(),
      limit: self.limit.unwrap_or(default_limit),
      starting_after: self.starting_after.as_deref().map(Cursor::decode).transpose()?,
      ending_before: self.ending_before.as_deref().map(Cursor::decode).transpose()?,
    };
    paginator.validate()?;
    Ok(paginator)
  }
}

impl Paginator {
  pub fn validate(&self) -> Result<()> {
    if self.starting_after.is_some() && self.ending_before.is_some() {
      return Err(Error::InvalidPagination(
        "starting_after and ending_before are mutually exclusive".into(),
      ));
    }
    if self.limit == 0 || self.limit > MAX_LIMIT {
      return Err(Error::InvalidPagination(format!(
        "limit must be between 1 and {MAX_LIMIT}, got {}",
        self.limit
      )));
    }
    let mut seen = std::collections::HashSet::new();
    for key in &self.sort_keys {
      if key.is_empty() {
        return Err(Error::InvalidPagination("empty sort key".into()));
      }
      if !seen.insert(key.as_str()) {
        return Err(Error::InvalidPagination(format!("duplicate sort key {key:?}")));
      }
    }
    match self.sort_keys.last() {
      Some(last) if last == FINAL_SORT_KEY => {}
      Some(last) => return Err(Error::UnsupportedSortKey(format!("{last} (the final sort key must be id)"))),
      None => return Err(Error::InvalidPagination("no sort keys".into())),
    }
    if let Some(cursor) = self.cursor() {
      let keys: Vec<&str> = cursor.0.iter().map(|(k, _)| k.as_str()).collect();
      if keys != self.sort_keys.iter().map(String::as_str).collect::<Vec<_>>() {
        return Err(Error::InvalidPagination("cursor does not match the sort keys".into()));
      }
    }
    Ok(())
  }

  pub fn direction(&self) -> Direction {
    if self.ending_before.is_some() { Direction::Backward } else { Direction::Forward }
  }

  pub fn cursor(&self) -> Option<&Cursor> {
    self.starting_after.as_ref().or(self.ending_before.as_ref())
  }

  /// Whether the store should scan ascending: the requested order when
  /// paging forward, its reverse when paging backward.
  pub fn inner_ascending(&self) -> bool {
    (self.sort_order == SortOrder::Ascending) == (self.direction() == Direction::Forward)
  }

  /// Order `a` and `b` by the sort keys in the requested order. Nulls sort
  /// first ascending and last descending.
  pub fn compare<T: Keyset>(&self, a: &T, b: &T) -> Ordering {
    for key in &self.sort_keys {
      let va = a.key_value(key).unwrap_or(SqlValue::Null);
      let vb = b.key_value(key).unwrap_or(SqlValue::Null);
      let ord = match self.sort_order {
        SortOrder::Ascending => va.cmp(&vb),
        SortOrder::Descending => vb.cmp(&va),
      };
      if ord != Ordering::Equal {
        return ord;
      }
    }
    Ordering::Equal
  }
}

// ─── Keyset ──────────────────────────────────────────────────────────────────

/// Something a page can be sorted and positioned by.
pub trait Keyset {
  fn key_value(&self, key: &str) -> Option<SqlValue>;
}

impl Keyset for BaseUser {
  fn key_value(&self, key: &str) -> Option<SqlValue> {
    SystemColumn::from_str(key).ok().map(|c| self.system_value(c).to_sql())
  }
}

impl Keyset for User {
  fn key_value(&self, key: &str) -> Option<SqlValue> {
    self.base.key_value(key).or_else(|| self.sort_key_values.get(key).cloned())
  }
}

// ─── Page ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
  pub data:     Vec<T>,
  pub has_next: bool,
  pub has_prev: bool,
  pub next:     Option<String>,
  pub prev:     Option<String>,
}

impl<T> Default for Page<T> {
  fn default() -> Self {
    Self { data: Vec::new(), has_next: false, has_prev: false, next: None, prev: None }
  }
}

impl<T: Keyset> Page<T> {
  /// Build a page from up to `limit + 1` rows fetched in the inner
  /// direction.
  pub fn from_rows(mut rows: Vec<T>, paginator: &Paginator) -> Result<Self> {
    let more = rows.len() > paginator.limit;
    rows.truncate(paginator.limit);
    let (has_next, has_prev) = match paginator.direction() {
      Direction::Forward => (more, paginator.starting_after.is_some()),
      Direction::Backward => {
        rows.reverse();
        (true, more)
      }
    };
    Self::with_cursors(rows, has_next, has_prev, paginator)
  }

  /// Combine per-region pages of the same request. With one contributing
  /// region its page is returned as is; otherwise the rows are re-sorted and
  /// the page re-cut, since regional cursors are only locally meaningful.
  pub fn merge(pages: Vec<Page<T>>, paginator: &Paginator) -> Result<Self> {
    let contributing = pages.iter().filter(|p| !p.data.is_empty()).count();
    if contributing <= 1 {
      return Ok(
        pages
          .into_iter()
          .find(|p| !p.data.is_empty())
          .unwrap_or_default(),
      );
    }

    let any_next = pages.iter().any(|p| p.has_next);
    let any_prev = pages.iter().any(|p| p.has_prev);
    let mut rows: Vec<T> = pages.into_iter().flat_map(|p| p.data).collect();
    rows.sort_by(|a, b| paginator.compare(a, b));

    let limit = paginator.limit;
    let more = rows.len() > limit;
    let (has_next, has_prev) = match paginator.direction() {
      Direction::Forward => {
        rows.truncate(limit);
        (more || any_next, paginator.starting_after.is_some())
      }
      Direction::Backward => {
        if more {
          rows.drain(..rows.len() - limit);
        }
        (true, more || any_prev)
      }
    };
    Self::with_cursors(rows, has_next, has_prev, paginator)
  }

  fn with_cursors(data: Vec<T>, has_next: bool, has_prev: bool, paginator: &Paginator) -> Result<Self> {
    let next = match data.last() {
      Some(last) if has_next => Some(Cursor::at(last, &paginator.sort_keys).encode()?),
      _ => None,
    };
    let prev = match data.first() {
      Some(first) if has_prev => Some(Cursor::at(first, &paginator.sort_keys).encode()?),
      _ => None,
    };
    Ok(Self { has_next: next.is_some(), has_prev: prev.is_some(), data, next, prev })
  }
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone as _, Utc};
  use uuid::Uuid;

  use super::*;

  fn user(n: u128, created_secs: i64) -> BaseUser {
    let created = Utc.timestamp_opt(1_700_000_000 + created_secs, 0).unwrap();
    BaseUser {
      id: Uuid::from_u128(n),
      organization_id: Uuid::nil(),
      version: 0,
      created,
      updated: created,
      deleted: None,
    }
  }

  fn paginator(keys: &[&str], order: SortOrder, limit: usize) -> Paginator {
    Paginator {
      sort_keys: keys.iter().map(|k| k.to_string()).collect(),
      sort_order: order,
      limit,
      ..Default::default()
    }
  }

  fn ids(page: &Page<BaseUser>) -> Vec<u128> { page.data.iter().map(|u| u.id.as_u128()).collect() }

  #[test]
  fn validation() {
    assert!(Paginator::default().validate().is_ok());
    assert!(matches!(
      paginator(&["created"], SortOrder::Ascending, 10).validate(),
      Err(Error::UnsupportedSortKey(_))
    ));
    assert!(paginator(&["created", "created", "id"], SortOrder::Ascending, 10).validate().is_err());
    assert!(paginator(&["id"], SortOrder::Ascending, 0).validate().is_err());
    assert!(paginator(&["id"], SortOrder::Ascending, MAX_LIMIT + 1).validate().is_err());

    let cursor = Cursor::at(&user(1, 0), &["id".to_owned()]);
    let both = Paginator {
      starting_after: Some(cursor.clone()),
      ending_before: Some(cursor),
      ..Default::default()
    };
    assert!(matches!(both.validate(), Err(Error::InvalidPagination(_))));
  }

  #[test]
  fn cursor_round_trips_and_rejects_garbage() {
    let keys = vec!["created".to_owned(), "id".to_owned()];
    let cursor = Cursor::at(&user(7, 3), &keys);
    let encoded = cursor.encode().unwrap();
    assert_eq!(Cursor::decode(&encoded).unwrap(), cursor);
    assert!(matches!(Cursor::decode("!!not base64"), Err(Error::InvalidPagination(_))));

    let params = PaginationParams {
      sort_key: Some("created,id".into()),
      starting_after: Some(encoded),
      ..Default::default()
    };
    let p = params.into_paginator(DEFAULT_LIMIT).unwrap();
    assert_eq!(p.direction(), Direction::Forward);
    assert_eq!(p.cursor(), Some(&cursor));

    let mismatched = PaginationParams {
      sort_key: Some("updated,id".into()),
      starting_after: Some(Cursor::at(&user(7, 3), &keys).encode().unwrap()),
      ..Default::default()
    };
    assert!(mismatched.into_paginator(DEFAULT_LIMIT).is_err());
  }

  #[test]
  fn inner_direction() {
    let cursor = Some(Cursor::at(&user(1, 0), &["id".to_owned()]));
    let mut p = paginator(&["id"], SortOrder::Ascending, 5);
    assert!(p.inner_ascending());
    p.ending_before = cursor.clone();
    assert!(!p.inner_ascending());
    p.sort_order = SortOrder::Descending;
    assert!(p.inner_ascending());
    p.ending_before = None;
    assert!(!p.inner_ascending());
  }

  #[test]
  fn forward_page_trims_the_lookahead_row() {
    let p = paginator(&["id"], SortOrder::Ascending, 2);
    let page = Page::from_rows(vec![user(1, 0), user(2, 0), user(3, 0)], &p).unwrap();
    assert_eq!(ids(&page), vec![1, 2]);
    assert!(page.has_next);
    assert!(!page.has_prev);
    let next = Cursor::decode(page.next.as_deref().unwrap()).unwrap();
    assert_eq!(next.get("id"), Some(&SqlValue::from_uuid(Uuid::from_u128(2))));
  }

  #[test]
  fn backward_page_restores_requested_order() {
    let before = Cursor::at(&user(9, 0), &["id".to_owned()]);
    let p = Paginator { ending_before: Some(before), ..paginator(&["id"], SortOrder::Ascending, 2) };
    // Fetched descending from the cursor.
    let page = Page::from_rows(vec![user(8, 0), user(7, 0), user(6, 0)], &p).unwrap();
    assert_eq!(ids(&page), vec![7, 8]);
    assert!(page.has_prev);
    assert!(page.has_next);
  }

  #[test]
  fn merge_resorts_and_recuts() {
    let p = paginator(&["created", "id"], SortOrder::Descending, 3);
    let east = Page::from_rows(vec![user(1, 50), user(2, 30), user(3, 10), user(4, 5)], &p).unwrap();
    let west = Page::from_rows(vec![user(5, 40), user(6, 20)], &p).unwrap();
    assert!(east.has_next);

    let merged = Page::merge(vec![east, west], &p).unwrap();
    assert_eq!(ids(&merged), vec![1, 5, 2]);
    assert!(merged.has_next);
    assert!(!merged.has_prev);
  }

  #[test]
  fn merge_of_one_contributor_is_passthrough() {
    let p = paginator(&["id"], SortOrder::Ascending, 5);
    let only = Page::from_rows(vec![user(1, 0), user(2, 0)], &p).unwrap();
    let merged = Page::merge(vec![Page::default(), only, Page::default()], &p).unwrap();
    assert_eq!(ids(&merged), vec![1, 2]);
    assert!(!merged.has_next);

    let empty: Page<BaseUser> = Page::merge(vec![Page::default(), Page::default()], &p).unwrap();
    assert!(empty.data.is_empty());
  }

  #[test]
  fn nulls_first_ascending_last_descending() {
    let mut a = User::new(user(1, 0));
    let mut b = User::new(user(2, 0));
    a.sort_key_values.insert("email".into(), SqlValue::Null);
    b.sort_key_values.insert("email".into(), SqlValue::text("b@x"));
    let asc = paginator(&["email", "id"], SortOrder::Ascending, 5);
    assert_eq!(asc.compare(&a, &b), Ordering::Less);
    let desc = paginator(&["email", "id"], SortOrder::Descending, 5);
    assert_eq!(desc.compare(&a, &b), Ordering::Greater);
  }
}
