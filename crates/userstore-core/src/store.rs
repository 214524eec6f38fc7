//! The `UserStore` and `UserWriter` traits.
//!
//! Both are implemented by the regional backend (`userstore-sqlite`);
//! `UserStore` is also implemented by the multi-region layer, so the HTTP
//! API does not care how many regions sit behind it.

use std::future::Future;

use uuid::Uuid;

use crate::{
  Error,
  pagination::{Page, Paginator},
  selector::{Selector, ValidatedSelector},
  user::{AllUserValues, BaseUser, User},
  value::{ColumnValue, LifecycleState, NewColumnValue, UpdateColumnValue},
};

// ─── Errors ──────────────────────────────────────────────────────────────────

/// What callers of a store need to know about its errors.
pub trait StoreError: std::error::Error + Send + Sync + 'static {
  /// The request was at fault; retrying it cannot help.
  fn is_caller_error(&self) -> bool;

  /// The addressed entity does not exist in this store.
  fn is_not_found(&self) -> bool { false }
}

impl StoreError for Error {
  fn is_caller_error(&self) -> bool { Error::is_caller_error(self) }
}

// ─── Requests ────────────────────────────────────────────────────────────────

/// Parameters for [`UserStore::get_users_for_selector`].
#[derive(Debug, Clone, Default)]
pub struct SelectorRequest {
  pub selector:  Selector,
  /// Names of the columns to return. Users with none of them are skipped;
  /// an empty list returns every matching user with system columns only.
  pub columns:   Vec<String>,
  /// Every returned value must currently be retained for all of these.
  pub purposes:  Vec<Uuid>,
  pub paginator: Paginator,
  pub state:     LifecycleState,
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Read side of a userstore.
///
/// All methods return `Send` futures so the trait can be used from axum
/// handlers and spawned tasks.
pub trait UserStore: Send + Sync {
  type Error: StoreError;

  /// Check a selector, including a prepare-only dry run.
  fn validate_selector<'a>(
    &'a self,
    selector: &'a Selector,
    state: LifecycleState,
  ) -> impl Future<Output = Result<ValidatedSelector, Self::Error>> + Send + 'a;

  /// One page of users matching the request's selector.
  fn get_users_for_selector<'a>(
    &'a self,
    request: &'a SelectorRequest,
  ) -> impl Future<Output = Result<Page<User>, Self::Error>> + Send + 'a;

  /// A live user with all currently retained values. `None` if the user
  /// does not exist or is deleted.
  fn get_user(&self, id: Uuid) -> impl Future<Output = Result<Option<User>, Self::Error>> + Send + '_;

  /// Every stored value of a user, ignoring retention.
  fn get_all_user_values(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<AllUserValues>, Self::Error>> + Send + '_;

  /// Soft-delete a user. Returns `false` if there was no live user.
  fn delete_user(&self, id: Uuid) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// A page of live base users, sorted by system columns.
  fn list_users_paginated<'a>(
    &'a self,
    paginator: &'a Paginator,
  ) -> impl Future<Output = Result<Page<BaseUser>, Self::Error>> + Send + 'a;

  /// Live users whose `email` column currently holds `email`.
  fn list_users_for_email<'a>(
    &'a self,
    email: &'a str,
  ) -> impl Future<Output = Result<Vec<BaseUser>, Self::Error>> + Send + 'a;

  /// Repair up to `max_candidates` queued users. Returns the number of
  /// candidates still queued afterwards.
  fn cleanup_users(
    &self,
    max_candidates: usize,
    dry_run: bool,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;
}

/// Ingestion into one region.
pub trait UserWriter: Send + Sync {
  type Error: StoreError;

  fn create_user(
    &self,
    organization_id: Uuid,
  ) -> impl Future<Output = Result<BaseUser, Self::Error>> + Send + '_;

  /// Insert live values at version 1.
  fn insert_values(
    &self,
    user_id: Uuid,
    values: Vec<NewColumnValue>,
  ) -> impl Future<Output = Result<Vec<ColumnValue>, Self::Error>> + Send + '_;

  /// Replace a live value, failing unless its version is `expected_version`.
  fn update_value(
    &self,
    id: Uuid,
    update: UpdateColumnValue,
  ) -> impl Future<Output = Result<ColumnValue, Self::Error>> + Send + '_;

  /// Move a live value to the soft-deleted table. Returns `false` if there
  /// was no such live value.
  fn soft_delete_value(&self, id: Uuid) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;
}
