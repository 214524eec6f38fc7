//! Fan-out tests over in-memory SQLite regions.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use userstore_core::{
  catalog::{CatalogCache, fixtures},
  pagination::{Cursor, Page, Paginator},
  selector::{Selector, ValidatedSelector},
  store::{SelectorRequest, StoreError as _, UserStore, UserWriter},
  user::{AllUserValues, BaseUser, User},
  value::{ConsentedPurpose, LifecycleState, NewColumnValue},
};
use userstore_sqlite::SqliteStore;

use crate::{Error, MultiRegionStore, store::first_wins};

const OPERATIONAL: Uuid = Uuid::from_u128(0x0a);

/// A region that can be taken down.
struct Region {
  inner: SqliteStore,
  down:  AtomicBool,
}

impl Region {
  fn check(&self) -> userstore_sqlite::Result<()> {
    if self.down.load(Ordering::SeqCst) {
      return Err(tokio_rusqlite::Error::ConnectionClosed.into());
    }
    Ok(())
  }
}

impl UserStore for Region {
  type Error = userstore_sqlite::Error;

  async fn validate_selector(
    &self,
    selector: &Selector,
    state: LifecycleState,
  ) -> userstore_sqlite::Result<ValidatedSelector> {
    self.check()?;
    self.inner.validate_selector(selector, state).await
  }

  async fn get_users_for_selector(&self, request: &SelectorRequest) -> userstore_sqlite::Result<Page<User>> {
    self.check()?;
    self.inner.get_users_for_selector(request).await
  }

  async fn get_user(&self, id: Uuid) -> userstore_sqlite::Result<Option<User>> {
    self.check()?;
    self.inner.get_user(id).await
  }

  async fn get_all_user_values(&self, id: Uuid) -> userstore_sqlite::Result<Option<AllUserValues>> {
    self.check()?;
    self.inner.get_all_user_values(id).await
  }

  async fn delete_user(&self, id: Uuid) -> userstore_sqlite::Result<bool> {
    self.check()?;
    self.inner.delete_user(id).await
  }

  async fn list_users_paginated(&self, paginator: &Paginator) -> userstore_sqlite::Result<Page<BaseUser>> {
    self.check()?;
    self.inner.list_users_paginated(paginator).await
  }

  async fn list_users_for_email(&self, email: &str) -> userstore_sqlite::Result<Vec<BaseUser>> {
    self.check()?;
    self.inner.list_users_for_email(email).await
  }

  async fn cleanup_users(&self, max_candidates: usize, dry_run: bool) -> userstore_sqlite::Result<usize> {
    self.check()?;
    self.inner.cleanup_users(max_candidates, dry_run).await
  }
}

struct Fixture {
  store:    MultiRegionStore<Region>,
  shutdown: watch::Sender<bool>,
}

async fn regions(names: &[&str]) -> Fixture {
  let catalog = Arc::new(CatalogCache::new(fixtures::catalog()));
  let mut stores = Vec::new();
  for name in names {
    let inner = SqliteStore::open_in_memory(catalog.clone()).await.unwrap();
    stores.push((name.to_string(), Region { inner, down: AtomicBool::new(false) }));
  }
  let (shutdown, rx) = watch::channel(false);
  let store = MultiRegionStore::new(stores, catalog, rx).expect("at least one region");
  Fixture { store, shutdown }
}

async fn add_user(f: &Fixture, region: &str, email: &str) -> Uuid {
  let store = &f.store.region(region).unwrap().inner;
  let user = store.create_user(Uuid::from_u128(1)).await.unwrap();
  store
    .insert_values(user.id, vec![NewColumnValue {
      column:    "email".into(),
      ordering:  0,
      value:     json!(email),
      consented: vec![ConsentedPurpose::indefinite(OPERATIONAL)],
    }])
    .await
    .unwrap();
  user.id
}

// ─── Construction ────────────────────────────────────────────────────────────

#[tokio::test]
async fn zero_regions_is_an_error() {
  let (_tx, rx) = watch::channel(false);
  let catalog = Arc::new(CatalogCache::new(fixtures::catalog()));
  let result = MultiRegionStore::<Region>::new(Vec::new(), catalog, rx);
  assert!(matches!(result, Err(Error::NoRegions)));
}

#[tokio::test]
async fn unknown_region_is_not_found() {
  let f = regions(&["eu"]).await;
  let err = f.store.region("mars").err().unwrap();
  assert!(err.is_not_found());
  assert!(err.is_caller_error());
}

// ─── Reads ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_region_is_called_directly() {
  let f = regions(&["eu"]).await;
  let id = add_user(&f, "eu", "ada@example.com").await;
  let user = f.store.get_user(id).await.unwrap().expect("user");
  assert_eq!(user.profile["email"], json!("ada@example.com"));
}

#[tokio::test]
async fn get_user_searches_every_region() {
  let f = regions(&["eu", "us"]).await;
  let id = add_user(&f, "us", "bob@example.com").await;

  let user = f.store.get_user(id).await.unwrap().expect("found in us");
  assert_eq!(user.id(), id);
  assert!(f.store.get_user(Uuid::new_v4()).await.unwrap().is_none());
  assert!(f.store.get_all_user_values(id).await.unwrap().is_some());
}

#[tokio::test]
async fn selector_pages_merge_across_regions() {
  let f = regions(&["eu", "us"]).await;
  let mut ids = Vec::new();
  for i in 0..3 {
    ids.push(add_user(&f, "eu", &format!("eu{i}@example.com")).await);
  }
  for i in 0..2 {
    ids.push(add_user(&f, "us", &format!("us{i}@example.com")).await);
  }
  ids.sort_by_key(|id| id.to_string());

  let mut request = SelectorRequest {
    selector: Selector::new("{email} LIKE ?", vec![json!("%@example.com")]),
    columns: vec!["email".into()],
    paginator: Paginator { limit: 3, ..Default::default() },
    ..Default::default()
  };
  let first = f.store.get_users_for_selector(&request).await.unwrap();
  assert_eq!(first.data.iter().map(User::id).collect::<Vec<_>>(), ids[..3]);
  assert!(first.has_next);

  request.paginator.starting_after = Some(Cursor::decode(first.next.as_deref().unwrap()).unwrap());
  let second = f.store.get_users_for_selector(&request).await.unwrap();
  assert_eq!(second.data.iter().map(User::id).collect::<Vec<_>>(), ids[3..]);
  assert!(!second.has_next);
}

#[tokio::test]
async fn base_user_listing_and_email_lookup_merge() {
  let f = regions(&["eu", "us"]).await;
  let ada = add_user(&f, "eu", "shared@example.com").await;
  let bob = add_user(&f, "us", "shared@example.com").await;

  let page = f.store.list_users_paginated(&Paginator::default()).await.unwrap();
  assert_eq!(page.data.len(), 2);
  assert!(page.data[0].id.to_string() < page.data[1].id.to_string());

  let found = f.store.list_users_for_email("shared@example.com").await.unwrap();
  assert_eq!(found.iter().map(|u| u.id).collect::<Vec<_>>(), vec![ada, bob]);
}

#[tokio::test]
async fn selector_errors_are_reported_once() {
  let f = regions(&["eu", "us"]).await;
  let request = SelectorRequest {
    selector: Selector::new("{email} = ? OR {email} = ?", vec![json!("a@b.c")]),
    ..Default::default()
  };
  let err = f.store.get_users_for_selector(&request).await.unwrap_err();
  assert!(matches!(err, Error::Core(userstore_core::Error::SelectorArity { .. })));
  assert!(err.is_caller_error());
}

// ─── Writes and failures ─────────────────────────────────────────────────────

#[tokio::test]
async fn delete_user_reaches_owning_region() {
  let f = regions(&["eu", "us"]).await;
  let id = add_user(&f, "us", "bob@example.com").await;
  assert!(f.store.delete_user(id).await.unwrap());
  assert!(!f.store.delete_user(id).await.unwrap());
  assert_eq!(f.store.cleanup_users(10, false).await.unwrap(), 0);
}

#[tokio::test]
async fn every_regional_failure_is_kept() {
  let f = regions(&["ap", "eu", "us"]).await;
  f.store.region("eu").unwrap().down.store(true, Ordering::SeqCst);
  f.store.region("us").unwrap().down.store(true, Ordering::SeqCst);

  let err = f.store.get_user(Uuid::new_v4()).await.unwrap_err();
  let regions: Vec<&str> = err.failures().map(|fail| fail.region.as_str()).collect();
  assert_eq!(regions, vec!["eu", "us"]);
  assert!(!err.is_caller_error());
}

#[tokio::test]
async fn shutdown_cancels_fan_out() {
  let f = regions(&["eu", "us"]).await;
  f.shutdown.send(true).unwrap();
  let err = f.store.get_user(Uuid::new_v4()).await.unwrap_err();
  assert!(matches!(err, Error::Shutdown(ref regions) if regions == &["eu", "us"]));
}

// ─── Merging ─────────────────────────────────────────────────────────────────

#[test]
fn first_region_wins_duplicates() {
  let shared = Uuid::from_u128(7);
  let mut eu = vec![shared, Uuid::from_u128(1)];
  let mut us = vec![Uuid::from_u128(2), shared];
  first_wins("test", [("eu", &mut eu), ("us", &mut us)].into_iter(), |id| *id);
  assert_eq!(eu, vec![shared, Uuid::from_u128(1)]);
  assert_eq!(us, vec![Uuid::from_u128(2)]);
}
