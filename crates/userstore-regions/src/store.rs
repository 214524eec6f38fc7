//! [`MultiRegionStore`]: one [`UserStore`] over every configured region.

use std::{
  collections::{BTreeMap, HashMap},
  future::Future,
  sync::Arc,
};

use tokio::{
  sync::{Mutex, watch},
  task::JoinSet,
};
use uuid::Uuid;

use userstore_core::{
  catalog::CatalogCache,
  pagination::{Page, Paginator},
  selector::{self, Selector, ValidatedSelector},
  store::{SelectorRequest, StoreError, UserStore},
  user::{AllUserValues, BaseUser, User},
  value::LifecycleState,
};

use crate::error::{Error, RegionFailure, Result};

// ─── Store ───────────────────────────────────────────────────────────────────

/// Regional stores keyed by region name.
///
/// Reads fan out to every region and merge; writes address one region
/// through [`MultiRegionStore::region`].
pub struct MultiRegionStore<S> {
  regions:  BTreeMap<String, Arc<S>>,
  catalog:  Arc<CatalogCache>,
  shutdown: watch::Receiver<bool>,
}

impl<S: UserStore + 'static> MultiRegionStore<S> {
  /// Fails with [`Error::NoRegions`] when `regions` is empty.
  pub fn new(
    regions: impl IntoIterator<Item = (String, S)>,
    catalog: Arc<CatalogCache>,
    shutdown: watch::Receiver<bool>,
  ) -> Result<Self, S::Error> {
    let regions: BTreeMap<String, Arc<S>> =
      regions.into_iter().map(|(name, store)| (name, Arc::new(store))).collect();
    if regions.is_empty() {
      return Err(Error::NoRegions);
    }
    Ok(Self { regions, catalog, shutdown })
  }

  pub fn region(&self, name: &str) -> Result<&Arc<S>, S::Error> {
    self.regions.get(name).ok_or_else(|| Error::UnknownRegion(name.to_owned()))
  }

  pub fn region_names(&self) -> impl Iterator<Item = &str> { self.regions.keys().map(String::as_str) }

  pub fn catalog(&self) -> &Arc<CatalogCache> { &self.catalog }

  /// Run `op` against every region and gather the answers in region-name
  /// order. Not-found answers are dropped. Any other failure fails the
  /// whole call, carrying every regional failure.
  async fn fan_out<T, F, Fut>(&self, name: &'static str, op: F) -> Result<Vec<(String, T)>, S::Error>
  where
    T: Send + 'static,
    F: Fn(Arc<S>) -> Fut,
    Fut: Future<Output = std::result::Result<T, S::Error>> + Send + 'static,
  {
    let gathered: Arc<Mutex<Gathered<T, S::Error>>> = Arc::default();

    if let [(region, store)] = self.regions.iter().collect::<Vec<_>>().as_slice() {
      run_region(region.to_string(), op(Arc::clone(store)), self.shutdown.clone(), gathered.clone(), name)
        .await;
    } else {
      let mut tasks = JoinSet::new();
      for (region, store) in &self.regions {
        tasks.spawn(run_region(
          region.clone(),
          op(Arc::clone(store)),
          self.shutdown.clone(),
          gathered.clone(),
          name,
        ));
      }
      let mut join_error = None;
      while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
          tracing::error!(op = name, error = %e, "region task failed");
          join_error.get_or_insert(e);
        }
      }
      if let Some(e) = join_error {
        return Err(Error::Join(e));
      }
    }

    let Gathered { mut found, mut failures, mut cancelled } = std::mem::take(&mut *gathered.lock().await);
    failures.sort_by(|a, b| a.region.cmp(&b.region));
    if !failures.is_empty() {
      let primary = failures.remove(0);
      return Err(Error::Regions { primary, others: failures });
    }
    if !cancelled.is_empty() {
      cancelled.sort();
      return Err(Error::Shutdown(cancelled));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
  }
}

/// Answers collected from the regional tasks.
struct Gathered<T, E> {
  found:     Vec<(String, T)>,
  failures:  Vec<RegionFailure<E>>,
  cancelled: Vec<String>,
}

impl<T, E> Default for Gathered<T, E> {
  fn default() -> Self { Self { found: Vec::new(), failures: Vec::new(), cancelled: Vec::new() } }
}

async fn run_region<T, E: StoreError>(
  region: String,
  work: impl Future<Output = std::result::Result<T, E>>,
  shutdown: watch::Receiver<bool>,
  gathered: Arc<Mutex<Gathered<T, E>>>,
  op: &'static str,
) {
  let outcome = tokio::select! {
    biased;
    _ = signalled(shutdown) => None,
    result = work => Some(result),
  };
  let mut gathered = gathered.lock().await;
  match outcome {
    Some(Ok(value)) => gathered.found.push((region, value)),
    Some(Err(e)) if e.is_not_found() => {
      tracing::debug!(op, %region, error = %e, "not found in region");
    }
    Some(Err(e)) => {
      tracing::warn!(op, %region, error = %e, "region failed");
      gathered.failures.push(RegionFailure { region, error: e });
    }
    None => {
      tracing::warn!(op, %region, "shutdown before region answered");
      gathered.cancelled.push(region);
    }
  }
}

/// Resolves once shutdown is signalled. A dropped sender never signals.
async fn signalled(mut shutdown: watch::Receiver<bool>) {
  loop {
    if *shutdown.borrow_and_update() {
      return;
    }
    if shutdown.changed().await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}

// ─── Merging ─────────────────────────────────────────────────────────────────

/// Drop items already seen in an earlier region. Regions arrive in name
/// order, so the first region holding an id keeps it.
pub(crate) fn first_wins<'a, T: 'a>(
  op: &str,
  regions: impl Iterator<Item = (&'a str, &'a mut Vec<T>)>,
  id: impl Fn(&T) -> Uuid,
) {
  let mut owners: HashMap<Uuid, &'a str> = HashMap::new();
  for (region, items) in regions {
    items.retain(|item| {
      let user_id = id(item);
      match owners.get(&user_id) {
        Some(first) => {
          tracing::warn!(op, %user_id, kept = %first, dropped = %region, "user found in several regions");
          false
        }
        None => {
          owners.insert(user_id, region);
          true
        }
      }
    });
  }
}

/// The first region's answer for a single user.
fn first_found<T>(op: &str, user_id: Uuid, found: Vec<(String, Option<T>)>) -> Option<T> {
  let mut hits = found.into_iter().filter_map(|(region, item)| item.map(|item| (region, item)));
  let (first, item) = hits.next()?;
  for (region, _) in hits {
    tracing::warn!(op, %user_id, kept = %first, dropped = %region, "user found in several regions");
  }
  Some(item)
}

fn merge_pages<T: userstore_core::pagination::Keyset>(
  op: &str,
  mut found: Vec<(String, Page<T>)>,
  paginator: &Paginator,
  id: impl Fn(&T) -> Uuid,
) -> std::result::Result<Page<T>, userstore_core::Error> {
  first_wins(op, found.iter_mut().map(|(region, page)| (region.as_str(), &mut page.data)), id);
  Page::merge(found.into_iter().map(|(_, page)| page).collect(), paginator)
}

// ─── UserStore impl ──────────────────────────────────────────────────────────

impl<S: UserStore + 'static> UserStore for MultiRegionStore<S> {
  type Error = Error<S::Error>;

  async fn validate_selector(&self, selector: &Selector, state: LifecycleState) -> Result<ValidatedSelector, S::Error> {
    selector::check(selector, &self.catalog.snapshot())?;
    let (region, store) = self.regions.iter().next().ok_or(Error::NoRegions)?;
    store
      .validate_selector(selector, state)
      .await
      .map_err(|e| Error::region(region.clone(), e))
  }

  async fn get_users_for_selector(&self, request: &SelectorRequest) -> Result<Page<User>, S::Error> {
    selector::check(&request.selector, &self.catalog.snapshot())?;
    request.paginator.validate()?;
    let request = Arc::new(request.clone());
    let found = self
      .fan_out("get_users_for_selector", |store| {
        let request = Arc::clone(&request);
        async move { store.get_users_for_selector(&request).await }
      })
      .await?;
    Ok(merge_pages("get_users_for_selector", found, &request.paginator, User::id)?)
  }

  async fn get_user(&self, id: Uuid) -> Result<Option<User>, S::Error> {
    let found = self
      .fan_out("get_user", |store| async move { store.get_user(id).await })
      .await?;
    Ok(first_found("get_user", id, found))
  }

  async fn get_all_user_values(&self, id: Uuid) -> Result<Option<AllUserValues>, S::Error> {
    let found = self
      .fan_out("get_all_user_values", |store| async move { store.get_all_user_values(id).await })
      .await?;
    Ok(first_found("get_all_user_values", id, found))
  }

  async fn delete_user(&self, id: Uuid) -> Result<bool, S::Error> {
    let found = self
      .fan_out("delete_user", |store| async move { store.delete_user(id).await })
      .await?;
    Ok(found.into_iter().any(|(_, deleted)| deleted))
  }

  async fn list_users_paginated(&self, paginator: &Paginator) -> Result<Page<BaseUser>, S::Error> {
    paginator.validate()?;
    let shared = Arc::new(paginator.clone());
    let found = self
      .fan_out("list_users_paginated", |store| {
        let paginator = Arc::clone(&shared);
        async move { store.list_users_paginated(&paginator).await }
      })
      .await?;
    Ok(merge_pages("list_users_paginated", found, paginator, |u: &BaseUser| u.id)?)
  }

  async fn list_users_for_email(&self, email: &str) -> Result<Vec<BaseUser>, S::Error> {
    let email: Arc<str> = Arc::from(email);
    let mut found = self
      .fan_out("list_users_for_email", |store| {
        let email = Arc::clone(&email);
        async move { store.list_users_for_email(&email).await }
      })
      .await?;
    first_wins("list_users_for_email", found.iter_mut().map(|(r, users)| (r.as_str(), users)), |u: &BaseUser| u.id);
    Ok(found.into_iter().flat_map(|(_, users)| users).collect())
  }

  async fn cleanup_users(&self, max_candidates: usize, dry_run: bool) -> Result<usize, S::Error> {
    let found = self
      .fan_out("cleanup_users", |store| async move { store.cleanup_users(max_candidates, dry_run).await })
      .await?;
    Ok(found.into_iter().map(|(_, remaining)| remaining).sum())
  }
}
