//! [`SqliteStore`]: one region's implementation of [`UserStore`].

use std::{future::Future, path::Path, sync::Arc};

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use userstore_core::{
  catalog::{Catalog, CatalogCache},
  pagination::{Page, Paginator},
  query::{QueryBuilder, QueryRequest, UserQuery},
  rows::{Processed, RowProcessor, UserRow, materialise_base},
  selector::{self, Selector, StatementPreparer, ValidatedSelector},
  store::{SelectorRequest, UserStore},
  user::{AllUserValues, BaseUser, User},
  value::{LifecycleState, RetentionCutoff},
};

use crate::{
  Result,
  encode::{BASE_USER_COLUMNS, RawBaseUser, RawUserRow, bind},
  schema::SCHEMA,
};

/// How long soft-deleted values stay retained when they were consented
/// indefinitely.
pub const DEFAULT_SOFT_DELETE_RETENTION_DAYS: i64 = 30;

/// Column holding the addresses [`UserStore::list_users_for_email`] matches.
pub const EMAIL_COLUMN: &str = "email";

// ─── Store ───────────────────────────────────────────────────────────────────

/// One region's userstore, backed by a single SQLite file.
///
/// Cloning is cheap; the connection and catalog are reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn:                  tokio_rusqlite::Connection,
  pub(crate) catalog:               Arc<CatalogCache>,
  pub(crate) soft_delete_retention: Duration,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>, catalog: Arc<CatalogCache>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn, catalog).await
  }

  /// Open an in-memory store; useful for testing.
  pub async fn open_in_memory(catalog: Arc<CatalogCache>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn, catalog).await
  }

  async fn init(conn: tokio_rusqlite::Connection, catalog: Arc<CatalogCache>) -> Result<Self> {
    let store = Self {
      conn,
      catalog,
      soft_delete_retention: Duration::days(DEFAULT_SOFT_DELETE_RETENTION_DAYS),
    };
    store.init_schema().await?;
    Ok(store)
  }

  pub fn with_soft_delete_retention(mut self, retention: Duration) -> Self {
    self.soft_delete_retention = retention;
    self
  }

  pub fn catalog(&self) -> &Arc<CatalogCache> { &self.catalog }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run a user query and decode its rows.
  async fn select_rows(&self, query: UserQuery, sort_keys: usize) -> Result<Vec<UserRow>> {
    tracing::debug!(sql = %query.sql, params = query.params.len(), "selecting user rows");
    let raws: Vec<RawUserRow> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&query.sql)?;
        bind(&mut stmt, &query.params)?;
        let mut rows = stmt.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
          out.push(RawUserRow::read(row, sort_keys)?);
        }
        Ok(out)
      })
      .await?;
    raws.into_iter().map(RawUserRow::into_user_row).collect()
  }

  /// Read, rebuild and enqueue any cleanup candidates the read turned up.
  async fn read_users(&self, catalog: &Catalog, read: Read<'_>) -> Result<Vec<User>> {
    let sort_keys: &[String] = read.paginator.map(|p| p.sort_keys.as_slice()).unwrap_or_default();
    let query = QueryBuilder::new(catalog)
      .reset(QueryRequest {
        selector:  read.selector,
        columns:   read.columns,
        purposes:  read.purposes,
        paginator: read.paginator,
        state:     read.state,
      })
      .build()?;
    let rows = self.select_rows(query, sort_keys.len()).await?;

    let Processed { users, cleanup } = {
      let mut processor = RowProcessor::new(catalog, read.state, read.cutoff)
        .expect_columns(read.expected)
        .expect_purposes(read.purposes)
        .sort_keys(sort_keys);
      for row in rows {
        processor.push(row)?;
      }
      processor.finish()?
    };
    if !cleanup.is_empty() {
      self.enqueue_cleanup(cleanup).await?;
    }
    Ok(users)
  }

  /// A user by id in `state`, with every value column and no retention
  /// cutoff unless `cutoff` says otherwise.
  async fn read_user(
    &self,
    catalog: &Catalog,
    id: Uuid,
    state: LifecycleState,
    cutoff: RetentionCutoff,
  ) -> Result<Option<User>> {
    let selector = selector::check(&Selector::new("{id} = ?", vec![json!(id)]), catalog)?;
    let columns: Vec<Uuid> = catalog.value_columns().map(|c| c.id()).collect();
    let users = self
      .read_users(catalog, Read {
        selector: &selector,
        columns: &columns,
        expected: &[],
        purposes: &[],
        paginator: None,
        state,
        cutoff,
      })
      .await?;
    Ok(users.into_iter().next())
  }

  /// The `users` row for `id`, deleted or not.
  pub(crate) async fn base_user(&self, id: Uuid) -> Result<Option<BaseUser>> {
    let id_str = userstore_core::sql::encode_uuid(id);
    let raw: Option<RawBaseUser> = self
      .conn
      .call(move |conn| {
        use rusqlite::OptionalExtension as _;
        Ok(
          conn
            .query_row(
              &format!("SELECT {} FROM users WHERE id = ?1", BASE_USER_COLUMNS),
              rusqlite::params![id_str],
              RawBaseUser::read,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawBaseUser::into_base_user).transpose()
  }
}

/// One read through the builder and row processor.
struct Read<'a> {
  selector:  &'a ValidatedSelector,
  columns:   &'a [Uuid],
  /// Users without a value for one of these are skipped.
  expected:  &'a [Uuid],
  purposes:  &'a [Uuid],
  paginator: Option<&'a Paginator>,
  state:     LifecycleState,
  cutoff:    RetentionCutoff,
}

fn resolve_columns(catalog: &Catalog, names: &[String]) -> Result<Vec<Uuid>> {
  names
    .iter()
    .map(|name| {
      catalog
        .column_by_name(name)
        .map(|c| c.id())
        .ok_or_else(|| userstore_core::Error::UnknownColumn(name.clone()).into())
    })
    .collect()
}

// ─── Selector dry runs ───────────────────────────────────────────────────────

impl StatementPreparer for SqliteStore {
  fn prepare(&self, sql: String) -> impl Future<Output = std::result::Result<(), String>> + Send + '_ {
    async move {
      self
        .conn
        .call(move |conn| {
          conn.prepare(&sql)?;
          Ok(())
        })
        .await
        .map_err(|e| match e {
          tokio_rusqlite::Error::Rusqlite(e) => e.to_string(),
          other => other.to_string(),
        })
    }
  }
}

// ─── UserStore impl ──────────────────────────────────────────────────────────

impl UserStore for SqliteStore {
  type Error = crate::Error;

  async fn validate_selector(&self, selector: &Selector, state: LifecycleState) -> Result<ValidatedSelector> {
    let catalog = self.catalog.snapshot();
    Ok(selector::validate(selector, &catalog, state, self).await?)
  }

  async fn get_users_for_selector(&self, request: &SelectorRequest) -> Result<Page<User>> {
    let catalog = self.catalog.snapshot();
    let selector = selector::validate(&request.selector, &catalog, request.state, self).await?;
    let columns = resolve_columns(&catalog, &request.columns)?;
    let users = self
      .read_users(&catalog, Read {
        selector:  &selector,
        columns:   &columns,
        expected:  &columns,
        purposes:  &request.purposes,
        paginator: Some(&request.paginator),
        state:     request.state,
        cutoff:    RetentionCutoff::now(),
      })
      .await?;
    Ok(Page::from_rows(users, &request.paginator)?)
  }

  async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
    let catalog = self.catalog.snapshot();
    self.read_user(&catalog, id, LifecycleState::Live, RetentionCutoff::now()).await
  }

  async fn get_all_user_values(&self, id: Uuid) -> Result<Option<AllUserValues>> {
    let Some(base) = self.base_user(id).await? else {
      return Ok(None);
    };
    let catalog = self.catalog.snapshot();
    let live = self
      .read_user(&catalog, id, LifecycleState::Live, RetentionCutoff::Unbounded)
      .await?
      .unwrap_or_else(|| materialise_base(base));
    let soft_deleted = self
      .read_user(&catalog, id, LifecycleState::SoftDeleted, RetentionCutoff::Unbounded)
      .await?
      .filter(|user| user.column_values.keys().any(|name| {
        catalog.column_by_name(name).is_some_and(|c| !c.is_system())
      }));
    Ok(Some(AllUserValues { live, soft_deleted }))
  }

  async fn delete_user(&self, id: Uuid) -> Result<bool> {
    let catalog = self.catalog.snapshot();
    let retention_until = Utc::now() + self.soft_delete_retention;
    let deleted = self
      .conn
      .call(move |conn| Ok(crate::ingest::delete_user_tx(conn, &catalog, id, retention_until)))
      .await??;
    if deleted {
      tracing::info!(user_id = %id, "user soft-deleted");
    }
    Ok(deleted)
  }

  async fn list_users_paginated(&self, paginator: &Paginator) -> Result<Page<BaseUser>> {
    let catalog = self.catalog.snapshot();
    let query = QueryBuilder::new(&catalog).base_users(paginator)?;
    tracing::debug!(sql = %query.sql, "listing base users");
    let raws: Vec<RawBaseUser> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&query.sql)?;
        bind(&mut stmt, &query.params)?;
        let mut rows = stmt.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
          out.push(RawBaseUser::read(row)?);
        }
        Ok(out)
      })
      .await?;
    let users = raws
      .into_iter()
      .map(RawBaseUser::into_base_user)
      .collect::<Result<Vec<_>>>()?;
    Ok(Page::from_rows(users, paginator)?)
  }

  async fn list_users_for_email(&self, email: &str) -> Result<Vec<BaseUser>> {
    let catalog = self.catalog.snapshot();
    let selector = selector::check(
      &Selector::new(format!("{{{EMAIL_COLUMN}}} = ?"), vec![json!(email)]),
      &catalog,
    )?;
    let columns = resolve_columns(&catalog, &[EMAIL_COLUMN.to_owned()])?;
    let users = self
      .read_users(&catalog, Read {
        selector:  &selector,
        columns:   &columns,
        expected:  &columns,
        purposes:  &[],
        paginator: None,
        state:     LifecycleState::Live,
        cutoff:    RetentionCutoff::now(),
      })
      .await?;
    Ok(users.into_iter().map(|u| u.base).collect())
  }

  async fn cleanup_users(&self, max_candidates: usize, dry_run: bool) -> Result<usize> {
    self.run_cleanup(max_candidates, dry_run).await
  }
}
