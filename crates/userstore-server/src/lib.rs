//! Wiring for the userstore server binary: configuration, the file-backed
//! catalog, region stores and the traced router.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use axum::Router;
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use userstore_api::{ApiState, api_router};
use userstore_core::{
  catalog::{Catalog, CatalogCache, CatalogDefinition, CatalogSource},
  pagination::DEFAULT_LIMIT,
};
use userstore_regions::MultiRegionStore;
use userstore_sqlite::{DEFAULT_SOFT_DELETE_RETENTION_DAYS, SqliteStore};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml` and
/// `USERSTORE_*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  pub host:                       String,
  pub port:                       u16,
  /// Region name → SQLite database path.
  pub regions:                    BTreeMap<String, PathBuf>,
  pub catalog_path:               PathBuf,
  #[serde(default = "default_retention_days")]
  pub soft_delete_retention_days: i64,
  #[serde(default = "default_page_limit")]
  pub default_page_limit:         usize,
}

fn default_retention_days() -> i64 { DEFAULT_SOFT_DELETE_RETENTION_DAYS }

fn default_page_limit() -> usize { DEFAULT_LIMIT }

// ─── Catalog file ────────────────────────────────────────────────────────────

/// Loads the catalog from a JSON [`CatalogDefinition`] on disk, on every
/// refresh.
pub struct FileCatalogSource {
  path: PathBuf,
}

impl FileCatalogSource {
  pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}

impl CatalogSource for FileCatalogSource {
  fn load(&self) -> userstore_core::Result<Catalog> {
    let text = std::fs::read_to_string(&self.path).map_err(|e| {
      userstore_core::Error::InvalidCatalog(format!("cannot read {}: {e}", self.path.display()))
    })?;
    let definition: CatalogDefinition = serde_json::from_str(&text)?;
    Catalog::new(definition)
  }
}

// ─── Startup ─────────────────────────────────────────────────────────────────

/// Open every configured region and put them behind one fan-out store.
pub async fn open_store(
  config: &ServerConfig,
  shutdown: watch::Receiver<bool>,
) -> anyhow::Result<MultiRegionStore<SqliteStore>> {
  let catalog_path = expand_tilde(&config.catalog_path);
  let catalog = Arc::new(
    CatalogCache::with_source(FileCatalogSource::new(&catalog_path))
      .with_context(|| format!("failed to load catalog from {catalog_path:?}"))?,
  );

  let retention = chrono::Duration::days(config.soft_delete_retention_days);
  let mut regions = Vec::with_capacity(config.regions.len());
  for (name, path) in &config.regions {
    let path = expand_tilde(path);
    let store = SqliteStore::open(&path, catalog.clone())
      .await
      .with_context(|| format!("failed to open region {name} at {path:?}"))?
      .with_soft_delete_retention(retention);
    tracing::info!(region = %name, path = %path.display(), "region opened");
    regions.push((name.clone(), store));
  }

  MultiRegionStore::new(regions, catalog, shutdown).context("failed to build the region set")
}

/// The API router with request tracing.
pub fn router(store: Arc<MultiRegionStore<SqliteStore>>, config: &ServerConfig) -> Router {
  let state = ApiState { store, default_page_limit: config.default_page_limit };
  Router::new().merge(api_router(state)).layer(TraceLayer::new_for_http())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use axum::{
    body::Body,
    http::{Request, StatusCode},
  };
  use tower::ServiceExt as _;

  use super::*;

  const CATALOG: &str = r#"{
    "columns": [
      { "id": "00000000-0000-0000-0000-0000000000c1", "name": "email",
        "data_type": "d26b6d52-a8d7-4c2f-9efc-394eb90a3294" }
    ]
  }"#;

  fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("userstore-server-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  fn config_for(dir: &Path) -> ServerConfig {
    let toml = format!(
      r#"
        host = "127.0.0.1"
        port = 0
        catalog_path = "{catalog}"

        [regions]
        eu = "{eu}"
        us = "{us}"
      "#,
      catalog = dir.join("catalog.json").display(),
      eu = dir.join("eu.sqlite").display(),
      us = dir.join("us.sqlite").display(),
    );
    config::Config::builder()
      .add_source(config::File::from_str(&toml, config::FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn config_defaults() {
    let config = config_for(Path::new("/tmp/x"));
    assert_eq!(config.regions.len(), 2);
    assert_eq!(config.soft_delete_retention_days, DEFAULT_SOFT_DELETE_RETENTION_DAYS);
    assert_eq!(config.default_page_limit, DEFAULT_LIMIT);
  }

  #[test]
  fn file_catalog_source_reads_definition() {
    let dir = scratch_dir();
    let path = dir.join("catalog.json");
    std::fs::write(&path, CATALOG).unwrap();
    let catalog = FileCatalogSource::new(&path).load().unwrap();
    assert!(catalog.column_by_name("email").is_some());

    assert!(FileCatalogSource::new(dir.join("missing.json")).load().is_err());
  }

  #[tokio::test]
  async fn serves_and_refreshes_catalog() {
    let dir = scratch_dir();
    std::fs::write(dir.join("catalog.json"), CATALOG).unwrap();
    let config = config_for(&dir);
    let (_tx, rx) = watch::channel(false);
    let store = Arc::new(open_store(&config, rx).await.unwrap());
    assert_eq!(store.region_names().collect::<Vec<_>>(), vec!["eu", "us"]);

    let app = router(store, &config);
    let resp = app
      .clone()
      .oneshot(Request::builder().uri("/users").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
      .oneshot(
        Request::builder()
          .method("POST")
          .uri("/catalog/refresh")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
  }
}
