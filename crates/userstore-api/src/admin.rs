//! Maintenance endpoints: the cleanup job and catalog refresh.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use userstore_core::store::UserStore;

use crate::{ApiState, RegionalStore, error::ApiError};

/// Candidates claimed per region when the body does not say.
pub const DEFAULT_MAX_CANDIDATES: usize = 100;

fn default_max_candidates() -> usize { DEFAULT_MAX_CANDIDATES }

#[derive(Debug, Deserialize)]
pub struct CleanupBody {
  #[serde(default = "default_max_candidates")]
  pub max_candidates: usize,
  #[serde(default)]
  pub dry_run:        bool,
}

#[derive(Debug, Serialize)]
pub struct CleanupResult {
  /// Candidates still queued across all regions.
  pub remaining: usize,
}

/// `POST /cleanup`, body: `{"max_candidates":100,"dry_run":false}`
pub async fn cleanup<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<CleanupBody>,
) -> Result<Json<CleanupResult>, ApiError> {
  let remaining = state
    .store
    .cleanup_users(body.max_candidates, body.dry_run)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(CleanupResult { remaining }))
}

#[derive(Debug, Serialize)]
pub struct RefreshResult {
  pub columns: usize,
}

/// `POST /catalog/refresh`
pub async fn refresh_catalog<S: RegionalStore>(
  State(state): State<ApiState<S>>,
) -> Result<Json<RefreshResult>, ApiError> {
  let catalog = state.store.catalog().refresh()?;
  Ok(Json(RefreshResult { columns: catalog.columns().count() }))
}
