//! Handlers for per-region writes.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `POST`   | `/regions/{region}/users` | Body: `{"organization_id":"..."}`; 201 |
//! | `POST`   | `/regions/{region}/users/{id}/values` | Body: list of [`NewColumnValue`]; 201 |
//! | `PUT`    | `/regions/{region}/values/{id}` | Body: [`UpdateColumnValue`] |
//! | `DELETE` | `/regions/{region}/values/{id}` | 204, or 404 if there was no live value |

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use userstore_core::{
  store::UserWriter,
  value::{NewColumnValue, UpdateColumnValue},
};

use crate::{ApiState, RegionalStore, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct CreateBody {
  pub organization_id: Uuid,
}

/// `POST /regions/{region}/users`
pub async fn create_user<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Path(region): Path<String>,
  Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError> {
  let store = state.store.region(&region).map_err(ApiError::store)?;
  let user = store
    .create_user(body.organization_id)
    .await
    .map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(user)))
}

/// `POST /regions/{region}/users/{id}/values`
pub async fn insert_values<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Path((region, user_id)): Path<(String, Uuid)>,
  Json(values): Json<Vec<NewColumnValue>>,
) -> Result<impl IntoResponse, ApiError> {
  let store = state.store.region(&region).map_err(ApiError::store)?;
  let stored = store
    .insert_values(user_id, values)
    .await
    .map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(stored)))
}

/// `PUT /regions/{region}/values/{id}`
pub async fn update_value<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Path((region, id)): Path<(String, Uuid)>,
  Json(update): Json<UpdateColumnValue>,
) -> Result<impl IntoResponse, ApiError> {
  let store = state.store.region(&region).map_err(ApiError::store)?;
  let value = store.update_value(id, update).await.map_err(ApiError::store)?;
  Ok(Json(value))
}

/// `DELETE /regions/{region}/values/{id}`
pub async fn delete_value<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Path((region, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, ApiError> {
  let store = state.store.region(&region).map_err(ApiError::store)?;
  if store.soft_delete_value(id).await.map_err(ApiError::store)? {
    Ok(StatusCode::NO_CONTENT)
  } else {
    Err(ApiError::NotFound(format!("no live value {id}")))
  }
}
