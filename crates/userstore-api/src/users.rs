//! Handlers for `/users` endpoints.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `POST`   | `/users/query` | Body: [`QueryBody`]; a page of users |
//! | `GET`    | `/users` | Pagination query parameters; live base users |
//! | `GET`    | `/users/by-email` | `?email=` required |
//! | `GET`    | `/users/{id}` | 404 if not found or deleted |
//! | `GET`    | `/users/{id}/values` | Live and soft-deleted values, ignoring retention |
//! | `DELETE` | `/users/{id}` | 204, or 404 if there was no live user |

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

use userstore_core::{
  pagination::{Page, PaginationParams},
  selector::Selector,
  store::{SelectorRequest, UserStore},
  user::{AllUserValues, BaseUser, User},
  value::LifecycleState,
};

use crate::{ApiState, RegionalStore, error::ApiError};

// ─── Query ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QueryBody {
  /// Selector clause, e.g. `{email} = ?`.
  pub selector:   String,
  #[serde(default)]
  pub params:     Vec<serde_json::Value>,
  /// Column names to return.
  #[serde(default)]
  pub columns:    Vec<String>,
  /// Purposes every returned value must be retained for.
  #[serde(default)]
  pub purposes:   Vec<Uuid>,
  #[serde(default)]
  pub state:      LifecycleState,
  #[serde(flatten)]
  pub pagination: PaginationParams,
}

/// `POST /users/query`
pub async fn query<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<QueryBody>,
) -> Result<Json<Page<User>>, ApiError> {
  let request = SelectorRequest {
    selector:  Selector::new(body.selector, body.params),
    columns:   body.columns,
    purposes:  body.purposes,
    paginator: body.pagination.into_paginator(state.default_page_limit)?,
    state:     body.state,
  };
  let page = state
    .store
    .get_users_for_selector(&request)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(page))
}

// ─── List ────────────────────────────────────────────────────────────────────

/// `GET /users[?sort_key=..][&sort_order=..][&limit=..][&starting_after=..|&ending_before=..]`
pub async fn list<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Query(params): Query<PaginationParams>,
) -> Result<Json<Page<BaseUser>>, ApiError> {
  let paginator = params.into_paginator(state.default_page_limit)?;
  let page = state
    .store
    .list_users_paginated(&paginator)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct EmailParams {
  pub email: String,
}

/// `GET /users/by-email?email=<address>`
pub async fn by_email<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Query(params): Query<EmailParams>,
) -> Result<Json<Vec<BaseUser>>, ApiError> {
  let users = state
    .store
    .list_users_for_email(&params.email)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(users))
}

// ─── One user ────────────────────────────────────────────────────────────────

/// `GET /users/{id}`
pub async fn get_one<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<User>, ApiError> {
  let user = state
    .store
    .get_user(id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("user {id} not found")))?;
  Ok(Json(user))
}

/// `GET /users/{id}/values`
pub async fn all_values<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<AllUserValues>, ApiError> {
  let values = state
    .store
    .get_all_user_values(id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("user {id} not found")))?;
  Ok(Json(values))
}

/// `DELETE /users/{id}`
pub async fn delete_one<S: RegionalStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
  if state.store.delete_user(id).await.map_err(ApiError::store)? {
    Ok(StatusCode::NO_CONTENT)
  } else {
    Err(ApiError::NotFound(format!("no live user {id}")))
  }
}
