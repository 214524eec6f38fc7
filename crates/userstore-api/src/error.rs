//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use userstore_core::store::StoreError;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ApiError {
  /// Classify a store error: not-found is 404, caller errors are 400 and
  /// everything else is a 500.
  pub fn store<E: StoreError>(error: E) -> Self {
    if error.is_not_found() {
      ApiError::NotFound(error.to_string())
    } else if error.is_caller_error() {
      ApiError::BadRequest(error.to_string())
    } else {
      ApiError::Store(Box::new(error))
    }
  }
}

impl From<userstore_core::Error> for ApiError {
  fn from(error: userstore_core::Error) -> Self { ApiError::store(error) }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match &self {
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
      ApiError::Store(e) => {
        tracing::error!(error = %e, "store failure");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
      }
    };
    (status, Json(json!({ "error": message }))).into_response()
  }
}
