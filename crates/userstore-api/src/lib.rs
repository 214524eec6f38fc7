//! JSON REST API for the userstore.
//!
//! Exposes an axum [`Router`] over a [`MultiRegionStore`]. Reads fan out to
//! every region; writes name their region in the path. Auth, TLS, and
//! transport concerns are the caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", userstore_api::api_router(state.clone()))
//! ```

pub mod admin;
pub mod error;
pub mod ingest;
pub mod users;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post, put},
};
use userstore_core::{
  pagination::DEFAULT_LIMIT,
  store::{UserStore, UserWriter},
};
use userstore_regions::MultiRegionStore;

pub use error::ApiError;

/// A regional backend the API can serve: readable through the fan-out and
/// writable directly.
pub trait RegionalStore: UserStore + UserWriter + 'static {}

impl<T: UserStore + UserWriter + 'static> RegionalStore for T {}

/// Shared handler state.
pub struct ApiState<S> {
  pub store:              Arc<MultiRegionStore<S>>,
  /// Page size when a request does not give one.
  pub default_page_limit: usize,
}

impl<S> ApiState<S> {
  pub fn new(store: Arc<MultiRegionStore<S>>) -> Self {
    Self { store, default_page_limit: DEFAULT_LIMIT }
  }
}

impl<S> Clone for ApiState<S> {
  fn clone(&self) -> Self {
    Self { store: Arc::clone(&self.store), default_page_limit: self.default_page_limit }
  }
}

/// Build a fully-materialised API router for `state`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S: RegionalStore>(state: ApiState<S>) -> Router<()> {
  Router::new()
    // Reads
    .route("/users", get(users::list::<S>))
    .route("/users/query", post(users::query::<S>))
    .route("/users/by-email", get(users::by_email::<S>))
    .route("/users/{id}", get(users::get_one::<S>).delete(users::delete_one::<S>))
    .route("/users/{id}/values", get(users::all_values::<S>))
    // Ingestion
    .route("/regions/{region}/users", post(ingest::create_user::<S>))
    .route("/regions/{region}/users/{id}/values", post(ingest::insert_values::<S>))
    .route(
      "/regions/{region}/values/{id}",
      put(ingest::update_value::<S>).delete(ingest::delete_value::<S>),
    )
    // Maintenance
    .route("/cleanup", post(admin::cleanup::<S>))
    .route("/catalog/refresh", post(admin::refresh_catalog::<S>))
    .with_state(state)
}

#[cfg(test)]
mod tests;
