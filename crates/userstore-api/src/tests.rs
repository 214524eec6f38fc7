//! Router tests over two in-memory SQLite regions.

use std::sync::Arc;

use axum::{
  body::Body,
  http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt as _;
use uuid::Uuid;

use userstore_core::catalog::{CatalogCache, fixtures};
use userstore_regions::MultiRegionStore;
use userstore_sqlite::SqliteStore;

use crate::{ApiState, api_router};

const OPERATIONAL: &str = "00000000-0000-0000-0000-00000000000a";

async fn make_state() -> ApiState<SqliteStore> {
  let catalog = Arc::new(CatalogCache::new(fixtures::catalog()));
  let mut regions = Vec::new();
  for name in ["eu", "us"] {
    regions.push((name.to_string(), SqliteStore::open_in_memory(catalog.clone()).await.unwrap()));
  }
  let (_shutdown, rx) = watch::channel(false);
  ApiState::new(Arc::new(MultiRegionStore::new(regions, catalog, rx).unwrap()))
}

async fn call(state: &ApiState<SqliteStore>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
  let mut builder = Request::builder().method(method).uri(uri);
  let body = match body {
    Some(json) => {
      builder = builder.header(header::CONTENT_TYPE, "application/json");
      Body::from(json.to_string())
    }
    None => Body::empty(),
  };
  let resp = api_router(state.clone()).oneshot(builder.body(body).unwrap()).await.unwrap();
  let status = resp.status();
  let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
  let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
  (status, json)
}

async fn create_user(state: &ApiState<SqliteStore>, region: &str, email: &str) -> String {
  let (status, user) = call(
    state,
    "POST",
    &format!("/regions/{region}/users"),
    Some(json!({ "organization_id": Uuid::from_u128(1) })),
  )
  .await;
  assert_eq!(status, StatusCode::CREATED);
  let id = user["id"].as_str().unwrap().to_owned();

  let (status, _) = call(
    state,
    "POST",
    &format!("/regions/{region}/users/{id}/values"),
    Some(json!([{
      "column": "email",
      "value": email,
      "consented": [{ "purpose_id": OPERATIONAL }],
    }])),
  )
  .await;
  assert_eq!(status, StatusCode::CREATED);
  id
}

// ─── Reads ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn query_by_email() {
  let state = make_state().await;
  let ada = create_user(&state, "eu", "ada@example.com").await;
  create_user(&state, "us", "bob@example.com").await;

  let (status, page) = call(
    &state,
    "POST",
    "/users/query",
    Some(json!({
      "selector": "{email} = ?",
      "params": ["ada@example.com"],
      "columns": ["email"],
    })),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(page["data"].as_array().unwrap().len(), 1);
  assert_eq!(page["data"][0]["id"], json!(ada));
  assert_eq!(page["data"][0]["profile"]["email"], json!("ada@example.com"));
  assert_eq!(page["has_next"], json!(false));
}

#[tokio::test]
async fn query_with_wrong_arity_is_400() {
  let state = make_state().await;
  let (status, body) = call(
    &state,
    "POST",
    "/users/query",
    Some(json!({ "selector": "{email} = ?", "params": [] })),
  )
  .await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert!(body["error"].as_str().unwrap().contains("1"), "{body}");
}

#[tokio::test]
async fn list_users_paginates_across_regions() {
  let state = make_state().await;
  for (region, email) in [("eu", "a@x.io"), ("us", "b@x.io"), ("eu", "c@x.io")] {
    create_user(&state, region, email).await;
  }

  let (status, first) = call(&state, "GET", "/users?limit=2", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(first["data"].as_array().unwrap().len(), 2);
  assert_eq!(first["has_next"], json!(true));

  let next = first["next"].as_str().unwrap();
  let (status, second) = call(&state, "GET", &format!("/users?limit=2&starting_after={next}"), None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(second["data"].as_array().unwrap().len(), 1);

  let (status, _) = call(&state, "GET", "/users?limit=0", None).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_user_and_values() {
  let state = make_state().await;
  let id = create_user(&state, "us", "bob@example.com").await;

  let (status, user) = call(&state, "GET", &format!("/users/{id}"), None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(user["profile"]["email"], json!("bob@example.com"));

  let (status, values) = call(&state, "GET", &format!("/users/{id}/values"), None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(values["soft_deleted"], Value::Null);

  let (status, found) = call(&state, "GET", "/users/by-email?email=bob@example.com", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(found[0]["id"], json!(id));

  let (status, body) = call(&state, "GET", &format!("/users/{}", Uuid::new_v4()), None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert!(body["error"].is_string());
}

// ─── Writes ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_user_then_404() {
  let state = make_state().await;
  let id = create_user(&state, "eu", "ada@example.com").await;

  let (status, _) = call(&state, "DELETE", &format!("/users/{id}"), None).await;
  assert_eq!(status, StatusCode::NO_CONTENT);
  let (status, _) = call(&state, "DELETE", &format!("/users/{id}"), None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  let (status, _) = call(&state, "GET", &format!("/users/{id}"), None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn update_and_soft_delete_value() {
  let state = make_state().await;
  let (_, user) = call(
    &state,
    "POST",
    "/regions/eu/users",
    Some(json!({ "organization_id": Uuid::from_u128(1) })),
  )
  .await;
  let user_id = user["id"].as_str().unwrap();
  let (_, stored) = call(
    &state,
    "POST",
    &format!("/regions/eu/users/{user_id}/values"),
    Some(json!([{ "column": "age", "value": 41, "consented": [{ "purpose_id": OPERATIONAL }] }])),
  )
  .await;
  let value_id = stored[0]["id"].as_str().unwrap();

  let update = json!({ "expected_version": 1, "value": 42, "consented": [{ "purpose_id": OPERATIONAL }] });
  let (status, updated) = call(&state, "PUT", &format!("/regions/eu/values/{value_id}"), Some(update.clone())).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(updated["version"], json!(2));
  assert_eq!(updated["value"], json!(42));

  let (status, _) = call(&state, "PUT", &format!("/regions/eu/values/{value_id}"), Some(update)).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  let (status, _) = call(&state, "DELETE", &format!("/regions/eu/values/{value_id}"), None).await;
  assert_eq!(status, StatusCode::NO_CONTENT);
  let (status, _) = call(&state, "DELETE", &format!("/regions/eu/values/{value_id}"), None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_region_is_404() {
  let state = make_state().await;
  let (status, body) = call(
    &state,
    "POST",
    "/regions/mars/users",
    Some(json!({ "organization_id": Uuid::from_u128(1) })),
  )
  .await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert!(body["error"].as_str().unwrap().contains("mars"));
}

#[tokio::test]
async fn invalid_value_is_400() {
  let state = make_state().await;
  let (_, user) = call(
    &state,
    "POST",
    "/regions/eu/users",
    Some(json!({ "organization_id": Uuid::from_u128(1) })),
  )
  .await;
  let user_id = user["id"].as_str().unwrap();
  let (status, _) = call(
    &state,
    "POST",
    &format!("/regions/eu/users/{user_id}/values"),
    Some(json!([{ "column": "age", "value": "old", "consented": [{ "purpose_id": OPERATIONAL }] }])),
  )
  .await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ─── Maintenance ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cleanup_reports_remaining() {
  let state = make_state().await;
  let (status, body) = call(&state, "POST", "/cleanup", Some(json!({ "dry_run": true }))).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["remaining"], json!(0));
}

#[tokio::test]
async fn refresh_without_source_is_500() {
  let state = make_state().await;
  let (status, body) = call(&state, "POST", "/catalog/refresh", None).await;
  assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
  assert!(body["error"].as_str().unwrap().contains("source"));
}
