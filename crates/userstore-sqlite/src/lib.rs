//! SQLite backend for one userstore region.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! thread without blocking the async runtime. Statements are produced by
//! `userstore-core` and bound by parameter name.

mod cleanup;
mod encode;
mod ingest;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{DEFAULT_SOFT_DELETE_RETENTION_DAYS, SqliteStore};
