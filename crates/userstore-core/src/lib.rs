//! Core types and the query engine for the userstore.
//!
//! This crate has no HTTP or database dependencies. It owns the selector
//! language, the SQL builder and the row processor; storage backends (e.g.
//! `userstore-sqlite`) execute what it produces.

pub mod catalog;
pub mod error;
pub mod ordering;
pub mod pagination;
pub mod query;
pub mod rows;
pub mod selector;
pub mod sql;
pub mod store;
pub mod user;
pub mod value;

pub use error::{Error, Result};
