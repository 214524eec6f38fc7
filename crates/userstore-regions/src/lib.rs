//! Fan-out of userstore reads across regions.
//!
//! Each region is an independent store. [`MultiRegionStore`] runs every
//! read in all of them concurrently, one task per region, and merges the
//! answers: single users resolve to the first region (by name) that has
//! them, lists are de-duplicated the same way and re-paginated when more
//! than one region contributed.

mod store;

pub mod error;

pub use error::{Error, RegionFailure, Result};
pub use store::MultiRegionStore;

#[cfg(test)]
mod tests;
