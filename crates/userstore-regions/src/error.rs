//! Error types for `userstore-regions`.

use std::fmt;

use thiserror::Error;
use userstore_core::store::StoreError;

/// One region's failure during a fan-out.
#[derive(Debug)]
pub struct RegionFailure<E> {
  pub region: String,
  pub error:  E,
}

impl<E: fmt::Display> fmt::Display for RegionFailure<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "region {}: {}", self.region, self.error)
  }
}

#[derive(Debug, Error)]
pub enum Error<E: StoreError> {
  #[error("no regions configured")]
  NoRegions,

  #[error("unknown region {0:?}")]
  UnknownRegion(String),

  #[error(transparent)]
  Core(#[from] userstore_core::Error),

  /// At least one region failed. `primary` is the first failure in region
  /// name order; the rest are kept in `others`.
  #[error("{primary} ({} other region(s) failed)", .others.len())]
  Regions {
    primary: RegionFailure<E>,
    others:  Vec<RegionFailure<E>>,
  },

  #[error("shut down before regions {0:?} answered")]
  Shutdown(Vec<String>),

  #[error("region task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

impl<E: StoreError> Error<E> {
  pub(crate) fn region(region: impl Into<String>, error: E) -> Self {
    Error::Regions { primary: RegionFailure { region: region.into(), error }, others: Vec::new() }
  }

  /// Every regional failure, primary first.
  pub fn failures(&self) -> impl Iterator<Item = &RegionFailure<E>> {
    let (primary, others) = match self {
      Error::Regions { primary, others } => (Some(primary), others.as_slice()),
      _ => (None, [].as_slice()),
    };
    primary.into_iter().chain(others)
  }
}

impl<E: StoreError> StoreError for Error<E> {
  fn is_caller_error(&self) -> bool {
    match self {
      Error::Core(e) => e.is_caller_error(),
      Error::UnknownRegion(_) => true,
      Error::Regions { primary, .. } => primary.error.is_caller_error(),
      _ => false,
    }
  }

  fn is_not_found(&self) -> bool {
    match self {
      Error::UnknownRegion(_) => true,
      Error::Regions { primary, .. } => primary.error.is_not_found(),
      _ => false,
    }
  }
}

pub type Result<T, E> = std::result::Result<T, Error<E>>;
