//! Error type for `userstore-sqlite`.

use thiserror::Error;
use userstore_core::store::StoreError;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] userstore_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("user not found: {0}")]
  UserNotFound(Uuid),

  #[error("value not found: {0}")]
  ValueNotFound(Uuid),

  /// An optimistic update found a different version than expected.
  #[error("value {id} is not at version {expected}")]
  VersionConflict { id: Uuid, expected: i64 },

  /// A cleanup claim marked a different number of candidates than it
  /// selected; another dequeuer raced this one.
  #[error("claimed {claimed} cleanup candidate(s) but selected {selected}")]
  ClaimMismatch { selected: usize, claimed: usize },
}

impl StoreError for Error {
  fn is_caller_error(&self) -> bool {
    match self {
      Error::Core(e) => e.is_caller_error(),
      Error::UserNotFound(_) | Error::ValueNotFound(_) | Error::VersionConflict { .. } => true,
      _ => false,
    }
  }

  fn is_not_found(&self) -> bool { matches!(self, Error::UserNotFound(_) | Error::ValueNotFound(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
