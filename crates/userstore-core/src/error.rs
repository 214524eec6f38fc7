//! Error types for `userstore-core`.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("selector expects {expected} parameter(s) but {supplied} were supplied")]
  SelectorArity { expected: usize, supplied: usize },

  #[error("unknown column: {0:?}")]
  UnknownColumn(String),

  #[error("column {column:?} has no sub-field {field:?}")]
  UnsupportedSubfield { column: String, field: String },

  #[error("invalid selector: {0}")]
  InvalidSelector(String),

  #[error("unsupported sort key: {0:?}")]
  UnsupportedSortKey(String),

  #[error("invalid pagination: {0}")]
  InvalidPagination(String),

  #[error("invalid column value: {0}")]
  InvalidValue(String),

  /// Two accepted values of one column share an ordering. Row-level
  /// corruption is filtered before this check, so reaching it is a bug.
  #[error("user {user_id} has duplicate orderings for column {column:?}")]
  DuplicateOrdering { user_id: Uuid, column: String },

  #[error("invalid catalog: {0}")]
  InvalidCatalog(String),

  #[error("unknown column id: {0}")]
  UnknownColumnId(Uuid),

  #[error("query builder used before a query was planned")]
  NotPlanned,

  #[error("decode error: {0}")]
  Decode(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Whether the error was caused by the request itself. Caller errors are
  /// never retried and map to a "bad request" class at the edge.
  pub fn is_caller_error(&self) -> bool {
    matches!(
      self,
      Error::SelectorArity { .. }
        | Error::UnknownColumn(_)
        | Error::UnsupportedSubfield { .. }
        | Error::InvalidSelector(_)
        | Error::UnsupportedSortKey(_)
        | Error::InvalidPagination(_)
        | Error::InvalidValue(_)
    )
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
