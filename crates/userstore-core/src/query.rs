//! SQL generation for user reads.
//!
//! A [`QueryBuilder`] is used in two phases: [`reset`](QueryBuilder::reset)
//! plans a request, [`build`](QueryBuilder::build) renders it. The rendered
//! statement always has the same leading projection (see [`layout`]), one
//! row per (user, value), ordered so that all rows of a user are adjacent
//! and users appear in the paginator's inner direction.
//!
//! When the selector joins value tables, or a page must be cut per user
//! rather than per row, the user ids are chosen by an inner
//! `SELECT DISTINCT ... LIMIT n + 1` and the outer query only fetches their
//! values. Otherwise every filter sits on the outer query.
//!
//! A value-column sort key is a correlated subquery yielding the user's
//! first live value for that column, so it never adds rows.

use uuid::Uuid;

use crate::{
  Error, Result,
  catalog::{Catalog, DataTypeKind, ValueSlot},
  pagination::{Cursor, Paginator},
  selector::{ValidatedSelector, render::join_alias},
  sql::{NOT_DELETED, SqlValue},
  value::LifecycleState,
};

/// Column positions in every user query's result rows.
pub mod layout {
  pub const USER_ID: usize = 0;
  pub const USER_CREATED: usize = 1;
  pub const USER_UPDATED: usize = 2;
  pub const USER_DELETED: usize = 3;
  pub const USER_VERSION: usize = 4;
  pub const USER_ORGANIZATION_ID: usize = 5;

  pub const VALUE_ID: usize = 6;
  pub const VALUE_VERSION: usize = 7;
  pub const VALUE_TYPE: usize = 8;
  pub const VALUE_COLUMN_ID: usize = 9;
  pub const VALUE_ORDERING: usize = 10;
  pub const VALUE_PURPOSE_IDS: usize = 11;
  pub const VALUE_RETENTION_TIMEOUTS: usize = 12;
  /// First of the nine payload slots, in [`ValueSlot`](crate::catalog::ValueSlot) order.
  pub const VALUE_SLOTS: usize = 13;
  pub const VALUE_CREATED: usize = 22;

  /// First projected sort-key value; one per sort key.
  pub const SORT_KEYS: usize = 23;

  /// Columns of a base-user list row.
  pub const BASE_USER_WIDTH: usize = 6;
}

const USER_FIELDS: [&str; 6] = [
  "u.id",
  "u.created",
  "u.updated",
  "u.deleted",
  "u._version",
  "u.organization_id",
];

fn value_fields() -> Vec<String> {
  let mut fields: Vec<String> = [
    "id",
    "_version",
    "value_type",
    "column_id",
    "ordering",
    "consented_purpose_ids",
    "retention_timeouts",
  ]
  .iter()
  .map(|f| format!("ucv.{f}"))
  .collect();
  fields.extend(ValueSlot::all().map(|s| format!("ucv.{}", s.column())));
  fields.push("ucv.created".to_owned());
  fields
}

fn deleted_predicate() -> String { format!("u.deleted = '{NOT_DELETED}'") }

fn purpose_containment(purposes: &str, alias: &str) -> String {
  format!(
    "NOT EXISTS (SELECT 1 FROM json_each({purposes}) rp WHERE rp.value NOT IN \
     (SELECT cp.value FROM json_each({alias}.consented_purpose_ids) cp))"
  )
}

/// A rendered statement and its positional parameters (`$1` is `params[0]`).
#[derive(Debug, Clone, PartialEq)]
pub struct UserQuery {
  pub sql:    String,
  pub params: Vec<SqlValue>,
}

/// What to read.
#[derive(Debug, Clone, Copy)]
pub struct QueryRequest<'a> {
  pub selector:  &'a ValidatedSelector,
  /// Columns whose values to return. System columns need no join.
  pub columns:   &'a [Uuid],
  /// Purposes every selector-matched value must be consented for.
  pub purposes:  &'a [Uuid],
  pub paginator: Option<&'a Paginator>,
  pub state:     LifecycleState,
}

struct SortKey {
  expr:     String,
  nullable: bool,
}

/// A user's first live value of one column, in row-processor order.
fn sort_value(alias: &str, slot: ValueSlot, column_param: &str) -> String {
  format!(
    "(SELECT {alias}.{column} FROM {table} {alias} \
     WHERE {alias}.user_id = u.id AND {alias}.column_id = {column_param} \
     ORDER BY {alias}.ordering, {alias}.created, {alias}.id LIMIT 1)",
    column = slot.column(),
    table = LifecycleState::Live.table(),
  )
}

pub struct QueryBuilder<'a> {
  catalog: &'a Catalog,
  request: Option<QueryRequest<'a>>,
  params:  Vec<SqlValue>,
}

impl<'a> QueryBuilder<'a> {
  pub fn new(catalog: &'a Catalog) -> Self { Self { catalog, request: None, params: Vec::new() } }

  /// Plan `request`, discarding anything planned before. The selector's
  /// parameters become `$1..$n`; everything the builder binds follows.
  pub fn reset(&mut self, request: QueryRequest<'a>) -> &mut Self {
    self.params = request.selector.params().to_vec();
    self.request = Some(request);
    self
  }

  fn bind(&mut self, value: SqlValue) -> String {
    self.params.push(value);
    format!("${}", self.params.len())
  }

  pub fn build(&mut self) -> Result<UserQuery> {
    let request = self.request.take().ok_or(Error::NotPlanned)?;
    if let Some(paginator) = request.paginator {
      paginator.validate()?;
    }
    let state = request.state;
    let table = state.table();
    let selector = request.selector;

    // Selector joins, one per referenced value column.
    let selector_where = selector.render(self.catalog, state, 0)?;
    let joined: Vec<Uuid> = selector.joined_columns().map(|c| c.column_id).collect();
    let purposes = match (joined.is_empty(), request.purposes.is_empty()) {
      (false, false) => Some(self.bind(SqlValue::uuid_array(request.purposes))),
      _ => None,
    };
    let mut selector_joins = String::new();
    for (i, column_id) in joined.iter().enumerate() {
      let alias = join_alias(i);
      let id = self.bind(SqlValue::from_uuid(*column_id));
      selector_joins.push_str(&format!(
        " LEFT JOIN {table} {alias} ON {alias}.user_id = u.id AND {alias}.column_id = {id}"
      ));
      if let Some(purposes) = &purposes {
        selector_joins.push_str(&format!(" AND {}", purpose_containment(purposes, &alias)));
      }
    }

    // Sort keys and the keyset predicate.
    let sort = match request.paginator {
      Some(p) => self.sort_keys(p, true)?,
      None => Vec::new(),
    };
    let keyset = match request.paginator {
      Some(p) => match p.cursor() {
        Some(cursor) => Some(self.keyset(&sort, &p.sort_keys, cursor, p.inner_ascending())),
        None => None,
      },
      None => None,
    };
    let order_by = match request.paginator {
      Some(p) => order_by(&sort, p.inner_ascending()),
      None => "u.id ASC".to_owned(),
    };
    let limit = request.paginator.map(|p| p.limit + 1);

    // Which value rows the outer query returns.
    let mut value_columns = Vec::new();
    for id in request.columns {
      let desc = self.catalog.column_by_id(*id).ok_or(Error::UnknownColumnId(*id))?;
      if !desc.is_system() && !value_columns.contains(id) {
        value_columns.push(*id);
      }
    }
    let value_filter = match value_columns.as_slice() {
      [] => None,
      [one] => Some(format!("ucv.column_id = {}", self.bind(SqlValue::from_uuid(*one)))),
      many => Some(format!(
        "ucv.column_id IN (SELECT value FROM json_each({}))",
        self.bind(SqlValue::uuid_array(many))
      )),
    };
    let has_values = value_filter.is_some();

    let live_only = (state == LifecycleState::Live || !has_values).then(deleted_predicate);
    let needs_inner = !joined.is_empty() || (request.paginator.is_some() && has_values);

    let mut filters: Vec<String> = Vec::new();
    filters.extend(live_only.clone());
    filters.extend(selector_where.map(|w| format!("({w})")));
    filters.extend(keyset.map(|k| format!("({k})")));

    // Projection.
    let mut select: Vec<String> = USER_FIELDS.iter().map(|f| (*f).to_owned()).collect();
    if has_values {
      select.extend(value_fields());
    } else {
      select.extend(std::iter::repeat_n("NULL".to_owned(), value_fields().len()));
    }
    for (i, key) in sort.iter().enumerate() {
      select.push(format!("{} AS sort_key_{i}", key.expr));
    }

    let mut sql = format!("SELECT {} FROM users u", select.join(", "));
    if let Some(filter) = &value_filter {
      sql.push_str(&format!(" LEFT JOIN {table} ucv ON ucv.user_id = u.id AND {filter}"));
    }

    if needs_inner {
      let mut inner_select: Vec<String> =
        sort.iter().enumerate().map(|(i, k)| format!("{} AS sort_key_{i}", k.expr)).collect();
      inner_select.push("u.id".to_owned());
      let mut inner = format!(
        "SELECT DISTINCT {} FROM users u{selector_joins}",
        inner_select.join(", ")
      );
      if !filters.is_empty() {
        inner.push_str(&format!(" WHERE {}", filters.join(" AND ")));
      }
      inner.push_str(&format!(" ORDER BY {order_by}"));
      if let Some(limit) = limit {
        inner.push_str(&format!(" LIMIT {limit}"));
      }

      let mut outer: Vec<String> = live_only.into_iter().collect();
      outer.push(format!("u.id IN (SELECT du.id FROM ({inner}) du)"));
      sql.push_str(&format!(" WHERE {}", outer.join(" AND ")));
    } else if !filters.is_empty() {
      sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
    }

    sql.push_str(&format!(" ORDER BY {order_by}"));
    if has_values {
      sql.push_str(match state {
        LifecycleState::Live => ", ucv.column_id, ucv.ordering, ucv.created, ucv.id",
        LifecycleState::SoftDeleted => ", ucv.column_id, ucv.created, ucv.ordering, ucv.id",
      });
    }
    if !needs_inner {
      if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
      }
    }

    Ok(UserQuery { sql, params: std::mem::take(&mut self.params) })
  }

  /// A page of live base users, sorted by system columns only.
  pub fn base_users(&mut self, paginator: &Paginator) -> Result<UserQuery> {
    paginator.validate()?;
    self.request = None;
    self.params = Vec::new();
    let sort = self.sort_keys(paginator, false)?;
    let order_by = order_by(&sort, paginator.inner_ascending());
    let mut sql = format!("SELECT {} FROM users u WHERE {}", USER_FIELDS.join(", "), deleted_predicate());
    if let Some(cursor) = paginator.cursor() {
      let keyset = self.keyset(&sort, &paginator.sort_keys, cursor, paginator.inner_ascending());
      sql.push_str(&format!(" AND ({keyset})"));
    }
    sql.push_str(&format!(" ORDER BY {order_by} LIMIT {}", paginator.limit + 1));
    Ok(UserQuery { sql, params: std::mem::take(&mut self.params) })
  }

  /// Resolve each sort key to an expression. Value columns are read from
  /// the live table whatever the requested state, and are rejected when
  /// `allow_values` is false.
  fn sort_keys(&mut self, paginator: &Paginator, allow_values: bool) -> Result<Vec<SortKey>> {
    let mut keys = Vec::with_capacity(paginator.sort_keys.len());
    for (i, name) in paginator.sort_keys.iter().enumerate() {
      let desc = self
        .catalog
        .column_by_name(name)
        .ok_or_else(|| Error::UnsupportedSortKey(name.clone()))?;
      if let Some(system) = desc.system() {
        keys.push(SortKey { expr: format!("u.{}", system.field()), nullable: false });
        continue;
      }
      let sortable = allow_values
        && !desc.is_array()
        && !matches!(desc.kind(), DataTypeKind::Composite { .. });
      let Some(slot) = desc.slot(LifecycleState::Live).filter(|_| sortable) else {
        return Err(Error::UnsupportedSortKey(name.clone()));
      };
      let id = self.bind(SqlValue::from_uuid(desc.id()));
      keys.push(SortKey {
        expr:     sort_value(&format!("sort_key_table_{i}"), slot, &id),
        nullable: true,
      });
    }
    Ok(keys)
  }

  /// Rows strictly after `cursor` in the inner direction, as an OR of ANDs.
  fn keyset(&mut self, sort: &[SortKey], names: &[String], cursor: &Cursor, ascending: bool) -> String {
    let bound: Vec<Option<String>> = names
      .iter()
      .map(|name| match cursor.get(name) {
        None | Some(SqlValue::Null) => None,
        Some(v) => Some(self.bind(v.clone())),
      })
      .collect();

    let mut alternatives = Vec::new();
    for (i, key) in sort.iter().enumerate() {
      let e = &key.expr;
      let strict = match (ascending, &bound[i]) {
        (true, Some(p)) => format!("{e} > {p}"),
        (true, None) => format!("{e} IS NOT NULL"),
        (false, Some(p)) if key.nullable => format!("({e} < {p} OR {e} IS NULL)"),
        (false, Some(p)) => format!("{e} < {p}"),
        // Nothing sorts after NULL when nulls come last.
        (false, None) => continue,
      };
      let mut terms: Vec<String> = sort[..i]
        .iter()
        .zip(&bound)
        .map(|(prev, p)| match p {
          Some(p) => format!("{} = {p}", prev.expr),
          None => format!("{} IS NULL", prev.expr),
        })
        .collect();
      terms.push(strict);
      alternatives.push(format!("({})", terms.join(" AND ")));
    }
    if alternatives.is_empty() { "0".to_owned() } else { alternatives.join(" OR ") }
  }
}

fn order_by(sort: &[SortKey], ascending: bool) -> String {
  let direction = if ascending { "ASC NULLS FIRST" } else { "DESC NULLS LAST" };
  sort
    .iter()
    .map(|k| format!("{} {direction}", k.expr))
    .collect::<Vec<_>>()
    .join(", ")
}
