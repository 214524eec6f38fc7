//! The user selector language.
//!
//! A selector is a SQL-like `WHERE` fragment over catalog columns:
//!
//! ```text
//! {email} = ? AND (date_part('year', {birthday}) < ? OR {home}->>'verified' = true)
//! ```
//!
//! Processing runs in three stages, each usable on its own:
//!
//! - [`format`] checks arity, resolves columns, and produces the canonical
//!   text with `$N` placeholders and one pair of parentheses per clause.
//! - [`check`] type-checks the tree and coerces the caller's parameters.
//! - [`validate`] additionally prepares (never executes) the selector
//!   against a store, turning any residual SQL error into
//!   [`Error::InvalidSelector`].

pub mod ast;
mod check;
pub mod lexer;
mod parser;
pub mod render;

use std::{collections::HashMap, future::Future};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::check::{DATE_PART_UNITS, DATE_TRUNC_UNITS, DateUnit, ParamKind};
use self::{ast::Clause, render::Renderer};
use crate::{
  Error, Result,
  catalog::Catalog,
  sql::{SqlValue, encode_uuid, quote_literal},
  value::LifecycleState,
};

/// The match-all selector. Case-sensitive, and takes no parameters.
pub const ALL: &str = "ALL";

/// A selector as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
  pub clause: String,
  #[serde(default)]
  pub params: Vec<serde_json::Value>,
}

impl Selector {
  pub fn new(clause: impl Into<String>, params: Vec<serde_json::Value>) -> Self {
    Self { clause: clause.into(), params }
  }

  pub fn all() -> Self { Self::new(ALL, Vec::new()) }
}

impl Default for Selector {
  fn default() -> Self { Self::all() }
}

/// A column referenced by a selector, in first-appearance order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorColumn {
  pub column_id: Uuid,
  pub name:      String,
  pub is_system: bool,
}

// ─── Format ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FormattedClause {
  /// Canonical text, e.g. `({email} = $1) OR ({age} > $2)`.
  pub text:        String,
  pub tree:        Clause,
  pub columns:     Vec<SelectorColumn>,
  pub param_count: usize,
}

impl FormattedClause {
  pub fn has_non_system_columns(&self) -> bool { self.columns.iter().any(|c| !c.is_system) }
}

#[derive(Debug, Clone)]
pub enum FormattedSelector {
  All,
  Clause(FormattedClause),
}

/// Check arity, parse, and resolve columns.
pub fn format(selector: &str, param_count: usize, catalog: &Catalog) -> Result<FormattedSelector> {
  if selector.trim().is_empty() {
    return Err(Error::InvalidSelector("empty selector".into()));
  }
  if selector == ALL {
    if param_count != 0 {
      return Err(Error::SelectorArity { expected: 0, supplied: param_count });
    }
    return Ok(FormattedSelector::All);
  }

  let expected = lexer::count_placeholders(selector);
  if expected != param_count {
    return Err(Error::SelectorArity { expected, supplied: param_count });
  }

  let tokens = lexer::tokenize(selector)?;
  let parsed = parser::parse(tokens, catalog)?;
  Ok(FormattedSelector::Clause(FormattedClause {
    text:        parsed.clause.to_string(),
    tree:        parsed.clause,
    columns:     parsed.columns,
    param_count: parsed.param_count,
  }))
}

// ─── Check ───────────────────────────────────────────────────────────────────

/// A type-checked selector with its parameters coerced for binding.
#[derive(Debug, Clone)]
pub enum ValidatedSelector {
  All,
  Clause { formatted: FormattedClause, params: Vec<SqlValue> },
}

impl ValidatedSelector {
  pub fn is_all(&self) -> bool { matches!(self, ValidatedSelector::All) }

  pub fn columns(&self) -> &[SelectorColumn] {
    match self {
      ValidatedSelector::All => &[],
      ValidatedSelector::Clause { formatted, .. } => &formatted.columns,
    }
  }

  /// Non-system columns in join order.
  pub fn joined_columns(&self) -> impl Iterator<Item = &SelectorColumn> {
    self.columns().iter().filter(|c| !c.is_system)
  }

  pub fn has_non_system_columns(&self) -> bool { self.joined_columns().next().is_some() }

  pub fn params(&self) -> &[SqlValue] {
    match self {
      ValidatedSelector::All => &[],
      ValidatedSelector::Clause { params, .. } => params,
    }
  }

  /// The canonical text of the selector.
  pub fn text(&self) -> &str {
    match self {
      ValidatedSelector::All => ALL,
      ValidatedSelector::Clause { formatted, .. } => &formatted.text,
    }
  }

  /// Render the `WHERE` fragment with placeholders shifted by `offset`, or
  /// `None` for the match-all selector.
  pub fn render(
    &self,
    catalog: &Catalog,
    state: LifecycleState,
    offset: usize,
  ) -> Result<Option<String>> {
    let ValidatedSelector::Clause { formatted, .. } = self else {
      return Ok(None);
    };
    let physical: HashMap<Uuid, String> = render::physical_columns(&formatted.columns, catalog, state)?;
    Renderer::new(&physical, offset).clause(&formatted.tree).map(Some)
  }
}

/// Format, type-check, and coerce parameters.
pub fn check(selector: &Selector, catalog: &Catalog) -> Result<ValidatedSelector> {
  let FormattedSelector::Clause(mut formatted) = format(&selector.clause, selector.params.len(), catalog)? else {
    return Ok(ValidatedSelector::All);
  };
  let kinds = check::Checker::new(catalog, formatted.param_count).check(&mut formatted.tree)?;
  let params = check::coerce_params(&kinds, &selector.params, catalog)?;
  Ok(ValidatedSelector::Clause { formatted, params })
}

// ─── Validate ────────────────────────────────────────────────────────────────

/// A backing store that can compile a statement without running it.
pub trait StatementPreparer: Send + Sync {
  fn prepare(&self, sql: String) -> impl Future<Output = std::result::Result<(), String>> + Send + '_;
}

/// The statement prepared by [`validate`]: the selector over every join it
/// needs, filtered to nothing else.
pub fn dry_run_sql(
  selector: &ValidatedSelector,
  catalog: &Catalog,
  state: LifecycleState,
) -> Result<Option<String>> {
  let Some(clause) = selector.render(catalog, state, 0)? else {
    return Ok(None);
  };
  let mut sql = String::from("SELECT u.id FROM users u");
  for (i, col) in selector.joined_columns().enumerate() {
    let alias = render::join_alias(i);
    sql.push_str(&format!(
      " LEFT JOIN {table} {alias} ON {alias}.user_id = u.id AND {alias}.column_id = {id}",
      table = state.table(),
      id = quote_literal(&encode_uuid(col.column_id)),
    ));
  }
  sql.push_str(" WHERE ");
  sql.push_str(&clause);
  Ok(Some(sql))
}

/// Fully validate a selector for `state`, including a prepare-only dry run.
pub async fn validate<P: StatementPreparer>(
  selector: &Selector,
  catalog: &Catalog,
  state: LifecycleState,
  preparer: &P,
) -> Result<ValidatedSelector> {
  let validated = check(selector, catalog)?;
  if let Some(sql) = dry_run_sql(&validated, catalog, state)? {
    preparer.prepare(sql).await.map_err(|e| {
      tracing::debug!(selector = %validated.text(), error = %e, "selector failed dry run");
      Error::InvalidSelector(e)
    })?;
  }
  Ok(validated)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::catalog::fixtures;

  fn catalog() -> Catalog { fixtures::catalog() }

  fn params_for(clause: &str) -> Vec<serde_json::Value> {
    vec![json!(null); lexer::count_placeholders(clause)]
  }

  /// Format and type-check with untyped parameters; coercion is not
  /// exercised here.
  fn accepts(clause: &str) -> Result<()> {
    let catalog = catalog();
    let FormattedSelector::Clause(mut formatted) = format(clause, lexer::count_placeholders(clause), &catalog)? else {
      return Ok(());
    };
    check::Checker::new(&catalog, formatted.param_count).check(&mut formatted.tree)?;
    for state in [LifecycleState::Live, LifecycleState::SoftDeleted] {
      let validated = ValidatedSelector::Clause { formatted: formatted.clone(), params: vec![] };
      validated.render(&catalog, state, 0)?;
    }
    Ok(())
  }

  #[track_caller]
  fn valid(clause: &str) {
    if let Err(e) = accepts(clause) {
      panic!("expected {clause:?} to be valid: {e}");
    }
  }

  #[track_caller]
  fn invalid(clause: &str) {
    assert!(accepts(clause).is_err(), "expected {clause:?} to be invalid");
  }

  #[test]
  fn arity_must_match() {
    let catalog = catalog();
    for supplied in [0, 2, 3] {
      let err = format("{email} = ?", supplied, &catalog).unwrap_err();
      assert!(
        matches!(err, Error::SelectorArity { expected: 1, supplied: s } if s == supplied),
        "{err}"
      );
    }
    assert!(format("{email} = ?", 1, &catalog).is_ok());
    assert!(matches!(
      format("ALL", 1, &catalog),
      Err(Error::SelectorArity { expected: 0, supplied: 1 })
    ));
    assert!(matches!(format("{email} = '?'", 0, &catalog), Ok(FormattedSelector::Clause(_))));
  }

  #[test]
  fn clauses_are_grouped_one_by_one() {
    let catalog = catalog();
    let FormattedSelector::Clause(f) = format("{email} = ? OR {name} = ? AND {age} > ?", 3, &catalog).unwrap() else {
      panic!("expected a clause");
    };
    assert_eq!(f.text, "({email} = $1) OR ({name} = $2) AND ({age} > $3)");
    assert!(f.has_non_system_columns());

    let FormattedSelector::Clause(f) = format("({id} = ? OR {id} = ?) and {created} > ?", 3, &catalog).unwrap() else {
      panic!("expected a clause");
    };
    assert_eq!(f.text, "(({id} = $1) OR ({id} = $2)) AND ({created} > $3)");
    assert!(!f.has_non_system_columns());
  }

  #[test]
  fn subfields_get_typed_casts() {
    let catalog = catalog();
    let FormattedSelector::Clause(f) = format("{home}->>'street_number' = ?", 1, &catalog).unwrap() else {
      panic!("expected a clause");
    };
    assert_eq!(f.text, "({home}->>'street_number')::INTEGER = $1");
    assert!(matches!(
      format("{home}->>'nope' = ?", 1, &catalog),
      Err(Error::UnsupportedSubfield { .. })
    ));
    assert!(matches!(format("{Email} = ?", 1, &catalog), Err(Error::UnknownColumn(_))));
  }

  #[test]
  fn special_forms() {
    let catalog = catalog();
    assert!(matches!(format("", 0, &catalog), Err(Error::InvalidSelector(_))));
    assert!(matches!(format("   ", 0, &catalog), Err(Error::InvalidSelector(_))));
    assert!(matches!(format("ALL", 0, &catalog), Ok(FormattedSelector::All)));
    assert!(matches!(format("all", 0, &catalog), Err(Error::InvalidSelector(_))));
  }

  #[test]
  fn system_and_scalar_comparisons() {
    for clause in [
      "{id} = ?",
      "{created} = ?",
      "{organization_id} = ?",
      "{updated} = ?",
      "{version} = ?",
      "{active} > ?",
      "{active} IS NULL",
      "{phones} is not null",
      "{home} = ?",
      "{home} >= ?",
      "{home} IS NOT NULL",
      "{home}->>'string' = 'main'",
      "{home}->>'street_number' = -52",
      "{home}->>'verified' = true",
    ] {
      valid(clause);
    }
    for clause in [
      "{home}->>'string' = 52",
      "{home}->>'street_number' = 'string'",
      "{home}->>'verified' = 'string'",
      "{home} = 'x'",
    ] {
      invalid(clause);
    }
  }

  #[test]
  fn boolean_literals() {
    for lit in ["'on'", "'ON'", "'t'", "true", "'TRUE'", "'y'", "'yes'", "'of'", "'OFF'", "'n'", "FALSE"] {
      valid(&format!("{{active}} = {lit}"));
      valid(&format!("{{active}} = {lit}::BOOL"));
    }
    valid("{active} = 1::BOOL");
    valid("{active} = '0'::BOOLEAN");
    invalid("{active} = foo");
    invalid("{active} = 'foo'");
    invalid("{active} = 42");
    invalid("{active} = 'N'::VARCHAR");
  }

  #[test]
  fn integers_and_integer_functions() {
    for clause in [
      "{age} = 2",
      "{age} = +2::INT",
      "{age} = -2::INTEGER",
      "{age} = '+2'",
      "{age} = '-2'::INT",
      "abs({age}) = ?",
      "ABS({age}) = 4",
      "mod({age},2) = ?",
      "MOD({age},?) = ?",
      "div({age},-3) = ?",
      "DIV({age},2::INTEGER) = 1::INTEGER",
      "abs(div(mod({age}, 2), 2)) = ?",
    ] {
      valid(clause);
    }
    invalid("{age} = 'foo'");
    invalid("{age} = '10'::VARCHAR");
    invalid("abs(div(mod({email}, 2), 2)) = ?");
  }

  #[test]
  fn strings_and_string_functions() {
    for clause in [
      "{email} = 'fo''o'",
      "{handle} = 'foo'::VARCHAR",
      "{email} like ?",
      "{handle} ILIKE 'foo'",
      "{phones} NOT LIKE ?",
      "char_length({email}) = ?",
      "CHARACTER_LENGTH({email}) = 4",
      "lower(upper({handle})) = ?",
      "char_length(upper({phones})) = 4",
    ] {
      valid(clause);
    }
    for clause in [
      "{email} = 4",
      "{email} = false",
      "char_length({email}) = 'foo'",
      "lower({email}) = 4",
      "{age} like ?",
      "{home} ilike ?",
    ] {
      invalid(clause);
    }
  }

  #[test]
  fn timestamps_and_date_functions() {
    for clause in [
      "{birthday} = '2024-01-01 00:00:00'",
      "{birthday} = '2024-01-01 00:00:00'::TIMESTAMP",
      "DATE_PART(?,{birthday}) = 10",
      "date_part('dow',{birthday}) = ?",
      "date_part('Epoch',{birthday}) = ?",
      "DATE_TRUNC(?,{birthday}) = '2024-01-01 00:00:00'",
      "date_trunc('week',{birthday}) = ?",
      "date_part('year', DATE_TRUNC('hour',{birthday})) = 2024::INTEGER",
    ] {
      valid(clause);
    }
    for clause in [
      "{birthday} = 'foo'",
      "{birthday} = 42",
      "date_part('foo',{birthday}) = ?",
      "date_trunc('dow',{birthday}) = ?",
      "date_part('year', date_part('hour',{birthday})) = ?",
      "date_part('day',{age}) = ?",
    ] {
      invalid(clause);
    }
  }

  #[test]
  fn uuids() {
    valid("{friend} = '00000000-0000-0000-0000-000000000000'");
    valid("{friend} = '00000000-0000-0000-0000-000000000000'::UUID");
    invalid("{friend} = '00000000-0000-0000-0000-00000000'");
    invalid("{friend} = 42");
  }

  #[test]
  fn any_sets() {
    for clause in [
      "{age} = ANY (?)",
      "{age} = any ((?))",
      "{age} = ANY (ARRAY[1])",
      "{age} = any (array[1,2::INT,4::INTEGER,'5','6'::INT,?,'7'::INTEGER,?])",
      "{age} = ANY (ARRAY [ 1, 2, 4, 5 ])",
      "{active} = ANY (ARRAY[true,false,?,'T'::BOOL,'FALSE'::BOOLEAN])",
      "{email} = ANY (( ARRAY['10',?,'bar'::VARCHAR, 'string''with''quotes'::VARCHAR] ) )",
    ] {
      valid(clause);
    }
    for clause in [
      "{age} = ARRAY[1]",
      "{age} = ANY ARRAY['foo']",
      "{email} = ANY (ARRAY[1])",
      "{home} = ANY (?)",
    ] {
      invalid(clause);
    }
  }

  #[test]
  fn malformed_selectors() {
    for clause in [
      "{id} = (?)",
      "({id}=?)",
      "({id}=(?))",
      "{id}<?",
      "{id}!=?",
      "{id} = ? or {id} = ?",
      "( {id} = ? OR {id} = ?) AND {id} = ?",
      "{id} = ? OR ({id} = ? AND {id} = ? )",
    ] {
      valid(clause);
    }
    for clause in [
      "({id}) = ?",
      "{id} = = ?",
      "{id} = ? = ?",
      "? = {id}",
      "? = ?",
      "(?) = ANY (?)",
      "{id} = ? ?",
      "{id} LIKE LIKE",
      "{id} >= <=",
      "{id} ANY (?)",
      "{id} = ? OR ",
      "{id}LIKE ?",
      "{id}",
      "columnX = (?)",
      "{email} IS NOT NOT NULL",
      "{email} = NULL",
      "{age} = 1.5",
    ] {
      invalid(clause);
    }
  }

  #[test]
  fn incompatible_functions() {
    for func in ["abs", "char_length", "lower", "upper"] {
      for col in ["home", "active", "friend"] {
        invalid(&format!("{func}({{{col}}}) = ?"));
      }
    }
    for func in ["mod", "div"] {
      for col in ["home", "email", "birthday"] {
        invalid(&format!("{func}({{{col}}}, 1) = ?"));
      }
    }
  }

  #[test]
  fn params_are_coerced_to_inferred_types() {
    let catalog = catalog();
    let selector = Selector::new(
      "{age} > ? AND {active} = ? AND {friend} = ANY (?) AND date_trunc(?, {birthday}) = ?",
      vec![
        json!("41"),
        json!("yes"),
        json!(["00000000-0000-0000-0000-0000000000AB"]),
        json!("DAY"),
        json!("2024-01-01"),
      ],
    );
    let validated = check(&selector, &catalog).unwrap();
    assert_eq!(validated.params(), &[
      SqlValue::Integer(41),
      SqlValue::Integer(1),
      SqlValue::text("[\"00000000-0000-0000-0000-0000000000ab\"]"),
      SqlValue::text("day"),
      SqlValue::text("2024-01-01T00:00:00.000000Z"),
    ]);

    let bad = Selector::new("{age} = ?", vec![json!("forty")]);
    assert!(matches!(check(&bad, &catalog), Err(Error::InvalidSelector(_))));
    let null = Selector::new("{email} = ?", params_for("{email} = ?"));
    assert!(matches!(check(&null, &catalog), Err(Error::InvalidSelector(_))));
  }

  #[test]
  fn renders_physical_references() {
    let catalog = catalog();
    let selector = Selector::new(
      "{email} = ? OR {id} = ? AND {home}->>'verified' = true AND lower({handle}) LIKE ?",
      vec![json!("a@example.com"), json!(Uuid::nil()), json!("%x%")],
    );
    let validated = check(&selector, &catalog).unwrap();

    let live = validated.render(&catalog, LifecycleState::Live, 2).unwrap().unwrap();
    assert_eq!(
      live,
      "(column_0.varchar_value = $3) OR (u.id = $4) AND \
       (CAST(column_1.jsonb_value ->> '$.verified' AS INTEGER) = 1) AND \
       (lower(column_2.varchar_unique_value) LIKE $5 ESCAPE '\\')"
    );

    let deleted = validated.render(&catalog, LifecycleState::SoftDeleted, 0).unwrap().unwrap();
    assert!(deleted.contains("lower(column_2.varchar_value)"), "{deleted}");
  }

  #[test]
  fn renders_any_and_date_functions() {
    let catalog = catalog();
    let selector = Selector::new(
      "{age} = ANY (?) AND {age} > ANY (ARRAY[1, 2]) AND date_part('year', {birthday}) = 2024",
      vec![json!([1, 2])],
    );
    let sql = check(&selector, &catalog)
      .unwrap()
      .render(&catalog, LifecycleState::Live, 0)
      .unwrap()
      .unwrap();
    assert_eq!(
      sql,
      "(column_0.int_value IN (SELECT value FROM json_each($1))) AND \
       ((column_0.int_value > 1 OR column_0.int_value > 2)) AND \
       (CAST(strftime('%Y', column_1.timestamp_value) AS INTEGER) = 2024)"
    );
  }

  #[test]
  fn sub_second_parts_read_the_stored_digits() {
    let catalog = catalog();
    let selector = Selector::new("date_part('microseconds', {birthday}) = 5123456", vec![]);
    let sql = check(&selector, &catalog)
      .unwrap()
      .render(&catalog, LifecycleState::Live, 0)
      .unwrap()
      .unwrap();
    assert_eq!(
      sql,
      "((CAST(substr(column_0.timestamp_value, 18, 2) AS INTEGER) * 1000000 + \
       CAST(substr(column_0.timestamp_value, 21, 6) AS INTEGER)) = 5123456)"
    );
  }

  struct RecordingPreparer {
    fail: bool,
    seen: std::sync::Mutex<Vec<String>>,
  }

  impl StatementPreparer for RecordingPreparer {
    fn prepare(&self, sql: String) -> impl Future<Output = std::result::Result<(), String>> + Send + '_ {
      async move {
        self.seen.lock().unwrap().push(sql);
        if self.fail { Err("no such column".into()) } else { Ok(()) }
      }
    }
  }

  #[tokio::test]
  async fn validate_dry_runs_the_join() {
    let catalog = catalog();
    let preparer = RecordingPreparer { fail: false, seen: Default::default() };
    let selector = Selector::new("{email} = ?", vec![json!("a@example.com")]);
    validate(&selector, &catalog, LifecycleState::SoftDeleted, &preparer).await.unwrap();

    let seen = preparer.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("SELECT u.id FROM users u LEFT JOIN user_column_post_delete_values column_0"));
    assert!(seen[0].ends_with("WHERE (column_0.varchar_value = $1)"));

    validate(&Selector::all(), &catalog, LifecycleState::Live, &preparer).await.unwrap();
    assert_eq!(preparer.seen.lock().unwrap().len(), 1);

    let failing = RecordingPreparer { fail: true, seen: Default::default() };
    assert!(matches!(
      validate(&selector, &catalog, LifecycleState::Live, &failing).await,
      Err(Error::InvalidSelector(_))
    ));
  }
}
