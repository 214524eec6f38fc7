//! Parsed selector tree.
//!
//! `Display` renders the canonical formatted form: `$N` placeholders, one
//! pair of parentheses around every clause, and typed casts for composite
//! sub-field accessors.

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::lexer::CompareOp;
use crate::{
  catalog::ScalarType,
  sql::{encode_timestamp, quote_literal},
};

// ─── Clauses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conjunction {
  And,
  Or,
}

/// A flat chain of expressions joined by `AND`/`OR`. Standard SQL precedence
/// applies when evaluated; the formatted text parenthesizes each link.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
  pub first: Expr,
  pub rest:  Vec<(Conjunction, Expr)>,
}

impl Clause {
  pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
    std::iter::once(&self.first).chain(self.rest.iter().map(|(_, e)| e))
  }

  pub fn exprs_mut(&mut self) -> impl Iterator<Item = &mut Expr> {
    std::iter::once(&mut self.first).chain(self.rest.iter_mut().map(|(_, e)| e))
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Predicate(Predicate),
  Group(Box<Clause>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
  pub left: Operand,
  pub test: Test,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Test {
  Compare { op: CompareOp, right: Operand },
  CompareAny { op: CompareOp, set: AnySet },
  Like { negated: bool, case_insensitive: bool, pattern: Operand },
  IsNull { negated: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnySet {
  /// `ANY(?)`: one parameter holding an array.
  Param(usize),
  /// `ANY(ARRAY[...])`.
  Array(Vec<Operand>),
}

// ─── Operands ────────────────────────────────────────────────────────────────

/// A resolved `{column}` reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
  pub column_id: Uuid,
  pub name:      String,
  /// Composite sub-field key and its declared type.
  pub field:     Option<(String, ScalarType)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
  Column(ColumnRef),
  /// 1-based positional parameter.
  Param(usize),
  Literal(Literal),
  Cast(Box<Operand>, CastType),
  Call(Function, Vec<Operand>),
}

impl Operand {
  pub fn references_column(&self) -> bool {
    match self {
      Operand::Column(_) => true,
      Operand::Cast(inner, _) => inner.references_column(),
      Operand::Call(_, args) => args.iter().any(Operand::references_column),
      Operand::Param(_) | Operand::Literal(_) => false,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
  /// A quoted literal whose type is decided by context.
  Str(String),
  Int(i64),
  Bool(bool),
  Timestamp(DateTime<Utc>),
  Uuid(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastType {
  Varchar,
  Boolean,
  Integer,
  Timestamp,
  Uuid,
}

impl CastType {
  pub fn parse(word: &str) -> Option<Self> {
    match word.to_ascii_uppercase().as_str() {
      "VARCHAR" | "TEXT" => Some(CastType::Varchar),
      "BOOL" | "BOOLEAN" => Some(CastType::Boolean),
      "INT" | "INTEGER" | "INT4" | "INT8" | "BIGINT" => Some(CastType::Integer),
      "TIMESTAMP" | "TIMESTAMPTZ" => Some(CastType::Timestamp),
      "UUID" => Some(CastType::Uuid),
      _ => None,
    }
  }

  pub fn scalar(self) -> ScalarType {
    match self {
      CastType::Varchar => ScalarType::String,
      CastType::Boolean => ScalarType::Boolean,
      CastType::Integer => ScalarType::Integer,
      CastType::Timestamp => ScalarType::Timestamp,
      CastType::Uuid => ScalarType::Uuid,
    }
  }

  pub fn for_scalar(scalar: ScalarType) -> Self {
    match scalar {
      ScalarType::String => CastType::Varchar,
      ScalarType::Boolean => CastType::Boolean,
      ScalarType::Integer => CastType::Integer,
      ScalarType::Timestamp => CastType::Timestamp,
      ScalarType::Uuid => CastType::Uuid,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      CastType::Varchar => "VARCHAR",
      CastType::Boolean => "BOOLEAN",
      CastType::Integer => "INTEGER",
      CastType::Timestamp => "TIMESTAMP",
      CastType::Uuid => "UUID",
    }
  }
}

/// Whitelisted scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Function {
  Abs,
  Mod,
  Div,
  #[strum(to_string = "char_length", serialize = "character_length")]
  CharLength,
  Lower,
  Upper,
  DatePart,
  DateTrunc,
}

impl Function {
  pub fn arity(self) -> usize {
    match self {
      Function::Abs | Function::CharLength | Function::Lower | Function::Upper => 1,
      Function::Mod | Function::Div | Function::DatePart | Function::DateTrunc => 2,
    }
  }
}

// ─── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for Clause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({})", self.first)?;
    for (conj, expr) in &self.rest {
      let word = match conj {
        Conjunction::And => "AND",
        Conjunction::Or => "OR",
      };
      write!(f, " {word} ({expr})")?;
    }
    Ok(())
  }
}

impl fmt::Display for Expr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Expr::Predicate(p) => write!(f, "{p}"),
      Expr::Group(c) => write!(f, "{c}"),
    }
  }
}

impl fmt::Display for Predicate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ", self.left)?;
    match &self.test {
      Test::Compare { op, right } => write!(f, "{} {right}", display_op(*op)),
      Test::CompareAny { op, set: AnySet::Param(i) } => {
        write!(f, "{} ANY (${i})", display_op(*op))
      }
      Test::CompareAny { op, set: AnySet::Array(items) } => {
        write!(f, "{} ANY (ARRAY[{}])", display_op(*op), join(items))
      }
      Test::Like { negated, case_insensitive, pattern } => {
        let not = if *negated { "NOT " } else { "" };
        let like = if *case_insensitive { "ILIKE" } else { "LIKE" };
        write!(f, "{not}{like} {pattern}")
      }
      Test::IsNull { negated: false } => write!(f, "IS NULL"),
      Test::IsNull { negated: true } => write!(f, "IS NOT NULL"),
    }
  }
}

impl fmt::Display for Operand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Operand::Column(ColumnRef { name, field: None, .. }) => write!(f, "{{{name}}}"),
      Operand::Column(ColumnRef { name, field: Some((key, scalar)), .. }) => {
        write!(f, "({{{name}}}->>{})::{}", quote_literal(key), CastType::for_scalar(*scalar).name())
      }
      Operand::Param(i) => write!(f, "${i}"),
      Operand::Literal(lit) => write!(f, "{lit}"),
      Operand::Cast(inner, ty) => write!(f, "{inner}::{}", ty.name()),
      Operand::Call(func, args) => write!(f, "{func}({})", join(args)),
    }
  }
}

impl fmt::Display for Literal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Literal::Str(s) => f.write_str(&quote_literal(s)),
      Literal::Int(i) => write!(f, "{i}"),
      Literal::Bool(true) => f.write_str("TRUE"),
      Literal::Bool(false) => f.write_str("FALSE"),
      Literal::Timestamp(t) => f.write_str(&quote_literal(&encode_timestamp(*t))),
      Literal::Uuid(u) => write!(f, "'{u}'"),
    }
  }
}

fn display_op(op: CompareOp) -> &'static str {
  match op {
    CompareOp::Ne => "!=",
    other => other.as_sql(),
  }
}

fn join(items: &[Operand]) -> String {
  items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
