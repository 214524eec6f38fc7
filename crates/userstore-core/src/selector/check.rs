//! Type checking for parsed selectors.
//!
//! Placeholders and quoted literals take their type from context: the other
//! side of a comparison, a function's parameter, or an explicit cast. Quoted
//! literals are rewritten in place to their typed form so rendering can
//! normalise them. Every placeholder must end up with a type; that type
//! drives coercion of the caller's JSON parameters.

use uuid::Uuid;

use super::ast::{AnySet, CastType, Clause, Expr, Function, Literal, Operand, Predicate, Test};
use crate::{
  Error, Result,
  catalog::{Catalog, DataTypeKind, ScalarType},
  sql::{SqlValue, parse_bool, parse_timestamp},
  value::Value,
};

pub const DATE_PART_UNITS: &[&str] = &[
  "day", "dow", "epoch", "hour", "microseconds", "milliseconds", "minute", "month",
  "second", "timezone", "week", "year",
];

pub const DATE_TRUNC_UNITS: &[&str] = &[
  "day", "hour", "microseconds", "milliseconds", "minute", "month", "second", "week", "year",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUnit {
  Part,
  Trunc,
}

impl DateUnit {
  fn allowed(self) -> &'static [&'static str] {
    match self {
      DateUnit::Part => DATE_PART_UNITS,
      DateUnit::Trunc => DATE_TRUNC_UNITS,
    }
  }
}

/// The SQL type a placeholder was inferred to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
  Scalar(ScalarType),
  /// `ANY(?)`: a JSON array of scalars.
  Array(ScalarType),
  Unit(DateUnit),
  /// A whole composite value of the given data type.
  Composite(Uuid),
}

enum Inferred {
  Known(ScalarType),
  /// Carries the composite's data type id.
  Composite(Uuid),
  Untyped,
}

fn invalid(msg: impl Into<String>) -> Error { Error::InvalidSelector(msg.into()) }

pub struct Checker<'a> {
  catalog: &'a Catalog,
  params:  Vec<Option<ParamKind>>,
}

impl<'a> Checker<'a> {
  pub fn new(catalog: &'a Catalog, param_count: usize) -> Self {
    Self { catalog, params: vec![None; param_count] }
  }

  /// Check `clause`, returning the inferred kind of every placeholder.
  pub fn check(mut self, clause: &mut Clause) -> Result<Vec<ParamKind>> {
    self.clause(clause)?;
    self
      .params
      .into_iter()
      .enumerate()
      .map(|(i, kind)| kind.ok_or_else(|| invalid(format!("cannot infer a type for ${}", i + 1))))
      .collect()
  }

  fn clause(&mut self, clause: &mut Clause) -> Result<()> {
    for expr in clause.exprs_mut() {
      match expr {
        Expr::Predicate(p) => self.predicate(p)?,
        Expr::Group(inner) => self.clause(inner)?,
      }
    }
    Ok(())
  }

  fn predicate(&mut self, p: &mut Predicate) -> Result<()> {
    match &mut p.test {
      Test::IsNull { .. } => {
        self.infer(&mut p.left)?;
        Ok(())
      }
      Test::Like { pattern, .. } => {
        self.expect(&mut p.left, ScalarType::String).map_err(|_| {
          invalid(format!("LIKE/ILIKE requires a string operand, got {}", p.left))
        })?;
        self.expect(pattern, ScalarType::String)
      }
      Test::Compare { right, .. } => match self.infer(&mut p.left)? {
        Inferred::Known(ty) => self.expect(right, ty),
        Inferred::Composite(data_type) => match right {
          Operand::Param(i) => self.assign(*i, ParamKind::Composite(data_type)),
          other => Err(invalid(format!(
            "{} is a composite column; compare it with ? or address a field with ->>, got {other}",
            p.left
          ))),
        },
        Inferred::Untyped => Err(invalid(format!("cannot infer the type of {}", p.left))),
      },
      Test::CompareAny { set, .. } => {
        let ty = self.comparable(&mut p.left)?;
        match set {
          AnySet::Param(i) => self.assign(*i, ParamKind::Array(ty)),
          AnySet::Array(items) => {
            for item in items {
              self.expect(item, ty)?;
            }
            Ok(())
          }
        }
      }
    }
  }

  /// The scalar type of an `ANY` comparison's left side.
  fn comparable(&mut self, left: &mut Operand) -> Result<ScalarType> {
    match self.infer(left)? {
      Inferred::Known(ty) => Ok(ty),
      Inferred::Composite(_) => Err(invalid(format!(
        "{left} is a composite column; ANY needs a field addressed with ->>'field'"
      ))),
      Inferred::Untyped => Err(invalid(format!("cannot infer the type of {left}"))),
    }
  }

  fn infer(&mut self, op: &mut Operand) -> Result<Inferred> {
    match op {
      Operand::Column(col) => {
        if let Some((_, scalar)) = col.field {
          return Ok(Inferred::Known(scalar));
        }
        let desc = self
          .catalog
          .column_by_id(col.column_id)
          .ok_or(Error::UnknownColumnId(col.column_id))?;
        Ok(match desc.kind().scalar() {
          Some(scalar) => Inferred::Known(scalar),
          None => Inferred::Composite(desc.data_type.id),
        })
      }
      Operand::Param(_) | Operand::Literal(Literal::Str(_)) => Ok(Inferred::Untyped),
      Operand::Literal(Literal::Int(_)) => Ok(Inferred::Known(ScalarType::Integer)),
      Operand::Literal(Literal::Bool(_)) => Ok(Inferred::Known(ScalarType::Boolean)),
      Operand::Literal(Literal::Timestamp(_)) => Ok(Inferred::Known(ScalarType::Timestamp)),
      Operand::Literal(Literal::Uuid(_)) => Ok(Inferred::Known(ScalarType::Uuid)),
      Operand::Cast(inner, ty) => {
        self.cast(inner, *ty)?;
        Ok(Inferred::Known(ty.scalar()))
      }
      Operand::Call(func, args) => self.call(*func, args).map(Inferred::Known),
    }
  }

  /// Require `op` to have type `ty`, typing placeholders and quoted
  /// literals along the way.
  fn expect(&mut self, op: &mut Operand, ty: ScalarType) -> Result<()> {
    match op {
      Operand::Param(i) => self.assign(*i, ParamKind::Scalar(ty)),
      Operand::Literal(Literal::Str(s)) => {
        *op = Operand::Literal(coerce_literal(s, ty)?);
        Ok(())
      }
      _ => match self.infer(op)? {
        Inferred::Known(actual) if actual == ty => Ok(()),
        Inferred::Known(actual) => Err(invalid(format!("{op} is {actual}, expected {ty}"))),
        Inferred::Composite(_) => Err(invalid(format!("{op} is a composite column, expected {ty}"))),
        Inferred::Untyped => Err(invalid(format!("cannot infer the type of {op}"))),
      },
    }
  }

  fn cast(&mut self, inner: &mut Operand, to: CastType) -> Result<()> {
    match inner {
      Operand::Param(i) => self.assign(*i, ParamKind::Scalar(to.scalar())),
      Operand::Literal(Literal::Str(s)) => {
        *inner = Operand::Literal(coerce_literal(s, to.scalar())?);
        Ok(())
      }
      _ => match self.infer(inner)? {
        Inferred::Known(from) if castable(from, to) => Ok(()),
        Inferred::Known(from) => Err(invalid(format!("cannot cast {from} to {}", to.name()))),
        Inferred::Composite(_) if to == CastType::Varchar => Ok(()),
        Inferred::Composite(_) => Err(invalid(format!("cannot cast a composite to {}", to.name()))),
        Inferred::Untyped => Err(invalid(format!("cannot infer the type of {inner}"))),
      },
    }
  }

  fn call(&mut self, func: Function, args: &mut [Operand]) -> Result<ScalarType> {
    match (func, args) {
      (Function::Abs, [x]) => {
        self.expect(x, ScalarType::Integer)?;
        Ok(ScalarType::Integer)
      }
      (Function::Mod | Function::Div, [a, b]) => {
        self.expect(a, ScalarType::Integer)?;
        self.expect(b, ScalarType::Integer)?;
        Ok(ScalarType::Integer)
      }
      (Function::CharLength, [s]) => {
        self.expect(s, ScalarType::String)?;
        Ok(ScalarType::Integer)
      }
      (Function::Lower | Function::Upper, [s]) => {
        self.expect(s, ScalarType::String)?;
        Ok(ScalarType::String)
      }
      (Function::DatePart, [unit, ts]) => {
        self.unit(unit, DateUnit::Part)?;
        self.expect(ts, ScalarType::Timestamp)?;
        Ok(ScalarType::Integer)
      }
      (Function::DateTrunc, [unit, ts]) => {
        self.unit(unit, DateUnit::Trunc)?;
        self.expect(ts, ScalarType::Timestamp)?;
        Ok(ScalarType::Timestamp)
      }
      (func, args) => Err(invalid(format!("{func} does not take {} argument(s)", args.len()))),
    }
  }

  fn unit(&mut self, op: &mut Operand, kind: DateUnit) -> Result<()> {
    match op {
      Operand::Param(i) => self.assign(*i, ParamKind::Unit(kind)),
      Operand::Literal(Literal::Str(s)) => {
        let lower = s.to_ascii_lowercase();
        if !kind.allowed().contains(&lower.as_str()) {
          return Err(invalid(format!("unsupported date unit '{s}'")));
        }
        *s = lower;
        Ok(())
      }
      other => Err(invalid(format!("date unit must be a quoted literal or ?, got {other}"))),
    }
  }

  fn assign(&mut self, index: usize, kind: ParamKind) -> Result<()> {
    let slot = self
      .params
      .get_mut(index - 1)
      .ok_or_else(|| invalid(format!("parameter ${index} out of range")))?;
    match slot {
      Some(existing) if *existing != kind => {
        Err(invalid(format!("parameter ${index} is used with conflicting types")))
      }
      _ => {
        *slot = Some(kind);
        Ok(())
      }
    }
  }
}

fn castable(from: ScalarType, to: CastType) -> bool {
  let to = to.scalar();
  from == to
    || to == ScalarType::String
    || from == ScalarType::String
    || matches!(
      (from, to),
      (ScalarType::Integer, ScalarType::Boolean) | (ScalarType::Boolean, ScalarType::Integer)
    )
}

/// Give a quoted literal the type `ty`, or fail if it does not parse as one.
fn coerce_literal(s: &str, ty: ScalarType) -> Result<Literal> {
  let bad = || invalid(format!("'{s}' is not a valid {ty}"));
  match ty {
    ScalarType::String => Ok(Literal::Str(s.to_owned())),
    ScalarType::Boolean => parse_bool(s).map(Literal::Bool).ok_or_else(bad),
    ScalarType::Integer => s.trim().parse().map(Literal::Int).map_err(|_| bad()),
    ScalarType::Timestamp => parse_timestamp(s).map(Literal::Timestamp).ok_or_else(bad),
    ScalarType::Uuid => Uuid::parse_str(s.trim()).map(Literal::Uuid).map_err(|_| bad()),
  }
}

// ─── Parameter coercion ──────────────────────────────────────────────────────

/// Convert caller-supplied JSON parameters to bindable values.
pub fn coerce_params(
  kinds: &[ParamKind],
  params: &[serde_json::Value],
  catalog: &Catalog,
) -> Result<Vec<SqlValue>> {
  kinds
    .iter()
    .zip(params)
    .enumerate()
    .map(|(i, (kind, json))| coerce_param(i + 1, *kind, json, catalog))
    .collect()
}

fn coerce_param(
  index: usize,
  kind: ParamKind,
  json: &serde_json::Value,
  catalog: &Catalog,
) -> Result<SqlValue> {
  if json.is_null() {
    return Err(invalid(format!("parameter ${index} is null; use IS [NOT] NULL instead")));
  }
  let scalar = |ty: ScalarType, v: &serde_json::Value| {
    Value::from_json(&DataTypeKind::from_scalar(ty), v)
      .map(|v| v.to_sql())
      .map_err(|e| invalid(format!("parameter ${index}: {e}")))
  };
  match kind {
    ParamKind::Scalar(ty) => scalar(ty, json),
    ParamKind::Array(ty) => {
      let serde_json::Value::Array(items) = json else {
        return Err(invalid(format!("parameter ${index} must be an array")));
      };
      let values = items.iter().map(|v| scalar(ty, v)).collect::<Result<Vec<_>>>()?;
      Ok(SqlValue::Text(serde_json::to_string(&values)?))
    }
    ParamKind::Unit(unit) => {
      let Some(s) = json.as_str() else {
        return Err(invalid(format!("parameter ${index} must be a date unit string")));
      };
      let lower = s.to_ascii_lowercase();
      if !unit.allowed().contains(&lower.as_str()) {
        return Err(invalid(format!("parameter ${index}: unsupported date unit {s:?}")));
      }
      Ok(SqlValue::Text(lower))
    }
    ParamKind::Composite(data_type) => {
      let dt = catalog
        .data_type_by_id(data_type)
        .ok_or_else(|| invalid(format!("parameter ${index}: unknown data type {data_type}")))?;
      Value::from_json(&dt.kind, json)
        .map(|v| v.to_sql())
        .map_err(|e| invalid(format!("parameter ${index}: {e}")))
    }
  }
}
