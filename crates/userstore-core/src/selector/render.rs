//! Rendering a checked selector tree as a SQLite `WHERE` fragment.
//!
//! Column references are resolved through a map from column id to the
//! physical expression (`u.created`, `column_0.varchar_value`, ...).
//! Placeholders are renumbered by `offset` so the selector's parameters can
//! sit anywhere in the final statement's parameter list.

use std::collections::HashMap;

use uuid::Uuid;

use super::{
  SelectorColumn,
  ast::{AnySet, CastType, Clause, Conjunction, Expr, Function, Literal, Operand, Predicate, Test},
  check::{DATE_PART_UNITS, DATE_TRUNC_UNITS},
  lexer::CompareOp,
};
use crate::{
  Error, Result,
  catalog::{Catalog, ScalarType},
  sql::{encode_timestamp, encode_uuid, quote_literal},
  value::LifecycleState,
};

/// Join alias of the `index`th non-system column a selector references.
pub fn join_alias(index: usize) -> String { format!("column_{index}") }

/// Physical expressions for every column in `columns`. System columns read
/// from `u`; value columns read from their join alias in the order they
/// appear.
pub fn physical_columns(
  columns: &[SelectorColumn],
  catalog: &Catalog,
  state: LifecycleState,
) -> Result<HashMap<Uuid, String>> {
  let mut out = HashMap::new();
  let mut joined = 0;
  for col in columns {
    let desc = catalog
      .column_by_id(col.column_id)
      .ok_or(Error::UnknownColumnId(col.column_id))?;
    let expr = match (desc.system(), desc.slot(state)) {
      (Some(system), _) => format!("u.{}", system.field()),
      (None, Some(slot)) => {
        let alias = join_alias(joined);
        joined += 1;
        format!("{alias}.{}", slot.column())
      }
      (None, None) => return Err(Error::UnknownColumnId(col.column_id)),
    };
    out.insert(col.column_id, expr);
  }
  Ok(out)
}

pub struct Renderer<'a> {
  columns: &'a HashMap<Uuid, String>,
  offset:  usize,
}

impl<'a> Renderer<'a> {
  pub fn new(columns: &'a HashMap<Uuid, String>, offset: usize) -> Self {
    Self { columns, offset }
  }

  pub fn clause(&self, clause: &Clause) -> Result<String> {
    let mut out = format!("({})", self.expr(&clause.first)?);
    for (conj, expr) in &clause.rest {
      let word = match conj {
        Conjunction::And => "AND",
        Conjunction::Or => "OR",
      };
      out.push_str(&format!(" {word} ({})", self.expr(expr)?));
    }
    Ok(out)
  }

  fn expr(&self, expr: &Expr) -> Result<String> {
    match expr {
      Expr::Predicate(p) => self.predicate(p),
      Expr::Group(c) => self.clause(c),
    }
  }

  fn predicate(&self, p: &Predicate) -> Result<String> {
    let left = self.operand(&p.left)?;
    Ok(match &p.test {
      Test::Compare { op, right } => format!("{left} {} {}", op.as_sql(), self.operand(right)?),
      Test::CompareAny { op: CompareOp::Eq, set: AnySet::Param(i) } => {
        format!("{left} IN (SELECT value FROM json_each({}))", self.param(*i))
      }
      Test::CompareAny { op, set: AnySet::Param(i) } => format!(
        "EXISTS (SELECT 1 FROM json_each({}) any_set WHERE {left} {} any_set.value)",
        self.param(*i),
        op.as_sql()
      ),
      Test::CompareAny { op, set: AnySet::Array(items) } => {
        let items = items.iter().map(|i| self.operand(i)).collect::<Result<Vec<_>>>()?;
        if *op == CompareOp::Eq {
          format!("{left} IN ({})", items.join(", "))
        } else {
          let alternatives: Vec<String> =
            items.iter().map(|i| format!("{left} {} {i}", op.as_sql())).collect();
          format!("({})", alternatives.join(" OR "))
        }
      }
      Test::Like { negated, case_insensitive, pattern } => {
        let not = if *negated { "NOT " } else { "" };
        let pattern = self.operand(pattern)?;
        if *case_insensitive {
          format!("lower({left}) {not}LIKE lower({pattern}) ESCAPE '\\'")
        } else {
          format!("{left} {not}LIKE {pattern} ESCAPE '\\'")
        }
      }
      Test::IsNull { negated: false } => format!("{left} IS NULL"),
      Test::IsNull { negated: true } => format!("{left} IS NOT NULL"),
    })
  }

  fn param(&self, index: usize) -> String { format!("${}", index + self.offset) }

  fn operand(&self, op: &Operand) -> Result<String> {
    match op {
      Operand::Column(col) => {
        let base = self
          .columns
          .get(&col.column_id)
          .ok_or(Error::UnknownColumnId(col.column_id))?;
        Ok(match &col.field {
          None => base.clone(),
          Some((key, scalar)) => format!(
            "CAST({base} ->> {} AS {})",
            quote_literal(&format!("$.{key}")),
            storage_type(*scalar)
          ),
        })
      }
      Operand::Param(i) => Ok(self.param(*i)),
      Operand::Literal(lit) => Ok(literal(lit)),
      Operand::Cast(inner, ty) => {
        let x = self.operand(inner)?;
        Ok(match ty {
          CastType::Varchar => format!("CAST({x} AS TEXT)"),
          CastType::Integer => format!("CAST({x} AS INTEGER)"),
          CastType::Boolean => format!("(CAST({x} AS INTEGER) <> 0)"),
          // Literals and bound parameters are already canonical.
          CastType::Timestamp if matches!(**inner, Operand::Literal(_) | Operand::Param(_)) => x,
          CastType::Timestamp => format!("CAST({x} AS TEXT)"),
          CastType::Uuid => format!("lower(CAST({x} AS TEXT))"),
        })
      }
      Operand::Call(func, args) => self.call(*func, args),
    }
  }

  fn call(&self, func: Function, args: &[Operand]) -> Result<String> {
    let rendered = args.iter().map(|a| self.operand(a)).collect::<Result<Vec<_>>>()?;
    match (func, rendered.as_slice()) {
      (Function::Abs, [x]) => Ok(format!("abs({x})")),
      (Function::Mod, [a, b]) => Ok(format!("({a} % {b})")),
      (Function::Div, [a, b]) => Ok(format!("({a} / {b})")),
      (Function::CharLength, [s]) => Ok(format!("length({s})")),
      (Function::Lower, [s]) => Ok(format!("lower({s})")),
      (Function::Upper, [s]) => Ok(format!("upper({s})")),
      (Function::DatePart | Function::DateTrunc, [unit, ts]) => {
        let (render, units): (fn(&str, &str) -> Option<String>, &[&str]) =
          if func == Function::DatePart {
            (date_part, DATE_PART_UNITS)
          } else {
            (date_trunc, DATE_TRUNC_UNITS)
          };
        match &args[0] {
          Operand::Literal(Literal::Str(u)) => render(u, ts)
            .ok_or_else(|| Error::InvalidSelector(format!("unsupported date unit '{u}'"))),
          _ => {
            let arms: String = units
              .iter()
              .filter_map(|u| render(u, ts).map(|sql| format!(" WHEN '{u}' THEN {sql}")))
              .collect();
            Ok(format!("(CASE lower({unit}){arms} END)"))
          }
        }
      }
      _ => Err(Error::InvalidSelector(format!("{func} called with {} argument(s)", args.len()))),
    }
  }
}

/// Render a typed literal in its stored form.
fn literal(lit: &Literal) -> String {
  match lit {
    Literal::Str(s) => quote_literal(s),
    Literal::Int(i) => i.to_string(),
    Literal::Bool(b) => i64::from(*b).to_string(),
    Literal::Timestamp(t) => quote_literal(&encode_timestamp(*t)),
    Literal::Uuid(u) => quote_literal(&encode_uuid(*u)),
  }
}

/// SQLite storage class a composite sub-field is compared as.
fn storage_type(scalar: ScalarType) -> &'static str {
  match scalar {
    ScalarType::String | ScalarType::Timestamp | ScalarType::Uuid => "TEXT",
    ScalarType::Boolean | ScalarType::Integer => "INTEGER",
  }
}

fn date_part(unit: &str, ts: &str) -> Option<String> {
  let field = |fmt: &str| format!("CAST(strftime('{fmt}', {ts}) AS INTEGER)");
  Some(match unit {
    "year" => field("%Y"),
    "month" => field("%m"),
    "day" => field("%d"),
    "hour" => field("%H"),
    "minute" => field("%M"),
    "second" => field("%S"),
    "dow" => field("%w"),
    "week" => field("%W"),
    "epoch" => field("%s"),
    "milliseconds" => sub_second(ts, 1_000, 3),
    "microseconds" => sub_second(ts, 1_000_000, 6),
    "timezone" => "0".to_owned(),
    _ => return None,
  })
}

/// Seconds plus the leading `digits` fractional digits, in units of
/// `1/scale` s. Read from the fixed-width `YYYY-MM-DDTHH:MM:SS.ffffffZ` text,
/// since `strftime('%f')` stops at milliseconds.
fn sub_second(ts: &str, scale: u32, digits: u8) -> String {
  format!("(CAST(substr({ts}, 18, 2) AS INTEGER) * {scale} + CAST(substr({ts}, 21, {digits}) AS INTEGER))")
}

fn date_trunc(unit: &str, ts: &str) -> Option<String> {
  let pattern = |fmt: &str| format!("strftime('{fmt}', {ts})");
  Some(match unit {
    "year" => pattern("%Y-01-01T00:00:00.000000Z"),
    "month" => pattern("%Y-%m-01T00:00:00.000000Z"),
    "week" => format!("strftime('%Y-%m-%dT00:00:00.000000Z', {ts}, 'weekday 0', '-6 days')"),
    "day" => pattern("%Y-%m-%dT00:00:00.000000Z"),
    "hour" => pattern("%Y-%m-%dT%H:00:00.000000Z"),
    "minute" => pattern("%Y-%m-%dT%H:%M:00.000000Z"),
    "second" => pattern("%Y-%m-%dT%H:%M:%S.000000Z"),
    "milliseconds" => format!("(strftime('%Y-%m-%dT%H:%M:%f', {ts}) || '000Z')"),
    "microseconds" => ts.to_owned(),
    _ => return None,
  })
}
