//! Recursive-descent parser from tokens to a [`Clause`].
//!
//! Column references are resolved against the catalog while parsing, so an
//! unknown `{name}` or sub-field fails here rather than at SQL time.

use super::{
  SelectorColumn,
  ast::{AnySet, CastType, Clause, ColumnRef, Conjunction, Expr, Function, Literal, Operand, Predicate, Test},
  lexer::{Spanned, Token},
};
use crate::{Error, Result, catalog::Catalog};

/// Deepest allowed nesting of groups and function calls.
const MAX_DEPTH: usize = 32;

pub struct Parsed {
  pub clause:      Clause,
  pub columns:     Vec<SelectorColumn>,
  pub param_count: usize,
}

pub fn parse(tokens: Vec<Spanned>, catalog: &Catalog) -> Result<Parsed> {
  let mut parser = Parser { tokens, pos: 0, catalog, params: 0, columns: Vec::new(), depth: 0 };
  let clause = parser.clause()?;
  if let Some(extra) = parser.tokens.get(parser.pos) {
    return Err(invalid(extra.pos, "unexpected trailing input"));
  }
  Ok(Parsed { clause, columns: parser.columns, param_count: parser.params })
}

struct Parser<'a> {
  tokens:  Vec<Spanned>,
  pos:     usize,
  catalog: &'a Catalog,
  params:  usize,
  columns: Vec<SelectorColumn>,
  depth:   usize,
}

fn invalid(pos: usize, msg: &str) -> Error {
  Error::InvalidSelector(format!("{msg} at offset {pos}"))
}

impl Parser<'_> {
  // ── Token helpers ─────────────────────────────────────────────────────

  fn peek(&self) -> Option<&Token> { self.tokens.get(self.pos).map(|s| &s.token) }

  fn offset(&self) -> usize {
    self
      .tokens
      .get(self.pos)
      .or_else(|| self.tokens.last())
      .map_or(0, |s| s.pos)
  }

  fn next(&mut self) -> Option<Token> {
    let token = self.tokens.get(self.pos).map(|s| s.token.clone());
    if token.is_some() {
      self.pos += 1;
    }
    token
  }

  fn eat_keyword(&mut self, keyword: &str) -> bool {
    if self.peek().is_some_and(|t| t.is_keyword(keyword)) {
      self.pos += 1;
      true
    } else {
      false
    }
  }

  fn expect(&mut self, want: Token, what: &str) -> Result<()> {
    if self.peek() == Some(&want) {
      self.pos += 1;
      Ok(())
    } else {
      Err(invalid(self.offset(), &format!("expected {what}")))
    }
  }

  fn enter(&mut self) -> Result<()> {
    self.depth += 1;
    if self.depth > MAX_DEPTH {
      return Err(invalid(self.offset(), "selector nests too deeply"));
    }
    Ok(())
  }

  // ── Clauses ───────────────────────────────────────────────────────────

  fn clause(&mut self) -> Result<Clause> {
    let first = self.expr()?;
    let mut rest = Vec::new();
    loop {
      let conj = if self.eat_keyword("AND") {
        Conjunction::And
      } else if self.eat_keyword("OR") {
        Conjunction::Or
      } else {
        break;
      };
      rest.push((conj, self.expr()?));
    }
    Ok(Clause { first, rest })
  }

  fn expr(&mut self) -> Result<Expr> {
    if self.peek() == Some(&Token::LParen) {
      self.enter()?;
      self.pos += 1;
      let inner = self.clause()?;
      self.expect(Token::RParen, "')'")?;
      self.depth -= 1;
      return Ok(Expr::Group(Box::new(inner)));
    }
    if self.peek().is_none() {
      return Err(invalid(self.offset(), "expected a condition"));
    }
    Ok(Expr::Predicate(self.predicate()?))
  }

  fn predicate(&mut self) -> Result<Predicate> {
    let at = self.offset();
    let left = match self.peek() {
      Some(Token::Column { .. }) => self.value()?,
      Some(Token::Word(w)) if w.to_ascii_lowercase().parse::<Function>().is_ok() => self.value()?,
      _ => return Err(invalid(at, "expected a column or function call")),
    };
    if !left.references_column() {
      return Err(invalid(at, "the left side of a condition must reference a column"));
    }
    let test = self.test()?;
    Ok(Predicate { left, test })
  }

  fn test(&mut self) -> Result<Test> {
    let at = self.offset();
    match self.peek().cloned() {
      Some(Token::Op(op)) => {
        self.pos += 1;
        if self.eat_keyword("ANY") {
          self.expect(Token::LParen, "'(' after ANY")?;
          let set = self.any_set()?;
          self.expect(Token::RParen, "')'")?;
          return Ok(Test::CompareAny { op, set });
        }
        let right = self.value()?;
        Ok(Test::Compare { op, right })
      }
      Some(t) if t.is_keyword("NOT") => {
        self.pos += 1;
        let case_insensitive = self.like_keyword(at)?;
        Ok(Test::Like { negated: true, case_insensitive, pattern: self.value()? })
      }
      Some(t) if t.is_keyword("LIKE") || t.is_keyword("ILIKE") => {
        let case_insensitive = self.like_keyword(at)?;
        Ok(Test::Like { negated: false, case_insensitive, pattern: self.value()? })
      }
      Some(t) if t.is_keyword("IS") => {
        self.pos += 1;
        let negated = self.eat_keyword("NOT");
        if !self.eat_keyword("NULL") {
          return Err(invalid(self.offset(), "expected NULL after IS [NOT]"));
        }
        Ok(Test::IsNull { negated })
      }
      _ => Err(invalid(at, "expected a comparison operator")),
    }
  }

  /// Consume `LIKE` or `ILIKE`; returns whether it was `ILIKE`.
  fn like_keyword(&mut self, at: usize) -> Result<bool> {
    if self.eat_keyword("LIKE") {
      Ok(false)
    } else if self.eat_keyword("ILIKE") {
      Ok(true)
    } else {
      Err(invalid(at, "expected LIKE or ILIKE"))
    }
  }

  fn any_set(&mut self) -> Result<AnySet> {
    match self.peek() {
      Some(Token::Placeholder) => {
        self.pos += 1;
        self.params += 1;
        Ok(AnySet::Param(self.params))
      }
      Some(Token::LParen) => {
        self.enter()?;
        self.pos += 1;
        let inner = self.any_set()?;
        self.expect(Token::RParen, "')'")?;
        self.depth -= 1;
        Ok(inner)
      }
      Some(t) if t.is_keyword("ARRAY") => {
        self.pos += 1;
        self.expect(Token::LBracket, "'[' after ARRAY")?;
        let mut items = vec![self.value()?];
        while self.peek() == Some(&Token::Comma) {
          self.pos += 1;
          items.push(self.value()?);
        }
        self.expect(Token::RBracket, "']'")?;
        Ok(AnySet::Array(items))
      }
      _ => Err(invalid(self.offset(), "ANY expects a parameter or ARRAY[...]")),
    }
  }

  // ── Operands ──────────────────────────────────────────────────────────

  fn value(&mut self) -> Result<Operand> {
    let mut operand = self.primary()?;
    while self.peek() == Some(&Token::Cast) {
      self.pos += 1;
      let at = self.offset();
      let ty = match self.next() {
        Some(Token::Word(w)) => CastType::parse(&w).ok_or_else(|| invalid(at, &format!("unsupported cast type {w:?}")))?,
        _ => return Err(invalid(at, "expected a type name after ::")),
      };
      operand = Operand::Cast(Box::new(operand), ty);
    }
    Ok(operand)
  }

  fn primary(&mut self) -> Result<Operand> {
    let at = self.offset();
    match self.next() {
      Some(Token::Column { name, field }) => Ok(Operand::Column(self.column(name, field)?)),
      Some(Token::Placeholder) => {
        self.params += 1;
        Ok(Operand::Param(self.params))
      }
      Some(Token::Str(s)) => Ok(Operand::Literal(Literal::Str(s))),
      Some(Token::Int(digits)) => Ok(Operand::Literal(Literal::Int(parse_int(at, "", &digits)?))),
      Some(sign @ (Token::Plus | Token::Minus)) => match self.next() {
        Some(Token::Int(digits)) => {
          let sign = if sign == Token::Minus { "-" } else { "" };
          Ok(Operand::Literal(Literal::Int(parse_int(at, sign, &digits)?)))
        }
        _ => Err(invalid(at, "a sign must be followed by an integer")),
      },
      Some(Token::LParen) => {
        self.enter()?;
        let inner = self.value()?;
        self.expect(Token::RParen, "')'")?;
        self.depth -= 1;
        Ok(inner)
      }
      Some(Token::Word(w)) => self.word(at, w),
      Some(_) => Err(invalid(at, "expected a value")),
      None => Err(invalid(at, "unexpected end of selector")),
    }
  }

  fn word(&mut self, at: usize, word: String) -> Result<Operand> {
    let lower = word.to_ascii_lowercase();
    match lower.as_str() {
      "true" => return Ok(Operand::Literal(Literal::Bool(true))),
      "false" => return Ok(Operand::Literal(Literal::Bool(false))),
      "null" => return Err(invalid(at, "NULL can only be tested with IS [NOT] NULL")),
      "array" => return Err(invalid(at, "ARRAY[...] is only allowed inside ANY(...)")),
      _ => {}
    }
    let Ok(func) = lower.parse::<Function>() else {
      return Err(invalid(at, &format!("unexpected word {word:?}")));
    };
    if self.peek() != Some(&Token::LParen) {
      return Err(invalid(at, &format!("expected '(' after {word}")));
    }
    self.enter()?;
    self.pos += 1;
    let mut args = Vec::new();
    if self.peek() != Some(&Token::RParen) {
      args.push(self.value()?);
      while self.peek() == Some(&Token::Comma) {
        self.pos += 1;
        args.push(self.value()?);
      }
    }
    self.expect(Token::RParen, "')'")?;
    self.depth -= 1;
    if args.len() != func.arity() {
      return Err(invalid(
        at,
        &format!("{func} takes {} argument(s), got {}", func.arity(), args.len()),
      ));
    }
    Ok(Operand::Call(func, args))
  }

  fn column(&mut self, name: String, field: Option<String>) -> Result<ColumnRef> {
    let Some(desc) = self.catalog.column_by_name(&name) else {
      return Err(Error::UnknownColumn(name));
    };
    let resolved = match field {
      None => None,
      Some(key) => {
        let Some(f) = desc.kind().field(&key) else {
          return Err(Error::UnsupportedSubfield { column: name, field: key });
        };
        Some((key, f.field_type))
      }
    };
    if !self.columns.iter().any(|c| c.column_id == desc.id()) {
      self.columns.push(SelectorColumn {
        column_id: desc.id(),
        name:      desc.name().to_owned(),
        is_system: desc.is_system(),
      });
    }
    Ok(ColumnRef { column_id: desc.id(), name, field: resolved })
  }
}

fn parse_int(at: usize, sign: &str, digits: &str) -> Result<i64> {
  format!("{sign}{digits}")
    .parse()
    .map_err(|_| invalid(at, "integer literal out of range"))
}
