//! Tokenizer for the selector language.

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
}

impl CompareOp {
  pub fn as_sql(self) -> &'static str {
    match self {
      CompareOp::Eq => "=",
      CompareOp::Ne => "<>",
      CompareOp::Lt => "<",
      CompareOp::Le => "<=",
      CompareOp::Gt => ">",
      CompareOp::Ge => ">=",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
  /// `{name}` with an optional `->>'field'` accessor.
  Column { name: String, field: Option<String> },
  Placeholder,
  /// A quoted literal, unescaped.
  Str(String),
  /// An unsigned integer literal, as written.
  Int(String),
  /// Identifiers, keywords and function names.
  Word(String),
  Op(CompareOp),
  Cast,
  LParen,
  RParen,
  LBracket,
  RBracket,
  Comma,
  Plus,
  Minus,
}

impl Token {
  /// Tokens that must be separated from each other by whitespace or
  /// punctuation.
  fn is_wordlike(&self) -> bool {
    matches!(
      self,
      Token::Column { .. } | Token::Placeholder | Token::Str(_) | Token::Int(_) | Token::Word(_)
    )
  }

  /// Case-insensitive keyword test.
  pub fn is_keyword(&self, keyword: &str) -> bool {
    matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
  }
}

#[derive(Debug, Clone)]
pub struct Spanned {
  pub token: Token,
  pub pos:   usize,
}

/// Count `?` placeholders outside quoted literals.
pub fn count_placeholders(input: &str) -> usize {
  let mut count = 0;
  let mut in_quote = false;
  for c in input.chars() {
    match c {
      '\'' => in_quote = !in_quote,
      '?' if !in_quote => count += 1,
      _ => {}
    }
  }
  count
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>> {
  let chars: Vec<(usize, char)> = input.char_indices().collect();
  let mut tokens: Vec<Spanned> = Vec::new();
  let mut i = 0;
  let mut spaced = true;

  let err = |pos: usize, msg: &str| Error::InvalidSelector(format!("{msg} at offset {pos}"));

  while i < chars.len() {
    let (pos, c) = chars[i];
    if c.is_whitespace() {
      spaced = true;
      i += 1;
      continue;
    }

    let token = match c {
      '{' => {
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && chars[end].1 != '}' {
          end += 1;
        }
        if end >= chars.len() {
          return Err(err(pos, "unterminated column reference"));
        }
        let name: String = chars[start..end].iter().map(|(_, c)| *c).collect();
        if name.is_empty() {
          return Err(err(pos, "empty column reference"));
        }
        i = end + 1;

        let mut field = None;
        if starts_with(&chars, i, "->>") {
          i += 3;
          if i >= chars.len() || chars[i].1 != '\'' {
            return Err(err(pos, "expected a quoted field name after ->>"));
          }
          let (text, next) = read_quoted(&chars, i).ok_or_else(|| err(pos, "unterminated field name"))?;
          field = Some(text);
          i = next;
        }
        Token::Column { name, field }
      }
      '?' => {
        i += 1;
        Token::Placeholder
      }
      '\'' => {
        let (text, next) = read_quoted(&chars, i).ok_or_else(|| err(pos, "unterminated string literal"))?;
        i = next;
        Token::Str(text)
      }
      '0'..='9' => {
        let start = i;
        while i < chars.len() && chars[i].1.is_ascii_digit() {
          i += 1;
        }
        if i < chars.len() && chars[i].1 == '.' {
          return Err(err(pos, "decimal literals are not supported"));
        }
        Token::Int(chars[start..i].iter().map(|(_, c)| *c).collect())
      }
      c if c.is_ascii_alphabetic() || c == '_' => {
        let start = i;
        while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
          i += 1;
        }
        Token::Word(chars[start..i].iter().map(|(_, c)| *c).collect())
      }
      ':' if starts_with(&chars, i, "::") => {
        i += 2;
        Token::Cast
      }
      '=' => {
        i += 1;
        Token::Op(CompareOp::Eq)
      }
      '!' if starts_with(&chars, i, "!=") => {
        i += 2;
        Token::Op(CompareOp::Ne)
      }
      '<' => {
        if starts_with(&chars, i, "<=") {
          i += 2;
          Token::Op(CompareOp::Le)
        } else if starts_with(&chars, i, "<>") {
          i += 2;
          Token::Op(CompareOp::Ne)
        } else {
          i += 1;
          Token::Op(CompareOp::Lt)
        }
      }
      '>' => {
        if starts_with(&chars, i, ">=") {
          i += 2;
          Token::Op(CompareOp::Ge)
        } else {
          i += 1;
          Token::Op(CompareOp::Gt)
        }
      }
      '(' => {
        i += 1;
        Token::LParen
      }
      ')' => {
        i += 1;
        Token::RParen
      }
      '[' => {
        i += 1;
        Token::LBracket
      }
      ']' => {
        i += 1;
        Token::RBracket
      }
      ',' => {
        i += 1;
        Token::Comma
      }
      '+' => {
        i += 1;
        Token::Plus
      }
      '-' => {
        i += 1;
        Token::Minus
      }
      other => return Err(err(pos, &format!("unexpected character {other:?}"))),
    };

    if !spaced
      && token.is_wordlike()
      && tokens.last().is_some_and(|prev| prev.token.is_wordlike())
    {
      return Err(err(pos, "missing whitespace between tokens"));
    }
    tokens.push(Spanned { token, pos });
    spaced = false;
  }

  Ok(tokens)
}

fn starts_with(chars: &[(usize, char)], at: usize, pat: &str) -> bool {
  let mut idx = at;
  for p in pat.chars() {
    match chars.get(idx) {
      Some((_, c)) if *c == p => idx += 1,
      _ => return false,
    }
  }
  true
}

/// Read a `'...'` literal starting at `at`, where `''` is an escaped quote.
/// Returns the unescaped text and the index after the closing quote.
fn read_quoted(chars: &[(usize, char)], at: usize) -> Option<(String, usize)> {
  let mut out = String::new();
  let mut i = at + 1;
  while i < chars.len() {
    let c = chars[i].1;
    if c == '\'' {
      if chars.get(i + 1).is_some_and(|(_, n)| *n == '\'') {
        out.push('\'');
        i += 2;
        continue;
      }
      return Some((out, i + 1));
    }
    out.push(c);
    i += 1;
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn kinds(input: &str) -> Vec<Token> {
    tokenize(input).unwrap().into_iter().map(|s| s.token).collect()
  }

  #[test]
  fn column_with_subfield() {
    assert_eq!(
      kinds("{home}->>'street_number' = ?"),
      vec![
        Token::Column { name: "home".into(), field: Some("street_number".into()) },
        Token::Op(CompareOp::Eq),
        Token::Placeholder,
      ]
    );
  }

  #[test]
  fn escaped_quote_stays_in_literal() {
    assert_eq!(kinds("'fo''o'"), vec![Token::Str("fo'o".into())]);
    assert_eq!(count_placeholders("{x} = '?' AND {y} = ?"), 1);
  }

  #[test]
  fn operators_need_no_spaces() {
    assert_eq!(kinds("({id}=?)").len(), 5);
    assert_eq!(kinds("{a}<>?")[1], Token::Op(CompareOp::Ne));
    assert_eq!(kinds("1::BOOL")[1], Token::Cast);
  }

  #[test]
  fn keywords_need_whitespace() {
    assert!(tokenize("{id}LIKE ?").is_err());
    assert!(tokenize("{id} LIKE?").is_err());
    assert!(tokenize("{id} LIKE ?").is_ok());
  }

  #[test]
  fn rejects_unterminated_input() {
    assert!(tokenize("{id").is_err());
    assert!(tokenize("{id} = 'abc").is_err());
    assert!(tokenize("{} = ?").is_err());
  }
}
