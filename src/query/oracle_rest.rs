//! Oracle REST `q=` expressions, e.g. `q=DeptName LIKE 'Eng%';Loc != 'NYC'`.
//!
//! Grammar (keywords case-insensitive, `;` separates clauses joined by AND):
//!
//! ```text
//! expr       := and ("OR" and)*
//! and        := predicate ("AND" predicate)*
//! predicate  := "(" expr ")"
//!             | field op literal
//!             | field "LIKE" literal
//!             | field "BETWEEN" literal "AND" literal
//! op         := = | != | <> | < | <= | > | >=
//! ```

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;

use super::filter::{CompareOp, Filter};
use super::{process_query, Paging, QueryHandler};
use crate::http::{Request, Response};
use crate::proxy::RequestContext;

/// Replacement for the built-in `q` parser. Receives the raw `q` value.
pub type QueryBuilder = Arc<dyn Fn(Option<&str>) -> Result<Filter> + Send + Sync>;

pub struct OracleRestQueryHandler {
  store_name: String,
  builder: Option<QueryBuilder>,
}

impl OracleRestQueryHandler {
  pub fn new(store_name: &str) -> Self {
    Self {
      store_name: store_name.to_string(),
      builder: None,
    }
  }

  pub fn with_query_builder(mut self, builder: QueryBuilder) -> Self {
    self.builder = Some(builder);
    self
  }

  fn build_filter(&self, q: Option<&str>) -> Result<Filter> {
    match &self.builder {
      Some(builder) => builder(q),
      None => q.map(parse_query).unwrap_or(Ok(Filter::All)),
    }
  }
}

impl QueryHandler for OracleRestQueryHandler {
  fn handle(&self, ctx: &RequestContext, request: &Request) -> Result<Option<Response>> {
    if !request.method.is_read() {
      return Ok(None);
    }

    let params = request.query_pairs();
    let q = params
      .iter()
      .find(|(name, _)| name == "q")
      .map(|(_, value)| value.as_str());

    let filter = match self.build_filter(q) {
      Ok(filter) => filter,
      Err(e) => {
        tracing::warn!(url = %request.url, "Ignoring unparseable query expression: {}", e);
        return Ok(None);
      }
    };

    let Some(mut response) = process_query(
      ctx,
      request,
      &self.store_name,
      &filter,
      Paging::from_params(&params),
    )?
    else {
      return Ok(None);
    };

    if let Ok(Value::Object(mut body)) = response.json() {
      if !body.contains_key("links") {
        body.insert("links".to_string(), json!([{"rel": "self", "href": request.url}]));
        response.body = Value::Object(body).to_string().into_bytes();
      }
    }
    Ok(Some(response))
  }
}

/// Parse a full `q` value into a filter tree.
pub fn parse_query(q: &str) -> Result<Filter> {
  let clauses = split_clauses(q)
    .into_iter()
    .filter(|clause| !clause.trim().is_empty())
    .map(|clause| {
      let tokens = tokenize(clause)?;
      let mut parser = Parser { tokens, pos: 0 };
      let filter = parser.expr()?;
      match parser.tokens.get(parser.pos) {
        None => Ok(filter),
        Some(token) => Err(eyre!("Unexpected {:?} in query clause '{}'", token, clause)),
      }
    })
    .collect::<Result<Vec<_>>>()?;
  Ok(Filter::all_of(clauses))
}

/// Split on `;` outside quoted literals.
fn split_clauses(q: &str) -> Vec<&str> {
  let mut clauses = Vec::new();
  let mut quote = None;
  let mut start = 0;
  for (i, c) in q.char_indices() {
    match (quote, c) {
      (Some(open), c) if c == open => quote = None,
      (None, '\'' | '"' | '`') => quote = Some(c),
      (None, ';') => {
        clauses.push(&q[start..i]);
        start = i + 1;
      }
      _ => {}
    }
  }
  clauses.push(&q[start..]);
  clauses
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
  Word(String),
  Literal(Value),
  Op(CompareOp),
  Open,
  Close,
}

impl Token {
  fn is_keyword(&self, keyword: &str) -> bool {
    matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
  }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
  let mut tokens = Vec::new();
  let mut chars = input.chars().peekable();

  while let Some(&c) = chars.peek() {
    match c {
      c if c.is_whitespace() => {
        chars.next();
      }
      '(' => {
        chars.next();
        tokens.push(Token::Open);
      }
      ')' => {
        chars.next();
        tokens.push(Token::Close);
      }
      '\'' | '"' | '`' => {
        chars.next();
        tokens.push(Token::Literal(Value::String(quoted(&mut chars, c)?)));
      }
      '=' | '!' | '<' | '>' => tokens.push(Token::Op(operator(&mut chars)?)),
      _ => {
        let mut word = String::new();
        while let Some(&c) = chars.peek() {
          if c.is_whitespace() || "()=!<>'\"`".contains(c) {
            break;
          }
          word.push(c);
          chars.next();
        }
        tokens.push(Token::Word(word));
      }
    }
  }
  Ok(tokens)
}

/// Body of a quoted literal; a backslash escapes the closing quote.
fn quoted(chars: &mut Peekable<Chars<'_>>, close: char) -> Result<String> {
  let mut text = String::new();
  while let Some(c) = chars.next() {
    match c {
      '\\' if chars.peek() == Some(&close) => {
        text.push(close);
        chars.next();
      }
      c if c == close => return Ok(text),
      c => text.push(c),
    }
  }
  Err(eyre!("Unterminated string literal"))
}

fn operator(chars: &mut Peekable<Chars<'_>>) -> Result<CompareOp> {
  let mut op = String::new();
  while let Some(&c) = chars.peek() {
    if !"=!<>".contains(c) {
      break;
    }
    op.push(c);
    chars.next();
  }
  CompareOp::parse(&op).ok_or_else(|| eyre!("Unknown operator '{}'", op))
}

struct Parser {
  tokens: Vec<Token>,
  pos: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn next(&mut self) -> Option<Token> {
    let token = self.tokens.get(self.pos).cloned();
    self.pos += 1;
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

  fn expr(&mut self) -> Result<Filter> {
    let mut terms = vec![self.and()?];
    while self.eat_keyword("OR") {
      terms.push(self.and()?);
    }
    Ok(if terms.len() == 1 {
      terms.remove(0)
    } else {
      Filter::Or(terms)
    })
  }

  fn and(&mut self) -> Result<Filter> {
    let mut terms = vec![self.predicate()?];
    while self.eat_keyword("AND") {
      terms.push(self.predicate()?);
    }
    Ok(Filter::all_of(terms))
  }

  fn predicate(&mut self) -> Result<Filter> {
    if self.peek() == Some(&Token::Open) {
      self.pos += 1;
      let inner = self.expr()?;
      return match self.next() {
        Some(Token::Close) => Ok(inner),
        other => Err(eyre!("Expected ')' but found {:?}", other)),
      };
    }

    let field = match self.next() {
      Some(Token::Word(word)) if !is_reserved(&word) => word,
      other => return Err(eyre!("Expected a field name but found {:?}", other)),
    };

    if self.eat_keyword("LIKE") {
      return match self.literal()? {
        Value::String(pattern) => Filter::like(field, &pattern),
        other => Filter::like(field, &other.to_string()),
      };
    }

    if self.eat_keyword("BETWEEN") {
      let low = self.literal()?;
      if !self.eat_keyword("AND") {
        return Err(eyre!("BETWEEN on '{}' is missing AND", field));
      }
      let high = self.literal()?;
      return Ok(Filter::And(vec![
        Filter::compare(field.clone(), CompareOp::Gte, low),
        Filter::compare(field, CompareOp::Lte, high),
      ]));
    }

    match self.next() {
      Some(Token::Op(op)) => Ok(Filter::compare(field, op, self.literal()?)),
      other => Err(eyre!("Expected an operator after '{}' but found {:?}", field, other)),
    }
  }

  fn literal(&mut self) -> Result<Value> {
    match self.next() {
      Some(Token::Literal(value)) => Ok(value),
      Some(Token::Word(word)) if !is_reserved(&word) => Ok(word_value(&word)),
      other => Err(eyre!("Expected a value but found {:?}", other)),
    }
  }
}

fn is_reserved(word: &str) -> bool {
  ["AND", "OR", "LIKE", "BETWEEN"]
    .iter()
    .any(|k| word.eq_ignore_ascii_case(k))
}

/// Unquoted literal: number, boolean, null, or bare text.
fn word_value(word: &str) -> Value {
  if let Ok(n) = word.parse::<i64>() {
    return Value::from(n);
  }
  if let Ok(n) = word.parse::<f64>() {
    if n.is_finite() {
      return Value::from(n);
    }
  }
  match word.to_ascii_lowercase().as_str() {
    "true" => Value::Bool(true),
    "false" => Value::Bool(false),
    "null" => Value::Null,
    _ => Value::String(word.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::{Key, Row};
  use crate::proxy::testing::{context_with, ScriptedTransport};
  use crate::proxy::ProxyOptions;
  use crate::shred::{IdAttribute, JsonProcessor};

  fn rows() -> Vec<Value> {
    vec![
      json!({"DeptId": 10, "DeptName": "Engineering", "Loc": "SF"}),
      json!({"DeptId": 20, "DeptName": "Sales", "Loc": "NYC"}),
      json!({"DeptId": 30, "DeptName": "Support", "Loc": "SF"}),
    ]
  }

  fn matching(q: &str) -> Vec<i64> {
    let filter = parse_query(q).unwrap();
    rows()
      .iter()
      .filter(|row| filter.matches(row))
      .filter_map(|row| row["DeptId"].as_i64())
      .collect()
  }

  #[test]
  fn test_comparisons_and_boolean_precedence() {
    assert_eq!(matching("DeptId > 10"), vec![20, 30]);
    assert_eq!(matching("Loc = 'SF' AND DeptId >= 30"), vec![30]);
    assert_eq!(matching("DeptId = 10 OR DeptId = 20 AND Loc = 'SF'"), vec![10]);
    assert_eq!(matching("(DeptId = 10 OR DeptId = 20) AND Loc = 'NYC'"), vec![20]);
    assert_eq!(matching("Loc != 'SF'"), vec![20]);
  }

  #[test]
  fn test_like_between_and_clauses() {
    assert_eq!(matching("DeptName LIKE 'S%'"), vec![20, 30]);
    assert_eq!(matching("DeptId BETWEEN 15 AND 30"), vec![20, 30]);
    assert_eq!(matching("Loc = 'SF';DeptName LIKE '%ort'"), vec![30]);
    assert_eq!(matching("dept_semicolon = 'a;b'"), Vec::<i64>::new());
  }

  #[test]
  fn test_malformed_expressions() {
    assert!(parse_query("DeptId >").is_err());
    assert!(parse_query("(DeptId = 1").is_err());
    assert!(parse_query("DeptName = 'open").is_err());
    assert!(parse_query("DeptId ~ 3").is_err());
  }

  fn seeded_context(count: i64) -> RequestContext {
    let processor = JsonProcessor::oracle_rest("depts", IdAttribute::from("DeptId"));
    let ctx = context_with(
      ScriptedTransport::unreachable(),
      ProxyOptions::default().with_json_processor(processor.clone()),
    );
    let items: Vec<Value> = (0..count).map(|i| json!({"DeptId": i})).collect();
    let body = json!({"items": items, "count": count});
    ctx
      .services
      .cache
      .put(
        &Request::get("/depts"),
        &Response::new(200, "OK").with_body(body.to_string()),
        None,
        Some(&processor),
      )
      .unwrap();
    ctx
  }

  #[tokio::test]
  async fn test_paged_query_metadata() {
    let ctx = seeded_context(10);
    let handler = OracleRestQueryHandler::new("depts");

    let response = handler
      .handle(&ctx, &Request::get("/depts?limit=3&offset=2"))
      .unwrap()
      .unwrap();
    let body = response.json().unwrap();

    assert_eq!(body["items"], json!([{"DeptId": 2}, {"DeptId": 3}, {"DeptId": 4}]));
    assert_eq!(body["count"], json!(3));
    assert_eq!(body["hasMore"], json!(true));
    assert_eq!(body["totalResults"], json!(10));
    assert_eq!(body["limit"], json!(3));
    assert_eq!(body["offset"], json!(2));
    assert_eq!(
      body["links"],
      json!([{"rel": "self", "href": "/depts?limit=3&offset=2"}])
    );
  }

  #[tokio::test]
  async fn test_custom_builder_and_bad_expression() {
    let ctx = seeded_context(4);
    let builder: QueryBuilder = Arc::new(|_q: Option<&str>| Ok(Filter::eq("DeptId", json!(3))));
    let handler = OracleRestQueryHandler::new("depts").with_query_builder(builder);

    let response = handler
      .handle(&ctx, &Request::get("/depts?q=ignored"))
      .unwrap()
      .unwrap();
    assert_eq!(response.json().unwrap()["items"], json!([{"DeptId": 3}]));

    let declined = OracleRestQueryHandler::new("depts")
      .handle(&ctx, &Request::get("/depts?q=DeptId%20%3E"))
      .unwrap();
    assert!(declined.is_none());
  }

  #[tokio::test]
  async fn test_store_changes_are_queried() {
    let ctx = seeded_context(2);
    ctx
      .services
      .stores
      .open_store("depts")
      .unwrap()
      .upsert_all(&[Row {
        key: Key::Scalar(json!(7)),
        value: json!({"DeptId": 7}),
      }])
      .unwrap();

    let response = OracleRestQueryHandler::new("depts")
      .handle(&ctx, &Request::get("/depts?q=DeptId>1"))
      .unwrap()
      .unwrap();
    assert_eq!(response.json().unwrap()["items"], json!([{"DeptId": 7}]));
  }
}
