//! Expression evaluation against a record's data
//!
//! Templates are literal text with `{{ expression }}` placeholders. A template made of a single
//! placeholder yields the expression's value untouched; anything else renders to a string.
//! Conditions are bare expressions.
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::TemplateError;
use crate::fields::Schema;
use crate::record::Record;
use crate::value::{Value, lookup};

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, TemplateError>;

    fn evaluate_condition(&self, expression: &str, scope: &Scope) -> Result<bool, TemplateError> {
        Ok(self.evaluate(expression, scope)?.is_truthy())
    }
}

/// Variables visible to one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Unknown variables read as null.
    pub fn get(&self, name: &str) -> &Value {
        lookup(&self.vars, name)
    }

    /// `form_*` variables of a record: ids, status, `form_f<id>`, `form_var_<varname>` (display
    /// value), `form_var_<varname>_raw`, `form_var_<varname>_structured`,
    /// `form_workflow_data_<key>` and `session_user`.
    pub fn for_record(record: &Record, schema: &Schema, actor: Option<&str>) -> Self {
        let mut scope = Scope::new();
        scope.insert("form_id", record.id.as_str());
        scope.insert("form_status", record.status.as_str());
        scope.insert("form_receipt_datetime", record.receipt_time.to_iso());
        for field in schema.fields() {
            let raw = lookup(&record.data, &field.id).clone();
            scope.insert(format!("form_f{}", field.id), raw.clone());
            let Some(varname) = &field.varname else {
                continue;
            };
            let display = record
                .data
                .get(&field.display_key())
                .cloned()
                .unwrap_or_else(|| raw.clone());
            scope.insert(format!("form_var_{varname}"), display);
            scope.insert(format!("form_var_{varname}_raw"), raw);
            if let Some(structured) = record.data.get(&field.structured_key()) {
                scope.insert(format!("form_var_{varname}_structured"), structured.clone());
            }
        }
        for (key, value) in &record.workflow_data {
            scope.insert(format!("form_workflow_data_{key}"), value.clone());
        }
        scope.insert("session_user", actor.map(Value::from).unwrap_or(Value::Null));
        scope
    }
}

/// Built-in interpreter: `or`, `and`, `not`, comparisons, `in`, literals, dotted paths,
/// parentheses and the `default`, `upper`, `lower`, `length` filters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Interpreter;

impl Evaluator for Interpreter {
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, TemplateError> {
        render(expression, scope)
    }

    fn evaluate_condition(&self, expression: &str, scope: &Scope) -> Result<bool, TemplateError> {
        let trimmed = expression.trim();
        let inner = trimmed
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);
        eval_expression(inner, scope).map(|value| value.is_truthy())
    }
}

pub fn render(template: &str, scope: &Scope) -> Result<Value, TemplateError> {
    if template.contains("{%") {
        return Err(TemplateError::new(template, "block tags are not supported"));
    }
    if !template.contains("{{") {
        return Ok(Value::Str(template.to_string()));
    }
    let trimmed = template.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
        if !inner.contains("{{") && !inner.contains("}}") {
            return eval_expression(inner, scope)
                .map_err(|e| TemplateError::new(template, e.message));
        }
    }

    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::new(template, "unclosed '{{'"))?;
        let value = eval_expression(&after[..end], scope)
            .map_err(|e| TemplateError::new(template, e.message))?;
        out.push_str(&value.to_display());
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::Str(out))
}

pub fn eval_expression(expression: &str, scope: &Scope) -> Result<Value, TemplateError> {
    let tokens = tokenize(expression).map_err(|msg| TemplateError::new(expression, msg))?;
    if tokens.is_empty() {
        return Err(TemplateError::new(expression, "empty expression"));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        scope,
    };
    let value = parser
        .or()
        .map_err(|msg| TemplateError::new(expression, msg))?;
    if parser.pos != tokens.len() {
        return Err(TemplateError::new(
            expression,
            format!("unexpected {:?}", tokens[parser.pos]),
        ));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Op(&'static str),
    LParen,
    RParen,
    Pipe,
    Colon,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = vec![];
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '"' | '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                s.push(*next);
                            }
                            i += 2;
                        }
                        Some(q) if *q == c => {
                            i += 1;
                            break;
                        }
                        Some(other) => {
                            s.push(*other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let after_dot = tokens.last() == Some(&Token::Dot);
                let fractional = !after_dot
                    && chars.get(i) == Some(&'.')
                    && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit());
                if fractional {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    tokens.push(Token::Float(text.parse().map_err(|_| "invalid number")?));
                } else {
                    let text: String = chars[start..i].iter().collect();
                    tokens.push(Token::Int(text.parse().map_err(|_| "invalid number")?));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '=' | '!' | '<' | '>' => {
                let two = chars.get(i + 1) == Some(&'=');
                let op = match (c, two) {
                    ('=', true) => "==",
                    ('!', true) => "!=",
                    ('<', true) => "<=",
                    ('>', true) => ">=",
                    ('<', false) => "<",
                    ('>', false) => ">",
                    _ => return Err(format!("unexpected character {c:?}")),
                };
                i += if two { 2 } else { 1 };
                tokens.push(Token::Op(op));
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    scope: &'a Scope,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn keyword(&mut self, word: &str) -> bool {
        match self.peek() {
            Some(Token::Ident(ident)) if ident == word => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn or(&mut self) -> Result<Value, String> {
        let mut value = self.and()?;
        while self.keyword("or") {
            let rhs = self.and()?;
            value = Value::Bool(value.is_truthy() || rhs.is_truthy());
        }
        Ok(value)
    }

    fn and(&mut self) -> Result<Value, String> {
        let mut value = self.not()?;
        while self.keyword("and") {
            let rhs = self.not()?;
            value = Value::Bool(value.is_truthy() && rhs.is_truthy());
        }
        Ok(value)
    }

    fn not(&mut self) -> Result<Value, String> {
        if self.keyword("not") {
            return Ok(Value::Bool(!self.not()?.is_truthy()));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, String> {
        let lhs = self.filtered()?;
        if self.keyword("in") {
            let rhs = self.filtered()?;
            return Ok(Value::Bool(contains(&rhs, &lhs)));
        }
        let Some(Token::Op(op)) = self.peek().cloned() else {
            return Ok(lhs);
        };
        self.pos += 1;
        let rhs = self.filtered()?;
        let result = match op {
            "==" => loose_eq(&lhs, &rhs),
            "!=" => !loose_eq(&lhs, &rhs),
            _ => match compare(&lhs, &rhs) {
                None => false,
                Some(ordering) => match op {
                    "<" => ordering == Ordering::Less,
                    "<=" => ordering != Ordering::Greater,
                    ">" => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
            },
        };
        Ok(Value::Bool(result))
    }

    fn filtered(&mut self) -> Result<Value, String> {
        let mut value = self.primary()?;
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            let Some(Token::Ident(name)) = self.next() else {
                return Err("expected a filter name".into());
            };
            let arg = if self.peek() == Some(&Token::Colon) {
                self.pos += 1;
                Some(self.primary()?)
            } else {
                None
            };
            value = apply_filter(&name, value, arg)?;
        }
        Ok(value)
    }

    fn primary(&mut self) -> Result<Value, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Int(i)) => Ok(Value::Int(i)),
            Some(Token::Float(f)) => Ok(Value::Float(f)),
            Some(Token::LParen) => {
                let value = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("expected ')'".into()),
                }
            }
            Some(Token::Ident(ident)) => match ident.as_str() {
                "True" | "true" => Ok(Value::Bool(true)),
                "False" | "false" => Ok(Value::Bool(false)),
                "None" | "null" => Ok(Value::Null),
                _ => {
                    let mut value = self.scope.get(&ident).clone();
                    while self.peek() == Some(&Token::Dot) {
                        self.pos += 1;
                        let key = match self.next() {
                            Some(Token::Ident(key)) => key,
                            Some(Token::Int(index)) => index.to_string(),
                            _ => return Err("expected an attribute after '.'".into()),
                        };
                        value = value.get_path(&key).cloned().unwrap_or(Value::Null);
                    }
                    Ok(value)
                }
            },
            Some(other) => Err(format!("unexpected {other:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

fn is_number(value: &Value) -> bool {
    matches!(value, Value::Int(_) | Value::Float(_))
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if is_number(a) || is_number(b) {
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            return x == y;
        }
    }
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Str(_), _) | (_, Value::Str(_)) => a.to_display() == b.to_display(),
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    Some(a.to_display().cmp(&b.to_display()))
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::List(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Map(map) => map.contains_key(&needle.to_display()),
        Value::Str(s) => s.contains(&needle.to_display()),
        _ => false,
    }
}

fn apply_filter(name: &str, value: Value, arg: Option<Value>) -> Result<Value, String> {
    match name {
        "default" => Ok(if value.is_empty() {
            arg.unwrap_or(Value::Null)
        } else {
            value
        }),
        "upper" => Ok(Value::Str(value.to_display().to_uppercase())),
        "lower" => Ok(Value::Str(value.to_display().to_lowercase())),
        "length" => {
            let len = match &value {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                Value::Block(block) => block.rows.len(),
                _ => 0,
            };
            Ok(Value::Int(len as i64))
        }
        other => Err(format!("unknown filter {other:?}")),
    }
}
