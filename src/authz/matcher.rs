//! Matcher expression compiler and tree-walking evaluator.
//!
//! Supported syntax:
//! - Attribute access: `r.sub`, `p.obj` (resolved to tuple positions at compile time)
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Boolean operators: `&&`, `||`, `!` (short-circuiting, left to right)
//! - Membership: `r.act in ("GET", "HEAD")`
//! - Calls: role definitions (`g(r.sub, p.sub)`, `g(r.sub, p.sub, r.dom)`),
//!   `keyMatch(path, pattern)`, `keyMatch2(path, pattern)`
//! - Literals: integers, floats, `"strings"`, `'strings'`, `true`, `false`
//! - Parentheses for grouping
//!
//! A policy value of exactly `*` equals any request value.

use std::borrow::Cow;

use crate::authz::errors::{ConfigError, QueryFault};
use crate::authz::model::{RoleDefinition, Shape};

pub const WILDCARD: &str = "*";

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(LitValue),
    Attr(Attr),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    In {
        element: Box<Expr>,
        items: Vec<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Request,
    Policy,
}

/// A resolved attribute reference: which tuple, and which position in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub scope: Scope,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    /// Index into the model's role definitions.
    Role(usize),
    KeyMatch,
    KeyMatch2,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LitValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Scalar,
}

impl Expr {
    fn kind(&self) -> Kind {
        match self {
            Expr::Literal(LitValue::Bool(_)) => Kind::Bool,
            Expr::Literal(_) | Expr::Attr(_) => Kind::Scalar,
            Expr::BinOp { .. } | Expr::Not(_) | Expr::In { .. } | Expr::Call { .. } => Kind::Bool,
        }
    }
}

// ─── Parser ─────────────────────────────────────────────────────────────

/// Names a matcher may refer to.
pub struct Bindings<'a> {
    pub request: &'a Shape,
    pub policy: &'a Shape,
    pub roles: &'a [RoleDefinition],
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Dot,
    Comma,
    LParen,
    RParen,
    Eq,  // ==
    Ne,  // !=
    Gt,  // >
    Lt,  // <
    Ge,  // >=
    Le,  // <=
    And, // &&
    Or,  // ||
    Not, // !
    In,  // in
}

/// Operator or punctuation starting at `c`, and how many chars it spans.
fn symbol(c: char, next: Option<char>) -> Option<(Token, usize)> {
    let token = match (c, next) {
        ('=', Some('=')) => (Token::Eq, 2),
        ('!', Some('=')) => (Token::Ne, 2),
        ('>', Some('=')) => (Token::Ge, 2),
        ('<', Some('=')) => (Token::Le, 2),
        ('&', Some('&')) => (Token::And, 2),
        ('|', Some('|')) => (Token::Or, 2),
        ('!', _) => (Token::Not, 1),
        ('>', _) => (Token::Gt, 1),
        ('<', _) => (Token::Lt, 1),
        ('.', _) => (Token::Dot, 1),
        (',', _) => (Token::Comma, 1),
        ('(', _) => (Token::LParen, 1),
        (')', _) => (Token::RParen, 1),
        _ => return None,
    };
    Some(token)
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConfigError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(&c) = chars.get(i) {
        if c.is_whitespace() {
            i += 1;
        } else if let Some((token, width)) = symbol(c, chars.get(i + 1).copied()) {
            tokens.push(token);
            i += width;
        } else if c == '"' || c == '\'' {
            let (text, end) = string_literal(&chars, i)?;
            tokens.push(Token::Str(text));
            i = end;
        } else if c.is_ascii_digit() {
            let end = scan(&chars, i, |c| c.is_ascii_digit() || c == '.');
            tokens.push(number(&chars[i..end].iter().collect::<String>())?);
            i = end;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let end = scan(&chars, i, |c| c.is_ascii_alphanumeric() || c == '_');
            let word: String = chars[i..end].iter().collect();
            tokens.push(match word.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "in" => Token::In,
                _ => Token::Ident(word),
            });
            i = end;
        } else {
            return Err(ConfigError::InvalidExpression(format!(
                "unexpected character `{c}`"
            )));
        }
    }
    Ok(tokens)
}

/// End of the run of chars from `start` accepted by `accept`.
fn scan(chars: &[char], start: usize, accept: impl Fn(char) -> bool) -> usize {
    chars[start..]
        .iter()
        .position(|&c| !accept(c))
        .map_or(chars.len(), |n| start + n)
}

/// A quoted literal opening at `start`; returns its text and the index past
/// the closing quote. A backslash escapes the next char.
fn string_literal(chars: &[char], start: usize) -> Result<(String, usize), ConfigError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    while let Some(&c) = chars.get(i) {
        if c == quote {
            return Ok((text, i + 1));
        }
        if c == '\\' {
            i += 1;
        }
        if let Some(&c) = chars.get(i) {
            text.push(c);
        }
        i += 1;
    }
    Err(ConfigError::InvalidExpression(
        "unterminated string literal".into(),
    ))
}

fn number(text: &str) -> Result<Token, ConfigError> {
    if text.contains('.') {
        text.parse()
            .map(Token::Float)
            .map_err(|_| ConfigError::InvalidExpression(format!("invalid float `{text}`")))
    } else {
        text.parse()
            .map(Token::Int)
            .map_err(|_| ConfigError::InvalidExpression(format!("invalid integer `{text}`")))
    }
}

struct Parser<'b> {
    tokens: Vec<Token>,
    pos: usize,
    bindings: &'b Bindings<'b>,
}

impl<'b> Parser<'b> {
    fn new(tokens: Vec<Token>, bindings: &'b Bindings<'b>) -> Self {
        Self {
            tokens,
            pos: 0,
            bindings,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ConfigError> {
        if self.advance() != Some(expected) {
            return Err(ConfigError::InvalidExpression(format!("expected {what}")));
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr, ConfigError> {
        self.parse_or()
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, ConfigError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = logical(BinOp::Or, left, right)?;
        }
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Expr, ConfigError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = logical(BinOp::And, left, right)?;
        }
        Ok(left)
    }

    /// comparison = unary (("==" | "!=" | ">" | "<" | ">=" | "<=") unary | "in" list)?
    fn parse_comparison(&mut self) -> Result<Expr, ConfigError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Le) => BinOp::Le,
            Some(Token::In) => {
                self.advance();
                let items = self.parse_list()?;
                return Ok(Expr::In {
                    element: Box::new(left),
                    items,
                });
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// list = "(" unary ("," unary)* ")"
    fn parse_list(&mut self) -> Result<Vec<Expr>, ConfigError> {
        self.expect(Token::LParen, "`(` after `in`")?;
        let mut items = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::Comma) {
            self.advance();
            items.push(self.parse_unary()?);
        }
        self.expect(Token::RParen, "closing parenthesis `)`")?;
        Ok(items)
    }

    /// unary = "!" unary | primary
    fn parse_unary(&mut self) -> Result<Expr, ConfigError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            if expr.kind() != Kind::Bool {
                return Err(ConfigError::InvalidExpression(
                    "`!` requires a boolean operand".into(),
                ));
            }
            return Ok(Expr::Not(Box::new(expr)));
        }
        self.parse_primary()
    }

    /// primary = literal | attribute | call | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr, ConfigError> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Literal(LitValue::Int(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(LitValue::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(LitValue::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(LitValue::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(LitValue::Bool(false))),
            Some(Token::Ident(name)) => match self.peek() {
                Some(Token::LParen) => self.parse_call(name),
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(field)) => self.resolve_attr(&name, &field),
                        _ => Err(ConfigError::InvalidExpression(format!(
                            "expected attribute name after `{name}.`"
                        ))),
                    }
                }
                _ => Err(ConfigError::UnknownAttribute(name)),
            },
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen, "closing parenthesis `)`")?;
                Ok(expr)
            }
            other => Err(ConfigError::InvalidExpression(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, ConfigError> {
        self.expect(Token::LParen, "`(`")?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            args.push(self.parse_unary()?);
            while self.peek() == Some(&Token::Comma) {
                self.advance();
                args.push(self.parse_unary()?);
            }
        }
        self.expect(Token::RParen, "closing parenthesis `)`")?;

        let (func, arity) = match name.as_str() {
            "keyMatch" => (Func::KeyMatch, 2),
            "keyMatch2" => (Func::KeyMatch2, 2),
            _ => {
                let idx = self
                    .bindings
                    .roles
                    .iter()
                    .position(|r| r.name == name)
                    .ok_or_else(|| ConfigError::UnknownFunction(name.clone()))?;
                (Func::Role(idx), self.bindings.roles[idx].arity())
            }
        };
        if args.len() != arity {
            return Err(ConfigError::InvalidExpression(format!(
                "`{name}` takes {arity} arguments, got {}",
                args.len()
            )));
        }
        if args.iter().any(|a| a.kind() != Kind::Scalar) {
            return Err(ConfigError::InvalidExpression(format!(
                "arguments of `{name}` must be attributes or literals"
            )));
        }
        Ok(Expr::Call { func, args })
    }

    fn resolve_attr(&self, key: &str, field: &str) -> Result<Expr, ConfigError> {
        let (scope, shape) = if key == self.bindings.request.key {
            (Scope::Request, self.bindings.request)
        } else if key == self.bindings.policy.key {
            (Scope::Policy, self.bindings.policy)
        } else {
            return Err(ConfigError::UnknownAttribute(format!("{key}.{field}")));
        };
        let index = shape
            .index_of(field)
            .ok_or_else(|| ConfigError::UnknownAttribute(format!("{key}.{field}")))?;
        Ok(Expr::Attr(Attr { scope, index }))
    }
}

fn logical(op: BinOp, left: Expr, right: Expr) -> Result<Expr, ConfigError> {
    if left.kind() != Kind::Bool || right.kind() != Kind::Bool {
        let sym = if op == BinOp::And { "&&" } else { "||" };
        return Err(ConfigError::InvalidExpression(format!(
            "`{sym}` requires boolean operands"
        )));
    }
    Ok(Expr::BinOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

/// A compiled matcher. Built once per model; evaluation never re-parses.
#[derive(Debug, Clone, PartialEq)]
pub struct Matcher {
    source: String,
    root: Expr,
}

impl Matcher {
    pub fn compile(source: &str, bindings: &Bindings<'_>) -> Result<Self, ConfigError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConfigError::InvalidExpression("empty expression".into()));
        }
        let mut parser = Parser::new(tokens, bindings);
        let root = parser.parse_expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(ConfigError::InvalidExpression(format!(
                "unexpected trailing token: {:?}",
                parser.tokens[parser.pos]
            )));
        }
        if root.kind() != Kind::Bool {
            return Err(ConfigError::InvalidExpression(
                "matcher must evaluate to a boolean".into(),
            ));
        }
        Ok(Self {
            source: source.trim().to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Evaluate against one request and one policy rule.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool, QueryFault> {
        eval_bool(&self.root, ctx)
    }
}

// ─── Evaluator ──────────────────────────────────────────────────────────

/// Answers role-membership calls for the evaluator.
pub trait RoleLookup {
    /// `relation` indexes the model's role definitions.
    fn has_role(&self, relation: usize, member: &str, role: &str, domain: Option<&str>) -> bool;
}

/// One request bound against one policy rule.
pub struct EvalContext<'a> {
    pub request: &'a [&'a str],
    pub rule: &'a [String],
    pub roles: &'a dyn RoleLookup,
}

#[derive(Debug, Clone)]
enum Value<'a> {
    Int(i64),
    Float(f64),
    Str(&'a str),
    /// A string taken from the policy rule; `*` matches anything.
    PolicyStr(&'a str),
    Bool(bool),
}

impl<'a> Value<'a> {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) | Value::PolicyStr(s) => s.trim().parse().ok(),
            Value::Bool(_) => None,
        }
    }

    fn as_text(&self) -> Option<Cow<'a, str>> {
        match self {
            Value::Str(s) | Value::PolicyStr(s) => Some(Cow::Borrowed(*s)),
            Value::Int(n) => Some(Cow::Owned(n.to_string())),
            Value::Float(f) => Some(Cow::Owned(f.to_string())),
            Value::Bool(_) => None,
        }
    }

    fn is_wildcard(&self) -> bool {
        matches!(self, Value::PolicyStr(s) if *s == WILDCARD)
    }
}

fn values_equal(l: &Value<'_>, r: &Value<'_>) -> bool {
    if l.is_wildcard() || r.is_wildcard() {
        return true;
    }
    match (l, r) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Str(a) | Value::PolicyStr(a), Value::Str(b) | Value::PolicyStr(b)) => a == b,
        (Value::Bool(_), _) | (_, Value::Bool(_)) => false,
        // at least one side is a number
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn eval_bool(expr: &Expr, ctx: &EvalContext<'_>) -> Result<bool, QueryFault> {
    match eval_value(expr, ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(QueryFault::Evaluation(format!(
            "expected a boolean, got {other:?}"
        ))),
    }
}

fn eval_value<'a>(expr: &'a Expr, ctx: &EvalContext<'a>) -> Result<Value<'a>, QueryFault> {
    match expr {
        Expr::Literal(lit) => Ok(match lit {
            LitValue::Int(n) => Value::Int(*n),
            LitValue::Float(f) => Value::Float(*f),
            LitValue::Str(s) => Value::Str(s),
            LitValue::Bool(b) => Value::Bool(*b),
        }),
        Expr::Attr(attr) => match attr.scope {
            Scope::Request => ctx
                .request
                .get(attr.index)
                .map(|s| Value::Str(*s))
                .ok_or_else(|| missing(attr)),
            Scope::Policy => ctx
                .rule
                .get(attr.index)
                .map(|s| Value::PolicyStr(s.as_str()))
                .ok_or_else(|| missing(attr)),
        },
        Expr::Not(inner) => Ok(Value::Bool(!eval_bool(inner, ctx)?)),
        Expr::In { element, items } => {
            let elem = eval_value(element, ctx)?;
            for item in items {
                if values_equal(&elem, &eval_value(item, ctx)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Call { func, args } => {
            let mut texts = Vec::with_capacity(args.len());
            for arg in args {
                let value = eval_value(arg, ctx)?;
                let text = value.as_text().ok_or_else(|| {
                    QueryFault::Evaluation("call arguments must be strings or numbers".into())
                })?;
                texts.push(text);
            }
            let result = match func {
                Func::Role(relation) => ctx.roles.has_role(
                    *relation,
                    &texts[0],
                    &texts[1],
                    texts.get(2).map(|d| &**d),
                ),
                Func::KeyMatch => key_match(&texts[0], &texts[1]),
                Func::KeyMatch2 => key_match2(&texts[0], &texts[1]),
            };
            Ok(Value::Bool(result))
        }
        Expr::BinOp { op, left, right } => match op {
            BinOp::And => Ok(Value::Bool(eval_bool(left, ctx)? && eval_bool(right, ctx)?)),
            BinOp::Or => Ok(Value::Bool(eval_bool(left, ctx)? || eval_bool(right, ctx)?)),
            BinOp::Eq | BinOp::Ne => {
                let l = eval_value(left, ctx)?;
                let r = eval_value(right, ctx)?;
                let eq = values_equal(&l, &r);
                Ok(Value::Bool(if *op == BinOp::Eq { eq } else { !eq }))
            }
            BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
                let l = eval_value(left, ctx)?;
                let r = eval_value(right, ctx)?;
                // non-numeric operands fail the match rather than the query
                let (Some(lf), Some(rf)) = (l.as_f64(), r.as_f64()) else {
                    return Ok(Value::Bool(false));
                };
                let result = match op {
                    BinOp::Gt => lf > rf,
                    BinOp::Lt => lf < rf,
                    BinOp::Ge => lf >= rf,
                    _ => lf <= rf,
                };
                Ok(Value::Bool(result))
            }
        },
    }
}

fn missing(attr: &Attr) -> QueryFault {
    QueryFault::Evaluation(format!(
        "{:?} attribute #{} is out of range",
        attr.scope, attr.index
    ))
}

/// `keyMatch("/foo/bar", "/foo/*")`: a `*` in the pattern matches any suffix.
pub fn key_match(key: &str, pattern: &str) -> bool {
    match pattern.find('*') {
        None => key == pattern,
        Some(i) => key.starts_with(&pattern[..i]),
    }
}

/// `keyMatch2("/users/42", "/users/:id")`: `:name` matches one path segment,
/// a `*` segment matches one or more segments, and a trailing `*` matches
/// the rest of the path.
pub fn key_match2(key: &str, pattern: &str) -> bool {
    let key_segs: Vec<&str> = key.split('/').collect();
    let pat_segs: Vec<&str> = pattern.split('/').collect();
    match_segments(&key_segs, &pat_segs)
}

fn match_segments(key: &[&str], pat: &[&str]) -> bool {
    let Some((first, rest)) = pat.split_first() else {
        return key.is_empty();
    };
    if rest.is_empty() {
        if let Some(prefix) = first.strip_suffix('*') {
            return !key.is_empty() && key.join("/").starts_with(prefix);
        }
    }
    if *first == "*" {
        return (1..=key.len()).any(|n| match_segments(&key[n..], rest));
    }
    let Some((seg, key_rest)) = key.split_first() else {
        return false;
    };
    let matched = if first.starts_with(':') && first.len() > 1 {
        !seg.is_empty()
    } else {
        seg == first
    };
    matched && match_segments(key_rest, rest)
}
