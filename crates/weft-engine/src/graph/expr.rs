//! Input binding expressions.
//!
//! A binding expression reads from the run context and nothing else:
//!
//! ```text
//! expr    := concat ( "??" concat )*
//! concat  := primary ( "+" primary )*
//! primary := literal | path | "(" expr ")"
//! literal := 'string' | "string" | number | true | false | null
//! path    := "context" ( ".inputs" | ".steps" )? "." name ( "." name | "[" index "]" )*
//! ```
//!
//! `context.<name>` reads the output of step `<name>` if it has produced one,
//! otherwise the run input `<name>`. There are no function calls.

use std::fmt;

use serde_json::Value;

use weft_core::error::EvalError;

use crate::context::ContextSnapshot;

const MAX_SOURCE_LEN: usize = 4096;
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Inputs,
    Steps,
    /// `context.<name>`: step output first, then input.
    Either,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// A `context.*` reference.
#[derive(Debug, Clone, PartialEq)]
pub struct PathRef {
    pub scope: Scope,
    pub head: String,
    pub segments: Vec<Segment>,
}

impl fmt::Display for PathRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Inputs => write!(f, "context.inputs.{}", self.head)?,
            Scope::Steps => write!(f, "context.steps.{}", self.head)?,
            Scope::Either => write!(f, "context.{}", self.head)?,
        }
        for seg in &self.segments {
            match seg {
                Segment::Field(name) => write!(f, ".{}", name)?,
                Segment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Path(PathRef),
    Concat(Box<Node>, Box<Node>),
    Coalesce(Box<Node>, Box<Node>),
}

impl Node {
    fn depth(&self) -> usize {
        match self {
            Node::Literal(_) | Node::Path(_) => 1,
            Node::Concat(l, r) | Node::Coalesce(l, r) => 1 + l.depth().max(r.depth()),
        }
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a PathRef>) {
        match self {
            Node::Literal(_) => {}
            Node::Path(p) => out.push(p),
            Node::Concat(l, r) | Node::Coalesce(l, r) => {
                l.collect_paths(out);
                r.collect_paths(out);
            }
        }
    }
}

/// A parsed binding expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, String> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(format!("expression longer than {} bytes", MAX_SOURCE_LEN));
        }
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty expression".into());
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_expr()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected {} after expression", tok));
        }
        if root.depth() > MAX_DEPTH {
            return Err("expression nested too deeply".into());
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every `context.*` reference in the expression.
    pub fn paths(&self) -> Vec<&PathRef> {
        let mut out = Vec::new();
        self.root.collect_paths(&mut out);
        out
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Evaluate an expression against a context snapshot. Pure: the same
/// expression and snapshot always give the same result.
pub fn evaluate(expr: &Expression, ctx: &ContextSnapshot) -> Result<Value, EvalError> {
    eval_node(&expr.root, ctx)
}

fn eval_node(node: &Node, ctx: &ContextSnapshot) -> Result<Value, EvalError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Path(path) => resolve_path(path, ctx),
        Node::Concat(l, r) => {
            let left = eval_node(l, ctx)?;
            let right = eval_node(r, ctx)?;
            if !left.is_string() && !right.is_string() {
                return Err(EvalError::TypeMismatch {
                    expected: "string".into(),
                    found: type_name(&left).into(),
                });
            }
            let mut out = render(&left)?;
            out.push_str(&render(&right)?);
            Ok(Value::String(out))
        }
        Node::Coalesce(l, r) => match eval_node(l, ctx) {
            Ok(Value::Null) | Err(EvalError::PathNotFound(_)) => eval_node(r, ctx),
            other => other,
        },
    }
}

fn resolve_path(path: &PathRef, ctx: &ContextSnapshot) -> Result<Value, EvalError> {
    let not_found = || EvalError::PathNotFound(path.to_string());

    let base = match path.scope {
        Scope::Inputs => ctx.input(&path.head),
        Scope::Steps => ctx.output(&path.head),
        Scope::Either => ctx.output(&path.head).or_else(|| ctx.input(&path.head)),
    }
    .ok_or_else(not_found)?;

    let mut current = base;
    for seg in &path.segments {
        current = match (seg, current) {
            (_, Value::Null) => return Err(not_found()),
            (Segment::Field(name), Value::Object(map)) => map.get(name).ok_or_else(not_found)?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i).ok_or_else(not_found)?,
            (Segment::Field(_), other) => {
                return Err(EvalError::TypeMismatch {
                    expected: "object".into(),
                    found: type_name(other).into(),
                })
            }
            (Segment::Index(_), other) => {
                return Err(EvalError::TypeMismatch {
                    expected: "array".into(),
                    found: type_name(other).into(),
                })
            }
        };
    }
    Ok(current.clone())
}

fn render(v: &Value) -> Result<String, EvalError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(EvalError::TypeMismatch {
            expected: "string, number or boolean".into(),
            found: type_name(other).into(),
        }),
    }
}

pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// --- Lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(Value),
    Ident(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Plus,
    Coalesce,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Str(s) => write!(f, "string '{}'", s),
            Token::Num(n) => write!(f, "number {}", n),
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::Dot => f.write_str("'.'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Plus => f.write_str("'+'"),
            Token::Coalesce => f.write_str("'??'"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '?' => {
                chars.next();
                match chars.next() {
                    Some((_, '?')) => tokens.push(Token::Coalesce),
                    _ => return Err(format!("expected '??' at offset {}", i)),
                }
            }
            '\'' | '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, other)) => s.push(other),
                            None => break,
                        },
                        ch if ch == c => {
                            closed = true;
                            break;
                        }
                        ch => s.push(ch),
                    }
                }
                if !closed {
                    return Err(format!("unterminated string starting at offset {}", i));
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Num(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '-' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character '{}' at offset {}", other, i)),
        }
    }
    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Value, String> {
    let invalid = || format!("invalid number '{}'", text);
    if text.contains('.') {
        let f: f64 = text.parse().map_err(|_| invalid())?;
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(invalid)
    } else {
        text.parse::<i64>().map(Value::from).map_err(|_| invalid())
    }
}

// --- Parser ---

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(format!("expected {}, found {}", want, tok)),
            None => Err(format!("expected {}, found end of expression", want)),
        }
    }

    fn parse_expr(&mut self) -> Result<Node, String> {
        let mut left = self.parse_concat()?;
        while self.peek() == Some(&Token::Coalesce) {
            self.pos += 1;
            let right = self.parse_concat()?;
            left = Node::Coalesce(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Node, String> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Token::Plus) {
            self.pos += 1;
            let right = self.parse_primary()?;
            left = Node::Concat(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Node, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Node::Literal(n)),
            Some(Token::LParen) => {
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    return Err("expression nested too deeply".into());
                }
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::Ident(id)) => match id.as_str() {
                "true" => Ok(Node::Literal(Value::Bool(true))),
                "false" => Ok(Node::Literal(Value::Bool(false))),
                "null" => Ok(Node::Literal(Value::Null)),
                "context" => self.parse_path().map(Node::Path),
                other => Err(format!(
                    "unknown identifier '{}' (paths start with 'context')",
                    other
                )),
            },
            Some(tok) => Err(format!("unexpected {}", tok)),
            None => Err("unexpected end of expression".into()),
        }
    }

    fn parse_field(&mut self) -> Result<String, String> {
        self.expect(Token::Dot)?;
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            Some(tok) => Err(format!("expected a name after '.', found {}", tok)),
            None => Err("expected a name after '.'".into()),
        }
    }

    fn parse_path(&mut self) -> Result<PathRef, String> {
        let first = self.parse_field()?;
        let (scope, head) = match first.as_str() {
            "inputs" => (Scope::Inputs, self.parse_field()?),
            "steps" => (Scope::Steps, self.parse_field()?),
            _ => (Scope::Either, first),
        };

        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => segments.push(Segment::Field(self.parse_field()?)),
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = match self.next() {
                        Some(Token::Num(Value::Number(n))) => n
                            .as_u64()
                            .ok_or_else(|| format!("invalid index {}", n))?,
                        Some(tok) => return Err(format!("expected an index, found {}", tok)),
                        None => return Err("expected an index".into()),
                    };
                    self.expect(Token::RBracket)?;
                    segments.push(Segment::Index(index as usize));
                }
                _ => break,
            }
        }

        Ok(PathRef {
            scope,
            head,
            segments,
        })
    }
}
