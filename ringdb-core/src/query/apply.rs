//! Row transforms listed under `apply`
//!
//! Steps run in order on every row that passed the value filter, before
//! `offset` and `limit`. Each step sees the row as the previous one left it.

use super::{QueryRow, QueryValue, RowSink};
use crate::{Result, RingError, Timestamp};
use std::collections::HashMap;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Nesting limit of `eval` expressions
const MAX_DEPTH: usize = 32;

/// One `apply` step
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyStep {
    /// Replace the row by an arithmetic expression over its columns
    Eval(Expr),
    /// Per-second change since the previous row of the same series
    Rate,
    Abs,
    /// Multiply column `i` by `weights[i]`; columns past the list are kept
    Scale(Vec<f64>),
    /// Collapse the row into the sum of its columns
    Sum { ignore_missing: bool },
    /// The `n` series with the largest time integral, emitted once the
    /// input ends
    Top(usize),
}

impl ApplyStep {
    /// Resolve `eval` names against the query's `columns` and check that
    /// every step gets rows it can handle
    pub fn bind(steps: &[ApplyStep], columns: &[String]) -> Result<Vec<ApplyStep>> {
        let mut width = columns.len();
        // names stay meaningful until a step reshapes the row
        let mut names = Some(columns);
        let mut bound = Vec::with_capacity(steps.len());

        for step in steps {
            let step = match step {
                ApplyStep::Eval(expr) => {
                    let cols = names.ok_or_else(|| bad("eval can not follow a step that reshapes rows"))?;
                    ApplyStep::Eval(expr.bind(cols)?)
                }
                ApplyStep::Top(_) if width != 1 => {
                    return Err(bad("top needs single-value rows"));
                }
                other => other.clone(),
            };
            if matches!(step, ApplyStep::Eval(_) | ApplyStep::Sum { .. } | ApplyStep::Top(_)) {
                width = 1;
                names = None;
            }
            bound.push(step);
        }
        Ok(bound)
    }
}

fn bad(msg: impl Into<String>) -> RingError {
    RingError::QueryParse(msg.into())
}

// ============================================================================
// Expressions
// ============================================================================

/// Binary operator of an `eval` expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Infix arithmetic over numbers and column names
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// Column name as written
    Name(String),
    /// Column position once bound
    Column(usize),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse `+ - * /`, unary minus and parentheses with the usual
    /// precedence
    pub fn parse(text: &str) -> Result<Expr> {
        let mut parser = ExprParser {
            tokens: tokenize(text)?,
            pos: 0,
        };
        let expr = parser.sum(0)?;
        match parser.tokens.get(parser.pos) {
            None => Ok(expr),
            Some(token) => Err(bad(format!("unexpected {} in expression", token))),
        }
    }

    fn bind(&self, columns: &[String]) -> Result<Expr> {
        Ok(match self {
            Expr::Name(name) => match columns.iter().position(|c| c == name) {
                Some(i) => Expr::Column(i),
                None => return Err(bad(format!("unknown column `{}`", name))),
            },
            Expr::Neg(inner) => Expr::Neg(Box::new(inner.bind(columns)?)),
            Expr::Binary(op, lhs, rhs) => {
                Expr::Binary(*op, Box::new(lhs.bind(columns)?), Box::new(rhs.bind(columns)?))
            }
            other => other.clone(),
        })
    }

    /// `None` when a referenced column holds no number
    pub fn eval(&self, values: &[QueryValue]) -> Option<f64> {
        match self {
            Expr::Number(v) => Some(*v),
            Expr::Name(_) => None,
            Expr::Column(i) => values.get(*i).and_then(QueryValue::as_f64),
            Expr::Neg(inner) => inner.eval(values).map(|v| -v),
            Expr::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(values)?, rhs.eval(values)?);
                Some(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Op(char),
    Open,
    Close,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(v) => write!(f, "number {}", v),
            Token::Name(name) => write!(f, "`{}`", name),
            Token::Op(c) => write!(f, "`{}`", c),
            Token::Open => f.write_str("`(`"),
            Token::Close => f.write_str("`)`"),
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '!'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | ':' | '!')
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if matches!(c, '+' | '-' | '*' | '/' | '(' | ')') {
            tokens.push(match c {
                '(' => Token::Open,
                ')' => Token::Close,
                op => Token::Op(op),
            });
            i += 1;
            continue;
        }

        let start = i;
        if c.is_ascii_digit() || c == '.' {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                i += 1;
                if i < chars.len() && matches!(chars[i], '+' | '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse()
                .map_err(|_| bad(format!("bad number `{}`", literal)))?;
            tokens.push(Token::Number(value));
        } else if is_name_start(c) {
            while i < chars.len() && is_name_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Name(chars[start..i].iter().collect()));
        } else {
            return Err(bad(format!("unexpected `{}` in expression", c)));
        }
    }

    if tokens.is_empty() {
        return Err(bad("empty expression"));
    }
    Ok(tokens)
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    /// Consume the next token if it is one of `ops`
    fn op(&mut self, ops: &[char]) -> Option<char> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(c)) if ops.contains(c) => {
                self.pos += 1;
                Some(*c)
            }
            _ => None,
        }
    }

    fn sum(&mut self, depth: usize) -> Result<Expr> {
        let mut lhs = self.product(depth)?;
        while let Some(c) = self.op(&['+', '-']) {
            let op = if c == '+' { BinOp::Add } else { BinOp::Sub };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.product(depth)?));
        }
        Ok(lhs)
    }

    fn product(&mut self, depth: usize) -> Result<Expr> {
        let mut lhs = self.unary(depth)?;
        while let Some(c) = self.op(&['*', '/']) {
            let op = if c == '*' { BinOp::Mul } else { BinOp::Div };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.unary(depth)?));
        }
        Ok(lhs)
    }

    fn unary(&mut self, depth: usize) -> Result<Expr> {
        if depth > MAX_DEPTH {
            return Err(bad("expression is nested too deeply"));
        }
        if self.op(&['-']).is_some() {
            return Ok(Expr::Neg(Box::new(self.unary(depth + 1)?)));
        }
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::Name(name)) => Ok(Expr::Name(name)),
            Some(Token::Open) => {
                let inner = self.sum(depth + 1)?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(bad("missing `)` in expression")),
                }
            }
            Some(token) => Err(bad(format!("unexpected {} in expression", token))),
            None => Err(bad("unexpected end of expression")),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Running state of one step
enum Node {
    Eval(Expr),
    Rate(HashMap<String, (Timestamp, Vec<QueryValue>)>),
    Abs,
    Scale(Vec<f64>),
    Sum { ignore_missing: bool },
    Top(TopN),
}

impl Node {
    fn new(step: &ApplyStep) -> Self {
        match step {
            ApplyStep::Eval(expr) => Node::Eval(expr.clone()),
            ApplyStep::Rate => Node::Rate(HashMap::new()),
            ApplyStep::Abs => Node::Abs,
            ApplyStep::Scale(weights) => Node::Scale(weights.clone()),
            ApplyStep::Sum { ignore_missing } => Node::Sum {
                ignore_missing: *ignore_missing,
            },
            ApplyStep::Top(n) => Node::Top(TopN::new(*n)),
        }
    }

    /// Transform `row`; `None` holds it back
    fn put(&mut self, mut row: QueryRow) -> Option<QueryRow> {
        match self {
            Node::Eval(expr) => {
                row.values = vec![expr.eval(&row.values).into()];
            }
            Node::Rate(last) => {
                let ts = row.time?;
                let (prev_ts, prev) = last.insert(row.series.clone(), (ts, row.values.clone()))?;
                if prev_ts == ts {
                    return None;
                }
                let dt = (ts as f64 - prev_ts as f64) / NANOS_PER_SEC;
                row.values = row
                    .values
                    .iter()
                    .zip(&prev)
                    .map(|(v, p)| match (v.as_f64(), p.as_f64()) {
                        (Some(v), Some(p)) => QueryValue::Float((v - p) / dt),
                        _ => QueryValue::Null,
                    })
                    .collect();
            }
            Node::Abs => {
                for value in &mut row.values {
                    if let QueryValue::Float(v) = value {
                        *v = v.abs();
                    }
                }
            }
            Node::Scale(weights) => {
                for (value, weight) in row.values.iter_mut().zip(weights.iter()) {
                    if let QueryValue::Float(v) = value {
                        *v *= weight;
                    }
                }
            }
            Node::Sum { ignore_missing } => {
                let total: Option<f64> = if *ignore_missing {
                    Some(row.values.iter().filter_map(QueryValue::as_f64).sum::<f64>())
                } else {
                    row.values.iter().map(QueryValue::as_f64).sum()
                };
                row.values = vec![total.into()];
            }
            Node::Top(top) => {
                top.add(&row);
                return None;
            }
        }
        Some(row)
    }

    /// Rows held until the input ended
    fn complete(&mut self) -> Vec<QueryRow> {
        match self {
            Node::Top(top) => top.drain(),
            _ => Vec::new(),
        }
    }
}

/// Per-series integral of value over time, in value-seconds
struct Integral {
    series: String,
    sum: f64,
    last: (Timestamp, f64),
}

struct TopN {
    n: usize,
    table: Vec<Integral>,
    by_series: HashMap<String, usize>,
}

impl TopN {
    fn new(n: usize) -> Self {
        Self {
            n,
            table: Vec::new(),
            by_series: HashMap::new(),
        }
    }

    fn add(&mut self, row: &QueryRow) {
        let (Some(ts), Some(v)) = (row.time, row.values.first().and_then(QueryValue::as_f64)) else {
            return;
        };
        match self.by_series.get(&row.series) {
            Some(&i) => {
                let entry = &mut self.table[i];
                let (prev_ts, prev) = entry.last;
                entry.sum += prev * (ts.abs_diff(prev_ts) as f64 / NANOS_PER_SEC);
                entry.last = (ts, v);
            }
            None => {
                self.by_series.insert(row.series.clone(), self.table.len());
                self.table.push(Integral {
                    series: row.series.clone(),
                    sum: 0.0,
                    last: (ts, v),
                });
            }
        }
    }

    /// Largest sums first; equal sums keep first-seen order
    fn drain(&mut self) -> Vec<QueryRow> {
        self.by_series.clear();
        let mut table = std::mem::take(&mut self.table);
        table.sort_by(|a, b| b.sum.total_cmp(&a.sum));
        table
            .into_iter()
            .take(self.n)
            .map(|e| QueryRow::new(e.series, e.last.0, vec![QueryValue::Float(e.sum)]))
            .collect()
    }
}

/// Runs rows through the `apply` steps on their way to `sink`
pub struct Pipeline<'a> {
    nodes: Vec<Node>,
    sink: &'a mut dyn RowSink,
}

impl<'a> Pipeline<'a> {
    pub fn new(steps: &[ApplyStep], sink: &'a mut dyn RowSink) -> Self {
        Self {
            nodes: steps.iter().map(Node::new).collect(),
            sink,
        }
    }

    fn forward(&mut self, start: usize, mut row: QueryRow) -> bool {
        for node in &mut self.nodes[start..] {
            match node.put(row) {
                Some(next) => row = next,
                None => return true,
            }
        }
        self.sink.emit(row)
    }

    /// Release rows held by steps that wait for the end of the input
    pub fn finish(&mut self) {
        for i in 0..self.nodes.len() {
            for row in self.nodes[i].complete() {
                if !self.forward(i + 1, row) {
                    return;
                }
            }
        }
    }
}

impl RowSink for Pipeline<'_> {
    fn emit(&mut self, row: QueryRow) -> bool {
        self.forward(0, row)
    }
}
