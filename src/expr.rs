//! Match-expression evaluation.
//!
//! A rule's match expression runs once per scheduled evaluation against the
//! search response and emits zero or more [`MatchEvent`]s through two host
//! mutators, `signalActive(match_key?)` and `signalResolved(match_key?)`.
//! The expression source is written in a small sandboxed mini-language; the
//! engine only depends on the [`MatchExpression`] trait, so a different
//! evaluator can be plugged in without touching the pipeline.
//!
//! The language binds four roots: `es` (search response), `tmp` (scratch
//! variables carried into the emitted event), `P` (rule params) and
//! `ALERT_ID` (the current match key). Rule authors may write the roots as
//! `${es...}` placeholders; those are rewritten to direct references at
//! compile time, not substituted as text.
//!
//! # Example
//!
//! ```ignore
//! for server in ${es.aggregations['2'].buckets} {
//!     ALERT_ID = server.key;
//!     tmp.server_ip = server.key;
//!     tmp.response_time = round(server['1'].value, 2);
//!     if server['1'].value > 5 {
//!         signalActive();
//!     } else {
//!         signalResolved();
//!     }
//! }
//! ```

use serde_json::{Map, Number, Value};

use crate::error::ExpressionError;

/// Hard cap on events emitted by one evaluation pass.
///
/// Guards against a buggy or adversarial expression looping unboundedly;
/// once reached the remainder of the pass is abandoned and a warning logged.
pub const MAX_EVENTS_PER_PASS: usize = 100;

/// Direction of one evaluator-emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The rule condition is satisfied (`signalActive`).
    Positive,
    /// The rule condition is resolved (`signalResolved`).
    Negative,
}

/// One signal emitted by an evaluation pass.
///
/// `variables` is a deep-copied snapshot of `tmp` taken at emission time, so
/// later mutation by the expression cannot retroactively change it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
    pub signal: Signal,
    /// Author-supplied per-item key, e.g. one bucket of an aggregation.
    pub match_key: Option<String>,
    /// Snapshot of the expression's `tmp` variables, visible to templates.
    pub variables: Map<String, Value>,
}

impl MatchEvent {
    pub fn is_positive(&self) -> bool {
        self.signal == Signal::Positive
    }
}

/// Outcome of one evaluation pass.
///
/// Events collected before an error or the cap are still valid and must be
/// processed by the caller; `error` only means the remainder of the pass was
/// abandoned.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub events: Vec<MatchEvent>,
    /// True when the pass was abandoned at [`MAX_EVENTS_PER_PASS`].
    pub capped: bool,
    pub error: Option<ExpressionError>,
}

/// Read-only context an expression (or a `${...}` placeholder) is bound to.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExprContext<'a> {
    /// Current search response, bound as `es`.
    pub response: Option<&'a Value>,
    /// Rule params, bound as `P`.
    pub params: Option<&'a Value>,
    /// Current match event's variables, bound as `tmp`.
    pub tmp: Option<&'a Map<String, Value>>,
    /// Current match key, bound as `ALERT_ID`.
    pub alert_id: Option<&'a str>,
    /// Extra synthetic bindings (e.g. `CURRENT_TIME_MS` for query templates).
    pub consts: Option<&'a Map<String, Value>>,
}

/// A compiled match expression, ready to run against a search response.
///
/// Implementations must be computation-only (no I/O, no suspension) and must
/// honor [`MAX_EVENTS_PER_PASS`].
pub trait MatchExpression: Send + Sync {
    fn evaluate(&self, ctx: ExprContext<'_>) -> Evaluation;
}

/// Evaluate a single expression string against a context.
///
/// This is what the template renderer uses for each `${...}` placeholder.
pub fn eval_str(source: &str, ctx: ExprContext<'_>) -> Result<Value, ExpressionError> {
    let expr = Parser::new(source).parse_single_expression()?;
    let mut interp = Interp::new(ctx);
    interp.eval(&expr)
}

/// Convert an expression value to its placeholder string form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Compiled script
// ---------------------------------------------------------------------------

/// A compiled mini-language script.
#[derive(Debug)]
pub struct Script {
    program: Vec<Stmt>,
}

impl Script {
    /// Compile expression source.
    ///
    /// `${root...}` placeholders are rewritten to direct references before
    /// parsing, matching the renderer's context-binding convention.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        let bound = strip_placeholders(source);
        let program = Parser::new(&bound).parse_program()?;
        Ok(Script { program })
    }
}

impl MatchExpression for Script {
    fn evaluate(&self, ctx: ExprContext<'_>) -> Evaluation {
        let mut interp = Interp::new(ctx);
        let mut error = None;
        match interp.exec_block(&self.program) {
            Ok(_) => {}
            Err(e) => error = Some(e),
        }
        Evaluation {
            events: interp.events,
            capped: interp.capped,
            error,
        }
    }
}

/// Rewrite `${path}` placeholders to bare references.
///
/// Nested braces are not part of the placeholder syntax, same as the
/// renderer's matching rule.
fn strip_placeholders(source: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^{}]*)\}").expect("static regex");
    re.replace_all(source, "$1").into_owned()
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Stmt {
    /// `tmp.name = expr` or `ALERT_ID = expr`.
    Assign { target: Target, value: Expr },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
    },
    /// `signalActive(key?)` / `signalResolved(key?)`.
    Signal { signal: Signal, key: Option<Expr> },
}

#[derive(Debug, Clone)]
enum Target {
    AlertId,
    Tmp(String),
}

#[derive(Debug, Clone)]
enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Var(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(f64),
    Str(String),
    Punct(&'static str),
    Eof,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        loop {
            while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            // Line comments, // to end of line.
            if self.pos + 1 < self.src.len()
                && self.src[self.pos] == b'/'
                && self.src[self.pos + 1] == b'/'
            {
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
    }

    fn next(&mut self) -> Result<(Tok, usize), ExpressionError> {
        self.skip_ws();
        let start = self.pos;
        if self.pos >= self.src.len() {
            return Ok((Tok::Eof, start));
        }
        let c = self.src[self.pos];

        if c.is_ascii_alphabetic() || c == b'_' {
            let mut end = self.pos;
            while end < self.src.len()
                && (self.src[end].is_ascii_alphanumeric() || self.src[end] == b'_')
            {
                end += 1;
            }
            let ident = std::str::from_utf8(&self.src[self.pos..end])
                .map_err(|_| self.error("invalid utf-8 in identifier"))?
                .to_string();
            self.pos = end;
            return Ok((Tok::Ident(ident), start));
        }

        if c.is_ascii_digit() {
            let mut end = self.pos;
            while end < self.src.len()
                && (self.src[end].is_ascii_digit() || self.src[end] == b'.')
            {
                end += 1;
            }
            let text = std::str::from_utf8(&self.src[self.pos..end])
                .map_err(|_| self.error("invalid utf-8 in number"))?;
            let num: f64 = text
                .parse()
                .map_err(|_| self.error(format!("invalid number '{}'", text)))?;
            self.pos = end;
            return Ok((Tok::Num(num), start));
        }

        if c == b'\'' || c == b'"' {
            let quote = c;
            let mut end = self.pos + 1;
            // Collect raw bytes and decode once, so multi-byte UTF-8
            // sequences in literals come through intact.
            let mut out = Vec::new();
            while end < self.src.len() && self.src[end] != quote {
                if self.src[end] == b'\\' && end + 1 < self.src.len() {
                    end += 1;
                    out.push(match self.src[end] {
                        b'n' => b'\n',
                        b't' => b'\t',
                        other => other,
                    });
                } else {
                    out.push(self.src[end]);
                }
                end += 1;
            }
            if end >= self.src.len() {
                return Err(self.error("unterminated string literal"));
            }
            let text = String::from_utf8(out)
                .map_err(|_| self.error("invalid utf-8 in string literal"))?;
            self.pos = end + 1;
            return Ok((Tok::Str(text), start));
        }

        // Two-character operators first.
        let two: &[(&[u8], &'static str)] = &[
            (b"==", "=="),
            (b"!=", "!="),
            (b"<=", "<="),
            (b">=", ">="),
            (b"&&", "&&"),
            (b"||", "||"),
        ];
        for (bytes, punct) in two {
            if self.src[self.pos..].starts_with(bytes) {
                self.pos += 2;
                return Ok((Tok::Punct(punct), start));
            }
        }

        let one: &[(u8, &'static str)] = &[
            (b'(', "("),
            (b')', ")"),
            (b'{', "{"),
            (b'}', "}"),
            (b'[', "["),
            (b']', "]"),
            (b'.', "."),
            (b',', ","),
            (b';', ";"),
            (b'=', "="),
            (b'<', "<"),
            (b'>', ">"),
            (b'+', "+"),
            (b'-', "-"),
            (b'*', "*"),
            (b'/', "/"),
            (b'%', "%"),
            (b'!', "!"),
        ];
        for (byte, punct) in one {
            if c == *byte {
                self.pos += 1;
                return Ok((Tok::Punct(punct), start));
            }
        }

        Err(self.error(format!("unexpected character '{}'", c as char)))
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    lex_error: Option<ExpressionError>,
}

impl Parser {
    fn new(source: &str) -> Self {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        let mut lex_error = None;
        loop {
            match lexer.next() {
                Ok((Tok::Eof, off)) => {
                    tokens.push((Tok::Eof, off));
                    break;
                }
                Ok(tok) => tokens.push(tok),
                Err(e) => {
                    lex_error = Some(e);
                    tokens.push((Tok::Eof, 0));
                    break;
                }
            }
        }
        Parser {
            tokens,
            pos: 0,
            lex_error,
        }
    }

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].0
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].1
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens[self.pos].0.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Parse {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), ExpressionError> {
        match self.bump() {
            Tok::Punct(p) if p == punct => Ok(()),
            other => Err(self.error(format!("expected '{}', found {:?}", punct, other))),
        }
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Tok::Punct(p) if *p == punct) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn parse_program(mut self) -> Result<Vec<Stmt>, ExpressionError> {
        if let Some(e) = self.lex_error.take() {
            return Err(e);
        }
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Tok::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_single_expression(mut self) -> Result<Expr, ExpressionError> {
        if let Some(e) = self.lex_error.take() {
            return Err(e);
        }
        let expr = self.parse_expr()?;
        if !matches!(self.peek(), Tok::Eof) {
            return Err(self.error("trailing input after expression"));
        }
        Ok(expr)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ExpressionError> {
        match self.peek().clone() {
            Tok::Ident(ident) => match ident.as_str() {
                "if" => self.parse_if(),
                "for" => self.parse_for(),
                "signalActive" => self.parse_signal(Signal::Positive),
                "signalResolved" => self.parse_signal(Signal::Negative),
                "ALERT_ID" => {
                    self.bump();
                    self.expect_punct("=")?;
                    let value = self.parse_expr()?;
                    self.eat_punct(";");
                    Ok(Stmt::Assign {
                        target: Target::AlertId,
                        value,
                    })
                }
                "tmp" => {
                    self.bump();
                    self.expect_punct(".")?;
                    let name = match self.bump() {
                        Tok::Ident(name) => name,
                        other => {
                            return Err(self.error(format!(
                                "expected field name after 'tmp.', found {:?}",
                                other
                            )))
                        }
                    };
                    self.expect_punct("=")?;
                    let value = self.parse_expr()?;
                    self.eat_punct(";");
                    Ok(Stmt::Assign {
                        target: Target::Tmp(name),
                        value,
                    })
                }
                other => Err(self.error(format!(
                    "expected statement, found identifier '{}'",
                    other
                ))),
            },
            other => Err(self.error(format!("expected statement, found {:?}", other))),
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ExpressionError> {
        self.expect_punct("{")?;
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Tok::Punct("}")) {
            if matches!(self.peek(), Tok::Eof) {
                return Err(self.error("unterminated block, expected '}'"));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.bump();
        Ok(stmts)
    }

    fn parse_if(&mut self) -> Result<Stmt, ExpressionError> {
        self.bump(); // if
        let cond = self.parse_expr()?;
        let then = self.parse_block()?;
        let otherwise = if matches!(self.peek(), Tok::Ident(i) if i == "else") {
            self.bump();
            if matches!(self.peek(), Tok::Ident(i) if i == "if") {
                vec![self.parse_if()?]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            cond,
            then,
            otherwise,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ExpressionError> {
        self.bump(); // for
        let var = match self.bump() {
            Tok::Ident(name) => name,
            other => return Err(self.error(format!("expected loop variable, found {:?}", other))),
        };
        match self.bump() {
            Tok::Ident(kw) if kw == "in" => {}
            other => return Err(self.error(format!("expected 'in', found {:?}", other))),
        }
        let iter = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::For { var, iter, body })
    }

    fn parse_signal(&mut self, signal: Signal) -> Result<Stmt, ExpressionError> {
        self.bump(); // signalActive / signalResolved
        self.expect_punct("(")?;
        let key = if matches!(self.peek(), Tok::Punct(")")) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect_punct(")")?;
        self.eat_punct(";");
        Ok(Stmt::Signal { signal, key })
    }

    fn parse_expr(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_and()?;
        while self.eat_punct("||") {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_cmp()?;
        while self.eat_punct("&&") {
            let rhs = self.parse_cmp()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExpressionError> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Tok::Punct("==") => BinOp::Eq,
            Tok::Punct("!=") => BinOp::Ne,
            Tok::Punct("<") => BinOp::Lt,
            Tok::Punct("<=") => BinOp::Le,
            Tok::Punct(">") => BinOp::Gt,
            Tok::Punct(">=") => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.parse_add()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Tok::Punct("+") => BinOp::Add,
                Tok::Punct("-") => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Punct("*") => BinOp::Mul,
                Tok::Punct("/") => BinOp::Div,
                Tok::Punct("%") => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat_punct("!") {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat_punct("-") {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                match self.bump() {
                    Tok::Ident(name) => expr = Expr::Field(Box::new(expr), name),
                    other => {
                        return Err(self.error(format!("expected field name, found {:?}", other)))
                    }
                }
            } else if self.eat_punct("[") {
                let index = self.parse_expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.bump() {
            Tok::Num(n) => Ok(Expr::Num(n)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::Ident(ident) => match ident.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ => {
                    if self.eat_punct("(") {
                        let mut args = Vec::new();
                        if !matches!(self.peek(), Tok::Punct(")")) {
                            loop {
                                args.push(self.parse_expr()?);
                                if !self.eat_punct(",") {
                                    break;
                                }
                            }
                        }
                        self.expect_punct(")")?;
                        Ok(Expr::Call(ident, args))
                    } else {
                        Ok(Expr::Var(ident))
                    }
                }
            },
            Tok::Punct("(") => {
                let expr = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            other => Err(self.error(format!("expected expression, found {:?}", other))),
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    /// Event cap reached, abandon the rest of the pass.
    Capped,
}

struct Interp<'a> {
    response: Option<&'a Value>,
    params: Option<&'a Value>,
    consts: Option<&'a Map<String, Value>>,
    tmp: Map<String, Value>,
    alert_id: Option<String>,
    locals: Vec<(String, Value)>,
    events: Vec<MatchEvent>,
    capped: bool,
}

impl<'a> Interp<'a> {
    fn new(ctx: ExprContext<'a>) -> Self {
        Interp {
            response: ctx.response,
            params: ctx.params,
            consts: ctx.consts,
            tmp: ctx.tmp.cloned().unwrap_or_default(),
            alert_id: ctx.alert_id.map(str::to_string),
            locals: Vec::new(),
            events: Vec::new(),
            capped: false,
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, ExpressionError> {
        for stmt in stmts {
            if let Flow::Capped = self.exec(stmt)? {
                return Ok(Flow::Capped);
            }
        }
        Ok(Flow::Continue)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ExpressionError> {
        match stmt {
            Stmt::Assign { target, value } => {
                let value = self.eval(value)?;
                match target {
                    Target::AlertId => self.alert_id = Some(value_to_string(&value)),
                    Target::Tmp(name) => {
                        self.tmp.insert(name.clone(), value);
                    }
                }
                Ok(Flow::Continue)
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.eval(cond)?;
                if truthy(&cond) {
                    self.exec_block(then)
                } else {
                    self.exec_block(otherwise)
                }
            }
            Stmt::For { var, iter, body } => {
                let iter = self.eval(iter)?;
                let items = match iter {
                    Value::Array(items) => items,
                    other => {
                        return Err(ExpressionError::eval(format!(
                            "for loop expects an array, found {}",
                            type_name(&other)
                        )))
                    }
                };
                for item in items {
                    self.locals.push((var.clone(), item));
                    let flow = self.exec_block(body);
                    self.locals.pop();
                    if let Flow::Capped = flow? {
                        return Ok(Flow::Capped);
                    }
                }
                Ok(Flow::Continue)
            }
            Stmt::Signal { signal, key } => {
                if self.events.len() >= MAX_EVENTS_PER_PASS {
                    self.capped = true;
                    return Ok(Flow::Capped);
                }
                let match_key = match key {
                    Some(expr) => Some(value_to_string(&self.eval(expr)?)),
                    None => self.alert_id.clone(),
                };
                self.events.push(MatchEvent {
                    signal: *signal,
                    match_key,
                    variables: self.tmp.clone(),
                });
                Ok(Flow::Continue)
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Num(n) => Ok(number(*n)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Var(name) => self.lookup(name),
            Expr::Field(base, field) => {
                let base = self.eval(base)?;
                match base {
                    Value::Object(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
                    other => Err(ExpressionError::eval(format!(
                        "cannot read field '{}' of {}",
                        field,
                        type_name(&other)
                    ))),
                }
            }
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                match (&base, &index) {
                    (Value::Array(items), Value::Number(n)) => {
                        let i = n.as_f64().unwrap_or(f64::NAN);
                        if i.fract() != 0.0 {
                            return Err(ExpressionError::eval(format!(
                                "array index must be an integer, got {}",
                                i
                            )));
                        }
                        if i >= 0.0 && (i as usize) < items.len() {
                            Ok(items[i as usize].clone())
                        } else {
                            Ok(Value::Null)
                        }
                    }
                    (Value::Object(map), Value::String(key)) => {
                        Ok(map.get(key).cloned().unwrap_or(Value::Null))
                    }
                    _ => Err(ExpressionError::eval(format!(
                        "cannot index {} with {}",
                        type_name(&base),
                        type_name(&index)
                    ))),
                }
            }
            Expr::Not(inner) => {
                let inner = self.eval(inner)?;
                Ok(Value::Bool(!truthy(&inner)))
            }
            Expr::Neg(inner) => {
                let inner = self.eval(inner)?;
                Ok(number(-as_number(&inner)?))
            }
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs),
            Expr::Call(name, args) => self.eval_call(name, args),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, ExpressionError> {
        // Loop variables shadow everything, innermost first.
        for (var, value) in self.locals.iter().rev() {
            if var == name {
                return Ok(value.clone());
            }
        }
        match name {
            "es" => self
                .response
                .cloned()
                .ok_or_else(|| ExpressionError::UnknownVariable("es".to_string())),
            "P" => Ok(self.params.cloned().unwrap_or(Value::Null)),
            "tmp" => Ok(Value::Object(self.tmp.clone())),
            "ALERT_ID" => Ok(self
                .alert_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null)),
            other => {
                if let Some(consts) = self.consts {
                    if let Some(value) = consts.get(other) {
                        return Ok(value.clone());
                    }
                }
                Err(ExpressionError::UnknownVariable(other.to_string()))
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Value, ExpressionError> {
        // Short-circuit logic before evaluating the right side.
        if op == BinOp::And {
            let lhs = self.eval(lhs)?;
            if !truthy(&lhs) {
                return Ok(Value::Bool(false));
            }
            let rhs = self.eval(rhs)?;
            return Ok(Value::Bool(truthy(&rhs)));
        }
        if op == BinOp::Or {
            let lhs = self.eval(lhs)?;
            if truthy(&lhs) {
                return Ok(Value::Bool(true));
            }
            let rhs = self.eval(rhs)?;
            return Ok(Value::Bool(truthy(&rhs)));
        }

        let lhs = self.eval(lhs)?;
        let rhs = self.eval(rhs)?;
        match op {
            BinOp::Add => match (&lhs, &rhs) {
                (Value::Number(_), Value::Number(_)) => {
                    Ok(number(as_number(&lhs)? + as_number(&rhs)?))
                }
                (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
                    "{}{}",
                    value_to_string(&lhs),
                    value_to_string(&rhs)
                ))),
                _ => Err(ExpressionError::eval(format!(
                    "cannot add {} and {}",
                    type_name(&lhs),
                    type_name(&rhs)
                ))),
            },
            BinOp::Sub => Ok(number(as_number(&lhs)? - as_number(&rhs)?)),
            BinOp::Mul => Ok(number(as_number(&lhs)? * as_number(&rhs)?)),
            BinOp::Div => {
                let divisor = as_number(&rhs)?;
                if divisor == 0.0 {
                    return Err(ExpressionError::eval("division by zero"));
                }
                Ok(number(as_number(&lhs)? / divisor))
            }
            BinOp::Rem => {
                let divisor = as_number(&rhs)?;
                if divisor == 0.0 {
                    return Err(ExpressionError::eval("division by zero"));
                }
                Ok(number(as_number(&lhs)? % divisor))
            }
            BinOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
            BinOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = compare(&lhs, &rhs)?;
                Ok(Value::Bool(match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                }))
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr]) -> Result<Value, ExpressionError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        match name {
            "len" => {
                if values.len() != 1 {
                    return Err(ExpressionError::eval("len() takes one argument"));
                }
                let len = match &values[0] {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    other => {
                        return Err(ExpressionError::eval(format!(
                            "len() of {}",
                            type_name(other)
                        )))
                    }
                };
                Ok(number(len as f64))
            }
            "round" => {
                let (value, digits) = match values.len() {
                    1 => (as_number(&values[0])?, 0),
                    2 => (as_number(&values[0])?, as_number(&values[1])? as i32),
                    _ => return Err(ExpressionError::eval("round() takes one or two arguments")),
                };
                let factor = 10f64.powi(digits);
                Ok(number((value * factor).round() / factor))
            }
            other => Err(ExpressionError::eval(format!("unknown function '{}'", other))),
        }
    }
}

fn number(n: f64) -> Value {
    // Preserve integer form where possible so templates render "3" not "3.0".
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn as_number(value: &Value) -> Result<f64, ExpressionError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExpressionError::eval("number out of range")),
        other => Err(ExpressionError::eval(format!(
            "expected a number, found {}",
            type_name(other)
        ))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| ExpressionError::eval("cannot compare NaN"))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExpressionError::eval(format!(
            "cannot compare {} with {}",
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(source: &str, response: &Value) -> Evaluation {
        let script = Script::compile(source).expect("compile");
        script.evaluate(ExprContext {
            response: Some(response),
            ..Default::default()
        })
    }

    fn run_with_params(source: &str, response: &Value, params: &Value) -> Evaluation {
        let script = Script::compile(source).expect("compile");
        script.evaluate(ExprContext {
            response: Some(response),
            params: Some(params),
            ..Default::default()
        })
    }

    #[test]
    fn simple_threshold_signals_active() {
        let response = json!({"hits": {"total": 12}});
        let result = run(
            "if ${es.hits.total} > 10 { signalActive(); } else { signalResolved(); }",
            &response,
        );
        assert!(result.error.is_none());
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].signal, Signal::Positive);
        assert_eq!(result.events[0].match_key, None);
    }

    #[test]
    fn below_threshold_signals_resolved() {
        let response = json!({"hits": {"total": 3}});
        let result = run(
            "if es.hits.total > 10 { signalActive(); } else { signalResolved(); }",
            &response,
        );
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].signal, Signal::Negative);
    }

    #[test]
    fn aggregation_loop_emits_per_bucket_events() {
        let response = json!({
            "aggregations": {"2": {"buckets": [
                {"key": "host-a", "1": {"value": 7.251}},
                {"key": "host-b", "1": {"value": 1.2}},
            ]}}
        });
        let source = r#"
            for server in ${es.aggregations['2'].buckets} {
                ALERT_ID = server.key;
                tmp.server_ip = server.key;
                tmp.response_time = round(server['1'].value, 2);
                if server['1'].value > 5 {
                    signalActive();
                } else {
                    signalResolved();
                }
            }
        "#;
        let result = run(source, &response);
        assert!(result.error.is_none(), "error: {:?}", result.error);
        assert_eq!(result.events.len(), 2);

        assert_eq!(result.events[0].signal, Signal::Positive);
        assert_eq!(result.events[0].match_key.as_deref(), Some("host-a"));
        assert_eq!(result.events[0].variables["server_ip"], json!("host-a"));
        assert_eq!(result.events[0].variables["response_time"], json!(7.25));

        assert_eq!(result.events[1].signal, Signal::Negative);
        assert_eq!(result.events[1].match_key.as_deref(), Some("host-b"));
    }

    #[test]
    fn explicit_signal_keys_produce_independent_events() {
        let response = json!({});
        let result = run(
            r#"signalActive("host-a"); signalActive("host-b");"#,
            &response,
        );
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.events[0].match_key.as_deref(), Some("host-a"));
        assert_eq!(result.events[1].match_key.as_deref(), Some("host-b"));
    }

    #[test]
    fn variables_are_snapshotted_at_emission() {
        let response = json!({});
        let result = run(
            r#"
                tmp.host = "a";
                signalActive("first");
                tmp.host = "b";
                signalActive("second");
            "#,
            &response,
        );
        assert_eq!(result.events[0].variables["host"], json!("a"));
        assert_eq!(result.events[1].variables["host"], json!("b"));
    }

    #[test]
    fn event_cap_abandons_remainder_but_keeps_collected() {
        let response = json!({"items": (0..300).collect::<Vec<u32>>()});
        let result = run(
            "for item in es.items { ALERT_ID = item; signalActive(); }",
            &response,
        );
        assert!(result.capped);
        assert!(result.error.is_none());
        assert_eq!(result.events.len(), MAX_EVENTS_PER_PASS);
    }

    #[test]
    fn runtime_error_keeps_collected_events() {
        let response = json!({"hits": {"total": 1}});
        let result = run(
            "signalActive('early'); tmp.x = es.hits.total.deeper;",
            &response,
        );
        assert!(result.error.is_some());
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].match_key.as_deref(), Some("early"));
    }

    #[test]
    fn params_are_visible_as_p_root() {
        let response = json!({"hits": {"total": 42}});
        let params = json!({"threshold": 40});
        let result = run_with_params(
            "if ${es.hits.total} > ${P.threshold} { signalActive(); }",
            &response,
            &params,
        );
        assert_eq!(result.events.len(), 1);
    }

    #[test]
    fn zero_events_is_a_noop_pass() {
        let response = json!({"hits": {"total": 1}});
        let result = run("if es.hits.total > 10 { signalActive(); }", &response);
        assert!(result.events.is_empty());
        assert!(result.error.is_none());
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let result = run("tmp.x = bogus;", &json!({}));
        assert!(matches!(
            result.error,
            Some(ExpressionError::UnknownVariable(ref name)) if name == "bogus"
        ));
    }

    #[test]
    fn parse_error_reports_offset() {
        let err = Script::compile("if { signalActive(); }").unwrap_err();
        assert!(matches!(err, ExpressionError::Parse { .. }));
    }

    #[test]
    fn comments_are_ignored() {
        let result = run(
            "// threshold check\nif es.n > 1 { signalActive(); } // fire",
            &json!({"n": 2}),
        );
        assert_eq!(result.events.len(), 1);
    }

    #[test]
    fn eval_str_resolves_paths_and_arithmetic() {
        let response = json!({"hits": {"total": 7}});
        let ctx = ExprContext {
            response: Some(&response),
            ..Default::default()
        };
        assert_eq!(eval_str("es.hits.total", ctx).unwrap(), json!(7));
        assert_eq!(eval_str("es.hits.total * 2 + 1", ctx).unwrap(), json!(15));
    }

    #[test]
    fn eval_str_without_response_rejects_es() {
        let err = eval_str("es.hits.total", ExprContext::default()).unwrap_err();
        assert!(matches!(err, ExpressionError::UnknownVariable(ref n) if n == "es"));
    }

    #[test]
    fn eval_str_consts_are_visible() {
        let mut consts = Map::new();
        consts.insert("CURRENT_TIME_MS".to_string(), json!(1000));
        let ctx = ExprContext {
            consts: Some(&consts),
            ..Default::default()
        };
        assert_eq!(eval_str("CURRENT_TIME_MS - 400", ctx).unwrap(), json!(600));
    }

    #[test]
    fn string_concat_and_comparison() {
        let ctx = ExprContext::default();
        assert_eq!(
            eval_str("'host-' + 'a'", ctx).unwrap(),
            json!("host-a")
        );
        assert_eq!(eval_str("'a' < 'b'", ctx).unwrap(), json!(true));
        assert_eq!(eval_str("1 == 1.0", ctx).unwrap(), json!(true));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = eval_str("1 / 0", ExprContext::default()).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn non_ascii_string_literals_survive_lexing() {
        let result = run(
            r#"tmp.host = "höst-ä"; signalActive("höst-ä");"#,
            &json!({}),
        );
        assert!(result.error.is_none(), "error: {:?}", result.error);
        assert_eq!(result.events[0].match_key.as_deref(), Some("höst-ä"));
        assert_eq!(result.events[0].variables["host"], json!("höst-ä"));
    }

    #[test]
    fn literal_key_matches_the_same_key_from_the_response() {
        // Identity stability: the key written as a literal and the key read
        // out of the response must produce the same match key.
        let response = json!({"buckets": [{"key": "höst-ä"}]});
        let result = run(
            r#"
                for b in es.buckets {
                    if b.key == "höst-ä" {
                        signalActive(b.key);
                    }
                }
            "#,
            &response,
        );
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].match_key.as_deref(), Some("höst-ä"));
    }

    #[test]
    fn fractional_array_index_is_an_error() {
        let response = json!({"items": [10, 20, 30]});
        let ctx = ExprContext {
            response: Some(&response),
            ..Default::default()
        };
        let err = eval_str("es.items[1.5]", ctx).unwrap_err();
        assert!(err.to_string().contains("integer"));
    }

    #[test]
    fn out_of_bounds_index_is_null() {
        let response = json!({"items": [1, 2]});
        let ctx = ExprContext {
            response: Some(&response),
            ..Default::default()
        };
        assert_eq!(eval_str("es.items[9]", ctx).unwrap(), Value::Null);
    }

    #[test]
    fn missing_field_is_null_but_deref_of_null_errors() {
        let response = json!({"hits": {}});
        let ctx = ExprContext {
            response: Some(&response),
            ..Default::default()
        };
        assert_eq!(eval_str("es.hits.total", ctx).unwrap(), Value::Null);
        assert!(eval_str("es.hits.total.value", ctx).is_err());
    }
}
