//! Condition expression language: parser, compiler and stack VM.
//!
//! Supported syntax:
//! - Literals: `null`, `true`/`false`, integers, doubles, `"strings"`
//! - Name lookup (`request`, `R`, `P`, `variables`, `V`), member access
//!   (`.`), indexing (`[]`), list literals
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`; membership: `in`
//! - Arithmetic: `+`, `-`, `*`, `/`, `%`
//! - Boolean operators `&&`, `||`, `!` with short-circuit
//! - Functions: `size`, `has`, `timestamp`, `duration`, `now`; methods:
//!   `startsWith`, `endsWith`, `contains`, `matches`
//!
//! Expressions are parsed once into an [`Expr`] tree, then lowered into a
//! [`Program`] over the closed opcode set in [`Op`]. Evaluation is a plain
//! stack interpreter; there is no dynamic dispatch and no wall-clock access
//! other than the request-start timestamp bound in [`EvalCtx`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, TimeDelta};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ExprError;
use crate::value::Value;

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Literal),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    /// Free function call: `size(x)`, `timestamp(s)`, `now()`.
    Call { name: String, args: Vec<Expr> },
    /// Method call: `x.startsWith("y")`.
    Method {
        recv: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// `has(a.b.c)`: membership test on the final segment.
    Has(Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
}

// ─── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,
    In,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' if i + 1 < chars.len() && chars[i + 1].is_ascii_digit() => {
                return Err(ExprError::Parse(
                    "numbers must start with a digit".into(),
                ));
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            quote @ ('"' | '\'') => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ExprError::Parse(
                                "unterminated string literal".into(),
                            ))
                        }
                        Some(&c) if c == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            i += 1;
                            match chars.get(i) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some('r') => s.push('\r'),
                                Some(&c @ ('\\' | '"' | '\'')) => s.push(c),
                                other => {
                                    return Err(ExprError::Parse(format!(
                                        "invalid escape `\\{}`",
                                        other.map(|c| c.to_string()).unwrap_or_default()
                                    )))
                                }
                            }
                            i += 1;
                        }
                        Some(&c) => {
                            s.push(c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if chars.get(i) == Some(&'.')
                    && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
                {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let f: f64 = text.parse().map_err(|_| {
                        ExprError::Parse(format!("invalid double `{text}`"))
                    })?;
                    tokens.push(Token::Float(f));
                } else {
                    let n: i64 = text.parse().map_err(|_| {
                        ExprError::Parse(format!("invalid integer `{text}`"))
                    })?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                });
            }
            c => {
                return Err(ExprError::Parse(format!("unexpected character `{c}`")));
            }
        }
    }
    Ok(tokens)
}

// ─── Parser ─────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        if self.advance().as_ref() != Some(&expected) {
            return Err(ExprError::Parse(format!("expected {what}")));
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.parse_or()
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// comparison = additive (cmp_op additive)?  — comparisons do not chain
    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Le) => BinOp::Le,
            Some(Token::In) => BinOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    /// additive = multiplicative (("+" | "-") multiplicative)*
    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    /// multiplicative = unary (("*" | "/" | "%") unary)*
    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    /// unary = ("!" | "-") unary | postfix
    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    /// postfix = primary ("." ident call_args? | "[" expr "]")*
    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        _ => {
                            return Err(ExprError::Parse(
                                "expected identifier after `.`".into(),
                            ))
                        }
                    };
                    if self.peek() == Some(&Token::LParen) {
                        let args = self.parse_call_args()?;
                        expr = Expr::Method {
                            recv: Box::new(expr),
                            name,
                            args,
                        };
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket, "closing bracket `]`")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Lit(Literal::Int(n))),
            Some(Token::Float(f)) => Ok(Expr::Lit(Literal::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Literal::Str(s))),
            Some(Token::True) => Ok(Expr::Lit(Literal::Bool(true))),
            Some(Token::False) => Ok(Expr::Lit(Literal::Bool(false))),
            Some(Token::Null) => Ok(Expr::Lit(Literal::Null)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    let args = self.parse_call_args()?;
                    if name == "has" {
                        if args.len() != 1 || !matches!(args[0], Expr::Member(..)) {
                            return Err(ExprError::Parse(
                                "has() requires a single member access argument".into(),
                            ));
                        }
                        let arg = args.into_iter().next().expect("checked length");
                        return Ok(Expr::Has(Box::new(arg)));
                    }
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen, "closing parenthesis `)`")?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut elems = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        elems.push(self.parse_expr()?);
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.advance();
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(Token::RBracket, "closing bracket `]`")?;
                Ok(Expr::List(elems))
            }
            other => Err(ExprError::Parse(format!("unexpected token: {other:?}"))),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        self.expect(Token::LParen, "opening parenthesis `(`")?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                match self.peek() {
                    Some(Token::Comma) => {
                        self.advance();
                    }
                    _ => break,
                }
            }
        }
        self.expect(Token::RParen, "closing parenthesis `)`")?;
        Ok(args)
    }
}

/// Parse an expression string into an AST.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExprError::Parse("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(ExprError::Parse(format!(
            "unexpected trailing token: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

// ─── Compiler ───────────────────────────────────────────────────────────

/// Built-in functions. The set is closed; adding to it is a semantic change
/// to the policy language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Size,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    Timestamp,
    Duration,
    Now,
}

/// The closed opcode set. Programs evaluate on a value stack; every opcode
/// has a deterministic effect and jumps are only ever forward.
#[derive(Debug, Clone)]
pub enum Op {
    /// Push a constant.
    Const(Value),
    /// Push the request binding (`request`).
    Root,
    /// Pop a value, push its named member. Missing member is an error.
    Member(String),
    /// Pop a value, push whether the named member exists.
    HasMember(String),
    /// Pop index then container, push the element.
    Index,
    /// Pop `n` values, push them as a list (in source order).
    BuildList(usize),
    /// Push the memoized value of variable slot `n`, evaluating on first use.
    LoadVar(usize),
    /// Pop `argc` arguments (receiver deepest), push the function result.
    Call(Func, usize),
    /// Pop a string, push whether the precompiled pattern matches it.
    MatchesLit(Arc<Regex>),
    Unary(UnaryOp),
    /// All binary operators except `&&`/`||`, which lower to jumps.
    Binary(BinOp),
    /// Pop a bool; if false, push false and jump. Non-bool is an error.
    AndJump(usize),
    /// Pop a bool; if true, push true and jump. Non-bool is an error.
    OrJump(usize),
    /// Pop a value and push it back, failing unless it is a bool.
    CheckBool,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    ops: Vec<Op>,
}

/// Names that may appear at the root of an expression, fixed at compile
/// time. Variable slots come from the enclosing policy's resolved table.
pub struct CompileCtx<'a> {
    pub var_slots: &'a HashMap<String, usize>,
}

static EMPTY_SLOTS: Lazy<HashMap<String, usize>> = Lazy::new(HashMap::new);

impl CompileCtx<'static> {
    /// A context with no variable slots, for expressions outside a policy.
    pub fn empty() -> Self {
        CompileCtx {
            var_slots: &EMPTY_SLOTS,
        }
    }
}

/// Lower a parsed expression into a program.
pub fn compile(expr: &Expr, ctx: &CompileCtx<'_>) -> Result<Program, ExprError> {
    let mut program = Program::default();
    lower(expr, ctx, &mut program.ops)?;
    Ok(program)
}

fn lower(expr: &Expr, ctx: &CompileCtx<'_>, out: &mut Vec<Op>) -> Result<(), ExprError> {
    match expr {
        Expr::Lit(lit) => out.push(Op::Const(literal_value(lit))),
        Expr::Ident(name) => match name.as_str() {
            "request" => out.push(Op::Root),
            "R" => {
                out.push(Op::Root);
                out.push(Op::Member("resource".into()));
            }
            "P" => {
                out.push(Op::Root);
                out.push(Op::Member("principal".into()));
            }
            other => return Err(ExprError::UnknownName(other.to_string())),
        },
        Expr::Member(base, name) => {
            // `variables.x` / `V.x` resolves to a slot, not a map lookup
            if let Expr::Ident(root) = base.as_ref() {
                if root == "variables" || root == "V" {
                    let slot = ctx
                        .var_slots
                        .get(name)
                        .copied()
                        .ok_or_else(|| {
                            ExprError::UnknownName(format!("variables.{name}"))
                        })?;
                    out.push(Op::LoadVar(slot));
                    return Ok(());
                }
            }
            lower(base, ctx, out)?;
            out.push(Op::Member(name.clone()));
        }
        Expr::Index(base, index) => {
            lower(base, ctx, out)?;
            lower(index, ctx, out)?;
            out.push(Op::Index);
        }
        Expr::List(elems) => {
            for elem in elems {
                lower(elem, ctx, out)?;
            }
            out.push(Op::BuildList(elems.len()));
        }
        Expr::Has(arg) => {
            let Expr::Member(base, name) = arg.as_ref() else {
                return Err(ExprError::Parse(
                    "has() requires a single member access argument".into(),
                ));
            };
            lower(base, ctx, out)?;
            out.push(Op::HasMember(name.clone()));
        }
        Expr::Call { name, args } => {
            let (func, arity) = match name.as_str() {
                "size" => (Func::Size, 1),
                "timestamp" => (Func::Timestamp, 1),
                "duration" => (Func::Duration, 1),
                "now" => (Func::Now, 0),
                other => return Err(ExprError::UnknownFunction(other.to_string())),
            };
            check_arity(name, args.len(), arity)?;
            for arg in args {
                lower(arg, ctx, out)?;
            }
            out.push(Op::Call(func, args.len()));
        }
        Expr::Method { recv, name, args } => {
            let (func, arity) = match name.as_str() {
                "startsWith" => (Func::StartsWith, 1),
                "endsWith" => (Func::EndsWith, 1),
                "contains" => (Func::Contains, 1),
                "matches" => (Func::Matches, 1),
                "size" => (Func::Size, 0),
                other => return Err(ExprError::UnknownFunction(other.to_string())),
            };
            check_arity(name, args.len(), arity)?;
            lower(recv, ctx, out)?;
            // literal regex patterns compile once
            if func == Func::Matches {
                if let Expr::Lit(Literal::Str(pattern)) = &args[0] {
                    let re = Regex::new(pattern).map_err(|e| ExprError::BadLiteral {
                        what: "regex",
                        input: pattern.clone(),
                        message: e.to_string(),
                    })?;
                    out.push(Op::MatchesLit(Arc::new(re)));
                    return Ok(());
                }
            }
            for arg in args {
                lower(arg, ctx, out)?;
            }
            out.push(Op::Call(func, args.len() + 1));
        }
        Expr::Unary(op, inner) => {
            lower(inner, ctx, out)?;
            out.push(Op::Unary(*op));
        }
        Expr::Binary(BinOp::And, lhs, rhs) => {
            lower(lhs, ctx, out)?;
            let jump_at = out.len();
            out.push(Op::AndJump(usize::MAX));
            lower(rhs, ctx, out)?;
            out.push(Op::CheckBool);
            let target = out.len();
            out[jump_at] = Op::AndJump(target);
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            lower(lhs, ctx, out)?;
            let jump_at = out.len();
            out.push(Op::OrJump(usize::MAX));
            lower(rhs, ctx, out)?;
            out.push(Op::CheckBool);
            let target = out.len();
            out[jump_at] = Op::OrJump(target);
        }
        Expr::Binary(op, lhs, rhs) => {
            lower(lhs, ctx, out)?;
            lower(rhs, ctx, out)?;
            out.push(Op::Binary(*op));
        }
    }
    Ok(())
}

fn check_arity(name: &str, got: usize, want: usize) -> Result<(), ExprError> {
    if got != want {
        return Err(ExprError::Parse(format!(
            "{name}() takes {want} argument(s), got {got}"
        )));
    }
    Ok(())
}

pub fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(n) => Value::Int(*n),
        Literal::Float(f) => Value::Float(*f),
        Literal::Str(s) => Value::String(s.clone()),
    }
}

// ─── Evaluator ──────────────────────────────────────────────────────────

/// Per-request evaluation context. The `request` tree and the variable
/// programs are shared; the memoization table is request-local and sized to
/// the compiled slot count.
pub struct EvalCtx<'a> {
    request: &'a Value,
    now: DateTime<FixedOffset>,
    var_programs: &'a [Program],
    var_cache: RefCell<Vec<Option<Value>>>,
}

impl<'a> EvalCtx<'a> {
    pub fn new(
        request: &'a Value,
        now: DateTime<FixedOffset>,
        var_programs: &'a [Program],
    ) -> Self {
        Self {
            request,
            now,
            var_programs,
            var_cache: RefCell::new(vec![None; var_programs.len()]),
        }
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        self.now
    }

    fn load_var(&self, slot: usize) -> Result<Value, ExprError> {
        if let Some(v) = self.var_cache.borrow()[slot].clone() {
            return Ok(v);
        }
        let v = eval(&self.var_programs[slot], self)?;
        self.var_cache.borrow_mut()[slot] = Some(v.clone());
        Ok(v)
    }
}

/// Run a program to completion and return the top of the stack.
pub fn eval(program: &Program, ctx: &EvalCtx<'_>) -> Result<Value, ExprError> {
    let mut stack: Vec<Value> = Vec::with_capacity(8);
    let mut pc = 0;

    while pc < program.ops.len() {
        let op = &program.ops[pc];
        pc += 1;
        match op {
            Op::Const(v) => stack.push(v.clone()),
            Op::Root => stack.push(ctx.request.clone()),
            Op::Member(name) => {
                let v = pop(&mut stack);
                match v.member(name) {
                    Some(m) => stack.push(m.clone()),
                    None => {
                        return Err(match v {
                            Value::Map(_) => ExprError::UnknownName(name.clone()),
                            other => ExprError::TypeMismatch(format!(
                                "cannot access member `{name}` of {}",
                                other.sort()
                            )),
                        })
                    }
                }
            }
            Op::HasMember(name) => {
                let v = pop(&mut stack);
                stack.push(Value::Bool(v.member(name).is_some()));
            }
            Op::Index => {
                let index = pop(&mut stack);
                let container = pop(&mut stack);
                stack.push(index_value(&container, &index)?);
            }
            Op::BuildList(n) => {
                let elems = stack.split_off(stack.len() - n);
                stack.push(Value::List(elems));
            }
            Op::LoadVar(slot) => stack.push(ctx.load_var(*slot)?),
            Op::Call(func, argc) => {
                let args = stack.split_off(stack.len() - argc);
                stack.push(call_func(*func, &args, ctx.now())?);
            }
            Op::MatchesLit(re) => {
                let v = pop(&mut stack);
                match v {
                    Value::String(s) => stack.push(Value::Bool(re.is_match(&s))),
                    other => {
                        return Err(ExprError::TypeMismatch(format!(
                            "matches() requires a string receiver, got {}",
                            other.sort()
                        )))
                    }
                }
            }
            Op::Unary(op) => {
                let v = pop(&mut stack);
                stack.push(apply_unary(*op, v)?);
            }
            Op::Binary(op) => {
                let rhs = pop(&mut stack);
                let lhs = pop(&mut stack);
                stack.push(apply_binary(*op, lhs, rhs)?);
            }
            Op::AndJump(target) => match pop(&mut stack) {
                Value::Bool(false) => {
                    stack.push(Value::Bool(false));
                    pc = *target;
                }
                Value::Bool(true) => {}
                other => {
                    return Err(ExprError::TypeMismatch(format!(
                        "`&&` requires bool operands, got {}",
                        other.sort()
                    )))
                }
            },
            Op::OrJump(target) => match pop(&mut stack) {
                Value::Bool(true) => {
                    stack.push(Value::Bool(true));
                    pc = *target;
                }
                Value::Bool(false) => {}
                other => {
                    return Err(ExprError::TypeMismatch(format!(
                        "`||` requires bool operands, got {}",
                        other.sort()
                    )))
                }
            },
            Op::CheckBool => {
                let v = pop(&mut stack);
                match v {
                    Value::Bool(_) => stack.push(v),
                    other => {
                        return Err(ExprError::TypeMismatch(format!(
                            "expected bool operand, got {}",
                            other.sort()
                        )))
                    }
                }
            }
        }
    }

    Ok(stack.pop().unwrap_or(Value::Null))
}

/// Evaluate a program that must produce a boolean.
pub fn eval_bool(program: &Program, ctx: &EvalCtx<'_>) -> Result<bool, ExprError> {
    match eval(program, ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::NonBoolean {
            actual: other.sort(),
        }),
    }
}

fn pop(stack: &mut Vec<Value>) -> Value {
    // lowering always balances the stack
    stack.pop().expect("stack underflow")
}

pub(crate) fn index_value(container: &Value, index: &Value) -> Result<Value, ExprError> {
    match (container, index) {
        (Value::List(items), Value::Int(i)) => {
            let idx = usize::try_from(*i).ok().filter(|i| *i < items.len());
            match idx {
                Some(i) => Ok(items[i].clone()),
                None => Err(ExprError::TypeMismatch(format!(
                    "index {i} out of bounds (len {})",
                    items.len()
                ))),
            }
        }
        (Value::Map(fields), Value::String(key)) => fields
            .get(key)
            .cloned()
            .ok_or_else(|| ExprError::UnknownName(key.clone())),
        (c, i) => Err(ExprError::TypeMismatch(format!(
            "cannot index {} with {}",
            c.sort(),
            i.sort()
        ))),
    }
}

pub(crate) fn apply_unary(op: UnaryOp, v: Value) -> Result<Value, ExprError> {
    match (op, v) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| ExprError::TypeMismatch("integer overflow".into())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, Value::Duration(d)) => Ok(Value::Duration(-d)),
        (UnaryOp::Not, other) => Err(ExprError::TypeMismatch(format!(
            "`!` requires a bool operand, got {}",
            other.sort()
        ))),
        (UnaryOp::Neg, other) => Err(ExprError::TypeMismatch(format!(
            "`-` requires a numeric operand, got {}",
            other.sort()
        ))),
    }
}

pub(crate) fn apply_binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = lhs.compare(&rhs).ok_or_else(|| {
                ExprError::TypeMismatch(format!(
                    "cannot compare {} with {}",
                    lhs.sort(),
                    rhs.sort()
                ))
            })?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                BinOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            }))
        }
        BinOp::In => match &rhs {
            Value::List(items) => Ok(Value::Bool(items.contains(&lhs))),
            Value::Map(fields) => match &lhs {
                Value::String(key) => Ok(Value::Bool(fields.contains_key(key))),
                other => Err(ExprError::TypeMismatch(format!(
                    "map membership requires a string key, got {}",
                    other.sort()
                ))),
            },
            other => Err(ExprError::TypeMismatch(format!(
                "`in` requires a list or map on the right, got {}",
                other.sort()
            ))),
        },
        BinOp::Add => add_values(lhs, rhs),
        BinOp::Sub => sub_values(lhs, rhs),
        BinOp::Mul => numeric_op(lhs, rhs, "*", i64::checked_mul, |a, b| a * b),
        BinOp::Div => div_values(lhs, rhs),
        BinOp::Mod => match (lhs, rhs) {
            (Value::Int(_), Value::Int(0)) => Err(ExprError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a % b)),
            (a, b) => Err(ExprError::TypeMismatch(format!(
                "`%` requires int operands, got {} and {}",
                a.sort(),
                b.sort()
            ))),
        },
        BinOp::And | BinOp::Or => unreachable!("lowered to jumps"),
    }
}

fn add_values(lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (Value::Timestamp(ts), Value::Duration(d))
        | (Value::Duration(d), Value::Timestamp(ts)) => ts
            .checked_add_signed(d)
            .map(Value::Timestamp)
            .ok_or_else(|| ExprError::TypeMismatch("timestamp overflow".into())),
        (Value::Duration(a), Value::Duration(b)) => a
            .checked_add(&b)
            .map(Value::Duration)
            .ok_or_else(|| ExprError::TypeMismatch("duration overflow".into())),
        (lhs, rhs) => numeric_op(lhs, rhs, "+", i64::checked_add, |a, b| a + b),
    }
}

fn sub_values(lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    match (lhs, rhs) {
        (Value::Timestamp(a), Value::Timestamp(b)) => Ok(Value::Duration(a - b)),
        (Value::Timestamp(ts), Value::Duration(d)) => ts
            .checked_sub_signed(d)
            .map(Value::Timestamp)
            .ok_or_else(|| ExprError::TypeMismatch("timestamp overflow".into())),
        (Value::Duration(a), Value::Duration(b)) => a
            .checked_sub(&b)
            .map(Value::Duration)
            .ok_or_else(|| ExprError::TypeMismatch("duration overflow".into())),
        (lhs, rhs) => numeric_op(lhs, rhs, "-", i64::checked_sub, |a, b| a - b),
    }
}

fn div_values(lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    match (&lhs, &rhs) {
        (Value::Int(_), Value::Int(0)) => Err(ExprError::DivisionByZero),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a / b)),
        _ => numeric_op(lhs, rhs, "/", i64::checked_div, |a, b| a / b),
    }
}

fn numeric_op(
    lhs: Value,
    rhs: Value,
    sym: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, ExprError> {
    match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or_else(|| ExprError::TypeMismatch("integer overflow".into())),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        _ => Err(ExprError::TypeMismatch(format!(
            "`{sym}` requires numeric operands, got {} and {}",
            lhs.sort(),
            rhs.sort()
        ))),
    }
}

pub(crate) fn call_func(
    func: Func,
    args: &[Value],
    now: DateTime<FixedOffset>,
) -> Result<Value, ExprError> {
    match func {
        Func::Size => match &args[0] {
            Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            Value::Map(fields) => Ok(Value::Int(fields.len() as i64)),
            other => Err(ExprError::TypeMismatch(format!(
                "size() requires a string, list or map, got {}",
                other.sort()
            ))),
        },
        Func::StartsWith => string_pair(args, "startsWith")
            .map(|(s, prefix)| Value::Bool(s.starts_with(prefix))),
        Func::EndsWith => string_pair(args, "endsWith")
            .map(|(s, suffix)| Value::Bool(s.ends_with(suffix))),
        Func::Contains => string_pair(args, "contains")
            .map(|(s, needle)| Value::Bool(s.contains(needle))),
        Func::Matches => {
            let (s, pattern) = string_pair(args, "matches")?;
            let re = Regex::new(pattern).map_err(|e| ExprError::BadLiteral {
                what: "regex",
                input: pattern.to_string(),
                message: e.to_string(),
            })?;
            Ok(Value::Bool(re.is_match(s)))
        }
        Func::Timestamp => match &args[0] {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(Value::Timestamp)
                .map_err(|e| ExprError::BadLiteral {
                    what: "timestamp",
                    input: s.clone(),
                    message: e.to_string(),
                }),
            Value::Timestamp(ts) => Ok(Value::Timestamp(*ts)),
            other => Err(ExprError::TypeMismatch(format!(
                "timestamp() requires a string, got {}",
                other.sort()
            ))),
        },
        Func::Duration => match &args[0] {
            Value::String(s) => {
                let std = humantime::parse_duration(s).map_err(|e| {
                    ExprError::BadLiteral {
                        what: "duration",
                        input: s.clone(),
                        message: e.to_string(),
                    }
                })?;
                TimeDelta::from_std(std).map(Value::Duration).map_err(|_| {
                    ExprError::BadLiteral {
                        what: "duration",
                        input: s.clone(),
                        message: "out of range".into(),
                    }
                })
            }
            Value::Duration(d) => Ok(Value::Duration(*d)),
            other => Err(ExprError::TypeMismatch(format!(
                "duration() requires a string, got {}",
                other.sort()
            ))),
        },
        Func::Now => Ok(Value::Timestamp(now)),
    }
}

fn string_pair<'v>(args: &'v [Value], name: &str) -> Result<(&'v str, &'v str), ExprError> {
    match (&args[0], &args[1]) {
        (Value::String(a), Value::String(b)) => Ok((a, b)),
        (a, b) => Err(ExprError::TypeMismatch(format!(
            "{name}() requires string operands, got {} and {}",
            a.sort(),
            b.sort()
        ))),
    }
}
