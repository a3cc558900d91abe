//! Compiled conditions: `Match` combinator trees over compiled expressions.
//!
//! `all` is AND (short-circuits on the first false), `any` is OR
//! (short-circuits on the first true), `none` is NOT-OR. Expression nodes
//! must produce a boolean; anything else is a typed evaluation error that
//! the engine traps at the rule level.

use crate::errors::ExprError;
use crate::expr::{self, CompileCtx, EvalCtx, Expr, Program};
use crate::policy::Match;

/// An expression compiled against a policy's variable table. The source and
/// AST are retained: the source for traces, the AST for the planner.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    pub src: String,
    pub ast: Expr,
    pub program: Program,
}

impl CompiledExpr {
    pub fn compile(src: &str, ctx: &CompileCtx<'_>) -> Result<Self, ExprError> {
        let ast = expr::parse(src)?;
        let program = expr::compile(&ast, ctx)?;
        Ok(Self {
            src: src.to_string(),
            ast,
            program,
        })
    }

    pub fn eval_bool(&self, ctx: &EvalCtx<'_>) -> Result<bool, ExprError> {
        expr::eval_bool(&self.program, ctx)
    }
}

#[derive(Debug, Clone)]
pub enum CompiledMatch {
    All(Vec<CompiledMatch>),
    Any(Vec<CompiledMatch>),
    None(Vec<CompiledMatch>),
    Expr(CompiledExpr),
}

impl CompiledMatch {
    pub fn compile(m: &Match, ctx: &CompileCtx<'_>) -> Result<Self, ExprError> {
        Ok(match m {
            Match::All(items) => CompiledMatch::All(compile_list(items, ctx)?),
            Match::Any(items) => CompiledMatch::Any(compile_list(items, ctx)?),
            Match::None(items) => CompiledMatch::None(compile_list(items, ctx)?),
            Match::Expr(src) => CompiledMatch::Expr(CompiledExpr::compile(src, ctx)?),
        })
    }

    pub fn eval(&self, ctx: &EvalCtx<'_>) -> Result<bool, ExprError> {
        match self {
            CompiledMatch::All(items) => {
                for item in items {
                    if !item.eval(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            CompiledMatch::Any(items) => {
                for item in items {
                    if item.eval(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            CompiledMatch::None(items) => {
                for item in items {
                    if item.eval(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            CompiledMatch::Expr(expr) => expr.eval_bool(ctx),
        }
    }
}

fn compile_list(
    items: &[Match],
    ctx: &CompileCtx<'_>,
) -> Result<Vec<CompiledMatch>, ExprError> {
    items.iter().map(|m| CompiledMatch::compile(m, ctx)).collect()
}
