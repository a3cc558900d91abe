//! Query planner: partial evaluation of the policy chain without a concrete
//! resource instance.
//!
//! The planner walks the same principal-then-resource, deepest-scope-first
//! chain as the engine, but evaluates conditions against an environment
//! where `request.resource.id` and any resource attribute not supplied in
//! the plan input are unknown. Sub-expressions over unknowns are preserved
//! symbolically; everything else folds to a constant. The result is either a
//! definitive answer or a residual expression equivalent to the engine's
//! decision over any concrete resource.

use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::compiler::{CompiledKind, CompiledResourcePolicy, VariableTable};
use crate::condition::CompiledMatch;
use crate::engine::{build_request_value, AuxData, CheckInput, Principal, ResourceInstance};
use crate::errors::ExprError;
use crate::expr::{
    self, apply_binary, apply_unary, call_func, index_value, literal_value, BinOp, Expr, Func,
    Literal, UnaryOp,
};
use crate::index::{Index, Snapshot};
use crate::policy::{Effect, PolicyKind};
use crate::value::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PlanInput {
    #[serde(default)]
    pub request_id: String,
    pub principal: Principal,
    pub resource: PlanResource,
    pub action: String,
    #[serde(default)]
    pub aux_data: Option<AuxData>,
}

/// A resource kind with whatever attributes are known up front. Attributes
/// absent from `attr` stay symbolic in the plan.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PlanResource {
    pub kind: String,
    #[serde(default)]
    pub policy_version: Option<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub attr: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutput {
    pub request_id: String,
    pub action: String,
    pub policy_version: String,
    pub filter: PlanFilter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanFilter {
    AlwaysAllowed,
    AlwaysDenied,
    Conditional(Expr),
}

impl Serialize for PlanFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        match self {
            PlanFilter::AlwaysAllowed => map.serialize_entry("kind", "KIND_ALWAYS_ALLOWED")?,
            PlanFilter::AlwaysDenied => map.serialize_entry("kind", "KIND_ALWAYS_DENIED")?,
            PlanFilter::Conditional(expr) => {
                map.serialize_entry("kind", "KIND_CONDITIONAL")?;
                map.serialize_entry("condition", &render(expr))?;
            }
        }
        map.end()
    }
}

pub struct Planner {
    index: Index,
    default_policy_version: String,
}

impl Planner {
    pub fn new(index: Index, default_policy_version: impl Into<String>) -> Self {
        Self {
            index,
            default_policy_version: default_policy_version.into(),
        }
    }

    pub fn plan(&self, input: &PlanInput) -> PlanOutput {
        let snapshot = self.index.snapshot();
        let now = Utc::now().fixed_offset();
        self.plan_under(&snapshot, input, now)
    }

    fn plan_under(
        &self,
        snapshot: &Snapshot,
        input: &PlanInput,
        now: DateTime<FixedOffset>,
    ) -> PlanOutput {
        let request = build_plan_request(input);
        let principal_version = input
            .principal
            .policy_version
            .as_deref()
            .unwrap_or(&self.default_policy_version)
            .to_string();
        let resource_version = input
            .resource
            .policy_version
            .as_deref()
            .unwrap_or(&self.default_policy_version)
            .to_string();

        let mut fold = Fold::new();

        // principal policies first, mirroring the engine
        let mut cursor = snapshot.scope_start(
            PolicyKind::Principal,
            &input.principal.id,
            &principal_version,
            &input.principal.scope,
        );
        while let Some(idx) = cursor {
            if fold.decided {
                break;
            }
            let unit = snapshot.unit(idx);
            if let CompiledKind::Principal(pp) = &unit.kind {
                for rule in &pp.rules {
                    if !rule.resource.matches(&input.resource.kind) {
                        continue;
                    }
                    for entry in &rule.actions {
                        if fold.decided {
                            break;
                        }
                        if !entry.action.matches(&input.action) {
                            continue;
                        }
                        let env = PartialEnv {
                            request: &request,
                            now,
                            vars: &pp.variables,
                        };
                        fold.rule(entry.condition.as_ref(), entry.effect, &env);
                    }
                }
            }
            cursor = snapshot.parent_of(idx);
        }

        if !fold.decided {
            let mut cursor = snapshot.scope_start(
                PolicyKind::Resource,
                &input.resource.kind,
                &resource_version,
                &input.resource.scope,
            );
            while let Some(idx) = cursor {
                if fold.decided {
                    break;
                }
                let unit = snapshot.unit(idx);
                if let CompiledKind::Resource(rp) = &unit.kind {
                    self.fold_resource_unit(rp, input, &request, now, &mut fold);
                }
                cursor = snapshot.parent_of(idx);
            }
        }

        let filter = if !fold.any_rule_seen {
            PlanFilter::AlwaysDenied
        } else {
            match fold.allowed {
                Expr::Lit(Literal::Bool(true)) => PlanFilter::AlwaysAllowed,
                Expr::Lit(Literal::Bool(false)) => PlanFilter::AlwaysDenied,
                residual => PlanFilter::Conditional(residual),
            }
        };

        PlanOutput {
            request_id: input.request_id.clone(),
            action: input.action.clone(),
            policy_version: resource_version,
            filter,
        }
    }

    fn fold_resource_unit(
        &self,
        rp: &CompiledResourcePolicy,
        input: &PlanInput,
        request: &Value,
        now: DateTime<FixedOffset>,
        fold: &mut Fold,
    ) {
        // partial activation per derived role: constant false when no parent
        // role is held, otherwise the (possibly residual) condition
        let activations: Vec<(&str, Expr)> = rp
            .derived_roles
            .iter()
            .map(|role| {
                let held = input
                    .principal
                    .roles
                    .iter()
                    .any(|r| role.parent_roles.contains(r));
                let activation = if !held {
                    Expr::Lit(Literal::Bool(false))
                } else {
                    let env = PartialEnv {
                        request,
                        now,
                        vars: &role.variables,
                    };
                    match &role.condition {
                        None => Expr::Lit(Literal::Bool(true)),
                        Some(cond) => match peval_match(cond, &env) {
                            Ok(partial) => as_condition(partial)
                                .unwrap_or(Expr::Lit(Literal::Bool(false))),
                            // an errored activation can never hold
                            Err(_) => Expr::Lit(Literal::Bool(false)),
                        },
                    }
                };
                (role.name.as_str(), activation)
            })
            .collect();

        let env = PartialEnv {
            request,
            now,
            vars: &rp.variables,
        };

        for rule in &rp.rules {
            if fold.decided {
                return;
            }
            if !rule.actions.matches(&input.action) {
                continue;
            }

            // role gate: direct roles fold to a constant; derived roles
            // contribute their activation expressions
            let mut gate = Expr::Lit(Literal::Bool(
                rule.roles
                    .iter()
                    .any(|r| input.principal.roles.iter().any(|have| have == r)),
            ));
            for derived in &rule.derived_roles {
                if input.principal.roles.contains(derived) {
                    gate = or(gate, Expr::Lit(Literal::Bool(true)));
                }
                for (name, activation) in &activations {
                    if *name == derived.as_str() {
                        gate = or(gate, activation.clone());
                    }
                }
            }
            if gate == Expr::Lit(Literal::Bool(false)) {
                continue;
            }

            let cond = match &rule.condition {
                None => Expr::Lit(Literal::Bool(true)),
                Some(cond) => match peval_match(cond, &env) {
                    Ok(partial) => match as_condition(partial) {
                        Some(cond) => cond,
                        None => continue,
                    },
                    Err(_) => continue, // errored rules are non-matching
                },
            };
            let total = and(gate, cond);
            fold.apply(total, rule.effect);
        }
    }
}

/// First-match-wins folded into a guarded disjunction. `guard` is the
/// condition under which no earlier rule has already matched.
struct Fold {
    allowed: Expr,
    guard: Expr,
    decided: bool,
    any_rule_seen: bool,
}

impl Fold {
    fn new() -> Self {
        Self {
            allowed: Expr::Lit(Literal::Bool(false)),
            guard: Expr::Lit(Literal::Bool(true)),
            decided: false,
            any_rule_seen: false,
        }
    }

    fn rule(&mut self, condition: Option<&CompiledMatch>, effect: Effect, env: &PartialEnv<'_>) {
        let cond = match condition {
            None => Expr::Lit(Literal::Bool(true)),
            Some(cond) => match peval_match(cond, env) {
                // a condition that cannot produce a boolean is an errored
                // rule, which never matches
                Ok(partial) => match as_condition(partial) {
                    Some(cond) => cond,
                    None => return,
                },
                Err(_) => return,
            },
        };
        self.apply(cond, effect);
    }

    fn apply(&mut self, cond: Expr, effect: Effect) {
        self.any_rule_seen = true;
        match cond {
            Expr::Lit(Literal::Bool(false)) => {}
            Expr::Lit(Literal::Bool(true)) => {
                if effect == Effect::Allow {
                    self.allowed = or(self.allowed.clone(), self.guard.clone());
                }
                // an unconditional match ends the walk either way
                self.decided = true;
            }
            residual => {
                if effect == Effect::Allow {
                    self.allowed =
                        or(self.allowed.clone(), and(self.guard.clone(), residual.clone()));
                }
                self.guard = and(self.guard.clone(), not(residual));
            }
        }
    }
}

// ---------- Partial evaluation ----------

enum Partial {
    Known(Value),
    Residual(Expr),
}

impl Partial {
    fn into_expr(self) -> Expr {
        match self {
            Partial::Known(v) => value_to_expr(&v),
            Partial::Residual(e) => e,
        }
    }
}

struct PartialEnv<'a> {
    request: &'a Value,
    now: DateTime<FixedOffset>,
    vars: &'a VariableTable,
}

fn peval_match(m: &CompiledMatch, env: &PartialEnv<'_>) -> Result<Partial, ExprError> {
    match m {
        CompiledMatch::All(items) => {
            let mut acc = Expr::Lit(Literal::Bool(true));
            for item in items {
                let p = peval_match(item, env)?;
                if let Partial::Known(Value::Bool(false)) = p {
                    return Ok(Partial::Known(Value::Bool(false)));
                }
                acc = and(acc, p.into_expr());
            }
            Ok(expr_to_partial(acc))
        }
        CompiledMatch::Any(items) => {
            let mut acc = Expr::Lit(Literal::Bool(false));
            for item in items {
                let p = peval_match(item, env)?;
                if let Partial::Known(Value::Bool(true)) = p {
                    return Ok(Partial::Known(Value::Bool(true)));
                }
                acc = or(acc, p.into_expr());
            }
            Ok(expr_to_partial(acc))
        }
        CompiledMatch::None(items) => {
            let mut acc = Expr::Lit(Literal::Bool(true));
            for item in items {
                let p = peval_match(item, env)?;
                if let Partial::Known(Value::Bool(true)) = p {
                    return Ok(Partial::Known(Value::Bool(false)));
                }
                acc = and(acc, not(p.into_expr()));
            }
            Ok(expr_to_partial(acc))
        }
        CompiledMatch::Expr(compiled) => peval(&compiled.ast, env),
    }
}

fn expr_to_partial(e: Expr) -> Partial {
    match e {
        Expr::Lit(Literal::Bool(b)) => Partial::Known(Value::Bool(b)),
        other => Partial::Residual(other),
    }
}

/// A rule condition folded to a constant must be boolean; anything else is
/// the planner's counterpart of a trapped type error.
fn as_condition(p: Partial) -> Option<Expr> {
    match p {
        Partial::Known(Value::Bool(b)) => Some(Expr::Lit(Literal::Bool(b))),
        Partial::Known(_) => None,
        Partial::Residual(e) => Some(e),
    }
}

fn peval(expr: &Expr, env: &PartialEnv<'_>) -> Result<Partial, ExprError> {
    match expr {
        Expr::Lit(lit) => Ok(Partial::Known(literal_value(lit))),
        Expr::Ident(name) => match name.as_str() {
            "request" => Ok(Partial::Known(env.request.clone())),
            "R" => lookup_member(env.request, "resource", expr),
            "P" => lookup_member(env.request, "principal", expr),
            other => Err(ExprError::UnknownName(other.to_string())),
        },
        Expr::Member(base, name) => {
            // variables inline their (partially evaluated) definitions
            if let Expr::Ident(root) = base.as_ref() {
                if root == "variables" || root == "V" {
                    let slot = env.vars.slot(name).ok_or_else(|| {
                        ExprError::UnknownName(format!("variables.{name}"))
                    })?;
                    return peval(&env.vars.slots[slot].expr.ast, env);
                }
            }
            match peval(base, env)? {
                Partial::Known(value) => lookup_member(&value, name, expr),
                Partial::Residual(_) => Ok(Partial::Residual(expr.clone())),
            }
        }
        Expr::Index(base, index) => {
            let base_p = peval(base, env)?;
            let index_p = peval(index, env)?;
            match (base_p, index_p) {
                (Partial::Known(b), Partial::Known(i)) => match index_value(&b, &i) {
                    Ok(v) => Ok(Partial::Known(v)),
                    Err(err) => {
                        if is_resource_rooted(expr) {
                            Ok(Partial::Residual(expr.clone()))
                        } else {
                            Err(err)
                        }
                    }
                },
                _ => Ok(Partial::Residual(expr.clone())),
            }
        }
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            let mut parts = Vec::with_capacity(items.len());
            let mut all_known = true;
            for item in items {
                let p = peval(item, env)?;
                match &p {
                    Partial::Known(v) => values.push(v.clone()),
                    Partial::Residual(_) => all_known = false,
                }
                parts.push(p.into_expr());
            }
            if all_known {
                Ok(Partial::Known(Value::List(values)))
            } else {
                Ok(Partial::Residual(Expr::List(parts)))
            }
        }
        Expr::Has(inner) => {
            let Expr::Member(base, name) = inner.as_ref() else {
                return Err(ExprError::Parse(
                    "has() requires a single member access argument".into(),
                ));
            };
            match peval(base, env)? {
                Partial::Known(value) => {
                    if value.member(name).is_some() {
                        Ok(Partial::Known(Value::Bool(true)))
                    } else if is_resource_rooted(inner) {
                        Ok(Partial::Residual(expr.clone()))
                    } else {
                        Ok(Partial::Known(Value::Bool(false)))
                    }
                }
                Partial::Residual(_) => Ok(Partial::Residual(expr.clone())),
            }
        }
        Expr::Call { name, args } => {
            let func = match name.as_str() {
                "size" => Func::Size,
                "timestamp" => Func::Timestamp,
                "duration" => Func::Duration,
                "now" => Func::Now,
                other => return Err(ExprError::UnknownFunction(other.to_string())),
            };
            fold_call(func, None, args, expr, env)
        }
        Expr::Method { recv, name, args } => {
            let func = match name.as_str() {
                "startsWith" => Func::StartsWith,
                "endsWith" => Func::EndsWith,
                "contains" => Func::Contains,
                "matches" => Func::Matches,
                "size" => Func::Size,
                other => return Err(ExprError::UnknownFunction(other.to_string())),
            };
            fold_call(func, Some(recv), args, expr, env)
        }
        Expr::Unary(op, inner) => match peval(inner, env)? {
            Partial::Known(v) => Ok(Partial::Known(apply_unary(*op, v)?)),
            Partial::Residual(r) => Ok(Partial::Residual(match op {
                UnaryOp::Not => not(r),
                UnaryOp::Neg => Expr::Unary(UnaryOp::Neg, Box::new(r)),
            })),
        },
        Expr::Binary(BinOp::And, lhs, rhs) => {
            let l = peval(lhs, env)?;
            if let Partial::Known(Value::Bool(false)) = l {
                return Ok(Partial::Known(Value::Bool(false)));
            }
            let r = peval(rhs, env)?;
            Ok(expr_to_partial(and(l.into_expr(), r.into_expr())))
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            let l = peval(lhs, env)?;
            if let Partial::Known(Value::Bool(true)) = l {
                return Ok(Partial::Known(Value::Bool(true)));
            }
            let r = peval(rhs, env)?;
            Ok(expr_to_partial(or(l.into_expr(), r.into_expr())))
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = peval(lhs, env)?;
            let r = peval(rhs, env)?;
            match (l, r) {
                (Partial::Known(a), Partial::Known(b)) => {
                    Ok(Partial::Known(apply_binary(*op, a, b)?))
                }
                (l, r) => Ok(Partial::Residual(Expr::Binary(
                    *op,
                    Box::new(l.into_expr()),
                    Box::new(r.into_expr()),
                ))),
            }
        }
    }
}

fn fold_call(
    func: Func,
    recv: Option<&Expr>,
    args: &[Expr],
    original: &Expr,
    env: &PartialEnv<'_>,
) -> Result<Partial, ExprError> {
    let mut values = Vec::with_capacity(args.len() + 1);
    let mut all_known = true;
    if let Some(recv) = recv {
        match peval(recv, env)? {
            Partial::Known(v) => values.push(v),
            Partial::Residual(_) => all_known = false,
        }
    }
    for arg in args {
        match peval(arg, env)? {
            Partial::Known(v) => values.push(v),
            Partial::Residual(_) => all_known = false,
        }
    }
    if all_known {
        Ok(Partial::Known(call_func(func, &values, env.now)?))
    } else {
        Ok(Partial::Residual(original.clone()))
    }
}

/// Member lookup that residualizes unknown resource members instead of
/// failing: the instance attributes are exactly what the planner lacks.
fn lookup_member(value: &Value, name: &str, original: &Expr) -> Result<Partial, ExprError> {
    match value.member(name) {
        Some(v) => Ok(Partial::Known(v.clone())),
        None => {
            if is_resource_rooted(original) {
                Ok(Partial::Residual(original.clone()))
            } else {
                Err(match value {
                    Value::Map(_) => ExprError::UnknownName(name.to_string()),
                    other => ExprError::TypeMismatch(format!(
                        "cannot access member `{name}` of {}",
                        other.sort()
                    )),
                })
            }
        }
    }
}

/// True for member/index chains rooted at the request resource.
fn is_resource_rooted(expr: &Expr) -> bool {
    match expr {
        Expr::Ident(name) => name == "R",
        Expr::Member(base, name) => {
            matches!(base.as_ref(), Expr::Ident(root) if root == "request" && name == "resource")
                || is_resource_rooted(base)
        }
        Expr::Index(base, _) | Expr::Has(base) => is_resource_rooted(base),
        _ => false,
    }
}

// ---------- Residual construction and simplification ----------

fn and(a: Expr, b: Expr) -> Expr {
    use Literal::Bool;
    match (&a, &b) {
        (Expr::Lit(Bool(true)), _) => b,
        (_, Expr::Lit(Bool(true))) => a,
        (Expr::Lit(Bool(false)), _) | (_, Expr::Lit(Bool(false))) => {
            Expr::Lit(Bool(false))
        }
        _ if a == b => a, // duplicate-clause elimination
        _ => Expr::Binary(BinOp::And, Box::new(a), Box::new(b)),
    }
}

fn or(a: Expr, b: Expr) -> Expr {
    use Literal::Bool;
    match (&a, &b) {
        (Expr::Lit(Bool(false)), _) => b,
        (_, Expr::Lit(Bool(false))) => a,
        (Expr::Lit(Bool(true)), _) | (_, Expr::Lit(Bool(true))) => Expr::Lit(Bool(true)),
        _ if a == b => a,
        _ => Expr::Binary(BinOp::Or, Box::new(a), Box::new(b)),
    }
}

fn not(e: Expr) -> Expr {
    match e {
        Expr::Lit(Literal::Bool(b)) => Expr::Lit(Literal::Bool(!b)),
        Expr::Unary(UnaryOp::Not, inner) => *inner,
        other => Expr::Unary(UnaryOp::Not, Box::new(other)),
    }
}

/// Fold a value back into literal syntax. Sorts without literal forms keep
/// their constructor-call shape.
fn value_to_expr(v: &Value) -> Expr {
    match v {
        Value::Null => Expr::Lit(Literal::Null),
        Value::Bool(b) => Expr::Lit(Literal::Bool(*b)),
        Value::Int(i) => Expr::Lit(Literal::Int(*i)),
        Value::Float(f) => Expr::Lit(Literal::Float(*f)),
        Value::String(s) => Expr::Lit(Literal::Str(s.clone())),
        Value::List(items) => Expr::List(items.iter().map(value_to_expr).collect()),
        Value::Timestamp(ts) => Expr::Call {
            name: "timestamp".into(),
            args: vec![Expr::Lit(Literal::Str(ts.to_rfc3339()))],
        },
        Value::Duration(d) => Expr::Call {
            name: "duration".into(),
            args: vec![Expr::Lit(Literal::Str(format!("{}s", d.num_seconds())))],
        },
        // no map literal syntax; render through JSON for determinism
        Value::Map(_) => Expr::Lit(Literal::Str(v.to_json().to_string())),
    }
}

/// Render a residual in source syntax, parenthesized for re-parsing.
pub fn render(expr: &Expr) -> String {
    let mut out = String::new();
    render_into(expr, &mut out).expect("writing to a string is infallible");
    out
}

fn render_into(expr: &Expr, f: &mut impl fmt::Write) -> fmt::Result {
    match expr {
        Expr::Lit(Literal::Null) => write!(f, "null"),
        Expr::Lit(Literal::Bool(b)) => write!(f, "{b}"),
        Expr::Lit(Literal::Int(i)) => write!(f, "{i}"),
        Expr::Lit(Literal::Float(x)) => write!(f, "{x}"),
        Expr::Lit(Literal::Str(s)) => write!(f, "{s:?}"),
        Expr::Ident(name) => write!(f, "{name}"),
        Expr::Member(base, name) => {
            render_into(base, f)?;
            write!(f, ".{name}")
        }
        Expr::Index(base, index) => {
            render_into(base, f)?;
            write!(f, "[")?;
            render_into(index, f)?;
            write!(f, "]")
        }
        Expr::List(items) => {
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                render_into(item, f)?;
            }
            write!(f, "]")
        }
        Expr::Call { name, args } => {
            write!(f, "{name}(")?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                render_into(arg, f)?;
            }
            write!(f, ")")
        }
        Expr::Method { recv, name, args } => {
            render_into(recv, f)?;
            write!(f, ".{name}(")?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                render_into(arg, f)?;
            }
            write!(f, ")")
        }
        Expr::Has(inner) => {
            write!(f, "has(")?;
            render_into(inner, f)?;
            write!(f, ")")
        }
        Expr::Unary(UnaryOp::Not, inner) => {
            write!(f, "!(")?;
            render_into(inner, f)?;
            write!(f, ")")
        }
        Expr::Unary(UnaryOp::Neg, inner) => {
            write!(f, "-(")?;
            render_into(inner, f)?;
            write!(f, ")")
        }
        Expr::Binary(op, lhs, rhs) => {
            let sym = match op {
                BinOp::Eq => "==",
                BinOp::Ne => "!=",
                BinOp::Lt => "<",
                BinOp::Le => "<=",
                BinOp::Gt => ">",
                BinOp::Ge => ">=",
                BinOp::In => "in",
                BinOp::Add => "+",
                BinOp::Sub => "-",
                BinOp::Mul => "*",
                BinOp::Div => "/",
                BinOp::Mod => "%",
                BinOp::And => "&&",
                BinOp::Or => "||",
            };
            write!(f, "(")?;
            render_into(lhs, f)?;
            write!(f, " {sym} ")?;
            render_into(rhs, f)?;
            write!(f, ")")
        }
    }
}

/// Evaluate a plan against a concrete resource instance. Used to check plan
/// soundness: the result must equal the engine's decision.
pub fn evaluate_filter(
    filter: &PlanFilter,
    input: &CheckInput,
    now: DateTime<FixedOffset>,
) -> Result<bool, ExprError> {
    match filter {
        PlanFilter::AlwaysAllowed => Ok(true),
        PlanFilter::AlwaysDenied => Ok(false),
        PlanFilter::Conditional(residual) => {
            let program = expr::compile(residual, &expr::CompileCtx::empty())?;
            let request = build_request_value(input);
            let ctx = expr::EvalCtx::new(&request, now, &[]);
            expr::eval_bool(&program, &ctx)
        }
    }
}

/// The `request` binding for planning: the resource has no id and only the
/// supplied attributes.
fn build_plan_request(input: &PlanInput) -> Value {
    let probe = CheckInput {
        request_id: input.request_id.clone(),
        principal: input.principal.clone(),
        resource: ResourceInstance {
            kind: input.resource.kind.clone(),
            id: String::new(),
            policy_version: input.resource.policy_version.clone(),
            scope: input.resource.scope.clone(),
            attr: input.resource.attr.clone(),
        },
        actions: vec![input.action.clone()],
        aux_data: input.aux_data.clone(),
    };
    let mut request = build_request_value(&probe);
    if let Value::Map(fields) = &mut request {
        if let Some(Value::Map(resource)) = fields.get_mut("resource") {
            resource.remove("id");
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_set;
    use crate::loader::{read_policy, Format};
    use crate::policy::Policy;
    use serde_json::json;

    fn planner_with(yamls: &[&str]) -> Planner {
        let policies: Vec<Policy> = yamls
            .iter()
            .map(|y| read_policy(y.as_bytes(), Format::Yaml).unwrap())
            .collect();
        let units = compile_set(&policies).unwrap();
        Planner::new(Index::new(Snapshot::build(units)), "default")
    }

    fn plan_input(roles: &[&str], action: &str) -> PlanInput {
        PlanInput {
            request_id: "plan".into(),
            principal: Principal {
                id: "sally".into(),
                policy_version: None,
                scope: String::new(),
                roles: roles.iter().map(|r| r.to_string()).collect(),
                attr: serde_json::Map::new(),
            },
            resource: PlanResource {
                kind: "leave_request".into(),
                policy_version: None,
                scope: String::new(),
                attr: serde_json::Map::new(),
            },
            action: action.into(),
            aux_data: None,
        }
    }

    const POLICY: &str = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: default
  rules:
    - actions: ["view:*"]
      effect: EFFECT_ALLOW
      roles: [employee]
    - actions: [approve]
      effect: EFFECT_ALLOW
      roles: [manager]
      condition:
        match:
          expr: request.resource.attr.status == "PENDING_APPROVAL"
    - actions: [delete]
      effect: EFFECT_DENY
      roles: [manager]
      condition:
        match:
          expr: request.resource.attr.locked == true
    - actions: [delete]
      effect: EFFECT_ALLOW
      roles: [manager]
"#;

    #[test]
    fn test_unconditional_allow() {
        let planner = planner_with(&[POLICY]);
        let out = planner.plan(&plan_input(&["employee"], "view:public"));
        assert_eq!(out.filter, PlanFilter::AlwaysAllowed);
    }

    #[test]
    fn test_no_applicable_rule_is_denied() {
        let planner = planner_with(&[POLICY]);
        let out = planner.plan(&plan_input(&["contractor"], "approve"));
        assert_eq!(out.filter, PlanFilter::AlwaysDenied);

        let out = planner.plan(&plan_input(&["employee"], "unheard_of"));
        assert_eq!(out.filter, PlanFilter::AlwaysDenied);
    }

    #[test]
    fn test_conditional_residual() {
        let planner = planner_with(&[POLICY]);
        let out = planner.plan(&plan_input(&["manager"], "approve"));
        let PlanFilter::Conditional(residual) = &out.filter else {
            panic!("expected conditional, got {:?}", out.filter);
        };
        assert_eq!(
            render(residual),
            r#"(request.resource.attr.status == "PENDING_APPROVAL")"#
        );
    }

    #[test]
    fn test_deny_rule_guards_later_allow() {
        let planner = planner_with(&[POLICY]);
        let out = planner.plan(&plan_input(&["manager"], "delete"));
        let PlanFilter::Conditional(residual) = &out.filter else {
            panic!("expected conditional, got {:?}", out.filter);
        };
        // allowed iff the deny condition does not hold
        assert_eq!(render(residual), "!((request.resource.attr.locked == true))");
    }

    #[test]
    fn test_known_attributes_fold() {
        let planner = planner_with(&[POLICY]);
        let mut input = plan_input(&["manager"], "approve");
        input.resource.attr = json!({"status": "PENDING_APPROVAL"})
            .as_object()
            .cloned()
            .unwrap();
        let out = planner.plan(&input);
        assert_eq!(out.filter, PlanFilter::AlwaysAllowed);

        input.resource.attr = json!({"status": "DRAFT"}).as_object().cloned().unwrap();
        let out = planner.plan(&input);
        assert_eq!(out.filter, PlanFilter::AlwaysDenied);
    }

    #[test]
    fn test_principal_policy_short_circuits_plan() {
        let planner = planner_with(&[
            POLICY,
            r#"
apiVersion: api.cerbos.dev/v1
principalPolicy:
  principal: sally
  version: default
  rules:
    - resource: leave_request
      actions:
        - action: approve
          effect: EFFECT_ALLOW
"#,
        ]);
        let out = planner.plan(&plan_input(&[], "approve"));
        assert_eq!(out.filter, PlanFilter::AlwaysAllowed);
    }

    #[test]
    fn test_derived_role_activation_in_plan() {
        let planner = planner_with(&[
            r#"
apiVersion: api.cerbos.dev/v1
derivedRoles:
  name: ownership
  definitions:
    - name: owner
      parentRoles: [employee]
      condition:
        match:
          expr: request.resource.attr.owner == request.principal.id
"#,
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: default
  importDerivedRoles: [ownership]
  rules:
    - actions: [edit]
      effect: EFFECT_ALLOW
      derivedRoles: [owner]
"#,
        ]);
        let out = planner.plan(&plan_input(&["employee"], "edit"));
        let PlanFilter::Conditional(residual) = &out.filter else {
            panic!("expected conditional, got {:?}", out.filter);
        };
        assert_eq!(
            render(residual),
            r#"(request.resource.attr.owner == "sally")"#
        );

        // without the parent role the derived role can never activate
        let out = planner.plan(&plan_input(&["contractor"], "edit"));
        assert_eq!(out.filter, PlanFilter::AlwaysDenied);
    }

    #[test]
    fn test_plan_soundness_against_engine() {
        use crate::engine::{CancelToken, Engine, EngineConf};
        use crate::schema::SchemaRegistry;
        use std::sync::Arc;

        let policies: Vec<Policy> = [POLICY]
            .iter()
            .map(|y| read_policy(y.as_bytes(), Format::Yaml).unwrap())
            .collect();
        let units = compile_set(&policies).unwrap();
        let index = Index::new(Snapshot::build(units));
        let planner = Planner::new(index.clone(), "default");
        let engine = Engine::new(
            index,
            Arc::new(SchemaRegistry::new()),
            EngineConf::default(),
        );

        let now = Utc::now().fixed_offset();
        for action in ["view:public", "approve", "delete", "reject"] {
            let out = planner.plan(&plan_input(&["manager", "employee"], action));
            for attr in [
                json!({"status": "PENDING_APPROVAL", "locked": false}),
                json!({"status": "DRAFT", "locked": false}),
                json!({"status": "PENDING_APPROVAL", "locked": true}),
            ] {
                let check = CheckInput {
                    request_id: "t".into(),
                    principal: Principal {
                        id: "sally".into(),
                        policy_version: None,
                        scope: String::new(),
                        roles: vec!["manager".into(), "employee".into()],
                        attr: serde_json::Map::new(),
                    },
                    resource: ResourceInstance {
                        kind: "leave_request".into(),
                        id: "XX125".into(),
                        policy_version: None,
                        scope: String::new(),
                        attr: attr.as_object().cloned().unwrap(),
                    },
                    actions: vec![action.to_string()],
                    aux_data: None,
                };
                let effect = engine.check(&check, &CancelToken::new()).unwrap().results[0]
                    .actions[action]
                    .effect;
                let planned = evaluate_filter(&out.filter, &check, now).unwrap();
                assert_eq!(
                    planned,
                    effect == Effect::Allow,
                    "divergence for action {action} attr {attr}"
                );
            }
        }
    }
}
