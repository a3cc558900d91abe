//! The request evaluator: scope walk, derived-role activation, rule
//! selection, condition evaluation and effect aggregation.
//!
//! Resolution order per action: principal policies first, then resource
//! policies, then the `NO_MATCH` deny. Within each family the walk starts at
//! the densest scope prefix and moves toward the root; the first matching
//! rule wins, so an answer at a deeper scope is authoritative over anything
//! a parent scope would say.
//!
//! All shared state is immutable under the pinned snapshot. Per-request
//! state (bindings, variable memos, derived-role activations) lives in a
//! request-scoped [`EvalState`] and is discarded on completion.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::compiler::{
    rule_label, CompilationUnit, CompiledKind, CompiledResourcePolicy, VariableTable,
};
use crate::condition::CompiledExpr;
use crate::errors::Canceled;
use crate::expr::EvalCtx;
use crate::index::{Index, Snapshot};
use crate::policy::{Effect, PolicyKind, DEFAULT_VERSION};
use crate::schema::{SchemaRegistry, SchemaViolation};
use crate::settings::SchemaMode;
use crate::value::Value;

/// Policy identifier reported when no rule matched anywhere in the chain.
pub const NO_MATCH: &str = "NO_MATCH";

// ---------- Request / response types ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CheckInput {
    #[serde(default)]
    pub request_id: String,
    pub principal: Principal,
    pub resource: ResourceInstance,
    pub actions: Vec<String>,
    #[serde(default)]
    pub aux_data: Option<AuxData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub policy_version: Option<String>,
    #[serde(default)]
    pub scope: String,
    pub roles: Vec<String>,
    #[serde(default)]
    pub attr: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResourceInstance {
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub policy_version: Option<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub attr: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AuxData {
    #[serde(default)]
    pub jwt: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutput {
    pub request_id: String,
    /// One entry per checked resource. A single check produces a one-entry
    /// array, keeping the envelope identical to batch responses.
    pub results: Vec<CheckResult>,
    #[serde(skip)]
    pub trace: Vec<TraceEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub resource: ResourceIdentifier,
    /// Per-action decisions, keyed by action for deterministic encoding.
    pub actions: BTreeMap<String, ActionEffect>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub effective_derived_roles: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<SchemaViolation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentifier {
    pub kind: String,
    pub policy_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

/// Decision for one action. `scope` names the scope level whose rule decided
/// the action and is omitted when the deciding policy is unscoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEffect {
    pub effect: Effect,
    pub policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Value produced by a matched rule's `output.expr`.
#[derive(Debug, Clone, Serialize)]
pub struct OutputEntry {
    pub src: String,
    pub val: serde_json::Value,
}

/// One step of the evaluation, in the order it happened.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub event: TraceEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventKind {
    DerivedRoleActivated { role: String },
    DerivedRoleErrored { role: String, message: String },
    RuleMatched { effect: Effect },
    RuleErrored { message: String },
    OutputErrored { message: String },
    SchemaViolations { count: usize },
    NoMatch,
}

// ---------- Cancellation ----------

/// Cooperative cancellation flag, checked between rules and scope levels.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------- Engine ----------

#[derive(Debug, Clone)]
pub struct EngineConf {
    pub default_policy_version: String,
    pub schema_validation: SchemaMode,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            default_policy_version: DEFAULT_VERSION.to_string(),
            schema_validation: SchemaMode::Warn,
        }
    }
}

pub struct Engine {
    index: Index,
    schemas: Arc<SchemaRegistry>,
    conf: EngineConf,
}

impl Engine {
    pub fn new(index: Index, schemas: Arc<SchemaRegistry>, conf: EngineConf) -> Self {
        Self {
            index,
            schemas,
            conf,
        }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Evaluate one check request under the current snapshot.
    pub fn check(&self, input: &CheckInput, cancel: &CancelToken) -> Result<CheckOutput, Canceled> {
        let snapshot = self.index.snapshot();
        self.check_under(&snapshot, input, cancel)
    }

    /// Evaluate a batch in order. All inputs see the same snapshot.
    pub fn check_all(
        &self,
        inputs: &[CheckInput],
        cancel: &CancelToken,
    ) -> Result<Vec<CheckOutput>, Canceled> {
        let snapshot = self.index.snapshot();
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            if cancel.is_canceled() {
                return Err(Canceled);
            }
            outputs.push(self.check_under(&snapshot, input, cancel)?);
        }
        Ok(outputs)
    }

    fn check_under(
        &self,
        snapshot: &Snapshot,
        input: &CheckInput,
        cancel: &CancelToken,
    ) -> Result<CheckOutput, Canceled> {
        let request = build_request_value(input);
        let now = Utc::now().fixed_offset();
        let mut state = EvalState::new(snapshot, &request, now);

        let principal_version = input
            .principal
            .policy_version
            .as_deref()
            .unwrap_or(&self.conf.default_policy_version)
            .to_string();
        let resource_version = input
            .resource
            .policy_version
            .as_deref()
            .unwrap_or(&self.conf.default_policy_version)
            .to_string();

        let mut actions = BTreeMap::new();
        let mut outputs = Vec::new();

        for action in &input.actions {
            let decision = self.check_action(
                &mut state,
                input,
                action,
                &principal_version,
                &resource_version,
                &mut outputs,
                cancel,
            )?;
            actions.insert(action.clone(), decision);
        }

        // schema validation applies to the whole request, once
        let mut validation_errors = Vec::new();
        if self.conf.schema_validation != SchemaMode::None {
            validation_errors = self.validate_attributes(
                snapshot,
                input,
                &resource_version,
                &mut state.trace,
            );
            if !validation_errors.is_empty() && self.conf.schema_validation == SchemaMode::Error {
                for effect in actions.values_mut() {
                    effect.effect = Effect::Deny;
                }
            }
        }

        let mut effective_derived_roles: Vec<String> =
            state.effective_derived_roles.iter().cloned().collect();
        effective_derived_roles.sort();

        tracing::debug!(
            request_id = %input.request_id,
            resource = %input.resource.kind,
            actions = input.actions.len(),
            "evaluated check request"
        );

        Ok(CheckOutput {
            request_id: input.request_id.clone(),
            results: vec![CheckResult {
                resource: ResourceIdentifier {
                    kind: input.resource.kind.clone(),
                    policy_version: resource_version,
                    scope: input.resource.scope.clone(),
                },
                actions,
                effective_derived_roles,
                validation_errors,
                outputs,
            }],
            trace: state.trace,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn check_action(
        &self,
        state: &mut EvalState<'_>,
        input: &CheckInput,
        action: &str,
        principal_version: &str,
        resource_version: &str,
        outputs: &mut Vec<OutputEntry>,
        cancel: &CancelToken,
    ) -> Result<ActionEffect, Canceled> {
        if let Some(decision) = self.principal_walk(
            state,
            input,
            action,
            principal_version,
            outputs,
            cancel,
        )? {
            return Ok(decision);
        }

        if let Some(decision) = self.resource_walk(
            state,
            input,
            action,
            resource_version,
            outputs,
            cancel,
        )? {
            return Ok(decision);
        }

        state.trace.push(TraceEvent {
            policy: NO_MATCH.to_string(),
            rule: None,
            action: Some(action.to_string()),
            event: TraceEventKind::NoMatch,
        });
        Ok(ActionEffect {
            effect: Effect::Deny,
            policy: NO_MATCH.to_string(),
            scope: None,
        })
    }

    fn principal_walk(
        &self,
        state: &mut EvalState<'_>,
        input: &CheckInput,
        action: &str,
        version: &str,
        outputs: &mut Vec<OutputEntry>,
        cancel: &CancelToken,
    ) -> Result<Option<ActionEffect>, Canceled> {
        let snapshot = state.snapshot;
        let mut cursor = snapshot.scope_start(
            PolicyKind::Principal,
            &input.principal.id,
            version,
            &input.principal.scope,
        );

        while let Some(idx) = cursor {
            if cancel.is_canceled() {
                return Err(Canceled);
            }
            let unit = snapshot.unit(idx);
            let CompiledKind::Principal(pp) = &unit.kind else {
                cursor = snapshot.parent_of(idx);
                continue;
            };

            for rule in &pp.rules {
                if !rule.resource.matches(&input.resource.kind) {
                    continue;
                }
                for entry in &rule.actions {
                    if cancel.is_canceled() {
                        return Err(Canceled);
                    }
                    if !entry.action.matches(action) {
                        continue;
                    }
                    let cond_result = match &entry.condition {
                        None => Ok(true),
                        Some(cond) => cond.eval(state.ctx(&pp.variables)),
                    };
                    let matched = match cond_result {
                        Ok(matched) => matched,
                        Err(err) => {
                            state.trace.push(TraceEvent {
                                policy: unit.fqn.clone(),
                                rule: Some(rule_label(&entry.name, entry.ordinal)),
                                action: Some(action.to_string()),
                                event: TraceEventKind::RuleErrored {
                                    message: err.to_string(),
                                },
                            });
                            continue;
                        }
                    };
                    if !matched {
                        continue;
                    }

                    state.trace.push(TraceEvent {
                        policy: unit.fqn.clone(),
                        rule: Some(rule_label(&entry.name, entry.ordinal)),
                        action: Some(action.to_string()),
                        event: TraceEventKind::RuleMatched {
                            effect: entry.effect,
                        },
                    });
                    if let Some(output) = &entry.output {
                        self.emit_output(
                            state,
                            &unit.fqn,
                            &rule_label(&entry.name, entry.ordinal),
                            output,
                            &pp.variables,
                            outputs,
                        );
                    }
                    return Ok(Some(ActionEffect {
                        effect: entry.effect,
                        policy: unit.fqn.clone(),
                        scope: non_empty(&unit.key.scope),
                    }));
                }
            }
            cursor = snapshot.parent_of(idx);
        }
        Ok(None)
    }

    fn resource_walk(
        &self,
        state: &mut EvalState<'_>,
        input: &CheckInput,
        action: &str,
        version: &str,
        outputs: &mut Vec<OutputEntry>,
        cancel: &CancelToken,
    ) -> Result<Option<ActionEffect>, Canceled> {
        let snapshot = state.snapshot;
        let mut cursor = snapshot.scope_start(
            PolicyKind::Resource,
            &input.resource.kind,
            version,
            &input.resource.scope,
        );

        while let Some(idx) = cursor {
            if cancel.is_canceled() {
                return Err(Canceled);
            }
            let unit = snapshot.unit(idx);
            let CompiledKind::Resource(rp) = &unit.kind else {
                cursor = snapshot.parent_of(idx);
                continue;
            };

            let activated = state.activate_derived_roles(idx, unit, rp, &input.principal.roles);

            for rule in &rp.rules {
                if cancel.is_canceled() {
                    return Err(Canceled);
                }
                if !rule.actions.matches(action) {
                    continue;
                }
                let role_match = rule
                    .roles
                    .iter()
                    .any(|r| input.principal.roles.iter().any(|have| have == r))
                    || rule
                        .derived_roles
                        .iter()
                        .any(|r| activated.contains(r) || input.principal.roles.contains(r));
                if !role_match {
                    continue;
                }

                let cond_result = match &rule.condition {
                    None => Ok(true),
                    Some(cond) => cond.eval(state.ctx(&rp.variables)),
                };
                let matched = match cond_result {
                    Ok(matched) => matched,
                    Err(err) => {
                        state.trace.push(TraceEvent {
                            policy: unit.fqn.clone(),
                            rule: Some(rule_label(&rule.name, rule.ordinal)),
                            action: Some(action.to_string()),
                            event: TraceEventKind::RuleErrored {
                                message: err.to_string(),
                            },
                        });
                        continue;
                    }
                };
                if !matched {
                    continue;
                }

                state.trace.push(TraceEvent {
                    policy: unit.fqn.clone(),
                    rule: Some(rule_label(&rule.name, rule.ordinal)),
                    action: Some(action.to_string()),
                    event: TraceEventKind::RuleMatched {
                        effect: rule.effect,
                    },
                });
                if let Some(output) = &rule.output {
                    self.emit_output(
                        state,
                        &unit.fqn,
                        &rule_label(&rule.name, rule.ordinal),
                        output,
                        &rp.variables,
                        outputs,
                    );
                }
                return Ok(Some(ActionEffect {
                    effect: rule.effect,
                    policy: unit.fqn.clone(),
                    scope: non_empty(&unit.key.scope),
                }));
            }
            cursor = snapshot.parent_of(idx);
        }
        Ok(None)
    }

    /// Expression errors in outputs never change the effect; they only leave
    /// a trace entry.
    fn emit_output<'a>(
        &self,
        state: &mut EvalState<'a>,
        fqn: &str,
        rule: &str,
        output: &CompiledExpr,
        variables: &'a Arc<VariableTable>,
        outputs: &mut Vec<OutputEntry>,
    ) {
        let result = crate::expr::eval(&output.program, state.ctx(variables));
        match result {
            Ok(val) => outputs.push(OutputEntry {
                src: format!("{fqn}{rule}"),
                val: val.to_json(),
            }),
            Err(err) => state.trace.push(TraceEvent {
                policy: fqn.to_string(),
                rule: Some(rule.to_string()),
                action: None,
                event: TraceEventKind::OutputErrored {
                    message: err.to_string(),
                },
            }),
        }
    }

    /// Validate principal and resource attributes against the schemas of
    /// the deepest resource-policy unit in the chain that declares any.
    fn validate_attributes(
        &self,
        snapshot: &Snapshot,
        input: &CheckInput,
        resource_version: &str,
        trace: &mut Vec<TraceEvent>,
    ) -> Vec<SchemaViolation> {
        let mut cursor = snapshot.scope_start(
            PolicyKind::Resource,
            &input.resource.kind,
            resource_version,
            &input.resource.scope,
        );

        let mut violations = Vec::new();
        while let Some(idx) = cursor {
            let unit = snapshot.unit(idx);
            if let CompiledKind::Resource(CompiledResourcePolicy {
                schemas: Some(schemas),
                ..
            }) = &unit.kind
            {
                if let Some(schema) = &schemas.principal_schema {
                    violations.extend(self.schemas.validate(
                        &schema.reference,
                        "principal",
                        &serde_json::Value::Object(input.principal.attr.clone()),
                    ));
                }
                if let Some(schema) = &schemas.resource_schema {
                    violations.extend(self.schemas.validate(
                        &schema.reference,
                        "resource",
                        &serde_json::Value::Object(input.resource.attr.clone()),
                    ));
                }
                if !violations.is_empty() {
                    trace.push(TraceEvent {
                        policy: unit.fqn.clone(),
                        rule: None,
                        action: None,
                        event: TraceEventKind::SchemaViolations {
                            count: violations.len(),
                        },
                    });
                    tracing::warn!(
                        policy = %unit.fqn,
                        violations = violations.len(),
                        "attribute schema validation failed"
                    );
                }
                break;
            }
            cursor = snapshot.parent_of(idx);
        }
        violations
    }
}

// ---------- Per-request evaluation state ----------

struct EvalState<'a> {
    snapshot: &'a Snapshot,
    request: &'a Value,
    now: DateTime<FixedOffset>,
    /// Evaluation contexts keyed by variable-table identity; memoized
    /// variable values live inside and persist for the whole request.
    ctxs: HashMap<usize, EvalCtx<'a>>,
    /// Derived-role activations per resource-policy unit.
    activations: HashMap<usize, Arc<HashSet<String>>>,
    effective_derived_roles: HashSet<String>,
    trace: Vec<TraceEvent>,
}

impl<'a> EvalState<'a> {
    fn new(snapshot: &'a Snapshot, request: &'a Value, now: DateTime<FixedOffset>) -> Self {
        Self {
            snapshot,
            request,
            now,
            ctxs: HashMap::new(),
            activations: HashMap::new(),
            effective_derived_roles: HashSet::new(),
            trace: Vec::new(),
        }
    }

    fn ctx(&mut self, table: &'a Arc<VariableTable>) -> &EvalCtx<'a> {
        let key = Arc::as_ptr(table) as usize;
        let (request, now) = (self.request, self.now);
        self.ctxs
            .entry(key)
            .or_insert_with(|| EvalCtx::new(request, now, &table.programs))
    }

    /// Activate the unit's derived roles once per request. Activation order
    /// is import order then definition order; a condition error leaves the
    /// role inactive and a trace entry behind.
    fn activate_derived_roles(
        &mut self,
        idx: usize,
        unit: &'a CompilationUnit,
        rp: &'a CompiledResourcePolicy,
        principal_roles: &[String],
    ) -> Arc<HashSet<String>> {
        if let Some(cached) = self.activations.get(&idx) {
            return Arc::clone(cached);
        }

        let mut activated = HashSet::new();
        for role in &rp.derived_roles {
            if !principal_roles.iter().any(|r| role.parent_roles.contains(r)) {
                continue;
            }
            let cond_result = match &role.condition {
                None => Ok(true),
                Some(cond) => cond.eval(self.ctx(&role.variables)),
            };
            let active = match cond_result {
                Ok(active) => active,
                Err(err) => {
                    self.trace.push(TraceEvent {
                        policy: unit.fqn.clone(),
                        rule: None,
                        action: None,
                        event: TraceEventKind::DerivedRoleErrored {
                            role: role.name.clone(),
                            message: err.to_string(),
                        },
                    });
                    false
                }
            };
            if active {
                self.trace.push(TraceEvent {
                    policy: unit.fqn.clone(),
                    rule: None,
                    action: None,
                    event: TraceEventKind::DerivedRoleActivated {
                        role: role.name.clone(),
                    },
                });
                activated.insert(role.name.clone());
                self.effective_derived_roles.insert(role.name.clone());
            }
        }

        let activated = Arc::new(activated);
        self.activations.insert(idx, Arc::clone(&activated));
        activated
    }
}

/// The `request` binding visible to condition expressions.
pub(crate) fn build_request_value(input: &CheckInput) -> Value {
    let mut principal = BTreeMap::new();
    principal.insert("id".to_string(), Value::String(input.principal.id.clone()));
    principal.insert(
        "roles".to_string(),
        Value::List(
            input
                .principal
                .roles
                .iter()
                .map(|r| Value::String(r.clone()))
                .collect(),
        ),
    );
    principal.insert(
        "attr".to_string(),
        Value::from_json(&serde_json::Value::Object(input.principal.attr.clone())),
    );
    if !input.principal.scope.is_empty() {
        principal.insert(
            "scope".to_string(),
            Value::String(input.principal.scope.clone()),
        );
    }

    let mut resource = BTreeMap::new();
    resource.insert("kind".to_string(), Value::String(input.resource.kind.clone()));
    resource.insert("id".to_string(), Value::String(input.resource.id.clone()));
    resource.insert(
        "attr".to_string(),
        Value::from_json(&serde_json::Value::Object(input.resource.attr.clone())),
    );
    if !input.resource.scope.is_empty() {
        resource.insert(
            "scope".to_string(),
            Value::String(input.resource.scope.clone()),
        );
    }

    let mut aux_data = BTreeMap::new();
    let jwt = input
        .aux_data
        .as_ref()
        .map(|aux| serde_json::Value::Object(aux.jwt.clone()))
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    aux_data.insert("jwt".to_string(), Value::from_json(&jwt));

    let mut request = BTreeMap::new();
    request.insert("principal".to_string(), Value::Map(principal));
    request.insert("resource".to_string(), Value::Map(resource));
    request.insert("auxData".to_string(), Value::Map(aux_data));
    Value::Map(request)
}

fn non_empty(scope: &str) -> Option<String> {
    if scope.is_empty() {
        None
    } else {
        Some(scope.to_string())
    }
}
