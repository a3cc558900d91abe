//! Transforms validated policies into evaluable compilation units.
//!
//! Compilation resolves `importDerivedRoles` and `importVariables` against
//! the rest of the set, denormalizes derived-role definitions into their
//! importers, topologically orders variable definitions into a slot table,
//! and precompiles every action pattern and condition expression. The output
//! is immutable; the engine never touches source policies.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use globset::{Glob, GlobMatcher};

use crate::condition::{CompiledExpr, CompiledMatch};
use crate::errors::{CompileError, ExprError};
use crate::expr::{self, CompileCtx, Expr, Program};
use crate::hash::policy_hash;
use crate::policy::{
    Effect, Policy, PolicyKey, PolicySchemas, Variables,
};

/// Binding names fixed by the evaluation environment.
const RESERVED_NAMES: [&str; 6] = ["request", "R", "P", "variables", "V", "now"];

/// The evaluable, import-resolved form of one policy.
#[derive(Debug)]
pub struct CompilationUnit {
    pub key: PolicyKey,
    pub fqn: String,
    pub hash: u64,
    /// Identities of the derived-role and exported-variable sets this unit
    /// depends on, in import order.
    pub dependencies: Vec<PolicyKey>,
    pub kind: CompiledKind,
}

#[derive(Debug)]
pub enum CompiledKind {
    Resource(CompiledResourcePolicy),
    Principal(CompiledPrincipalPolicy),
    /// Definitions are denormalized into every importer; the unit remains
    /// addressable for dependency-closure lookups.
    DerivedRoles,
    ExportVariables,
}

#[derive(Debug)]
pub struct CompiledResourcePolicy {
    pub schemas: Option<PolicySchemas>,
    pub derived_roles: Vec<CompiledDerivedRole>,
    pub variables: Arc<VariableTable>,
    pub rules: Vec<CompiledResourceRule>,
}

#[derive(Debug)]
pub struct CompiledPrincipalPolicy {
    pub variables: Arc<VariableTable>,
    pub rules: Vec<CompiledPrincipalRule>,
}

/// A derived-role definition carried into an importing resource policy.
/// Conditions are compiled against the defining set's variable table.
#[derive(Debug, Clone)]
pub struct CompiledDerivedRole {
    pub name: String,
    pub parent_roles: HashSet<String>,
    pub condition: Option<CompiledMatch>,
    pub variables: Arc<VariableTable>,
}

#[derive(Debug)]
pub struct CompiledResourceRule {
    pub name: String,
    pub ordinal: usize,
    pub actions: ActionMatcher,
    pub roles: HashSet<String>,
    pub derived_roles: HashSet<String>,
    pub condition: Option<CompiledMatch>,
    pub effect: Effect,
    pub output: Option<CompiledExpr>,
}

#[derive(Debug)]
pub struct CompiledPrincipalRule {
    pub resource: ActionMatcher,
    pub actions: Vec<CompiledPrincipalAction>,
}

#[derive(Debug)]
pub struct CompiledPrincipalAction {
    pub name: String,
    pub ordinal: usize,
    pub action: ActionMatcher,
    pub effect: Effect,
    pub condition: Option<CompiledMatch>,
    pub output: Option<CompiledExpr>,
}

/// Resolved variable definitions in topological order: a slot never
/// references a later slot. Slot indices feed the per-request memo table.
#[derive(Debug, Default)]
pub struct VariableTable {
    pub slots: Vec<VariableSlot>,
    /// Slot-indexed programs, the shape the evaluation context wants.
    pub programs: Vec<Program>,
    names: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct VariableSlot {
    pub name: String,
    pub expr: CompiledExpr,
}

impl VariableTable {
    pub fn slot(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }
}

/// Matcher over a set of action (or resource-kind) patterns. Literal-only
/// sets stay on the hash-set fast path; globs are compiled once.
#[derive(Debug)]
pub struct ActionMatcher {
    literals: HashSet<String>,
    globs: Vec<(String, GlobMatcher)>,
}

impl ActionMatcher {
    pub fn compile(patterns: &[String], policy: &str) -> Result<Self, CompileError> {
        let mut literals = HashSet::new();
        let mut globs = Vec::new();
        for pattern in patterns {
            if pattern.contains(['*', '?', '[']) {
                let glob = Glob::new(pattern).map_err(|e| CompileError::BadGlob {
                    policy: policy.to_string(),
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
                globs.push((pattern.clone(), glob.compile_matcher()));
            } else {
                literals.insert(pattern.clone());
            }
        }
        Ok(Self { literals, globs })
    }

    pub fn matches(&self, action: &str) -> bool {
        self.literals.contains(action)
            || self.globs.iter().any(|(_, glob)| glob.is_match(action))
    }

    /// The source patterns, for traces.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.literals
            .iter()
            .map(String::as_str)
            .chain(self.globs.iter().map(|(p, _)| p.as_str()))
    }
}

/// Compile a whole policy set. Disabled policies are skipped (importing one
/// is an error); everything else must resolve or the set is rejected.
pub fn compile_set(policies: &[Policy]) -> Result<Vec<CompilationUnit>, CompileError> {
    let mut seen = HashSet::new();
    for policy in policies {
        let key = policy.key();
        if !seen.insert(key.clone()) {
            return Err(CompileError::DuplicatePolicy { fqn: key.fqn() });
        }
    }

    let mut export_variables: HashMap<&str, &Policy> = HashMap::new();
    let mut derived_roles: HashMap<&str, &Policy> = HashMap::new();
    for policy in policies {
        if let Some(ev) = &policy.export_variables {
            export_variables.insert(ev.name.as_str(), policy);
        }
        if let Some(dr) = &policy.derived_roles {
            derived_roles.insert(dr.name.as_str(), policy);
        }
    }

    let resolver = Resolver {
        export_variables,
        derived_roles,
    };

    let mut units = Vec::new();
    let mut derived_cache: HashMap<String, Vec<CompiledDerivedRole>> = HashMap::new();

    for policy in policies {
        if policy.disabled {
            tracing::debug!(policy = %policy.fqn(), "skipping disabled policy");
            continue;
        }
        units.push(compile_policy(policy, &resolver, &mut derived_cache)?);
    }

    Ok(units)
}

struct Resolver<'p> {
    export_variables: HashMap<&'p str, &'p Policy>,
    derived_roles: HashMap<&'p str, &'p Policy>,
}

fn compile_policy(
    policy: &Policy,
    resolver: &Resolver<'_>,
    derived_cache: &mut HashMap<String, Vec<CompiledDerivedRole>>,
) -> Result<CompilationUnit, CompileError> {
    let key = policy.key();
    let fqn = key.fqn();
    let hash = policy_hash(policy);
    let mut dependencies = Vec::new();

    let kind = if let Some(rp) = &policy.resource_policy {
        let variables = Arc::new(build_variable_table(
            &rp.variables,
            &fqn,
            resolver,
            &mut dependencies,
        )?);

        let mut roles = Vec::new();
        let mut defined_names = HashSet::new();
        for import in &rp.import_derived_roles {
            let set = compile_derived_roles_set(import, &fqn, resolver, derived_cache)?;
            dependencies.push(PolicyKey::derived_roles(import));
            for role in &set {
                defined_names.insert(role.name.clone());
            }
            roles.extend(set);
        }

        let ctx = CompileCtx {
            var_slots: &variables.names,
        };
        let mut rules = Vec::with_capacity(rp.rules.len());
        for (ordinal, rule) in rp.rules.iter().enumerate() {
            for name in &rule.derived_roles {
                if !defined_names.contains(name) {
                    return Err(CompileError::UnknownDerivedRole {
                        policy: fqn.clone(),
                        name: name.clone(),
                    });
                }
            }
            if rule.roles.is_empty() && rule.derived_roles.is_empty() {
                return Err(CompileError::NoRoles {
                    policy: fqn.clone(),
                    rule: rule_label(&rule.name, ordinal),
                });
            }
            rules.push(CompiledResourceRule {
                name: rule.name.clone(),
                ordinal,
                actions: ActionMatcher::compile(&rule.actions, &fqn)?,
                roles: rule.roles.iter().cloned().collect(),
                derived_roles: rule.derived_roles.iter().cloned().collect(),
                condition: rule
                    .condition
                    .as_ref()
                    .map(|c| CompiledMatch::compile(&c.match_, &ctx))
                    .transpose()
                    .map_err(|e| expr_error(&fqn, e))?,
                effect: rule.effect,
                output: rule
                    .output
                    .as_ref()
                    .map(|o| CompiledExpr::compile(&o.expr, &ctx))
                    .transpose()
                    .map_err(|e| expr_error(&fqn, e))?,
            });
        }

        CompiledKind::Resource(CompiledResourcePolicy {
            schemas: rp.schemas.clone(),
            derived_roles: roles,
            variables,
            rules,
        })
    } else if let Some(pp) = &policy.principal_policy {
        let variables = Arc::new(build_variable_table(
            &pp.variables,
            &fqn,
            resolver,
            &mut dependencies,
        )?);
        let ctx = CompileCtx {
            var_slots: &variables.names,
        };

        let mut rules = Vec::with_capacity(pp.rules.len());
        for rule in &pp.rules {
            let resource =
                ActionMatcher::compile(std::slice::from_ref(&rule.resource), &fqn)?;
            let mut actions = Vec::with_capacity(rule.actions.len());
            for (ordinal, action) in rule.actions.iter().enumerate() {
                actions.push(CompiledPrincipalAction {
                    name: action.name.clone(),
                    ordinal,
                    action: ActionMatcher::compile(
                        std::slice::from_ref(&action.action),
                        &fqn,
                    )?,
                    effect: action.effect,
                    condition: action
                        .condition
                        .as_ref()
                        .map(|c| CompiledMatch::compile(&c.match_, &ctx))
                        .transpose()
                        .map_err(|e| expr_error(&fqn, e))?,
                    output: action
                        .output
                        .as_ref()
                        .map(|o| CompiledExpr::compile(&o.expr, &ctx))
                        .transpose()
                        .map_err(|e| expr_error(&fqn, e))?,
                });
            }
            rules.push(CompiledPrincipalRule { resource, actions });
        }

        CompiledKind::Principal(CompiledPrincipalPolicy { variables, rules })
    } else if policy.derived_roles.is_some() {
        let name = key.name.clone();
        // compiles the definitions (and records variable imports) even if
        // nothing imports this set yet
        compile_derived_roles_set(&name, &fqn, resolver, derived_cache)?;
        if let Some(dr) = &policy.derived_roles {
            for import in &dr.variables.import {
                dependencies.push(PolicyKey::export_variables(import));
            }
        }
        CompiledKind::DerivedRoles
    } else if let Some(ev) = &policy.export_variables {
        // self-contained check: definitions must parse and be acyclic
        let vars = Variables {
            import: vec![],
            local: ev.definitions.clone(),
        };
        build_variable_table(&vars, &fqn, resolver, &mut Vec::new())?;
        CompiledKind::ExportVariables
    } else {
        // unreachable for validated policies
        return Err(CompileError::MissingImport {
            policy: fqn,
            name: "policy kind".into(),
        });
    };

    Ok(CompilationUnit {
        key,
        fqn,
        hash,
        dependencies,
        kind,
    })
}

fn compile_derived_roles_set(
    name: &str,
    importer: &str,
    resolver: &Resolver<'_>,
    cache: &mut HashMap<String, Vec<CompiledDerivedRole>>,
) -> Result<Vec<CompiledDerivedRole>, CompileError> {
    if let Some(compiled) = cache.get(name) {
        return Ok(compiled.clone());
    }

    let policy = resolver.derived_roles.get(name).copied().ok_or_else(|| {
        CompileError::MissingImport {
            policy: importer.to_string(),
            name: name.to_string(),
        }
    })?;
    if policy.disabled {
        return Err(CompileError::DisabledImport {
            policy: importer.to_string(),
            fqn: policy.fqn(),
        });
    }

    let dr = policy.derived_roles.as_ref().expect("derived roles policy");
    let fqn = policy.fqn();
    let variables = Arc::new(build_variable_table(
        &dr.variables,
        &fqn,
        resolver,
        &mut Vec::new(),
    )?);
    let ctx = CompileCtx {
        var_slots: &variables.names,
    };

    let mut compiled = Vec::with_capacity(dr.definitions.len());
    for def in &dr.definitions {
        compiled.push(CompiledDerivedRole {
            name: def.name.clone(),
            parent_roles: def.parent_roles.iter().cloned().collect(),
            condition: def
                .condition
                .as_ref()
                .map(|c| CompiledMatch::compile(&c.match_, &ctx))
                .transpose()
                .map_err(|e| expr_error(&fqn, e))?,
            variables: Arc::clone(&variables),
        });
    }

    cache.insert(name.to_string(), compiled.clone());
    Ok(compiled)
}

/// Resolve imports, apply local shadowing, order definitions topologically
/// and compile each into a slot.
fn build_variable_table(
    variables: &Variables,
    policy: &str,
    resolver: &Resolver<'_>,
    dependencies: &mut Vec<PolicyKey>,
) -> Result<VariableTable, CompileError> {
    // effective set: imports in order, locals shadowing
    let mut effective: BTreeMap<String, String> = BTreeMap::new();
    for import in &variables.import {
        let source = resolver
            .export_variables
            .get(import.as_str())
            .copied()
            .ok_or_else(|| CompileError::MissingImport {
                policy: policy.to_string(),
                name: import.clone(),
            })?;
        if source.disabled {
            return Err(CompileError::DisabledImport {
                policy: policy.to_string(),
                fqn: source.fqn(),
            });
        }
        dependencies.push(PolicyKey::export_variables(import));
        let defs = &source.export_variables.as_ref().expect("export variables").definitions;
        for (name, expr) in defs {
            effective.insert(name.clone(), expr.clone());
        }
    }
    for (name, expr) in &variables.local {
        effective.insert(name.clone(), expr.clone());
    }

    for name in effective.keys() {
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(CompileError::ReservedName {
                policy: policy.to_string(),
                name: name.clone(),
            });
        }
    }

    // parse everything up front so dependency edges are known
    let mut parsed: BTreeMap<&str, (Expr, &str)> = BTreeMap::new();
    for (name, src) in &effective {
        let ast = expr::parse(src).map_err(|e| expr_error(policy, e))?;
        parsed.insert(name.as_str(), (ast, src.as_str()));
    }

    let mut deps: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, (ast, _)) in &parsed {
        let mut referenced = Vec::new();
        collect_variable_refs(ast, &mut referenced);
        let edges = referenced
            .into_iter()
            .filter(|r| effective.contains_key(*r))
            .collect();
        deps.insert(*name, edges);
    }

    // DFS ordering with cycle reporting; BTreeMap iteration keeps slot
    // assignment deterministic
    let mut order: Vec<&str> = Vec::with_capacity(parsed.len());
    let mut state: HashMap<&str, VisitState> = HashMap::new();
    let names: Vec<&str> = parsed.keys().copied().collect();
    for name in names {
        visit(name, &deps, &mut state, &mut order, policy)?;
    }

    let mut table = VariableTable::default();
    for (slot, name) in order.iter().enumerate() {
        table.names.insert((*name).to_string(), slot);
    }
    for name in &order {
        let (ast, src) = &parsed[*name];
        let ctx = CompileCtx {
            var_slots: &table.names,
        };
        let program = expr::compile(ast, &ctx).map_err(|e| expr_error(policy, e))?;
        table.programs.push(program.clone());
        table.slots.push(VariableSlot {
            name: (*name).to_string(),
            expr: CompiledExpr {
                src: (*src).to_string(),
                ast: ast.clone(),
                program,
            },
        });
    }
    Ok(table)
}

#[derive(Clone, Copy, PartialEq)]
enum VisitState {
    InProgress,
    Done,
}

fn visit<'n>(
    name: &'n str,
    deps: &BTreeMap<&'n str, Vec<&'n str>>,
    state: &mut HashMap<&'n str, VisitState>,
    order: &mut Vec<&'n str>,
    policy: &str,
) -> Result<(), CompileError> {
    match state.get(name) {
        Some(VisitState::Done) => return Ok(()),
        Some(VisitState::InProgress) => {
            return Err(CompileError::VariableCycle {
                policy: policy.to_string(),
                cycle: name.to_string(),
            })
        }
        None => {}
    }
    state.insert(name, VisitState::InProgress);
    if let Some(edges) = deps.get(name) {
        for dep in edges {
            visit(*dep, deps, state, order, policy)?;
        }
    }
    state.insert(name, VisitState::Done);
    order.push(name);
    Ok(())
}

/// Names referenced as `variables.x` or `V.x` within an expression.
fn collect_variable_refs<'e>(expr: &'e Expr, out: &mut Vec<&'e str>) {
    match expr {
        Expr::Member(base, name) => {
            if let Expr::Ident(root) = base.as_ref() {
                if root == "variables" || root == "V" {
                    out.push(name.as_str());
                    return;
                }
            }
            collect_variable_refs(base, out);
        }
        Expr::Index(base, index) => {
            collect_variable_refs(base, out);
            collect_variable_refs(index, out);
        }
        Expr::List(items) => {
            for item in items {
                collect_variable_refs(item, out);
            }
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_variable_refs(arg, out);
            }
        }
        Expr::Method { recv, args, .. } => {
            collect_variable_refs(recv, out);
            for arg in args {
                collect_variable_refs(arg, out);
            }
        }
        Expr::Has(inner) | Expr::Unary(_, inner) => collect_variable_refs(inner, out),
        Expr::Binary(_, lhs, rhs) => {
            collect_variable_refs(lhs, out);
            collect_variable_refs(rhs, out);
        }
        Expr::Lit(_) | Expr::Ident(_) => {}
    }
}

/// Rule identifier for traces and output sources: the declared name when
/// present, the declaration index otherwise.
pub fn rule_label(name: &str, ordinal: usize) -> String {
    if name.is_empty() {
        format!("#rule-{ordinal}")
    } else {
        format!("#{name}")
    }
}

fn expr_error(policy: &str, err: ExprError) -> CompileError {
    if let ExprError::UnknownName(name) = &err {
        if let Some(variable) = name.strip_prefix("variables.") {
            return CompileError::UndefinedVariable {
                policy: policy.to_string(),
                name: variable.to_string(),
            };
        }
    }
    CompileError::BadExpression {
        policy: policy.to_string(),
        source: err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{read_policy, Format};

    fn load(yaml: &str) -> Policy {
        read_policy(yaml.as_bytes(), Format::Yaml).unwrap()
    }

    fn resource_policy_yaml() -> Policy {
        load(
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: "20210210"
  importDerivedRoles:
    - common_roles
  variables:
    import:
      - common_vars
    local:
      is_pending: request.resource.attr.status == "PENDING_APPROVAL"
  rules:
    - actions: ["view:*"]
      effect: EFFECT_ALLOW
      derivedRoles: [employee_that_owns_the_record]
    - actions: [approve]
      effect: EFFECT_ALLOW
      derivedRoles: [direct_manager]
      condition:
        match:
          expr: variables.is_pending && variables.same_geography
"#,
        )
    }

    fn derived_roles_yaml() -> Policy {
        load(
            r#"
apiVersion: api.cerbos.dev/v1
derivedRoles:
  name: common_roles
  definitions:
    - name: employee_that_owns_the_record
      parentRoles: [employee]
      condition:
        match:
          expr: request.resource.attr.owner == request.principal.id
    - name: direct_manager
      parentRoles: [manager]
"#,
        )
    }

    fn export_variables_yaml() -> Policy {
        load(
            r#"
apiVersion: api.cerbos.dev/v1
exportVariables:
  name: common_vars
  definitions:
    same_geography: request.resource.attr.geography == request.principal.attr.geography
"#,
        )
    }

    #[test]
    fn test_compile_set_resolves_imports() {
        let policies = vec![
            resource_policy_yaml(),
            derived_roles_yaml(),
            export_variables_yaml(),
        ];
        let units = compile_set(&policies).unwrap();
        assert_eq!(units.len(), 3);

        let unit = &units[0];
        assert_eq!(unit.fqn, "resource.leave_request.v20210210");
        let CompiledKind::Resource(rp) = &unit.kind else {
            panic!("expected resource unit");
        };
        assert_eq!(rp.derived_roles.len(), 2);
        assert_eq!(rp.variables.slots.len(), 2);
        // imported variable resolves to a slot, local shadows nothing
        assert!(rp.variables.slot("same_geography").is_some());
        assert!(rp.variables.slot("is_pending").is_some());
        assert_eq!(
            unit.dependencies,
            vec![
                PolicyKey::export_variables("common_vars"),
                PolicyKey::derived_roles("common_roles"),
            ]
        );
    }

    #[test]
    fn test_missing_derived_roles_import() {
        let err = compile_set(&[resource_policy_yaml(), export_variables_yaml()]).unwrap_err();
        assert!(
            matches!(err, CompileError::MissingImport { ref name, .. } if name == "common_roles"),
            "got {err:?}"
        );
    }

    #[test]
    fn test_missing_variable_import() {
        let err = compile_set(&[resource_policy_yaml(), derived_roles_yaml()]).unwrap_err();
        assert!(
            matches!(err, CompileError::MissingImport { ref name, .. } if name == "common_vars"),
            "got {err:?}"
        );
    }

    #[test]
    fn test_unknown_derived_role_reference() {
        let mut policy = resource_policy_yaml();
        policy.resource_policy.as_mut().unwrap().rules[0].derived_roles =
            vec!["nonexistent".into()];
        let err =
            compile_set(&[policy, derived_roles_yaml(), export_variables_yaml()]).unwrap_err();
        assert!(matches!(err, CompileError::UnknownDerivedRole { .. }));
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let err = compile_set(&[resource_policy_yaml(), resource_policy_yaml()]).unwrap_err();
        assert!(matches!(err, CompileError::DuplicatePolicy { .. }));
    }

    #[test]
    fn test_variable_cycle_detected() {
        let policy = load(
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  variables:
    local:
      a: variables.b
      b: variables.a
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles: [admin]
"#,
        );
        let err = compile_set(&[policy]).unwrap_err();
        assert!(matches!(err, CompileError::VariableCycle { .. }));
    }

    #[test]
    fn test_variable_chain_is_topologically_ordered() {
        let policy = load(
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  variables:
    local:
      a: variables.b + 1
      b: variables.c + 1
      c: "1"
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles: [admin]
"#,
        );
        let units = compile_set(&[policy]).unwrap();
        let CompiledKind::Resource(rp) = &units[0].kind else {
            panic!("expected resource unit");
        };
        let positions: HashMap<&str, usize> = rp
            .variables
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        assert!(positions["c"] < positions["b"]);
        assert!(positions["b"] < positions["a"]);
    }

    #[test]
    fn test_reserved_variable_name_rejected() {
        let policy = load(
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  variables:
    local:
      request: "1"
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles: [admin]
"#,
        );
        let err = compile_set(&[policy]).unwrap_err();
        assert!(matches!(err, CompileError::ReservedName { ref name, .. } if name == "request"));
    }

    #[test]
    fn test_undefined_variable_rejected() {
        let policy = load(
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles: [admin]
      condition:
        match:
          expr: variables.missing
"#,
        );
        let err = compile_set(&[policy]).unwrap_err();
        assert!(matches!(err, CompileError::UndefinedVariable { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_rule_without_roles_rejected() {
        let policy = load(
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
"#,
        );
        let err = compile_set(&[policy]).unwrap_err();
        assert!(matches!(err, CompileError::NoRoles { .. }));
    }

    #[test]
    fn test_disabled_import_rejected() {
        let mut dr = derived_roles_yaml();
        dr.disabled = true;
        let err =
            compile_set(&[resource_policy_yaml(), dr, export_variables_yaml()]).unwrap_err();
        assert!(matches!(err, CompileError::DisabledImport { .. }));
    }

    #[test]
    fn test_action_matcher_globs() {
        let m = ActionMatcher::compile(
            &["view:*".into(), "approve".into()],
            "resource.test.vdefault",
        )
        .unwrap();
        assert!(m.matches("view:public"));
        assert!(m.matches("approve"));
        assert!(!m.matches("delete"));

        let star = ActionMatcher::compile(&["*".into()], "resource.test.vdefault").unwrap();
        assert!(star.matches("anything"));
    }

    #[test]
    fn test_local_shadows_import() {
        let ev = load(
            r#"
apiVersion: api.cerbos.dev/v1
exportVariables:
  name: common_vars
  definitions:
    flag: "false"
"#,
        );
        let rp = load(
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  variables:
    import: [common_vars]
    local:
      flag: "true"
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles: [admin]
      condition:
        match:
          expr: variables.flag
"#,
        );
        let units = compile_set(&[rp, ev]).unwrap();
        let CompiledKind::Resource(rp) = &units[0].kind else {
            panic!("expected resource unit");
        };
        let slot = rp.variables.slot("flag").unwrap();
        assert_eq!(rp.variables.slots[slot].expr.src, "true");
    }
}
