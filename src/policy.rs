//! In-memory representation of parsed policy documents.
//!
//! One source unit decodes into one [`Policy`], a tagged container holding
//! exactly one of the four document kinds. Policies are immutable after load;
//! the compiler consumes them by reference and never mutates them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ValidationError;

pub const API_VERSION: &str = "api.cerbos.dev/v1";

/// Version used when a request carries no explicit policy version.
pub const DEFAULT_VERSION: &str = "default";

static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("version pattern"));

static SCOPE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_]*)(\.[-A-Za-z0-9_]*)*$").expect("scope pattern")
});

// The upstream rule-name pattern, kept verbatim. The outer `*` permits the
// empty string; empty names are accepted and ignored for identification.
static RULE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\--\.0-9@-Z_a-z]*$").expect("rule name pattern"));

/// A single policy document. Exactly one of the four kind fields is set;
/// [`Policy::validate`] enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Policy {
    pub api_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,

    /// Editor annotation pointing at the document's JSON schema. Excluded
    /// from serialization so the content hash ignores it.
    #[serde(rename = "$schema", default, skip_serializing)]
    pub json_schema: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<ResourcePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_policy: Option<PrincipalPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_roles: Option<DerivedRoles>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_variables: Option<ExportVariables>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResourcePolicy {
    pub resource: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_derived_roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<PolicySchemas>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ResourceRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResourceRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub actions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    pub effect: Effect,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PrincipalPolicy {
    pub principal: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,

    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<PrincipalRule>,
}

/// Rules inside a principal policy are grouped by the resource kind they
/// target; the kind may be a glob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PrincipalRule {
    pub resource: String,
    pub actions: Vec<PrincipalAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PrincipalAction {
    /// Literal or glob matched against the request action.
    pub action: String,

    pub effect: Effect,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DerivedRoles {
    pub name: String,

    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,

    pub definitions: Vec<RoleDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RoleDef {
    pub name: String,
    pub parent_roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ExportVariables {
    pub name: String,
    pub definitions: BTreeMap<String, String>,
}

/// Variable imports and local definitions. The effective set is the union;
/// a local name shadows an imported one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Variables {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub local: BTreeMap<String, String>,
}

impl Variables {
    pub fn is_empty(&self) -> bool {
        self.import.is_empty() && self.local.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PolicySchemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_schema: Option<SchemaRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_schema: Option<SchemaRef>,
}

/// Reference to a registered schema: `cerbos:///<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaRef {
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "match")]
    pub match_: Match,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    #[serde(rename = "EFFECT_ALLOW")]
    Allow,
    #[serde(rename = "EFFECT_DENY")]
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Allow => write!(f, "EFFECT_ALLOW"),
            Effect::Deny => write!(f, "EFFECT_DENY"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Output {
    pub expr: String,
}

/// Boolean combinator tree over condition expressions.
///
/// Exactly one variant is active per node; the deserializer rejects nodes
/// with zero or more than one of `all`, `any`, `none`, `expr` set.
#[derive(Debug, Clone)]
pub enum Match {
    All(Vec<Match>),
    Any(Vec<Match>),
    None(Vec<Match>),
    Expr(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MatchRaw {
    #[serde(default)]
    all: Option<Vec<Match>>,
    #[serde(default)]
    any: Option<Vec<Match>>,
    #[serde(default)]
    none: Option<Vec<Match>>,
    #[serde(default)]
    expr: Option<String>,
}

impl<'de> Deserialize<'de> for Match {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = MatchRaw::deserialize(deserializer)?;
        let mut set = 0;
        for present in [
            raw.all.is_some(),
            raw.any.is_some(),
            raw.none.is_some(),
            raw.expr.is_some(),
        ] {
            set += usize::from(present);
        }
        if set != 1 {
            return Err(D::Error::custom(
                "exactly one of `all`, `any`, `none`, `expr` must be set",
            ));
        }
        Ok(match raw {
            MatchRaw { all: Some(m), .. } => Match::All(m),
            MatchRaw { any: Some(m), .. } => Match::Any(m),
            MatchRaw { none: Some(m), .. } => Match::None(m),
            MatchRaw { expr: Some(e), .. } => Match::Expr(e),
            _ => unreachable!(),
        })
    }
}

impl Serialize for Match {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Match::All(m) => map.serialize_entry("all", m)?,
            Match::Any(m) => map.serialize_entry("any", m)?,
            Match::None(m) => map.serialize_entry("none", m)?,
            Match::Expr(e) => map.serialize_entry("expr", e)?,
        }
        map.end()
    }
}

// ---------- Identity ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Resource,
    Principal,
    DerivedRoles,
    ExportVariables,
}

/// Policy identity: `(kind, name-or-target, version, scope)`. Derived-role
/// and exported-variable sets have empty version and scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub kind: PolicyKind,
    pub name: String,
    pub version: String,
    pub scope: String,
}

impl PolicyKey {
    pub fn resource(kind: &str, version: &str, scope: &str) -> Self {
        Self {
            kind: PolicyKind::Resource,
            name: kind.to_string(),
            version: version.to_string(),
            scope: scope.to_string(),
        }
    }

    pub fn principal(id: &str, version: &str, scope: &str) -> Self {
        Self {
            kind: PolicyKind::Principal,
            name: id.to_string(),
            version: version.to_string(),
            scope: scope.to_string(),
        }
    }

    pub fn derived_roles(name: &str) -> Self {
        Self {
            kind: PolicyKind::DerivedRoles,
            name: name.to_string(),
            version: String::new(),
            scope: String::new(),
        }
    }

    pub fn export_variables(name: &str) -> Self {
        Self {
            kind: PolicyKind::ExportVariables,
            name: name.to_string(),
            version: String::new(),
            scope: String::new(),
        }
    }

    /// The stable, audit-visible identifier string.
    pub fn fqn(&self) -> String {
        let mut out = match self.kind {
            PolicyKind::Resource => format!("resource.{}.v{}", self.name, self.version),
            PolicyKind::Principal => format!("principal.{}.v{}", self.name, self.version),
            PolicyKind::DerivedRoles => format!("derived_roles.{}", self.name),
            PolicyKind::ExportVariables => format!("export_variables.{}", self.name),
        };
        if !self.scope.is_empty() {
            out.push('/');
            out.push_str(&self.scope);
        }
        out
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fqn())
    }
}

/// Ancestors of a scope, from the scope itself down to the root: for
/// `a.b.c` yields `a.b.c`, `a.b`, `a`, `""`.
pub fn scope_ancestors(scope: &str) -> impl Iterator<Item = &str> {
    let mut current = Some(scope);
    std::iter::from_fn(move || {
        let s = current?;
        current = if s.is_empty() {
            None
        } else {
            Some(s.rfind('.').map(|i| &s[..i]).unwrap_or(""))
        };
        Some(s)
    })
}

impl Policy {
    pub fn key(&self) -> PolicyKey {
        if let Some(rp) = &self.resource_policy {
            PolicyKey::resource(&rp.resource, &rp.version, &rp.scope)
        } else if let Some(pp) = &self.principal_policy {
            PolicyKey::principal(&pp.principal, &pp.version, &pp.scope)
        } else if let Some(dr) = &self.derived_roles {
            PolicyKey::derived_roles(&dr.name)
        } else if let Some(ev) = &self.export_variables {
            PolicyKey::export_variables(&ev.name)
        } else {
            // validate() rejects kindless policies before they reach here
            PolicyKey::resource("", "", "")
        }
    }

    pub fn fqn(&self) -> String {
        self.key().fqn()
    }

    /// Structural validation: required fields, patterns, uniqueness, and
    /// combinator arity. Returns the first violation found, with its field
    /// path.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.api_version != API_VERSION {
            return Err(ValidationError::new(
                "apiVersion",
                format!("must be `{API_VERSION}`"),
            ));
        }

        let kinds = [
            self.resource_policy.is_some(),
            self.principal_policy.is_some(),
            self.derived_roles.is_some(),
            self.export_variables.is_some(),
        ];
        if kinds.iter().filter(|set| **set).count() != 1 {
            return Err(ValidationError::new(
                "",
                "exactly one of resourcePolicy, principalPolicy, derivedRoles, exportVariables must be set",
            ));
        }

        if let Some(rp) = &self.resource_policy {
            validate_resource_policy(rp)?;
        }
        if let Some(pp) = &self.principal_policy {
            validate_principal_policy(pp)?;
        }
        if let Some(dr) = &self.derived_roles {
            validate_derived_roles(dr)?;
        }
        if let Some(ev) = &self.export_variables {
            validate_export_variables(ev)?;
        }
        Ok(())
    }
}

fn validate_resource_policy(rp: &ResourcePolicy) -> Result<(), ValidationError> {
    let base = "resourcePolicy";
    require_non_empty(&rp.resource, &format!("{base}.resource"))?;
    validate_version(&rp.version, &format!("{base}.version"))?;
    validate_scope(&rp.scope, &format!("{base}.scope"))?;
    for (i, name) in rp.import_derived_roles.iter().enumerate() {
        require_non_empty(name, &format!("{base}.importDerivedRoles[{i}]"))?;
    }
    validate_variables(&rp.variables, &format!("{base}.variables"))?;
    if let Some(schemas) = &rp.schemas {
        validate_schemas(schemas, &format!("{base}.schemas"))?;
    }

    let mut seen_names = HashSet::new();
    for (i, rule) in rp.rules.iter().enumerate() {
        let rule_path = format!("{base}.rules[{i}]");
        validate_rule_name(&rule.name, &mut seen_names, &rule_path)?;
        validate_actions(&rule.actions, &format!("{rule_path}.actions"))?;
        for (j, role) in rule.roles.iter().enumerate() {
            require_non_empty(role, &format!("{rule_path}.roles[{j}]"))?;
        }
        for (j, role) in rule.derived_roles.iter().enumerate() {
            require_non_empty(role, &format!("{rule_path}.derivedRoles[{j}]"))?;
        }
        if let Some(cond) = &rule.condition {
            validate_match(&cond.match_, &format!("{rule_path}.condition.match"))?;
        }
        if let Some(output) = &rule.output {
            require_non_empty(&output.expr, &format!("{rule_path}.output.expr"))?;
        }
    }
    Ok(())
}

fn validate_principal_policy(pp: &PrincipalPolicy) -> Result<(), ValidationError> {
    let base = "principalPolicy";
    require_non_empty(&pp.principal, &format!("{base}.principal"))?;
    validate_version(&pp.version, &format!("{base}.version"))?;
    validate_scope(&pp.scope, &format!("{base}.scope"))?;
    validate_variables(&pp.variables, &format!("{base}.variables"))?;

    for (i, rule) in pp.rules.iter().enumerate() {
        let rule_path = format!("{base}.rules[{i}]");
        require_non_empty(&rule.resource, &format!("{rule_path}.resource"))?;
        if rule.actions.is_empty() {
            return Err(ValidationError::new(
                format!("{rule_path}.actions"),
                "must not be empty",
            ));
        }
        let mut seen_names = HashSet::new();
        for (j, action) in rule.actions.iter().enumerate() {
            let action_path = format!("{rule_path}.actions[{j}]");
            require_non_empty(&action.action, &format!("{action_path}.action"))?;
            validate_rule_name(&action.name, &mut seen_names, &action_path)?;
            if let Some(cond) = &action.condition {
                validate_match(&cond.match_, &format!("{action_path}.condition.match"))?;
            }
            if let Some(output) = &action.output {
                require_non_empty(&output.expr, &format!("{action_path}.output.expr"))?;
            }
        }
    }
    Ok(())
}

fn validate_derived_roles(dr: &DerivedRoles) -> Result<(), ValidationError> {
    let base = "derivedRoles";
    require_non_empty(&dr.name, &format!("{base}.name"))?;
    validate_variables(&dr.variables, &format!("{base}.variables"))?;
    if dr.definitions.is_empty() {
        return Err(ValidationError::new(
            format!("{base}.definitions"),
            "must not be empty",
        ));
    }
    let mut seen = HashSet::new();
    for (i, def) in dr.definitions.iter().enumerate() {
        let def_path = format!("{base}.definitions[{i}]");
        require_non_empty(&def.name, &format!("{def_path}.name"))?;
        if !seen.insert(def.name.as_str()) {
            return Err(ValidationError::new(
                format!("{def_path}.name"),
                format!("duplicate definition `{}`", def.name),
            ));
        }
        if def.parent_roles.is_empty() {
            return Err(ValidationError::new(
                format!("{def_path}.parentRoles"),
                "must not be empty",
            ));
        }
        for (j, role) in def.parent_roles.iter().enumerate() {
            require_non_empty(role, &format!("{def_path}.parentRoles[{j}]"))?;
        }
        if let Some(cond) = &def.condition {
            validate_match(&cond.match_, &format!("{def_path}.condition.match"))?;
        }
    }
    Ok(())
}

fn validate_export_variables(ev: &ExportVariables) -> Result<(), ValidationError> {
    let base = "exportVariables";
    require_non_empty(&ev.name, &format!("{base}.name"))?;
    if ev.definitions.is_empty() {
        return Err(ValidationError::new(
            format!("{base}.definitions"),
            "must not be empty",
        ));
    }
    for (name, expr) in &ev.definitions {
        require_non_empty(name, &format!("{base}.definitions"))?;
        require_non_empty(expr, &format!("{base}.definitions.{name}"))?;
    }
    Ok(())
}

fn validate_variables(vars: &Variables, path: &str) -> Result<(), ValidationError> {
    for (i, import) in vars.import.iter().enumerate() {
        require_non_empty(import, &format!("{path}.import[{i}]"))?;
    }
    for (name, expr) in &vars.local {
        require_non_empty(name, &format!("{path}.local"))?;
        require_non_empty(expr, &format!("{path}.local.{name}"))?;
    }
    Ok(())
}

fn validate_schemas(schemas: &PolicySchemas, path: &str) -> Result<(), ValidationError> {
    if let Some(s) = &schemas.principal_schema {
        require_non_empty(&s.reference, &format!("{path}.principalSchema.ref"))?;
    }
    if let Some(s) = &schemas.resource_schema {
        require_non_empty(&s.reference, &format!("{path}.resourceSchema.ref"))?;
    }
    Ok(())
}

fn validate_actions(actions: &[String], path: &str) -> Result<(), ValidationError> {
    if actions.is_empty() {
        return Err(ValidationError::new(path, "must not be empty"));
    }
    let mut seen = HashSet::new();
    for (i, action) in actions.iter().enumerate() {
        require_non_empty(action, &format!("{path}[{i}]"))?;
        if !seen.insert(action.as_str()) {
            return Err(ValidationError::new(
                format!("{path}[{i}]"),
                format!("duplicate action `{action}`"),
            ));
        }
    }
    Ok(())
}

fn validate_rule_name<'a>(
    name: &'a str,
    seen: &mut HashSet<&'a str>,
    path: &str,
) -> Result<(), ValidationError> {
    if !RULE_NAME_PATTERN.is_match(name) {
        return Err(ValidationError::new(
            format!("{path}.name"),
            format!("`{name}` does not match the rule name pattern"),
        ));
    }
    if !name.is_empty() && !seen.insert(name) {
        return Err(ValidationError::new(
            format!("{path}.name"),
            format!("duplicate rule name `{name}`"),
        ));
    }
    Ok(())
}

fn validate_version(version: &str, path: &str) -> Result<(), ValidationError> {
    if !VERSION_PATTERN.is_match(version) {
        return Err(ValidationError::new(
            path,
            format!("`{version}` must match ^[A-Za-z0-9_]+$"),
        ));
    }
    Ok(())
}

fn validate_scope(scope: &str, path: &str) -> Result<(), ValidationError> {
    if !scope.is_empty() && !SCOPE_PATTERN.is_match(scope) {
        return Err(ValidationError::new(
            path,
            format!("`{scope}` is not a valid dotted scope"),
        ));
    }
    Ok(())
}

fn require_non_empty(value: &str, path: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(path, "must not be empty"));
    }
    Ok(())
}

fn validate_match(m: &Match, path: &str) -> Result<(), ValidationError> {
    match m {
        Match::All(items) | Match::Any(items) | Match::None(items) => {
            if items.is_empty() {
                return Err(ValidationError::new(path, "must contain at least one operand"));
            }
            for (i, item) in items.iter().enumerate() {
                validate_match(item, &format!("{path}[{i}]"))?;
            }
        }
        Match::Expr(expr) => {
            require_non_empty(expr, path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_resource_policy() -> Policy {
        serde_yaml::from_str(
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: "20210210"
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles: [admin]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_validate_minimal() {
        minimal_resource_policy().validate().unwrap();
    }

    #[test]
    fn test_bad_api_version() {
        let mut p = minimal_resource_policy();
        p.api_version = "something".into();
        let err = p.validate().unwrap_err();
        assert_eq!(err.path, "apiVersion");
    }

    #[test]
    fn test_bad_version_pattern() {
        let mut p = minimal_resource_policy();
        p.resource_policy.as_mut().unwrap().version = "not ok".into();
        let err = p.validate().unwrap_err();
        assert_eq!(err.path, "resourcePolicy.version");
    }

    #[test]
    fn test_scope_patterns() {
        for scope in ["acme", "acme.hr", "acme.hr.uk", "a-b.c_d"] {
            let mut p = minimal_resource_policy();
            p.resource_policy.as_mut().unwrap().scope = scope.into();
            p.validate().unwrap();
        }
        for scope in [".acme", "acme..", "-acme", "acme hr"] {
            let mut p = minimal_resource_policy();
            p.resource_policy.as_mut().unwrap().scope = scope.into();
            assert!(p.validate().is_err(), "scope `{scope}` should be rejected");
        }
    }

    #[test]
    fn test_duplicate_actions_rejected() {
        let mut p = minimal_resource_policy();
        p.resource_policy.as_mut().unwrap().rules[0].actions =
            vec!["view".into(), "view".into()];
        let err = p.validate().unwrap_err();
        assert!(err.message.contains("duplicate action"));
    }

    #[test]
    fn test_two_kinds_rejected() {
        let mut p = minimal_resource_policy();
        p.principal_policy = Some(PrincipalPolicy {
            principal: "daffy".into(),
            version: "default".into(),
            scope: String::new(),
            variables: Variables::default(),
            rules: vec![],
        });
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_match_exactly_one_variant() {
        let err = serde_yaml::from_str::<Match>("all: [{expr: \"true\"}]\nexpr: \"true\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("exactly one"));

        let m: Match = serde_yaml::from_str("any: [{expr: \"a\"}, {expr: \"b\"}]").unwrap();
        assert!(matches!(m, Match::Any(items) if items.len() == 2));
    }

    #[test]
    fn test_empty_match_list_rejected() {
        let mut p = minimal_resource_policy();
        p.resource_policy.as_mut().unwrap().rules[0].condition = Some(Condition {
            match_: Match::All(vec![]),
        });
        let err = p.validate().unwrap_err();
        assert!(err.path.ends_with("condition.match"));
    }

    #[test]
    fn test_rule_name_pattern() {
        let mut p = minimal_resource_policy();
        p.resource_policy.as_mut().unwrap().rules[0].name = "working-hours.rule_1".into();
        p.validate().unwrap();

        let mut p = minimal_resource_policy();
        p.resource_policy.as_mut().unwrap().rules[0].name = "no spaces".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_fqn_strings() {
        assert_eq!(
            PolicyKey::resource("leave_request", "20210210", "").fqn(),
            "resource.leave_request.v20210210"
        );
        assert_eq!(
            PolicyKey::resource("leave_request", "default", "acme.hr").fqn(),
            "resource.leave_request.vdefault/acme.hr"
        );
        assert_eq!(
            PolicyKey::principal("daffy_duck", "dev", "").fqn(),
            "principal.daffy_duck.vdev"
        );
        assert_eq!(
            PolicyKey::derived_roles("common_roles").fqn(),
            "derived_roles.common_roles"
        );
        assert_eq!(
            PolicyKey::export_variables("common_vars").fqn(),
            "export_variables.common_vars"
        );
    }

    #[test]
    fn test_scope_ancestors() {
        let chain: Vec<&str> = scope_ancestors("a.b.c").collect();
        assert_eq!(chain, vec!["a.b.c", "a.b", "a", ""]);

        let chain: Vec<&str> = scope_ancestors("").collect();
        assert_eq!(chain, vec![""]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = serde_yaml::from_str::<Policy>(
            "apiVersion: api.cerbos.dev/v1\nbogus: true\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
