//! Canonical store of compilation units with atomic snapshot replacement.
//!
//! Readers pin an `Arc<Snapshot>` for the whole request; a publish swaps the
//! current snapshot without blocking them, and the previous snapshot is
//! reclaimed when its last reader drops. Scope-parent links are stored as
//! indices into the snapshot so the whole structure stays value-typed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::compiler::CompilationUnit;
use crate::policy::{scope_ancestors, PolicyKey, PolicyKind};

#[derive(Default)]
pub struct Snapshot {
    units: Vec<CompilationUnit>,
    by_key: HashMap<PolicyKey, usize>,
    /// Nearest ancestor-scope unit within the same (kind, name, version)
    /// family, per unit.
    parents: Vec<Option<usize>>,
}

impl Snapshot {
    /// Index a compiled set. Keys are unique by construction (the compiler
    /// rejects duplicates).
    pub fn build(units: Vec<CompilationUnit>) -> Self {
        let mut by_key = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            by_key.insert(unit.key.clone(), i);
        }

        let parents = units
            .iter()
            .map(|unit| {
                scope_ancestors(&unit.key.scope)
                    .skip(1)
                    .find_map(|scope| {
                        by_key
                            .get(&PolicyKey {
                                kind: unit.key.kind,
                                name: unit.key.name.clone(),
                                version: unit.key.version.clone(),
                                scope: scope.to_string(),
                            })
                            .copied()
                    })
            })
            .collect();

        Self {
            units,
            by_key,
            parents,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, idx: usize) -> &CompilationUnit {
        &self.units[idx]
    }

    pub fn get(&self, key: &PolicyKey) -> Option<&CompilationUnit> {
        self.by_key.get(key).map(|i| &self.units[*i])
    }

    pub fn units(&self) -> impl Iterator<Item = &CompilationUnit> {
        self.units.iter()
    }

    /// The unit at the densest scope prefix of `scope` for the given policy
    /// family, if any level of the chain exists.
    pub fn scope_start(
        &self,
        kind: PolicyKind,
        name: &str,
        version: &str,
        scope: &str,
    ) -> Option<usize> {
        scope_ancestors(scope).find_map(|candidate| {
            self.by_key
                .get(&PolicyKey {
                    kind,
                    name: name.to_string(),
                    version: version.to_string(),
                    scope: candidate.to_string(),
                })
                .copied()
        })
    }

    /// The next scope level up from `idx`, if present.
    pub fn parent_of(&self, idx: usize) -> Option<usize> {
        self.parents[idx]
    }

    /// The unit plus every unit reachable through its dependencies.
    pub fn dependency_closure(&self, key: &PolicyKey) -> Vec<&CompilationUnit> {
        let mut seen = HashSet::new();
        let mut queue = vec![key.clone()];
        let mut closure = Vec::new();
        while let Some(next) = queue.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(unit) = self.get(&next) {
                queue.extend(unit.dependencies.iter().cloned());
                closure.push(unit);
            }
        }
        closure
    }

    fn count_kind(&self, kind: PolicyKind) -> usize {
        self.units.iter().filter(|u| u.key.kind == kind).count()
    }
}

/// Shared handle over the current snapshot. Cloning is cheap; all clones
/// observe the same published snapshot.
#[derive(Clone)]
pub struct Index {
    current: Arc<ArcSwap<Snapshot>>,
}

impl Default for Index {
    fn default() -> Self {
        Self::new(Snapshot::default())
    }
}

impl Index {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    /// Pin the current snapshot. A request holds this for its whole
    /// evaluation; a concurrent publish does not affect it.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Atomically replace the snapshot. In-flight readers keep the one they
    /// pinned; it is freed when the last of them drops it.
    pub fn publish(&self, snapshot: Snapshot) {
        let previous = self.current.load();
        let replaced = snapshot
            .units
            .iter()
            .filter(|u| previous.by_key.contains_key(&u.key))
            .count();
        tracing::info!(
            units = snapshot.len(),
            resource_policies = snapshot.count_kind(PolicyKind::Resource),
            principal_policies = snapshot.count_kind(PolicyKind::Principal),
            derived_roles = snapshot.count_kind(PolicyKind::DerivedRoles),
            export_variables = snapshot.count_kind(PolicyKind::ExportVariables),
            replaced,
            "published policy snapshot"
        );
        self.current.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_set;
    use crate::loader::{read_policy, Format};
    use crate::policy::Policy;

    fn scoped_policy(scope: &str) -> Policy {
        let scope_line = if scope.is_empty() {
            String::new()
        } else {
            format!("  scope: {scope}\n")
        };
        read_policy(
            format!(
                r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: default
{scope_line}
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles: [admin]
"#
            )
            .as_bytes(),
            Format::Yaml,
        )
        .unwrap()
    }

    fn build_snapshot(scopes: &[&str]) -> Snapshot {
        let policies: Vec<Policy> = scopes.iter().map(|s| scoped_policy(s)).collect();
        Snapshot::build(compile_set(&policies).unwrap())
    }

    #[test]
    fn test_scope_parents_resolved() {
        let snapshot = build_snapshot(&["", "acme", "acme.hr.uk"]);

        let leaf = snapshot
            .scope_start(PolicyKind::Resource, "leave_request", "default", "acme.hr.uk")
            .unwrap();
        assert_eq!(snapshot.unit(leaf).key.scope, "acme.hr.uk");

        // acme.hr is missing; the parent link skips to acme
        let parent = snapshot.parent_of(leaf).unwrap();
        assert_eq!(snapshot.unit(parent).key.scope, "acme");

        let root = snapshot.parent_of(parent).unwrap();
        assert_eq!(snapshot.unit(root).key.scope, "");
        assert_eq!(snapshot.parent_of(root), None);
    }

    #[test]
    fn test_scope_start_uses_densest_prefix() {
        let snapshot = build_snapshot(&["", "acme"]);
        // request scope acme.hr.uk has no exact unit; densest prefix is acme
        let start = snapshot
            .scope_start(PolicyKind::Resource, "leave_request", "default", "acme.hr.uk")
            .unwrap();
        assert_eq!(snapshot.unit(start).key.scope, "acme");
    }

    #[test]
    fn test_missing_family_returns_none() {
        let snapshot = build_snapshot(&[""]);
        assert!(snapshot
            .scope_start(PolicyKind::Resource, "expense", "default", "")
            .is_none());
        assert!(snapshot
            .scope_start(PolicyKind::Resource, "leave_request", "staging", "")
            .is_none());
    }

    #[test]
    fn test_publish_preserves_pinned_snapshot() {
        let index = Index::new(build_snapshot(&[""]));
        let pinned = index.snapshot();
        assert_eq!(pinned.len(), 1);

        index.publish(build_snapshot(&["", "acme"]));

        // the pinned snapshot still sees the old world
        assert_eq!(pinned.len(), 1);
        assert_eq!(index.snapshot().len(), 2);
    }

    #[test]
    fn test_dependency_closure() {
        let policies: Vec<Policy> = [
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  importDerivedRoles: [roles_a]
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      derivedRoles: [writer]
"#,
            r#"
apiVersion: api.cerbos.dev/v1
derivedRoles:
  name: roles_a
  variables:
    import: [vars_a]
  definitions:
    - name: writer
      parentRoles: [user]
      condition:
        match:
          expr: variables.flag
"#,
            r#"
apiVersion: api.cerbos.dev/v1
exportVariables:
  name: vars_a
  definitions:
    flag: "true"
"#,
        ]
        .iter()
        .map(|y| read_policy(y.as_bytes(), Format::Yaml).unwrap())
        .collect();

        let snapshot = Snapshot::build(compile_set(&policies).unwrap());
        let closure =
            snapshot.dependency_closure(&PolicyKey::resource("doc", "default", ""));
        let fqns: Vec<&str> = closure.iter().map(|u| u.fqn.as_str()).collect();
        assert_eq!(closure.len(), 3);
        assert!(fqns.contains(&"resource.doc.vdefault"));
        assert!(fqns.contains(&"derived_roles.roles_a"));
        assert!(fqns.contains(&"export_variables.vars_a"));
    }
}
