//! End-to-end scenarios over the leave-management fixture policies.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use umbra::compiler::compile_set;
use umbra::engine::{
    CancelToken, CheckInput, Engine, EngineConf, Principal, ResourceInstance,
};
use umbra::errors::LoadError;
use umbra::hash::policy_hash;
use umbra::index::{Index, Snapshot};
use umbra::loader::{self, read_policy_file, Format};
use umbra::policy::Effect;
use umbra::schema::SchemaRegistry;
use umbra::settings::SchemaMode;

fn fixture(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(path)
}

fn store_engine() -> Engine {
    let policies = loader::load_dir(&fixture("store")).unwrap();
    let units = compile_set(&policies).unwrap();
    Engine::new(
        Index::new(Snapshot::build(units)),
        Arc::new(SchemaRegistry::new()),
        EngineConf::default(),
    )
}

fn sally() -> Principal {
    Principal {
        id: "sally".into(),
        policy_version: Some("20210210".into()),
        scope: String::new(),
        roles: vec!["employee".into(), "manager".into()],
        attr: json!({
            "department": "marketing",
            "geography": "GB",
            "team": "design",
            "managed_geographies": "GB",
        })
        .as_object()
        .cloned()
        .unwrap(),
    }
}

fn leave_request(version: &str, status: &str) -> ResourceInstance {
    ResourceInstance {
        kind: "leave_request".into(),
        id: "XX125".into(),
        policy_version: Some(version.into()),
        scope: String::new(),
        attr: json!({
            "owner": "john",
            "status": status,
            "geography": "GB",
            "department": "marketing",
            "team": "design",
        })
        .as_object()
        .cloned()
        .unwrap(),
    }
}

fn check_input(principal: Principal, resource: ResourceInstance, actions: &[&str]) -> CheckInput {
    CheckInput {
        request_id: "it-test".into(),
        principal,
        resource,
        actions: actions.iter().map(|a| a.to_string()).collect(),
        aux_data: None,
    }
}

#[test]
fn test_s1_manager_approves_pending_request() {
    let engine = store_engine();
    let out = engine
        .check(
            &check_input(sally(), leave_request("20210210", "PENDING_APPROVAL"), &["approve"]),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(out.results[0].actions["approve"].effect, Effect::Allow);
    assert_eq!(
        out.results[0].actions["approve"].policy,
        "resource.leave_request.v20210210"
    );
    assert_eq!(
        out.results[0].effective_derived_roles,
        vec!["any_employee".to_string(), "direct_manager".to_string()]
    );
}

#[test]
fn test_s2_manager_cannot_approve_draft() {
    let engine = store_engine();
    let out = engine
        .check(
            &check_input(sally(), leave_request("20210210", "DRAFT"), &["approve"]),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(out.results[0].actions["approve"].effect, Effect::Deny);
    assert_eq!(
        out.results[0].actions["approve"].policy,
        "resource.leave_request.v20210210"
    );
    assert_eq!(
        out.results[0].effective_derived_roles,
        vec!["any_employee".to_string(), "direct_manager".to_string()]
    );
}

#[test]
fn test_s3_principal_policy_override() {
    let engine = store_engine();
    let mut resource = leave_request("20210210", "PENDING_APPROVAL");
    resource
        .attr
        .insert("dev_record".into(), serde_json::Value::Bool(true));
    let principal = Principal {
        id: "donald_duck".into(),
        policy_version: Some("20210210".into()),
        scope: String::new(),
        roles: vec!["employee".into()],
        attr: serde_json::Map::new(),
    };

    let out = engine
        .check(
            &check_input(principal, resource, &["approve"]),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(out.results[0].actions["approve"].effect, Effect::Allow);
    assert_eq!(
        out.results[0].actions["approve"].policy,
        "principal.donald_duck.v20210210"
    );
}

#[test]
fn test_s4_resource_version_selects_policy() {
    let engine = store_engine();
    let out = engine
        .check(
            &check_input(
                sally(),
                leave_request("staging", "PENDING_APPROVAL"),
                &["approve", "view:public"],
            ),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(out.results[0].actions["approve"].effect, Effect::Deny);
    assert_eq!(
        out.results[0].actions["approve"].policy,
        "resource.leave_request.vstaging"
    );
    assert_eq!(out.results[0].actions["view:public"].effect, Effect::Allow);
    assert_eq!(
        out.results[0].actions["view:public"].policy,
        "resource.leave_request.vstaging"
    );
}

#[test]
fn test_s5_hash_stability_across_formats() {
    let from_yaml = read_policy_file(&fixture("policy_formats/resource_policy_01.yaml")).unwrap();
    let from_json = read_policy_file(&fixture("policy_formats/resource_policy_01.json")).unwrap();

    assert_eq!(policy_hash(&from_yaml), policy_hash(&from_json));

    // both compile to equivalent units
    let yaml_units = compile_set(std::slice::from_ref(&from_yaml)).unwrap();
    let json_units = compile_set(std::slice::from_ref(&from_json)).unwrap();
    assert_eq!(yaml_units[0].fqn, json_units[0].fqn);
    assert_eq!(yaml_units[0].hash, json_units[0].hash);
}

#[test]
fn test_s6_multiple_documents_rejected() {
    let err = read_policy_file(&fixture("policy_formats/multiple_policies.yaml")).unwrap_err();
    let LoadError::File { source, .. } = err else {
        panic!("expected file error, got {err:?}");
    };
    assert!(matches!(*source, LoadError::MultipleDocuments));
    assert_eq!(source.to_string(), "multiple policies in one file");
}

#[test]
fn test_determinism_over_fixture_store() {
    let engine = store_engine();
    let input = check_input(
        sally(),
        leave_request("20210210", "PENDING_APPROVAL"),
        &["approve", "view:public", "delete"],
    );

    let first = engine.check(&input, &CancelToken::new()).unwrap();
    for _ in 0..5 {
        let next = engine.check(&input, &CancelToken::new()).unwrap();
        assert_eq!(first.results[0].actions, next.results[0].actions);
        assert_eq!(first.results[0].effective_derived_roles, next.results[0].effective_derived_roles);
    }
}

#[test]
fn test_snapshot_pinned_across_reload() {
    let engine = store_engine();
    let input = check_input(
        sally(),
        leave_request("20210210", "PENDING_APPROVAL"),
        &["approve"],
    );

    let before = engine.check(&input, &CancelToken::new()).unwrap();

    // replace the snapshot with an empty one; a fresh check sees NO_MATCH
    engine.index().publish(Snapshot::build(vec![]));
    let after = engine.check(&input, &CancelToken::new()).unwrap();

    assert_eq!(before.results[0].actions["approve"].effect, Effect::Allow);
    assert_eq!(after.results[0].actions["approve"].policy, "NO_MATCH");
}

// ---------- schema validation modes ----------

fn schema_engine(mode: SchemaMode) -> Engine {
    let policy = read_policy(
        r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: default
  schemas:
    principalSchema:
      ref: cerbos:///principal.json
    resourceSchema:
      ref: cerbos:///leave_request.json
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles: [employee]
"#,
    );
    let units = compile_set(&[policy]).unwrap();

    let mut registry = SchemaRegistry::new();
    registry
        .register(
            "principal.json",
            &json!({"type": "object", "properties": {"department": {"type": "string"}}}),
        )
        .unwrap();
    registry
        .register(
            "leave_request.json",
            &json!({
                "type": "object",
                "properties": {"owner": {"type": "string"}},
                "required": ["owner"],
            }),
        )
        .unwrap();

    Engine::new(
        Index::new(Snapshot::build(units)),
        Arc::new(registry),
        EngineConf {
            default_policy_version: "default".into(),
            schema_validation: mode,
        },
    )
}

fn read_policy(yaml: &str) -> umbra::policy::Policy {
    umbra::loader::read_policy(yaml.as_bytes(), Format::Yaml).unwrap()
}

fn invalid_attr_input() -> CheckInput {
    CheckInput {
        request_id: "schema-test".into(),
        principal: Principal {
            id: "sally".into(),
            policy_version: None,
            scope: String::new(),
            roles: vec!["employee".into()],
            attr: serde_json::Map::new(),
        },
        resource: ResourceInstance {
            kind: "leave_request".into(),
            id: "XX125".into(),
            policy_version: None,
            scope: String::new(),
            // missing the required `owner`
            attr: json!({"status": "DRAFT"}).as_object().cloned().unwrap(),
        },
        actions: vec!["view".into()],
        aux_data: None,
    }
}

#[test]
fn test_schema_warn_mode_reports_but_allows() {
    let engine = schema_engine(SchemaMode::Warn);
    let out = engine
        .check(&invalid_attr_input(), &CancelToken::new())
        .unwrap();

    assert_eq!(out.results[0].actions["view"].effect, Effect::Allow);
    assert_eq!(out.results[0].validation_errors.len(), 1);
    assert_eq!(out.results[0].validation_errors[0].source, "resource");
}

#[test]
fn test_schema_error_mode_denies() {
    let engine = schema_engine(SchemaMode::Error);
    let out = engine
        .check(&invalid_attr_input(), &CancelToken::new())
        .unwrap();

    assert_eq!(out.results[0].actions["view"].effect, Effect::Deny);
    assert_eq!(out.results[0].validation_errors.len(), 1);
}

#[test]
fn test_schema_none_mode_skips_validation() {
    let engine = schema_engine(SchemaMode::None);
    let out = engine
        .check(&invalid_attr_input(), &CancelToken::new())
        .unwrap();

    assert_eq!(out.results[0].actions["view"].effect, Effect::Allow);
    assert!(out.results[0].validation_errors.is_empty());
}

#[test]
fn test_response_serialization_shape() {
    let engine = store_engine();
    let out = engine
        .check(
            &check_input(sally(), leave_request("20210210", "PENDING_APPROVAL"), &["approve"]),
            &CancelToken::new(),
        )
        .unwrap();

    let encoded = serde_json::to_value(&out).unwrap();
    assert_eq!(encoded["requestId"], "it-test");

    let results = encoded["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result["resource"]["kind"], "leave_request");
    assert_eq!(result["resource"]["policyVersion"], "20210210");
    assert_eq!(result["actions"]["approve"]["effect"], "EFFECT_ALLOW");
    assert_eq!(
        result["actions"]["approve"]["policy"],
        "resource.leave_request.v20210210"
    );
    assert_eq!(
        result["effectiveDerivedRoles"],
        json!(["any_employee", "direct_manager"])
    );
}
