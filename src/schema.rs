//! Registry of JSON schemas for principal and resource attributes.
//!
//! Schemas are registered under a bare name and addressed from policies by
//! `cerbos:///<name>` references. Validators compile once at registration;
//! validation happens on demand during evaluation, per the engine's
//! configured mode.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::errors::ValidationError;

pub const SCHEME_PREFIX: &str = "cerbos:///";

/// A single attribute-validation failure, attached to check responses.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchemaViolation {
    /// `principal` or `resource`.
    pub source: &'static str,
    pub path: String,
    pub message: String,
}

#[derive(Default)]
pub struct SchemaRegistry {
    validators: HashMap<String, jsonschema::Validator>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and store a schema document under `name`. Re-registering a
    /// name replaces the previous schema.
    pub fn register(
        &mut self,
        name: &str,
        schema: &serde_json::Value,
    ) -> Result<(), ValidationError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| ValidationError::new(name, format!("invalid schema: {e}")))?;
        self.validators.insert(name.to_string(), validator);
        Ok(())
    }

    /// Register every `*.json` file in `dir`, keyed by file name.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, ValidationError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ValidationError::new(dir.display().to_string(), e.to_string()))?;
        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        for path in &paths {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let data = std::fs::read(path)
                .map_err(|e| ValidationError::new(name.clone(), e.to_string()))?;
            let schema: serde_json::Value = serde_json::from_slice(&data)
                .map_err(|e| ValidationError::new(name.clone(), e.to_string()))?;
            self.register(&name, &schema)?;
        }

        tracing::info!(dir = %dir.display(), schemas = paths.len(), "loaded schemas");
        Ok(paths.len())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }

    /// Validate `attr` against the schema behind `reference`. An unknown
    /// reference reports a single violation rather than silently passing.
    pub fn validate(
        &self,
        reference: &str,
        source: &'static str,
        attr: &serde_json::Value,
    ) -> Vec<SchemaViolation> {
        let name = reference.strip_prefix(SCHEME_PREFIX).unwrap_or(reference);
        let Some(validator) = self.validators.get(name) else {
            return vec![SchemaViolation {
                source,
                path: String::new(),
                message: format!("unknown schema `{reference}`"),
            }];
        };

        validator
            .iter_errors(attr)
            .map(|err| SchemaViolation {
                source,
                path: err.instance_path.to_string(),
                message: err.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leave_request_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "owner": {"type": "string"},
                "status": {"type": "string"},
                "geography": {"type": "string"},
            },
            "required": ["owner", "status"],
        })
    }

    #[test]
    fn test_valid_attributes_pass() {
        let mut registry = SchemaRegistry::new();
        registry
            .register("leave_request.json", &leave_request_schema())
            .unwrap();

        let violations = registry.validate(
            "cerbos:///leave_request.json",
            "resource",
            &json!({"owner": "john", "status": "DRAFT"}),
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn test_missing_required_field_reported_with_path() {
        let mut registry = SchemaRegistry::new();
        registry
            .register("leave_request.json", &leave_request_schema())
            .unwrap();

        let violations = registry.validate(
            "cerbos:///leave_request.json",
            "resource",
            &json!({"owner": "john"}),
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].source, "resource");
        assert!(violations[0].message.contains("status"));
    }

    #[test]
    fn test_wrong_type_reported() {
        let mut registry = SchemaRegistry::new();
        registry
            .register("leave_request.json", &leave_request_schema())
            .unwrap();

        let violations = registry.validate(
            "cerbos:///leave_request.json",
            "principal",
            &json!({"owner": 42, "status": "DRAFT"}),
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "/owner");
    }

    #[test]
    fn test_unknown_schema_is_a_violation() {
        let registry = SchemaRegistry::new();
        let violations =
            registry.validate("cerbos:///nope.json", "resource", &json!({}));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("unknown schema"));
    }

    #[test]
    fn test_invalid_schema_rejected_at_registration() {
        let mut registry = SchemaRegistry::new();
        let err = registry
            .register("bad.json", &json!({"type": "not-a-type"}))
            .unwrap_err();
        assert!(err.message.contains("invalid schema"));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("leave_request.json"),
            serde_json::to_string(&leave_request_schema()).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = SchemaRegistry::new();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 1);
        assert!(registry.contains("leave_request.json"));
    }
}
