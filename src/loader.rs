//! Reads policy documents from byte streams and directories.
//!
//! Each source unit must contain exactly one document; YAML streams with
//! multiple `---`-separated documents are rejected. Decoded policies are
//! structurally validated before they are handed to the compiler.

use std::path::Path;

use serde::Deserialize;

use crate::errors::LoadError;
use crate::policy::Policy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Advertised format for a file, by extension. Unknown extensions are
    /// not policy sources.
    pub fn from_path(path: &Path) -> Option<Format> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(Format::Yaml),
            Some("json") => Some(Format::Json),
            _ => None,
        }
    }
}

/// Decode and validate a single policy from `data`.
pub fn read_policy(data: &[u8], format: Format) -> Result<Policy, LoadError> {
    let policy = match format {
        Format::Yaml => read_yaml(data)?,
        Format::Json => {
            serde_json::from_slice::<Policy>(data).map_err(|e| LoadError::Malformed {
                format: "JSON",
                message: e.to_string(),
                location: Some((e.line(), e.column())),
            })?
        }
    };
    policy.validate()?;
    Ok(policy)
}

fn read_yaml(data: &[u8]) -> Result<Policy, LoadError> {
    let mut documents = serde_yaml::Deserializer::from_slice(data);

    let first = documents.next().ok_or(LoadError::Malformed {
        format: "YAML",
        message: "empty document".to_string(),
        location: None,
    })?;
    let policy = Policy::deserialize(first).map_err(|e| LoadError::Malformed {
        format: "YAML",
        message: e.to_string(),
        location: e.location().map(|l| (l.line(), l.column())),
    })?;

    if documents.next().is_some() {
        return Err(LoadError::MultipleDocuments);
    }
    Ok(policy)
}

/// Read one policy from a file, detecting the format from the extension.
pub fn read_policy_file(path: &Path) -> Result<Policy, LoadError> {
    let format = Format::from_path(path).ok_or_else(|| LoadError::Malformed {
        format: "unknown",
        message: format!("`{}` has no recognized policy extension", path.display()),
        location: None,
    })?;
    let data = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    read_policy(&data, format).map_err(|source| LoadError::File {
        path: path.display().to_string(),
        source: Box::new(source),
    })
}

/// Load every policy file from `dir` in sorted order.
///
/// Files without a policy extension, hidden files, and files with a leading
/// underscore (fixture convention) are skipped.
pub fn load_dir(dir: &Path) -> Result<Vec<Policy>, LoadError> {
    let read_dir = std::fs::read_dir(dir).map_err(|source| LoadError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut paths: Vec<_> = read_dir
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| Format::from_path(p).is_some())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with('.') && !n.starts_with('_'))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut policies = Vec::with_capacity(paths.len());
    for path in &paths {
        policies.push(read_policy_file(path)?);
    }

    tracing::info!(
        dir = %dir.display(),
        files = paths.len(),
        policies = policies.len(),
        "loaded policies"
    );

    Ok(policies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::policy_hash;

    const RESOURCE_YAML: &str = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: "20210210"
  importDerivedRoles:
    - common_roles
  rules:
    - actions: ["view:*"]
      effect: EFFECT_ALLOW
      derivedRoles: [employee_that_owns_the_record]
    - actions: [approve]
      condition:
        match:
          expr: request.resource.attr.status == "PENDING_APPROVAL"
      effect: EFFECT_ALLOW
      derivedRoles: [direct_manager]
"#;

    const RESOURCE_JSON: &str = r#"{
  "apiVersion": "api.cerbos.dev/v1",
  "resourcePolicy": {
    "resource": "leave_request",
    "version": "20210210",
    "importDerivedRoles": ["common_roles"],
    "rules": [
      {
        "actions": ["view:*"],
        "effect": "EFFECT_ALLOW",
        "derivedRoles": ["employee_that_owns_the_record"]
      },
      {
        "actions": ["approve"],
        "condition": {
          "match": {"expr": "request.resource.attr.status == \"PENDING_APPROVAL\""}
        },
        "effect": "EFFECT_ALLOW",
        "derivedRoles": ["direct_manager"]
      }
    ]
  }
}"#;

    #[test]
    fn test_yaml_and_json_hash_identically() {
        let from_yaml = read_policy(RESOURCE_YAML.as_bytes(), Format::Yaml).unwrap();
        let from_json = read_policy(RESOURCE_JSON.as_bytes(), Format::Json).unwrap();
        assert_eq!(policy_hash(&from_yaml), policy_hash(&from_json));
    }

    #[test]
    fn test_multiple_documents_rejected() {
        let stream = format!("{RESOURCE_YAML}\n---\n{RESOURCE_YAML}");
        let err = read_policy(stream.as_bytes(), Format::Yaml).unwrap_err();
        assert!(matches!(err, LoadError::MultipleDocuments));
        assert_eq!(err.to_string(), "multiple policies in one file");
    }

    #[test]
    fn test_empty_stream_rejected() {
        let err = read_policy(b"", Format::Yaml).unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }));
    }

    #[test]
    fn test_unknown_field_is_load_error() {
        let doc = "apiVersion: api.cerbos.dev/v1\nresourcePolicies: []\n";
        let err = read_policy(doc.as_bytes(), Format::Yaml).unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }));
    }

    #[test]
    fn test_validation_failure_surfaces_path() {
        let doc = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: "bad version"
  rules: []
"#;
        let err = read_policy(doc.as_bytes(), Format::Yaml).unwrap_err();
        match err {
            LoadError::Invalid(v) => assert_eq!(v.path, "resourcePolicy.version"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_dir_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_policy.yaml"), RESOURCE_YAML).unwrap();
        std::fs::write(
            dir.path().join("a_policy.json"),
            RESOURCE_JSON.replace("leave_request", "expense"),
        )
        .unwrap();
        std::fs::write(dir.path().join("_fixture.yaml"), "ignored").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let policies = load_dir(dir.path()).unwrap();
        assert_eq!(policies.len(), 2);
        // sorted by path: a_policy.json first
        assert_eq!(
            policies[0].resource_policy.as_ref().unwrap().resource,
            "expense"
        );
        assert_eq!(
            policies[1].resource_policy.as_ref().unwrap().resource,
            "leave_request"
        );
    }

    #[test]
    fn test_load_dir_error_carries_file_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "apiVersion: nope\n").unwrap();
        let err = load_dir(dir.path()).unwrap_err();
        match err {
            LoadError::File { path, .. } => assert!(path.ends_with("broken.yaml")),
            other => panic!("expected file error, got {other:?}"),
        }
    }
}
