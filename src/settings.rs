use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::policy::DEFAULT_VERSION;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub storage: Storage,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Version used when a request carries no explicit policy version.
    pub default_policy_version: String,
    pub schema_validation: SchemaMode,
}

/// How attribute schema violations affect the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    /// Skip validation entirely.
    None,
    /// Report violations, proceed with the computed effects.
    Warn,
    /// Report violations and deny every action of the request.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Storage {
    /// Directory holding policy documents (one document per file).
    pub policy_dir: PathBuf,
    /// Directory holding attribute schemas, if any.
    pub schema_dir: Option<PathBuf>,
    /// Seconds between reloads of the policy directory. Unset disables
    /// periodic reloading.
    pub reload_interval_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Audit {
    pub enabled: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_policy_version: DEFAULT_VERSION.to_string(),
            schema_validation: SchemaMode::Warn,
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            policy_dir: PathBuf::from("policies"),
            schema_dir: None,
            reload_interval_sec: None,
        }
    }
}

impl Settings {
    /// Defaults, then the optional file at `path`, then environment
    /// overrides: UMBRA__ENGINE__SCHEMA_VALIDATION=error, etc.
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default(
                "engine.default_policy_version",
                EngineSettings::default().default_policy_version,
            )
            .into_diagnostic()?
            .set_default("engine.schema_validation", "warn")
            .into_diagnostic()?
            .set_default(
                "storage.policy_dir",
                Storage::default().policy_dir.to_string_lossy().to_string(),
            )
            .into_diagnostic()?
            .set_default("audit.enabled", false)
            .into_diagnostic()?;

        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder =
            builder.add_source(config::Environment::with_prefix("UMBRA").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let settings: Settings = cfg.try_deserialize().into_diagnostic()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.engine.default_policy_version, "default");
        assert_eq!(s.engine.schema_validation, SchemaMode::Warn);
        assert!(!s.audit.enabled);
        assert!(s.storage.reload_interval_sec.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[engine]
default_policy_version = "20210210"
schema_validation = "error"

[storage]
policy_dir = "/etc/umbra/policies"

[audit]
enabled = true
"#,
        )
        .unwrap();

        let s = Settings::load(path.to_str().unwrap()).unwrap();
        assert_eq!(s.engine.default_policy_version, "20210210");
        assert_eq!(s.engine.schema_validation, SchemaMode::Error);
        assert_eq!(s.storage.policy_dir, PathBuf::from("/etc/umbra/policies"));
        assert!(s.audit.enabled);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let s = Settings::load("/nonexistent/config.toml").unwrap();
        assert_eq!(s.engine.default_policy_version, "default");
    }
}
