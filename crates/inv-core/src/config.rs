//! YAML configuration for import runs.
//!
//! `${VAR}` references anywhere in the file are replaced with environment
//! variables before parsing. Every field is optional.
//!
//! ```yaml
//! overwrite: true
//! overwrite_vars: false
//! instance_id_path: "ec2_id,placement.instance"
//! enabled_var_path: status.power
//! enabled_value: "on"
//! host_filter: "web"
//! batch_size: 500
//! lock_timeout: 2m
//! license:
//!   license_type: enterprise
//!   instance_count: ${LICENSED_HOSTS}
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::capacity::LicenseInfo;
use crate::db::RetryConfig;
use crate::graph::{InventoryGraph, NameFilter};
use crate::identity::IdentityResolver;
use crate::lock::LockSettings;
use crate::reconcile::{ReconcileOptions, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};

/// Import configuration could not be loaded.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read import config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Import config is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Bad name filter '{pattern}': {message}")]
    BadFilter { pattern: String, message: String },

    #[error("Bad import option: {0}")]
    BadValue(String),

    #[error("Unset environment variables referenced: {0}")]
    MissingEnv(String),
}

/// Options for import runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Delete rows this source owns but no longer reports.
    pub overwrite: bool,
    /// Replace variables instead of merging them.
    pub overwrite_vars: bool,
    /// Comma separated dotted paths to the host instance ID.
    pub instance_id_path: Option<String>,
    /// Dotted path to the variable that decides whether a host is enabled.
    pub enabled_var_path: Option<String>,
    /// Value of `enabled_var_path` meaning enabled, compared case-insensitively.
    pub enabled_value: Option<String>,
    pub group_filter: Option<String>,
    pub host_filter: Option<String>,
    /// Drop groups with no hosts, children or variables before reconciling.
    pub exclude_empty_groups: bool,
    pub batch_size: usize,
    /// Fail the run when two hosts share an instance ID.
    pub reject_duplicate_instance_ids: bool,
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_poll_interval: Duration,
    /// Retry policy for the run status write.
    pub status_retry: RetryConfig,
    pub license: LicenseInfo,
}

impl Default for ImportConfig {
    fn default() -> Self {
        let lock = LockSettings::default();
        Self {
            overwrite: false,
            overwrite_vars: false,
            instance_id_path: None,
            enabled_var_path: None,
            enabled_value: None,
            group_filter: None,
            host_filter: None,
            exclude_empty_groups: false,
            batch_size: DEFAULT_BATCH_SIZE,
            reject_duplicate_instance_ids: false,
            lock_timeout: lock.timeout,
            lock_ttl: lock.ttl,
            lock_poll_interval: lock.poll_interval,
            status_retry: RetryConfig::default(),
            license: LicenseInfo::default(),
        }
    }
}

impl ImportConfig {
    /// Parses and validates a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let config: ImportConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field that parsing alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigError::BadValue(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        for pattern in [&self.group_filter, &self.host_filter].into_iter().flatten() {
            compile_filter(pattern)?;
        }
        if let Some(spec) = &self.instance_id_path {
            for path in spec.split(',') {
                let path = path.trim();
                if path.is_empty() || path.split('.').any(str::is_empty) {
                    return Err(ConfigError::BadValue(format!(
                        "instance_id_path entry '{}' is not a dotted path",
                        path
                    )));
                }
            }
        }
        if let Some(path) = &self.enabled_var_path {
            if path.split('.').any(str::is_empty) {
                return Err(ConfigError::BadValue(format!(
                    "enabled_var_path '{}' is not a dotted path",
                    path
                )));
            }
        }
        self.lock_settings()
            .validate()
            .map_err(|e| ConfigError::BadValue(e.to_string()))?;
        Ok(())
    }

    pub fn identity(&self) -> IdentityResolver {
        IdentityResolver::new(
            self.instance_id_path.clone(),
            self.enabled_var_path.clone(),
            self.enabled_value.clone(),
        )
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            overwrite: self.overwrite,
            overwrite_vars: self.overwrite_vars,
            batch_size: self.batch_size,
            reject_duplicate_instance_ids: self.reject_duplicate_instance_ids,
            identity: self.identity(),
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            timeout: self.lock_timeout,
            ttl: self.lock_ttl,
            poll_interval: self.lock_poll_interval,
        }
    }

    /// An empty graph carrying the configured name filters.
    pub fn graph(&self) -> Result<InventoryGraph, ConfigError> {
        let mut graph = InventoryGraph::new();
        if let Some(pattern) = &self.group_filter {
            graph = graph.with_group_filter(compile_filter(pattern)?);
        }
        if let Some(pattern) = &self.host_filter {
            graph = graph.with_host_filter(compile_filter(pattern)?);
        }
        Ok(graph)
    }
}

fn compile_filter(pattern: &str) -> Result<NameFilter, ConfigError> {
    NameFilter::new(pattern).map_err(|e| ConfigError::BadFilter {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Replaces `${VAR_NAME}` with the value of the environment variable.
fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    substitute_vars(input, |name| env::var(name).ok())
}

/// Replaces `${VAR_NAME}` with `lookup(VAR_NAME)`. Every name `lookup` does
/// not know is reported at once.
fn substitute_vars<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::BadValue(e.to_string()))?;
    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        lookup(name).unwrap_or_else(|| {
            missing.push(name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        return Err(ConfigError::MissingEnv(missing.join(", ")));
    }
    Ok(result.into_owned())
}

/// Loads and validates the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<ImportConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    ImportConfig::from_yaml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::LicenseType;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ImportConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ImportConfig::default());
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.lock_settings(), LockSettings::default());
    }

    #[test]
    fn test_load_from_file() {
        let yaml = r#"
overwrite: true
overwrite_vars: true
instance_id_path: "ec2_id, placement.instance"
enabled_var_path: status.power
enabled_value: "ON"
host_filter: "web"
batch_size: 50
lock_timeout: 5s
license:
  license_type: enterprise
  instance_count: 100
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert!(config.overwrite);
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.license.license_type, LicenseType::Enterprise);

        let options = config.reconcile_options();
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.identity.instance_id_path(), Some("ec2_id, placement.instance"));

        let mut graph = config.graph().unwrap();
        assert!(graph.get_or_create_host("web01").is_some());
        assert!(graph.get_or_create_host("db01").is_none());
    }

    #[test]
    fn test_var_substitution() {
        let vars: HashMap<&str, &str> = [("LICENSED_HOSTS", "42"), ("TIER", "gold")].into();
        let lookup = |name: &str| vars.get(name).map(|v| v.to_string());

        let content = substitute_vars(
            "license:\n  license_type: trial\n  instance_count: ${LICENSED_HOSTS}\n",
            lookup,
        )
        .unwrap();
        let config: ImportConfig = serde_yaml::from_str(&content).unwrap();
        assert_eq!(config.license.instance_count, 42);

        let err = substitute_vars("a: ${TIER}\nb: ${REGION}\nc: ${ZONE}\n", lookup).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(ref names) if names == "REGION, ZONE"));
    }

    #[test]
    fn test_missing_env_var() {
        let err = ImportConfig::from_yaml("host_filter: ${INV_TEST_NONEXISTENT_VAR}\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(ref name) if name == "INV_TEST_NONEXISTENT_VAR"));
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            ImportConfig::from_yaml("batch_size: 0\n").unwrap_err(),
            ConfigError::BadValue(_)
        ));
        assert!(matches!(
            ImportConfig::from_yaml("batch_size: 40000\n").unwrap_err(),
            ConfigError::BadValue(_)
        ));
        assert!(ImportConfig::from_yaml("batch_size: 10000\n").is_ok());
        assert!(matches!(
            ImportConfig::from_yaml("group_filter: \"web[\"\n").unwrap_err(),
            ConfigError::BadFilter { .. }
        ));
        assert!(matches!(
            ImportConfig::from_yaml("instance_id_path: \"a..b\"\n").unwrap_err(),
            ConfigError::BadValue(_)
        ));
        assert!(matches!(
            ImportConfig::from_yaml("lock_timeout: 2h\nlock_ttl: 1h\n").unwrap_err(),
            ConfigError::BadValue(_)
        ));
    }
}
