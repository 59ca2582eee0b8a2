//! Host identity and enabled-state derivation from variable trees.
//!
//! Paths are dotted (`status.power`) and walk nested objects key by key. An
//! instance ID path spec may list several paths separated by commas; they are
//! tried in order and the first one that yields a non-empty value wins.

use crate::graph::Variables;
use serde_json::Value;

/// Walks a dotted path through nested objects.
fn lookup<'a>(variables: &'a Variables, path: &str) -> Option<&'a Value> {
    let mut keys = path.split('.');
    let first = keys.next()?;
    let mut current = variables.get(first)?;
    for key in keys {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// Truthiness of a variable value: null, false, zero and empty values are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Renders a variable value as a plain string.
///
/// Strings are returned without quotes; other values use their JSON form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves a host's instance ID from its variables.
///
/// `path_spec` is a comma separated list of dotted paths. Returns `default`
/// when no path yields a non-empty value.
pub fn resolve_instance_id(variables: &Variables, path_spec: &str, default: &str) -> String {
    path_spec
        .split(',')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .filter_map(|path| lookup(variables, path))
        .find(|value| is_truthy(value))
        .map(value_to_string)
        .unwrap_or_else(|| default.to_string())
}

/// Resolves a host's enabled flag from its variables.
///
/// Returns `None` when the path is absent, meaning the persisted flag should
/// be left alone. With an `expected_value`, the result is a case-insensitive
/// comparison against the raw value; otherwise it is the value's truthiness.
pub fn resolve_enabled(
    variables: &Variables,
    path: &str,
    expected_value: Option<&str>,
) -> Option<bool> {
    let value = lookup(variables, path)?;
    Some(match expected_value {
        Some(expected) => value_to_string(value).to_lowercase() == expected.to_lowercase(),
        None => is_truthy(value),
    })
}

/// Identity settings for one import run.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    instance_id_path: Option<String>,
    enabled_var_path: Option<String>,
    enabled_value: Option<String>,
}

impl IdentityResolver {
    /// Creates a resolver; empty strings count as unset.
    pub fn new(
        instance_id_path: Option<String>,
        enabled_var_path: Option<String>,
        enabled_value: Option<String>,
    ) -> Self {
        Self {
            instance_id_path: instance_id_path.filter(|s| !s.trim().is_empty()),
            enabled_var_path: enabled_var_path.filter(|s| !s.trim().is_empty()),
            enabled_value: enabled_value.filter(|s| !s.is_empty()),
        }
    }

    /// Returns `true` if an instance ID path is configured.
    pub fn tracks_instance_ids(&self) -> bool {
        self.instance_id_path.is_some()
    }

    /// Returns the configured instance ID path spec.
    pub fn instance_id_path(&self) -> Option<&str> {
        self.instance_id_path.as_deref()
    }

    /// Resolves the instance ID, or `None` when unset or not found.
    pub fn instance_id(&self, variables: &Variables) -> Option<String> {
        let spec = self.instance_id_path.as_deref()?;
        let id = resolve_instance_id(variables, spec, "");
        (!id.is_empty()).then_some(id)
    }

    /// Resolves the enabled flag, or `None` when it should not change.
    pub fn enabled(&self, variables: &Variables) -> Option<bool> {
        let path = self.enabled_var_path.as_deref()?;
        resolve_enabled(variables, path, self.enabled_value.as_deref())
    }

    /// Top-level variable keys that can hold an instance ID.
    pub fn instance_id_root_keys(&self) -> Vec<String> {
        self.instance_id_path
            .as_deref()
            .map(|spec| {
                spec.split(',')
                    .filter_map(|path| path.trim().split('.').next())
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
