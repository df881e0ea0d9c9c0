//! Ordered configuration input layers and path utilities.
//!
//! Values reach the processor from up to five sources, lowest precedence
//! first: schema defaults, a configuration file (JSON or YAML), `--config
//! key=value` pairs, `--override a__b__c=value` dotted overrides, and
//! explicit environment variables. Keys at any layer may address nested
//! properties with either `.` or `__` separators.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::error::StevedoreError;

/// Environment prefix for config inputs: property `a.b` reads `MCP_A__B`.
pub const ENV_INPUT_PREFIX: &str = "MCP_";

/// Layered configuration inputs in precedence order (lowest to highest;
/// schema defaults sit below all of these).
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    /// Parsed configuration file contents.
    pub file: Option<Value>,
    /// `--config key=value` pairs, applied in the order given.
    pub cli: Vec<(String, String)>,
    /// `--override a__b__c=value` pairs; terminal values are parsed as JSON
    /// when they parse, else kept as strings.
    pub overrides: Vec<(String, String)>,
    /// Explicit environment variables (`MCP_*`), the highest-precedence layer.
    pub env: BTreeMap<String, String>,
}

impl ConfigLayers {
    pub fn with_file(mut self, contents: Value) -> Self {
        self.file = Some(contents);
        self
    }

    pub fn with_cli_pair(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.cli.push((key.into(), value.into()));
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Parse a configuration file. JSON and YAML are accepted; the format is
    /// chosen by extension, with JSON tried first for unknown extensions.
    pub fn load_file(path: &Path) -> crate::Result<Value> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StevedoreError::InvalidConfiguration(path.display().to_string(), e.to_string())
        })?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed: Value = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| {
                StevedoreError::InvalidConfiguration(path.display().to_string(), e.to_string())
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| {
                StevedoreError::InvalidConfiguration(path.display().to_string(), e.to_string())
            })?,
            _ => serde_json::from_str(&contents)
                .or_else(|_| serde_yaml::from_str(&contents))
                .map_err(|e: serde_yaml::Error| {
                    StevedoreError::InvalidConfiguration(path.display().to_string(), e.to_string())
                })?,
        };
        if !parsed.is_object() {
            return Err(StevedoreError::InvalidConfiguration(
                path.display().to_string(),
                "configuration file must contain an object".to_string(),
            ));
        }
        Ok(parsed)
    }

    /// Parse one `key=value` argument.
    pub fn parse_pair(raw: &str) -> crate::Result<(String, String)> {
        match raw.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(StevedoreError::InvalidConfiguration(
                raw.to_string(),
                "expected key=value".to_string(),
            )),
        }
    }

    /// Snapshot `MCP_*` variables from the process environment.
    pub fn capture_env() -> BTreeMap<String, String> {
        std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_INPUT_PREFIX))
            .collect()
    }
}

/// Split a layer key into nested path segments. `__` takes priority over `.`
/// so keys like `server__tls.cert` descend at each `__` boundary first.
pub fn split_path(key: &str) -> Vec<String> {
    if key.contains("__") {
        key.split("__").map(str::to_string).collect()
    } else {
        key.split('.').map(str::to_string).collect()
    }
}

/// Insert `value` at the nested path, creating intermediate objects.
/// A scalar in the way of a deeper path is replaced by an object — the
/// later-specified entry wins.
pub fn insert_path(target: &mut serde_json::Map<String, Value>, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        target.insert(head.clone(), value);
        return;
    }
    let slot = target
        .entry(head.clone())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(inner) = slot {
        insert_path(inner, rest, value);
    }
}

/// The environment variable that feeds a property path:
/// `hello_from` → `MCP_HELLO_FROM`, `server.port` → `MCP_SERVER__PORT`.
pub fn env_key_for_path(path: &[String]) -> String {
    let joined = path
        .iter()
        .map(|segment| segment.to_uppercase().replace('-', "_"))
        .collect::<Vec<_>>()
        .join("__");
    format!("{}{}", ENV_INPUT_PREFIX, joined)
}
