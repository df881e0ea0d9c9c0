//! Configuration processor — schema-driven merge, coercion, and plan output.
//!
//! Merges the five input layers with fixed precedence, coerces strings into
//! the schema-declared types, validates the result, and emits the runtime
//! config tree plus an environment-variable map, bind-mount directives, and
//! container command arguments. Processing is deterministic: the same
//! template and layers always produce byte-identical outputs.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::layers::{env_key_for_path, split_path, ConfigLayers};
use crate::error::StevedoreError;
use crate::template::descriptor::{PropertySchema, TemplateDescriptor, Transport};

/// Environment names the platform owns. User config may neither read them as
/// overrides nor emit them via `env_mapping`.
pub const RESERVED_ENV_PREFIX: &str = "MCP_";

/// Identity variables injected at deploy time.
pub const IDENTITY_ENV_KEYS: &[&str] = &[
    "MCP_TEMPLATE_ID",
    "MCP_TEMPLATE_VERSION",
    "MCP_DEPLOYMENT_ID",
    "MCP_TRANSPORT",
];

/// True when an emitted env key collides with the platform-owned set.
pub fn is_reserved_env(name: &str) -> bool {
    name.starts_with(RESERVED_ENV_PREFIX) || IDENTITY_ENV_KEYS.contains(&name)
}

/// Identity environment for one deployment, merged over the template env map.
pub fn identity_env(
    template: &TemplateDescriptor,
    deployment_id: &str,
    transport: Transport,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("MCP_TEMPLATE_ID".to_string(), template.id.clone()),
        ("MCP_TEMPLATE_VERSION".to_string(), template.version.clone()),
        ("MCP_DEPLOYMENT_ID".to_string(), deployment_id.to_string()),
        ("MCP_TRANSPORT".to_string(), transport.to_string()),
    ])
}

/// One bind mount, `host:container`. A bare path mounts to the same path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub host: String,
    pub container: String,
}

impl VolumeMount {
    fn parse(token: &str) -> Self {
        match token.split_once(':') {
            Some((host, container)) if !container.is_empty() => Self {
                host: host.to_string(),
                container: container.to_string(),
            },
            _ => Self {
                host: token.to_string(),
                container: token.to_string(),
            },
        }
    }
}

/// Output of configuration processing: validated values plus container plans.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedConfig {
    pub template_id: String,
    /// Validated runtime configuration tree.
    pub values: Value,
    /// Environment map from `env_mapping` annotations; deterministic order.
    pub env: BTreeMap<String, String>,
    /// Bind mounts from `volume_mount` annotations, in schema order.
    pub volumes: Vec<VolumeMount>,
    /// Container command arguments from `command_arg` annotations, in
    /// schema-declaration order.
    pub args: Vec<String>,
    /// Dotted paths of sensitive properties, for redaction.
    #[serde(skip)]
    sensitive_paths: Vec<String>,
    /// Env keys fed by sensitive properties, for redaction.
    #[serde(skip)]
    sensitive_env: Vec<String>,
}

impl ProcessedConfig {
    /// Stable content hash of the resolved configuration, used for
    /// idempotent-redeploy detection.
    pub fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.template_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(&self.values).unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    /// The env map with values of sensitive properties replaced by `***`,
    /// for plan output and logs.
    pub fn redacted_env(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| {
                if self.sensitive_env.contains(k) {
                    (k.clone(), "***".to_string())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    /// The config tree with sensitive leaves replaced by `***`. This is the
    /// only form the platform ever logs or echoes.
    pub fn redacted_values(&self) -> Value {
        let mut clone = self.values.clone();
        for path in &self.sensitive_paths {
            let segments: Vec<&str> = path.split('.').collect();
            redact_at(&mut clone, &segments);
        }
        clone
    }
}

fn redact_at(value: &mut Value, path: &[&str]) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    let Some(slot) = value.get_mut(head) else {
        return;
    };
    if rest.is_empty() {
        if !slot.is_null() {
            *slot = Value::String("***".to_string());
        }
    } else {
        redact_at(slot, rest);
    }
}

/// Schema-driven configuration processor for one template.
pub struct ConfigProcessor<'a> {
    template: &'a TemplateDescriptor,
}

impl<'a> ConfigProcessor<'a> {
    pub fn new(template: &'a TemplateDescriptor) -> Self {
        Self { template }
    }

    /// Merge, coerce, validate, and emit plans.
    pub fn process(&self, layers: &ConfigLayers) -> crate::Result<ProcessedConfig> {
        let properties = &self.template.config_schema.properties;

        // Reject reserved env names before any merging happens.
        check_reserved_mappings(properties)?;

        // Layer 1: schema defaults.
        let mut root = build_defaults(properties);

        // Layer 2: configuration file.
        if let Some(Value::Object(file)) = &layers.file {
            for (key, value) in file {
                overlay_entry(&mut root, key, value.clone());
            }
        }

        // Layer 3: --config key=value pairs.
        for (key, value) in &layers.cli {
            overlay_entry(&mut root, key, Value::String(value.clone()));
        }

        // Layer 4: --override dotted paths; terminal parsed as JSON if it parses.
        for (key, raw) in &layers.overrides {
            let value = serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.clone()));
            overlay_entry(&mut root, key, value);
        }

        // Layer 5: explicit environment variables.
        apply_env_layer(&mut root, properties, &layers.env, &mut Vec::new());

        // Coerce strings into declared types, then validate.
        coerce_object(&mut root, properties, "")?;
        validate_object(
            &Value::Object(root.clone()),
            properties,
            &self.template.config_schema.required,
            "",
        )?;

        // Emit plans in schema-declaration order.
        let mut outputs = Outputs::default();
        collect_outputs(
            &Value::Object(root.clone()),
            properties,
            &mut Vec::new(),
            &mut outputs,
        );

        let processed = ProcessedConfig {
            template_id: self.template.id.clone(),
            values: Value::Object(root),
            env: outputs.env,
            volumes: outputs.volumes,
            args: outputs.args,
            sensitive_paths: outputs.sensitive_paths,
            sensitive_env: outputs.sensitive_env,
        };
        tracing::debug!(
            template = %self.template.id,
            values = %processed.redacted_values(),
            env_keys = processed.env.len(),
            mounts = processed.volumes.len(),
            "configuration processed"
        );
        Ok(processed)
    }
}

/// Reject `env_mapping` annotations naming platform-reserved variables.
fn check_reserved_mappings(properties: &IndexMap<String, PropertySchema>) -> crate::Result<()> {
    for schema in properties.values() {
        if let Some(ref name) = schema.env_mapping {
            if is_reserved_env(name) {
                return Err(StevedoreError::ReservedEnvVar(name.clone()));
            }
        }
        check_reserved_mappings(&schema.properties)?;
    }
    Ok(())
}

/// Build the defaults tree from the schema, recursing into nested objects.
fn build_defaults(properties: &IndexMap<String, PropertySchema>) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    for (key, schema) in properties {
        if let Some(ref default) = schema.default {
            map.insert(key.clone(), default.clone());
        } else if !schema.properties.is_empty() {
            let nested = build_defaults(&schema.properties);
            if !nested.is_empty() {
                map.insert(key.clone(), Value::Object(nested));
            }
        }
    }
    map
}

/// Apply one layer entry at a possibly-dotted key. Objects deep-merge,
/// everything else replaces.
fn overlay_entry(target: &mut serde_json::Map<String, Value>, key: &str, value: Value) {
    let segments = split_path(key);
    overlay_at(target, &segments, value);
}

fn overlay_at(target: &mut serde_json::Map<String, Value>, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        match (target.get_mut(head), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    overlay_at(existing, &[k], v);
                }
            }
            (_, value) => {
                target.insert(head.clone(), value);
            }
        }
        return;
    }
    let slot = target
        .entry(head.clone())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(inner) = slot {
        overlay_at(inner, rest, value);
    }
}

/// Overlay `MCP_*` environment values onto matching schema leaves.
fn apply_env_layer(
    target: &mut serde_json::Map<String, Value>,
    properties: &IndexMap<String, PropertySchema>,
    env: &BTreeMap<String, String>,
    path: &mut Vec<String>,
) {
    for (key, schema) in properties {
        path.push(key.clone());
        if schema.is_object() && !schema.properties.is_empty() {
            let slot = target
                .entry(key.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(inner) = slot {
                apply_env_layer(inner, &schema.properties, env, path);
            }
        } else if let Some(raw) = env.get(&env_key_for_path(path)) {
            target.insert(key.clone(), Value::String(raw.clone()));
        }
        path.pop();
    }
}

fn property_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Coerce every schema-known value in the tree to its declared type.
fn coerce_object(
    target: &mut serde_json::Map<String, Value>,
    properties: &IndexMap<String, PropertySchema>,
    prefix: &str,
) -> crate::Result<()> {
    for (key, schema) in properties {
        let path = property_path(prefix, key);
        let Some(value) = target.get_mut(key) else {
            continue;
        };
        coerce_value(value, schema, &path)?;
    }
    Ok(())
}

fn coercion_error(path: &str, expected: &str, got: &Value) -> StevedoreError {
    let shown = match got {
        Value::String(s) => format!("'{}'", s),
        other => other.to_string(),
    };
    StevedoreError::InvalidConfiguration(
        path.to_string(),
        format!("expected {}, got {}", expected, shown),
    )
}

fn coerce_value(value: &mut Value, schema: &PropertySchema, path: &str) -> crate::Result<()> {
    if value.is_null() {
        return Ok(());
    }
    if schema.is_object() {
        if let Value::String(s) = &*value {
            match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => *value = parsed,
                _ => return Err(coercion_error(path, "object", value)),
            }
        }
        return match value {
            Value::Object(inner) => {
                if !schema.properties.is_empty() {
                    coerce_object(inner, &schema.properties, path)?;
                }
                Ok(())
            }
            other => Err(coercion_error(path, "object", other)),
        };
    }
    // Untyped leaves (anyOf/oneOf alternatives) are validated, not coerced.
    let Some(declared) = schema.property_type.as_deref() else {
        return Ok(());
    };
    match declared {
        "string" => match value {
            Value::String(_) => {}
            Value::Bool(b) => *value = Value::String(b.to_string()),
            Value::Number(n) => *value = Value::String(n.to_string()),
            other => return Err(coercion_error(path, "string", other)),
        },
        "boolean" => match &*value {
            Value::Bool(_) => {}
            Value::String(s) => match parse_bool(s) {
                Some(b) => *value = Value::Bool(b),
                None => return Err(coercion_error(path, "boolean", value)),
            },
            Value::Number(n) if n.as_i64() == Some(0) => *value = Value::Bool(false),
            Value::Number(n) if n.as_i64() == Some(1) => *value = Value::Bool(true),
            other => return Err(coercion_error(path, "boolean", other)),
        },
        "integer" => match &*value {
            Value::Number(n) if n.is_i64() || n.is_u64() => {}
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => *value = Value::from(f as i64),
                _ => return Err(coercion_error(path, "integer", value)),
            },
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(i) => *value = Value::from(i),
                Err(_) => return Err(coercion_error(path, "integer", value)),
            },
            other => return Err(coercion_error(path, "integer", other)),
        },
        "number" => match &*value {
            Value::Number(_) => {}
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(f) => *value = Value::from(f),
                Err(_) => return Err(coercion_error(path, "number", value)),
            },
            other => return Err(coercion_error(path, "number", other)),
        },
        "array" => {
            if let Value::String(s) = &*value {
                let items: Vec<Value> = s
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(|t| Value::String(t.to_string()))
                    .collect();
                *value = Value::Array(items);
            }
            match value {
                Value::Array(items) => {
                    if let Some(ref item_schema) = schema.items {
                        for (index, item) in items.iter_mut().enumerate() {
                            coerce_value(item, item_schema, &format!("{}[{}]", path, index))?;
                        }
                    }
                }
                other => return Err(coercion_error(path, "array", other)),
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Post-merge validation: required presence, enums, anyOf/oneOf, ranges.
fn validate_object(
    value: &Value,
    properties: &IndexMap<String, PropertySchema>,
    required: &[String],
    prefix: &str,
) -> crate::Result<()> {
    let map = value.as_object();
    for name in required {
        let present = map
            .and_then(|m| m.get(name))
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if !present {
            return Err(StevedoreError::InvalidConfiguration(
                property_path(prefix, name),
                "required property missing".to_string(),
            ));
        }
    }
    let Some(map) = map else {
        return Ok(());
    };
    for (key, schema) in properties {
        let path = property_path(prefix, key);
        let Some(value) = map.get(key) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        validate_value(value, schema, &path)?;
        if !schema.properties.is_empty() {
            validate_object(value, &schema.properties, &schema.required, &path)?;
        }
    }
    Ok(())
}

fn validate_value(value: &Value, schema: &PropertySchema, path: &str) -> crate::Result<()> {
    if let Some(ref allowed) = schema.enum_values {
        if !allowed.contains(value) {
            return Err(StevedoreError::InvalidConfiguration(
                path.to_string(),
                format!("value {} not in enum {:?}", value, allowed),
            ));
        }
    }
    if let Some(number) = value.as_f64() {
        if let Some(min) = schema.minimum {
            if number < min {
                return Err(StevedoreError::InvalidConfiguration(
                    path.to_string(),
                    format!("value {} below minimum {}", number, min),
                ));
            }
        }
        if let Some(max) = schema.maximum {
            if number > max {
                return Err(StevedoreError::InvalidConfiguration(
                    path.to_string(),
                    format!("value {} above maximum {}", number, max),
                ));
            }
        }
    }
    if let Some(ref alternatives) = schema.any_of {
        if !alternatives.iter().any(|s| matches_subschema(value, s)) {
            return Err(StevedoreError::InvalidConfiguration(
                path.to_string(),
                "value matches no anyOf alternative".to_string(),
            ));
        }
    }
    if let Some(ref alternatives) = schema.one_of {
        let matches = alternatives
            .iter()
            .filter(|s| matches_subschema(value, s))
            .count();
        if matches != 1 {
            return Err(StevedoreError::InvalidConfiguration(
                path.to_string(),
                format!("value matches {} oneOf alternatives, expected exactly 1", matches),
            ));
        }
    }
    Ok(())
}

/// Shallow structural match used for anyOf/oneOf alternatives.
fn matches_subschema(value: &Value, schema: &PropertySchema) -> bool {
    if let Some(ref t) = schema.property_type {
        let type_ok = match t.as_str() {
            "string" => value.is_string(),
            "boolean" => value.is_boolean(),
            "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
            "number" => value.is_number(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => false,
        };
        if !type_ok {
            return false;
        }
    }
    if let Some(ref allowed) = schema.enum_values {
        if !allowed.contains(value) {
            return false;
        }
    }
    if let Some(number) = value.as_f64() {
        if schema.minimum.is_some_and(|min| number < min) {
            return false;
        }
        if schema.maximum.is_some_and(|max| number > max) {
            return false;
        }
    }
    true
}

#[derive(Default)]
struct Outputs {
    env: BTreeMap<String, String>,
    volumes: Vec<VolumeMount>,
    args: Vec<String>,
    sensitive_paths: Vec<String>,
    sensitive_env: Vec<String>,
}

/// Walk the schema in declaration order and emit env, mounts, and args.
fn collect_outputs(
    value: &Value,
    properties: &IndexMap<String, PropertySchema>,
    path: &mut Vec<String>,
    outputs: &mut Outputs,
) {
    let Some(map) = value.as_object() else {
        return;
    };
    for (key, schema) in properties {
        path.push(key.clone());
        let resolved = map.get(key);
        if schema.is_object() && !schema.properties.is_empty() {
            if let Some(nested) = resolved {
                collect_outputs(nested, &schema.properties, path, outputs);
            }
        } else if let Some(value) = resolved.filter(|v| !v.is_null()) {
            if schema.sensitive {
                outputs.sensitive_paths.push(path.join("."));
            }
            if let Some(ref name) = schema.env_mapping {
                if schema.sensitive {
                    outputs.sensitive_env.push(name.clone());
                }
                outputs.env.insert(name.clone(), stringify(value));
            }
            if schema.volume_mount {
                for token in mount_tokens(value) {
                    outputs.volumes.push(VolumeMount::parse(&token));
                }
            }
            if schema.command_arg {
                match value {
                    Value::Array(items) => outputs.args.extend(items.iter().map(stringify)),
                    other => outputs.args.push(stringify(other)),
                }
            }
        }
        path.pop();
    }
}

/// String form used for env values and command args.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(","),
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
        Value::Null => String::new(),
    }
}

/// Split a path-valued property into mount tokens (whitespace or commas).
fn mount_tokens(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split([',', ' ', '\t'])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items.iter().flat_map(mount_tokens).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::descriptor::TemplateDescriptor;
    use std::path::PathBuf;

    fn template(schema_json: &str) -> TemplateDescriptor {
        let json = format!(
            r#"{{
                "id": "demo",
                "name": "Demo",
                "version": "1.0.0",
                "image": "example/demo",
                "transport": {{"default": "http", "supported": ["http", "stdio"]}},
                "config_schema": {schema_json}
            }}"#
        );
        TemplateDescriptor::parse(&PathBuf::from("demo/template.json"), &json).unwrap()
    }

    fn hello_template() -> TemplateDescriptor {
        template(
            r#"{
                "type": "object",
                "properties": {
                    "hello_from": {"type": "string", "default": "X", "env_mapping": "HELLO_FROM"}
                }
            }"#,
        )
    }

    #[test]
    fn test_empty_layers_returns_defaults() {
        let template = hello_template();
        let processed = ConfigProcessor::new(&template)
            .process(&ConfigLayers::default())
            .unwrap();
        assert_eq!(processed.values["hello_from"], "X");
        assert_eq!(processed.env.get("HELLO_FROM").unwrap(), "X");
    }

    #[test]
    fn test_precedence_env_wins() {
        // defaults < file < cli < override < env
        let template = hello_template();
        let layers = ConfigLayers::default()
            .with_file(serde_json::json!({"hello_from": "Y"}))
            .with_cli_pair("hello_from", "Z")
            .with_override("hello_from", "O")
            .with_env("MCP_HELLO_FROM", "W");
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        assert_eq!(processed.values["hello_from"], "W");
        assert_eq!(processed.env.get("HELLO_FROM").unwrap(), "W");
    }

    #[test]
    fn test_precedence_without_env() {
        let template = hello_template();
        let layers = ConfigLayers::default()
            .with_file(serde_json::json!({"hello_from": "Y"}))
            .with_cli_pair("hello_from", "Z");
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        assert_eq!(processed.values["hello_from"], "Z");
    }

    #[test]
    fn test_type_coercion_from_strings() {
        let template = template(
            r#"{
                "properties": {
                    "debug": {"type": "boolean"},
                    "port": {"type": "integer"},
                    "ratio": {"type": "number"},
                    "names": {"type": "array"}
                }
            }"#,
        );
        let layers = ConfigLayers::default()
            .with_cli_pair("debug", "yes")
            .with_cli_pair("port", "8080")
            .with_cli_pair("ratio", "0.5")
            .with_cli_pair("names", "a, b,c");
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        assert_eq!(processed.values["debug"], true);
        assert_eq!(processed.values["port"], 8080);
        assert_eq!(processed.values["ratio"], 0.5);
        assert_eq!(processed.values["names"], serde_json::json!(["a", "b", "c"]));
    }

    #[test]
    fn test_coercion_failure_names_property_and_type() {
        let template = template(r#"{"properties": {"port": {"type": "integer"}}}"#);
        let layers = ConfigLayers::default().with_cli_pair("port", "not-a-number");
        let result = ConfigProcessor::new(&template).process(&layers);
        assert!(
            matches!(result, Err(StevedoreError::InvalidConfiguration(path, msg))
                if path == "port" && msg.contains("integer"))
        );
    }

    #[test]
    fn test_env_mapping_skips_null() {
        let template = template(
            r#"{
                "properties": {
                    "token": {"type": "string", "env_mapping": "API_TOKEN"}
                }
            }"#,
        );
        let processed = ConfigProcessor::new(&template)
            .process(&ConfigLayers::default())
            .unwrap();
        assert!(!processed.env.contains_key("API_TOKEN"));

        let layers = ConfigLayers::default().with_cli_pair("token", "abc");
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        assert_eq!(processed.env.get("API_TOKEN").unwrap(), "abc");
    }

    #[test]
    fn test_reserved_env_mapping_rejected() {
        let template = template(
            r#"{
                "properties": {
                    "sneaky": {"type": "string", "env_mapping": "MCP_TEMPLATE_ID"}
                }
            }"#,
        );
        let result = ConfigProcessor::new(&template).process(&ConfigLayers::default());
        assert!(
            matches!(result, Err(StevedoreError::ReservedEnvVar(name)) if name == "MCP_TEMPLATE_ID")
        );
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let template = template(
            r#"{"properties": {"x": {"type": "string", "env_mapping": "MCP_CUSTOM"}}}"#,
        );
        let result = ConfigProcessor::new(&template).process(&ConfigLayers::default());
        assert!(matches!(result, Err(StevedoreError::ReservedEnvVar(_))));
    }

    #[test]
    fn test_volume_mounts_split_and_parse() {
        let template = template(
            r#"{
                "properties": {
                    "data_dirs": {"type": "string", "volume_mount": true}
                }
            }"#,
        );
        let layers =
            ConfigLayers::default().with_cli_pair("data_dirs", "/tmp/a:/data/a, /tmp/b");
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        assert_eq!(
            processed.volumes,
            vec![
                VolumeMount {
                    host: "/tmp/a".into(),
                    container: "/data/a".into()
                },
                VolumeMount {
                    host: "/tmp/b".into(),
                    container: "/tmp/b".into()
                },
            ]
        );
    }

    #[test]
    fn test_command_args_in_schema_order() {
        let template = template(
            r#"{
                "properties": {
                    "second": {"type": "string", "command_arg": true},
                    "first": {"type": "string", "command_arg": true}
                }
            }"#,
        );
        let layers = ConfigLayers::default()
            .with_cli_pair("first", "one")
            .with_cli_pair("second", "two");
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        // "second" is declared before "first" in the schema.
        assert_eq!(processed.args, vec!["two", "one"]);
    }

    #[test]
    fn test_required_property_enforced() {
        let template = template(
            r#"{
                "properties": {"token": {"type": "string"}},
                "required": ["token"]
            }"#,
        );
        let result = ConfigProcessor::new(&template).process(&ConfigLayers::default());
        assert!(
            matches!(result, Err(StevedoreError::InvalidConfiguration(path, msg))
                if path == "token" && msg.contains("required"))
        );
    }

    #[test]
    fn test_enum_and_range_validation() {
        let template = template(
            r#"{
                "properties": {
                    "mode": {"type": "string", "enum": ["fast", "safe"]},
                    "level": {"type": "integer", "minimum": 1, "maximum": 9}
                }
            }"#,
        );
        let bad_enum = ConfigLayers::default().with_cli_pair("mode", "other");
        assert!(ConfigProcessor::new(&template).process(&bad_enum).is_err());

        let bad_range = ConfigLayers::default().with_cli_pair("level", "12");
        assert!(ConfigProcessor::new(&template).process(&bad_range).is_err());

        let ok = ConfigLayers::default()
            .with_cli_pair("mode", "fast")
            .with_cli_pair("level", "3");
        assert!(ConfigProcessor::new(&template).process(&ok).is_ok());
    }

    #[test]
    fn test_deep_override_descends_eight_levels() {
        let template = template(
            r#"{
                "properties": {
                    "a": {"type": "object", "properties": {"b": {"type": "object", "properties": {
                        "c": {"type": "object", "properties": {"d": {"type": "object", "properties": {
                            "e": {"type": "object", "properties": {"f": {"type": "object", "properties": {
                                "g": {"type": "object", "properties": {"h": {"type": "integer"}}}
                            }}}}
                        }}}}
                    }}}}
                }
            }"#,
        );
        let layers = ConfigLayers::default().with_override("a__b__c__d__e__f__g__h", "42");
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        assert_eq!(
            processed.values["a"]["b"]["c"]["d"]["e"]["f"]["g"]["h"],
            42
        );
    }

    #[test]
    fn test_override_json_parsing_falls_back_to_string() {
        let template = template(
            r#"{
                "properties": {
                    "count": {"type": "integer"},
                    "label": {"type": "string"}
                }
            }"#,
        );
        let layers = ConfigLayers::default()
            .with_override("count", "7")
            .with_override("label", "plain text");
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        assert_eq!(processed.values["count"], 7);
        assert_eq!(processed.values["label"], "plain text");
    }

    #[test]
    fn test_processing_is_idempotent_byte_for_byte() {
        let template = template(
            r#"{
                "properties": {
                    "hello_from": {"type": "string", "default": "X", "env_mapping": "HELLO_FROM"},
                    "port": {"type": "integer", "default": 8080},
                    "dirs": {"type": "string", "volume_mount": true},
                    "verbose": {"type": "boolean", "command_arg": true}
                }
            }"#,
        );
        let layers = ConfigLayers::default()
            .with_file(serde_json::json!({"dirs": "/tmp/x"}))
            .with_cli_pair("verbose", "true")
            .with_env("MCP_PORT", "9090");
        let processor = ConfigProcessor::new(&template);
        let first = processor.process(&layers).unwrap();
        let second = processor.process(&layers).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(first.config_hash(), second.config_hash());
    }

    #[test]
    fn test_sensitive_values_redacted() {
        let template = template(
            r#"{
                "properties": {
                    "api_key": {"type": "string", "sensitive": true, "env_mapping": "API_KEY"},
                    "visible": {"type": "string"}
                }
            }"#,
        );
        let layers = ConfigLayers::default()
            .with_cli_pair("api_key", "super-secret")
            .with_cli_pair("visible", "fine");
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        let redacted = processed.redacted_values();
        assert_eq!(redacted["api_key"], "***");
        assert_eq!(redacted["visible"], "fine");
        assert_eq!(processed.redacted_env().get("API_KEY").unwrap(), "***");
        // The real value still reaches the env plan for the container.
        assert_eq!(processed.env.get("API_KEY").unwrap(), "super-secret");
    }

    #[test]
    fn test_nested_file_objects_deep_merge_with_defaults() {
        let template = template(
            r#"{
                "properties": {
                    "server": {"type": "object", "properties": {
                        "host": {"type": "string", "default": "0.0.0.0"},
                        "port": {"type": "integer", "default": 8080}
                    }}
                }
            }"#,
        );
        let layers = ConfigLayers::default()
            .with_file(serde_json::json!({"server": {"port": 9000}}));
        let processed = ConfigProcessor::new(&template).process(&layers).unwrap();
        assert_eq!(processed.values["server"]["host"], "0.0.0.0");
        assert_eq!(processed.values["server"]["port"], 9000);
    }

    #[test]
    fn test_any_of_validation() {
        let template = template(
            r#"{
                "properties": {
                    "limit": {"anyOf": [{"type": "integer"}, {"type": "string", "enum": ["unlimited"]}]}
                }
            }"#,
        );
        let ok_int = ConfigLayers::default().with_override("limit", "10");
        assert!(ConfigProcessor::new(&template).process(&ok_int).is_ok());
        let ok_str = ConfigLayers::default().with_override("limit", "\"unlimited\"");
        assert!(ConfigProcessor::new(&template).process(&ok_str).is_ok());
        let bad = ConfigLayers::default().with_override("limit", "\"sometimes\"");
        assert!(ConfigProcessor::new(&template).process(&bad).is_err());
    }

    #[test]
    fn test_identity_env_keys() {
        let template = hello_template();
        let env = identity_env(&template, "dep-123", Transport::Http);
        assert_eq!(env.get("MCP_TEMPLATE_ID").unwrap(), "demo");
        assert_eq!(env.get("MCP_DEPLOYMENT_ID").unwrap(), "dep-123");
        assert_eq!(env.get("MCP_TRANSPORT").unwrap(), "http");
        assert!(env.keys().all(|k| is_reserved_env(k)));
    }
}
