//! Template descriptors — parsing and validation.
//!
//! A template is an immutable description of one deployable MCP server:
//! image reference, transport capabilities, a JSON-Schema-like config schema
//! whose leaves may carry platform annotations (`env_mapping`, `volume_mount`,
//! `command_arg`, `sensitive`), and optional static tool metadata.

use std::path::Path;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StevedoreError;
use crate::protocol::McpTool;

/// Template ids are lowercase alphanumeric with hyphens.
static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("valid id pattern"));

/// Schema leaf types the configuration processor can coerce into.
const KNOWN_TYPES: &[&str] = &["string", "integer", "number", "boolean", "array", "object"];

/// Wire form of MCP spoken by a deployed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Stdio => write!(f, "stdio"),
            Transport::Http => write!(f, "http"),
        }
    }
}

/// Default and supported transports declared by a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSpec {
    pub default: Transport,
    #[serde(default)]
    pub supported: Vec<Transport>,
}

impl TransportSpec {
    pub fn supports(&self, transport: Transport) -> bool {
        self.default == transport || self.supported.contains(&transport)
    }
}

/// Whether a template shipped with the platform or was created by a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateOrigin {
    BuiltIn,
    #[default]
    User,
}

/// JSON-Schema-like configuration schema. Property order is preserved so
/// `command_arg` values land on the command line in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(default)]
    pub properties: IndexMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// One schema property, possibly nested. Leaves may carry annotations the
/// configuration processor turns into env vars, mounts, and command args.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, rename = "anyOf", skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<PropertySchema>>,
    #[serde(default, rename = "oneOf", skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<PropertySchema>>,
    /// Nested object properties.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    // --- platform annotations ---
    /// Emit this property into the container environment under the given name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_mapping: Option<String>,
    /// Treat the value as host path(s) to bind-mount into the container.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub volume_mount: bool,
    /// Append the value to the container command line.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub command_arg: bool,
    /// Never echo the value in logs or plan output.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
}

impl PropertySchema {
    /// Declared type, defaulting to string for untyped leaves.
    pub fn type_name(&self) -> &str {
        self.property_type.as_deref().unwrap_or("string")
    }

    pub fn is_object(&self) -> bool {
        self.type_name() == "object" || !self.properties.is_empty()
    }
}

/// Immutable descriptor of a deployable MCP server template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub image: String,
    pub transport: TransportSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub config_schema: ConfigSchema,
    /// Static tool metadata, the last tier of the discovery cascade.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<McpTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Set by the registry from the directory the descriptor was found in.
    #[serde(skip)]
    pub origin: TemplateOrigin,
    /// Unknown top-level keys, preserved but ignored.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TemplateDescriptor {
    /// Parse a descriptor from file contents, dispatching on extension.
    pub fn parse(path: &Path, contents: &str) -> crate::Result<Self> {
        let source = path.display().to_string();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let descriptor: TemplateDescriptor = if is_yaml {
            serde_yaml::from_str(contents)
                .map_err(|e| StevedoreError::InvalidTemplate(source.clone(), e.to_string()))?
        } else {
            serde_json::from_str(contents)
                .map_err(|e| StevedoreError::InvalidTemplate(source.clone(), e.to_string()))?
        };
        descriptor.validate(&source)?;
        Ok(descriptor)
    }

    /// Validate the descriptor against the platform meta-schema.
    pub fn validate(&self, source: &str) -> crate::Result<()> {
        if !ID_PATTERN.is_match(&self.id) {
            return Err(StevedoreError::InvalidTemplate(
                source.to_string(),
                format!(
                    "id '{}' must be lowercase alphanumeric with hyphens",
                    self.id
                ),
            ));
        }
        if self.name.is_empty() || self.version.is_empty() || self.image.is_empty() {
            return Err(StevedoreError::InvalidTemplate(
                source.to_string(),
                "name, version, and image must be non-empty".to_string(),
            ));
        }
        validate_schema_types(&self.config_schema.properties, source, "")?;
        Ok(())
    }

    /// True when the template can run over the given transport.
    pub fn supports_transport(&self, transport: Transport) -> bool {
        self.transport.supports(transport)
    }
}

/// Recursively check every declared property type is one the processor knows.
fn validate_schema_types(
    properties: &IndexMap<String, PropertySchema>,
    source: &str,
    prefix: &str,
) -> crate::Result<()> {
    for (key, schema) in properties {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        if let Some(ref t) = schema.property_type {
            if !KNOWN_TYPES.contains(&t.as_str()) {
                return Err(StevedoreError::InvalidTemplate(
                    source.to_string(),
                    format!("property '{}' has unknown type '{}'", path, t),
                ));
            }
        }
        if let Some(ref env) = schema.env_mapping {
            if env.is_empty() {
                return Err(StevedoreError::InvalidTemplate(
                    source.to_string(),
                    format!("property '{}' has an empty env_mapping", path),
                ));
            }
        }
        validate_schema_types(&schema.properties, source, &path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn minimal_json(id: &str) -> String {
        format!(
            r#"{{
                "id": "{id}",
                "name": "Demo",
                "version": "1.0.0",
                "image": "ghcr.io/example/demo:1.0.0",
                "transport": {{"default": "http", "supported": ["http", "stdio"]}},
                "config_schema": {{
                    "type": "object",
                    "properties": {{
                        "hello_from": {{"type": "string", "default": "X", "env_mapping": "HELLO_FROM"}}
                    }}
                }}
            }}"#
        )
    }

    #[test]
    fn test_parse_minimal_json() {
        let path = PathBuf::from("demo/template.json");
        let descriptor = TemplateDescriptor::parse(&path, &minimal_json("demo")).unwrap();
        assert_eq!(descriptor.id, "demo");
        assert_eq!(descriptor.transport.default, Transport::Http);
        assert!(descriptor.supports_transport(Transport::Stdio));
        let prop = descriptor.config_schema.properties.get("hello_from").unwrap();
        assert_eq!(prop.env_mapping.as_deref(), Some("HELLO_FROM"));
    }

    #[test]
    fn test_parse_yaml_descriptor() {
        let yaml = r#"
id: file-server
name: File Server
version: 0.3.1
image: ghcr.io/example/files:0.3.1
transport:
  default: stdio
  supported: [stdio]
config_schema:
  type: object
  properties:
    allowed_dirs:
      type: array
      volume_mount: true
tools:
  - name: read_file
    description: Read a file
"#;
        let path = PathBuf::from("file-server/template.yaml");
        let descriptor = TemplateDescriptor::parse(&path, yaml).unwrap();
        assert_eq!(descriptor.id, "file-server");
        assert_eq!(descriptor.tools.len(), 1);
        assert!(
            descriptor
                .config_schema
                .properties
                .get("allowed_dirs")
                .unwrap()
                .volume_mount
        );
        assert!(!descriptor.supports_transport(Transport::Http));
    }

    #[test]
    fn test_invalid_id_rejected() {
        let path = PathBuf::from("demo/template.json");
        let result = TemplateDescriptor::parse(&path, &minimal_json("Has_Caps"));
        assert!(
            matches!(result, Err(StevedoreError::InvalidTemplate(_, msg)) if msg.contains("lowercase"))
        );
    }

    #[test]
    fn test_unknown_top_level_keys_preserved() {
        let json = minimal_json("demo").replacen('{', r#"{"docs_url": "https://example.com","#, 1);
        let path = PathBuf::from("demo/template.json");
        let descriptor = TemplateDescriptor::parse(&path, &json).unwrap();
        assert_eq!(
            descriptor.extra.get("docs_url").and_then(|v| v.as_str()),
            Some("https://example.com")
        );
    }

    #[test]
    fn test_unknown_property_type_rejected() {
        let json = minimal_json("demo").replace(r#""type": "string""#, r#""type": "decimal""#);
        let path = PathBuf::from("demo/template.json");
        let result = TemplateDescriptor::parse(&path, &json);
        assert!(
            matches!(result, Err(StevedoreError::InvalidTemplate(_, msg)) if msg.contains("unknown type"))
        );
    }

    #[test]
    fn test_schema_property_order_preserved() {
        let json = r#"{
            "id": "ordered",
            "name": "Ordered",
            "version": "1.0.0",
            "image": "example/ordered",
            "transport": {"default": "stdio"},
            "config_schema": {
                "properties": {
                    "zeta": {"type": "string", "command_arg": true},
                    "alpha": {"type": "string", "command_arg": true}
                }
            }
        }"#;
        let path = PathBuf::from("ordered/template.json");
        let descriptor = TemplateDescriptor::parse(&path, json).unwrap();
        let keys: Vec<&String> = descriptor.config_schema.properties.keys().collect();
        assert_eq!(keys, ["zeta", "alpha"]);
    }
}
