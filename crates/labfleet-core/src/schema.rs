//! Inventory schema composed from the base document and handler fragments
//!
//! The base document constrains top-level options and the common device fields.
//! Each handler contributes a fragment whose definitions are merged into the
//! base and whose `$ref` is appended to the device `allOf`, so entries of a
//! registered `(type, manufacturer)` pair are checked against the handler's
//! own properties.

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::device::DeviceKind;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid schema fragment from '{handler}': {reason}")]
    InvalidFragment { handler: String, reason: String },
    #[error("Schema definition '{0}' is contributed twice")]
    DuplicateDefinition(String),
    #[error("Schema does not compile: {0}")]
    Compile(String),
    #[error("Configuration does not match schema:\n  {}", .0.join("\n  "))]
    Violations(Vec<String>),
}

/// Properties every device entry may carry regardless of its handler
fn common_device_properties() -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("type".into(), json!({ "type": "string" }));
    props.insert("manufacturer".into(), json!({ "type": "string" }));
    props.insert("simulated".into(), json!({ "type": "boolean", "default": false }));
    props
}

fn base_document() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "$ref": "#/definitions/DeviceConfiguration",
        "definitions": {
            "DeviceConfiguration": {
                "type": "object",
                "additionalProperties": false,
                "required": ["version"],
                "anyOf": [
                    { "required": ["cetoni_devices"] },
                    { "required": ["devices"] }
                ],
                "properties": {
                    "$schema": { "type": "string" },
                    "version": { "type": "integer", "minimum": 1 },
                    "server_ip": { "type": "string" },
                    "server_base_port": {
                        "type": "integer", "minimum": 1, "maximum": 65535, "default": 50051
                    },
                    "enable_discovery": { "type": "boolean", "default": true },
                    "regenerate_certificates": { "type": "boolean", "default": false },
                    "log_level": {
                        "type": "string",
                        "enum": ["debug", "info", "warning", "error", "critical"],
                        "default": "info"
                    },
                    "log_file_dir": { "type": "string" },
                    "scan_devices": { "type": "boolean", "default": false },
                    "simulate_missing": { "type": "boolean", "default": false },
                    "cetoni_devices": { "$ref": "#/definitions/CetoniDevices" },
                    "devices": {
                        "type": "object",
                        "additionalProperties": { "$ref": "#/definitions/Device" }
                    }
                }
            },
            "CetoniDevices": {
                "type": "object",
                "additionalProperties": false,
                "required": ["device_config_path"],
                "properties": {
                    "device_config_path": { "type": "string" },
                    "max_time_without_battery": {
                        "type": "string",
                        "pattern": "^P",
                        "default": "PT20S"
                    },
                    "max_time_without_traffic": {
                        "type": "string",
                        "pattern": "^P",
                        "default": "PT10M"
                    }
                }
            },
            "Device": {
                "allOf": [ { "$ref": "#/definitions/DeviceBase" } ]
            },
            "DeviceBase": {
                "type": "object",
                "required": ["type", "manufacturer"],
                "properties": Value::Object(common_device_properties())
            }
        }
    })
}

/// Build a handler fragment constraining entries of the given kinds
///
/// `properties` lists the handler-specific fields, `required` the ones that
/// must be present. Entries of a matching kind may not carry anything else.
pub fn device_fragment(
    definition: &str,
    kinds: &[DeviceKind],
    properties: Value,
    required: &[&str],
) -> Value {
    let mut props = common_device_properties();
    if let Value::Object(extra) = properties {
        props.extend(extra);
    }

    let mut required_all = vec![json!("type"), json!("manufacturer")];
    required_all.extend(required.iter().map(|r| json!(r)));

    let clauses: Vec<Value> = kinds
        .iter()
        .map(|kind| {
            json!({
                "if": {
                    "properties": {
                        "type": { "const": kind.device_type },
                        "manufacturer": { "const": kind.manufacturer }
                    },
                    "required": ["type", "manufacturer"]
                },
                "then": {
                    "properties": Value::Object(props.clone()),
                    "required": required_all,
                    "additionalProperties": false
                }
            })
        })
        .collect();

    let mut definitions = Map::new();
    definitions.insert(definition.to_string(), json!({ "allOf": clauses }));

    json!({
        "$ref": format!("#/definitions/{}", definition),
        "definitions": Value::Object(definitions)
    })
}

/// Composed inventory schema
#[derive(Debug, Clone)]
pub struct Schema {
    document: Value,
}

impl Default for Schema {
    fn default() -> Self {
        Self::base()
    }
}

impl Schema {
    /// The base schema without any handler fragments
    pub fn base() -> Self {
        Self {
            document: base_document(),
        }
    }

    /// Compose the base schema with every fragment, in order
    pub fn compose<'a, I>(fragments: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let mut schema = Self::base();
        for (handler, fragment) in fragments {
            schema.add_fragment(handler, fragment)?;
        }
        Ok(schema)
    }

    pub fn add_fragment(&mut self, handler: &str, fragment: Value) -> Result<(), SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidFragment {
            handler: handler.to_string(),
            reason: reason.to_string(),
        };

        let Value::Object(mut fragment) = fragment else {
            return Err(invalid("fragment is not an object"));
        };
        let reference = match fragment.remove("$ref") {
            Some(Value::String(r)) => r,
            _ => return Err(invalid("missing top-level $ref")),
        };
        let definitions = match fragment.remove("definitions") {
            Some(Value::Object(d)) => d,
            None => Map::new(),
            Some(_) => return Err(invalid("definitions is not an object")),
        };

        let base_defs = self
            .document
            .pointer_mut("/definitions")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| SchemaError::Compile("base document lost its definitions".into()))?;
        for (name, definition) in definitions {
            if base_defs.contains_key(&name) {
                return Err(SchemaError::DuplicateDefinition(name));
            }
            base_defs.insert(name, definition);
        }

        let all_of = self
            .document
            .pointer_mut("/definitions/Device/allOf")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| SchemaError::Compile("base document lost Device.allOf".into()))?;
        all_of.push(json!({ "$ref": reference }));
        Ok(())
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Validate an inventory document, reporting every violation with its path
    pub fn validate(&self, instance: &Value) -> Result<(), SchemaError> {
        let validator = jsonschema::validator_for(&self.document)
            .map_err(|e| SchemaError::Compile(e.to_string()))?;

        let violations: Vec<String> = validator
            .iter_errors(instance)
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{}: {}", path, error)
                }
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Violations(violations))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance_fragment() -> Value {
        device_fragment(
            "SartoriusBalance",
            &[DeviceKind::new("balance", "Sartorius")],
            json!({ "port": { "type": "string" } }),
            &[],
        )
    }

    #[test]
    fn test_base_schema_accepts_minimal_inventory() {
        let schema = Schema::base();
        let doc = json!({
            "version": 1,
            "devices": {
                "bal1": { "type": "balance", "manufacturer": "Sartorius" }
            }
        });
        schema.validate(&doc).unwrap();
    }

    #[test]
    fn test_rejects_unknown_top_level_key() {
        let schema = Schema::base();
        let doc = json!({ "version": 1, "devices": {}, "colour": "blue" });
        assert!(matches!(schema.validate(&doc), Err(SchemaError::Violations(_))));
    }

    #[test]
    fn test_requires_a_device_source() {
        let schema = Schema::base();
        assert!(schema.validate(&json!({ "version": 1 })).is_err());
    }

    #[test]
    fn test_fragment_constrains_matching_entries() {
        let schema = Schema::compose([("balance", balance_fragment())]).unwrap();

        let ok = json!({
            "version": 1,
            "devices": {
                "bal1": { "type": "balance", "manufacturer": "Sartorius", "port": "COM3" }
            }
        });
        schema.validate(&ok).unwrap();

        let bad = json!({
            "version": 1,
            "devices": {
                "bal1": { "type": "balance", "manufacturer": "Sartorius", "baud": 9600 }
            }
        });
        match schema.validate(&bad) {
            Err(SchemaError::Violations(v)) => {
                assert!(v.iter().any(|m| m.contains("/devices/bal1")), "{:?}", v)
            }
            other => panic!("expected violations, got {:?}", other),
        }
    }

    #[test]
    fn test_fragment_ignores_other_kinds() {
        let schema = Schema::compose([("balance", balance_fragment())]).unwrap();
        let doc = json!({
            "version": 1,
            "devices": {
                "x": { "type": "centrifuge", "manufacturer": "Acme", "rpm": 3000 }
            }
        });
        schema.validate(&doc).unwrap();
    }

    #[test]
    fn test_duplicate_definition_rejected() {
        let mut schema = Schema::base();
        schema.add_fragment("a", balance_fragment()).unwrap();
        assert!(matches!(
            schema.add_fragment("b", balance_fragment()),
            Err(SchemaError::DuplicateDefinition(_))
        ));
    }
}
