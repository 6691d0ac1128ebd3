//! Tool descriptors and their recursive parameter schema.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde_json::{Value, json};

/// Recursive parameter type: scalars, objects with named fields, arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object { properties: BTreeMap<String, Param> },
    Array { items: Box<Param> },
}

impl ParamKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object { .. } => "object",
            Self::Array { .. } => "array",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
}

impl Param {
    pub fn required(kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    fn to_wire(&self) -> Value {
        let mut schema = json!({
            "type": self.kind.type_name(),
            "description": self.description,
        });
        if let Some(default) = &self.default {
            schema["default"] = default.clone();
        }
        match &self.kind {
            ParamKind::Object { properties } => {
                schema["properties"] = json!(
                    properties
                        .iter()
                        .map(|(name, param)| (name.clone(), param.to_wire()))
                        .collect::<serde_json::Map<String, Value>>()
                );
                schema["required"] = json!(
                    properties
                        .iter()
                        .filter(|(_, param)| param.required)
                        .map(|(name, _)| name.clone())
                        .collect::<Vec<_>>()
                );
            }
            ParamKind::Array { items } => {
                schema["items"] = items.to_wire();
            }
            _ => {}
        }
        schema
    }

    fn from_wire(schema: &Value, required: bool) -> Result<Self> {
        let type_name = schema
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("string");
        let description = schema
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let default = schema.get("default").cloned();

        let kind = match type_name {
            "string" => ParamKind::String,
            "integer" => ParamKind::Integer,
            "number" => ParamKind::Number,
            "boolean" => ParamKind::Boolean,
            "object" => {
                let required_set: Vec<String> = schema
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let mut properties = BTreeMap::new();
                if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                    for (name, prop_schema) in props {
                        properties.insert(
                            name.clone(),
                            Param::from_wire(prop_schema, required_set.contains(name))?,
                        );
                    }
                }
                ParamKind::Object { properties }
            }
            "array" => {
                let items = schema
                    .get("items")
                    .map(|item| Param::from_wire(item, true))
                    .transpose()?
                    .unwrap_or_else(|| Param::required(ParamKind::String, ""));
                ParamKind::Array {
                    items: Box::new(items),
                }
            }
            other => bail!("unknown parameter type `{other}`"),
        };

        Ok(Self {
            kind,
            description,
            required,
            default,
        })
    }
}

/// A declared tool: id, display name, description, and typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, Param>,
}

impl ToolDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, param: Param) -> Self {
        self.parameters.insert(name.into(), param);
        self
    }

    /// The endpoint's `{name, description, input_schema}` form.
    pub fn to_wire(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|(name, param)| (name.clone(), param.to_wire()))
            .collect();
        let required: Vec<String> = self
            .parameters
            .iter()
            .filter(|(_, param)| param.required)
            .map(|(name, _)| name.clone())
            .collect();
        json!({
            "name": self.id,
            "description": self.description,
            "input_schema": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        })
    }

    /// Inverse of [`to_wire`]. The wire form carries no separate display
    /// name, so `name` comes back equal to `id`.
    pub fn from_wire(wire: &Value) -> Result<Self> {
        let Some(id) = wire.get("name").and_then(Value::as_str) else {
            bail!("tool wire form is missing `name`");
        };
        let description = wire
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let schema = wire.get("input_schema").cloned().unwrap_or(json!({}));

        let required_set: Vec<String> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut parameters = BTreeMap::new();
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop_schema) in props {
                parameters.insert(
                    name.clone(),
                    Param::from_wire(prop_schema, required_set.contains(name))?,
                );
            }
        }

        Ok(Self {
            id: id.to_string(),
            name: id.to_string(),
            description,
            parameters,
        })
    }
}
