//! Argument validation against a tool's declared schema.
//!
//! Validation is total: every call either yields a deterministic error
//! message naming the tool and the offending field, or is safe to forward
//! to the provider.

use serde_json::Value;

use crate::schema::{Param, ParamKind, ToolDescriptor};

/// Validate a call's arguments. `None` means the call may be forwarded.
pub fn validate_call(tool: &ToolDescriptor, args: &Value) -> Option<String> {
    let provided = match args.as_object() {
        Some(map) => map,
        None => {
            return Some(format!(
                "Error: Tool call `{}` expected an object of parameters",
                tool.id
            ));
        }
    };

    for (name, param) in &tool.parameters {
        match provided.get(name) {
            None | Some(Value::Null) if param.required => {
                return Some(format!(
                    "Error: Tool call `{}` expected parameter `{}`, got `null`",
                    tool.id, name
                ));
            }
            Some(value) if !value.is_null() && !matches_type(value, param) => {
                return Some(format!(
                    "Error: Tool call `{}` parameter `{}` has invalid type",
                    tool.id, name
                ));
            }
            _ => {}
        }
    }

    for name in provided.keys() {
        if !tool.parameters.contains_key(name) {
            return Some(format!(
                "Error: Tool call `{}` received unexpected parameter `{}`",
                tool.id, name
            ));
        }
    }

    None
}

fn matches_type(value: &Value, param: &Param) -> bool {
    match &param.kind {
        ParamKind::String => value.is_string(),
        ParamKind::Integer => value.is_i64() || value.is_u64(),
        ParamKind::Number => value.is_number(),
        ParamKind::Boolean => value.is_boolean(),
        ParamKind::Object { properties } => {
            let Some(map) = value.as_object() else {
                return false;
            };
            for (name, sub) in properties {
                match map.get(name) {
                    None if sub.required => return false,
                    Some(inner) if !matches_type(inner, sub) => return false,
                    _ => {}
                }
            }
            true
        }
        ParamKind::Array { items } => {
            let Some(list) = value.as_array() else {
                return false;
            };
            list.iter().all(|item| matches_type(item, items))
        }
    }
}
