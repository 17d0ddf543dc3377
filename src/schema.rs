//! Generation schema: the structural contract stored in a template.
//!
//! Templates keep their schema as OpenAPI-style JSON (`type`, `properties`,
//! `items`, `required`, `enum`), the dialect the generation engine accepts
//! as a response schema. The raw JSON is forwarded to the engine untouched;
//! the parsed [`SchemaNode`] tree is what we check responses against.
//!
//! ## Check semantics
//!
//! The engine enforces the schema while generating, so the check here is
//! deliberately forgiving about absence and strict about shape:
//!
//! - missing properties (required or not) are fine
//! - `null` is accepted anywhere
//! - unknown extra properties are ignored
//! - a present value of the wrong JSON type is a [`SchemaViolation`]

use crate::error::JobError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// One node of a parsed schema.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Object {
        properties: BTreeMap<String, SchemaNode>,
        required: Vec<String>,
    },
    Array {
        items: Box<SchemaNode>,
    },
    String {
        allowed: Vec<String>,
    },
    Number,
    Integer,
    Boolean,
    /// Untyped node: any value is accepted.
    Leaf,
}

impl SchemaNode {
    fn expected(&self) -> &'static str {
        match self {
            SchemaNode::Object { .. } => "object",
            SchemaNode::Array { .. } => "array",
            SchemaNode::String { .. } => "string",
            SchemaNode::Number => "number",
            SchemaNode::Integer => "integer",
            SchemaNode::Boolean => "boolean",
            SchemaNode::Leaf => "any",
        }
    }
}

/// A present value that does not have the shape its schema node demands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON-pointer-like location, e.g. `/steps/2/step`.
    pub path: String,
    pub expected: String,
    pub found: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: expected {}, found {}", self.expected, self.found)
    }
}

/// Resolved, immutable generation schema.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSchema {
    root: SchemaNode,
    raw: Value,
}

impl GenerationSchema {
    /// Parse a template's `components` value. The root must describe an object.
    pub fn from_value(raw: Value) -> Result<Self, JobError> {
        let root = parse_node(&raw, "")?;
        if !matches!(root, SchemaNode::Object { .. }) {
            return Err(JobError::validation(format!(
                "schema root must describe an object, got {}",
                root.expected()
            )));
        }
        Ok(Self { root, raw })
    }

    pub fn root(&self) -> &SchemaNode {
        &self.root
    }

    /// The schema exactly as stored, for the engine request.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Pretty JSON of the raw schema, for prompts.
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.raw).unwrap_or_else(|_| self.raw.to_string())
    }

    /// Collect every shape violation in `value`.
    pub fn check(&self, value: &Value) -> Vec<SchemaViolation> {
        let mut out = Vec::new();
        check_node(&self.root, value, &mut String::new(), &mut out);
        out
    }
}

fn parse_node(v: &Value, path: &str) -> Result<SchemaNode, JobError> {
    let obj = v.as_object().ok_or_else(|| {
        JobError::validation(format!(
            "schema node at '{}' must be an object, got {}",
            display_path(path),
            json_kind(v)
        ))
    })?;

    let type_name = obj
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);

    let node = match type_name.as_deref() {
        Some("object") => parse_object(obj, path)?,
        None if obj.contains_key("properties") => parse_object(obj, path)?,
        Some("array") => {
            let items = match obj.get("items") {
                Some(items) => parse_node(items, &format!("{path}/items"))?,
                None => SchemaNode::Leaf,
            };
            SchemaNode::Array {
                items: Box::new(items),
            }
        }
        Some("string") => SchemaNode::String {
            allowed: obj
                .get("enum")
                .and_then(Value::as_array)
                .map(|vals| {
                    vals.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        Some("number") => SchemaNode::Number,
        Some("integer") => SchemaNode::Integer,
        Some("boolean") => SchemaNode::Boolean,
        _ => SchemaNode::Leaf,
    };
    Ok(node)
}

fn parse_object(obj: &Map<String, Value>, path: &str) -> Result<SchemaNode, JobError> {
    let mut properties = BTreeMap::new();
    if let Some(props) = obj.get("properties") {
        let props = props.as_object().ok_or_else(|| {
            JobError::validation(format!(
                "'properties' at '{}' must be an object",
                display_path(path)
            ))
        })?;
        for (name, child) in props {
            let child_path = format!("{path}/{name}");
            properties.insert(name.clone(), parse_node(child, &child_path)?);
        }
    }
    let required = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(SchemaNode::Object {
        properties,
        required,
    })
}

fn check_node(node: &SchemaNode, value: &Value, path: &mut String, out: &mut Vec<SchemaViolation>) {
    if value.is_null() {
        return;
    }
    let ok = match node {
        SchemaNode::Leaf => true,
        SchemaNode::Object { properties, .. } => match value.as_object() {
            Some(map) => {
                for (name, child) in properties {
                    if let Some(v) = map.get(name) {
                        let len = path.len();
                        path.push('/');
                        path.push_str(name);
                        check_node(child, v, path, out);
                        path.truncate(len);
                    }
                }
                true
            }
            None => false,
        },
        SchemaNode::Array { items } => match value.as_array() {
            Some(elems) => {
                for (i, v) in elems.iter().enumerate() {
                    let len = path.len();
                    path.push('/');
                    path.push_str(&i.to_string());
                    check_node(items, v, path, out);
                    path.truncate(len);
                }
                true
            }
            None => false,
        },
        SchemaNode::String { allowed } => match value.as_str() {
            Some(s) if allowed.is_empty() || allowed.iter().any(|a| a == s) => true,
            Some(s) => {
                out.push(SchemaViolation {
                    path: path.clone(),
                    expected: format!("one of [{}]", allowed.join(", ")),
                    found: format!("\"{s}\""),
                });
                return;
            }
            None => false,
        },
        SchemaNode::Number => value.is_number(),
        SchemaNode::Integer => value.is_i64() || value.is_u64(),
        SchemaNode::Boolean => value.is_boolean(),
    };
    if !ok {
        out.push(SchemaViolation {
            path: path.clone(),
            expected: node.expected().to_string(),
            found: json_kind(value).to_string(),
        });
    }
}

/// JSON type name of a value, for messages.
pub(crate) fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}
