//! # Schema Nodes
//!
//! The two node variants of the telemetry schema and their JSON form.
//!
//! On the wire a node is a JSON object. An object carrying a `valu` or `desc`
//! key is a leaf, any other object is a namespace whose keys name its
//! children. Leaf keys other than `valu` and `desc` (units, types, limits)
//! are kept verbatim as attributes.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};

/// Name of the root namespace every path starts with
pub const ROOT: &str = "slate";

/// Leaf key holding the current value
pub const VALUE_KEY: &str = "valu";

/// Leaf key holding the human readable description
pub const DESCRIPTION_KEY: &str = "desc";

/// A single telemetry point
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    /// Current value, always a JSON scalar
    pub value: Value,
    /// Human readable description
    pub description: String,
    /// Any other keys the remote unit attached to this point
    pub attributes: Map<String, Value>,
}

/// Schema tree node: either a leaf or a namespace of named children
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Leaf(Leaf),
    Namespace(IndexMap<String, SchemaNode>),
}

/// True for JSON values a leaf may hold.
pub fn is_scalar(value: &Value) -> bool {
    !(value.is_object() || value.is_array())
}

impl Leaf {
    pub fn new(value: Value, description: impl Into<String>) -> Self {
        Self {
            value,
            description: description.into(),
            attributes: Map::new(),
        }
    }

    fn from_fields(fields: &Map<String, Value>, path: &str) -> Result<Self> {
        let value = fields.get(VALUE_KEY).cloned().unwrap_or(Value::Null);
        if !is_scalar(&value) {
            return Err(GatewayError::Schema(format!("leaf {} holds a non-scalar value", path)));
        }

        let description = match fields.get(DESCRIPTION_KEY) {
            None => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        };

        let attributes = fields
            .iter()
            .filter(|(key, _)| key.as_str() != VALUE_KEY && key.as_str() != DESCRIPTION_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self { value, description, attributes })
    }

    /// JSON form of the leaf, `valu` and `desc` first.
    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        fields.insert(VALUE_KEY.to_string(), self.value.clone());
        fields.insert(DESCRIPTION_KEY.to_string(), Value::String(self.description.clone()));
        for (key, value) in &self.attributes {
            fields.insert(key.clone(), value.clone());
        }
        Value::Object(fields)
    }
}

impl SchemaNode {
    /// Decode a node found at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Schema`] if the value is not an object or a leaf
    /// holds a non-scalar value.
    pub fn from_json(value: &Value, path: &str) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(GatewayError::Schema(format!("expected an object at {}", path)));
        };

        if fields.contains_key(VALUE_KEY) || fields.contains_key(DESCRIPTION_KEY) {
            return Ok(SchemaNode::Leaf(Leaf::from_fields(fields, path)?));
        }

        decode_children(fields, path).map(SchemaNode::Namespace)
    }

    pub fn to_json(&self) -> Value {
        match self {
            SchemaNode::Leaf(leaf) => leaf.to_json(),
            SchemaNode::Namespace(children) => encode_children(children),
        }
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            SchemaNode::Leaf(leaf) => Some(leaf),
            SchemaNode::Namespace(_) => None,
        }
    }
}

fn decode_children(
    fields: &Map<String, Value>,
    path: &str,
) -> Result<IndexMap<String, SchemaNode>> {
    fields
        .iter()
        .map(|(name, child)| {
            let child_path = format!("{}.{}", path, name);
            SchemaNode::from_json(child, &child_path).map(|node| (name.clone(), node))
        })
        .collect()
}

pub(crate) fn encode_children(children: &IndexMap<String, SchemaNode>) -> Value {
    Value::Object(
        children
            .iter()
            .map(|(name, node)| (name.clone(), node.to_json()))
            .collect(),
    )
}
