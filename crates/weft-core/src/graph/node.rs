use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{NodeState, Value};

/// Declared type of an input or output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Any,
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ValueType {
    /// Whether a slot of this type may receive values declared as `other`.
    pub fn accepts(&self, other: ValueType) -> bool {
        *self == ValueType::Any || other == ValueType::Any || *self == other
    }

    /// Whether a concrete value conforms to this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(s)
    }
}

/// A typed unit of work in the graph.
///
/// The `type` discriminator selects the handler; `metadata` carries the
/// handler's static parameters. `state` is only ever written by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the graph.
    pub id: String,
    /// Handler discriminator.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Input slots and their declared types.
    #[serde(default)]
    pub inputs: BTreeMap<String, ValueType>,
    /// Output slots and their declared types.
    #[serde(default)]
    pub outputs: BTreeMap<String, ValueType>,
    /// Static handler parameters.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub state: NodeState,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            metadata: serde_json::Map::new(),
            state: NodeState::Pending,
        }
    }

    /// Declare an input slot.
    pub fn with_input(mut self, slot: impl Into<String>, ty: ValueType) -> Self {
        self.inputs.insert(slot.into(), ty);
        self
    }

    /// Declare an output slot.
    pub fn with_output(mut self, slot: impl Into<String>, ty: ValueType) -> Self {
        self.outputs.insert(slot.into(), ty);
        self
    }

    /// Set a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_type_accepts() {
        assert!(ValueType::Any.accepts(ValueType::Number));
        assert!(ValueType::Array.accepts(ValueType::Any));
        assert!(ValueType::String.accepts(ValueType::String));
        assert!(!ValueType::String.accepts(ValueType::Number));
    }

    #[test]
    fn test_value_type_matches() {
        assert!(ValueType::Array.matches(&json!([1, 2])));
        assert!(!ValueType::Object.matches(&json!("x")));
        assert!(ValueType::Any.matches(&json!(null)));
    }

    #[test]
    fn test_node_deserialize_defaults() {
        let node: Node = serde_json::from_value(json!({
            "id": "fetch",
            "type": "http_fetch",
            "inputs": {"url": "string"}
        }))
        .unwrap();
        assert_eq!(node.node_type, "http_fetch");
        assert_eq!(node.inputs.get("url"), Some(&ValueType::String));
        assert!(node.outputs.is_empty());
        assert_eq!(node.state, NodeState::Pending);
    }
}
