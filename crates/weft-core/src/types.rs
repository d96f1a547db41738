use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WeftError};

/// Values travelling along edges are plain JSON.
pub type Value = serde_json::Value;

/// Input slot values handed to a handler for one firing.
pub type InputSnapshot = BTreeMap<String, Value>;

/// Output slot values produced by one emission.
pub type OutputSnapshot = BTreeMap<String, Value>;

/// Identifier tying together every dispatch of one run, local or distributed.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Pending,
    Running,
    Emitting,
    Success,
    Fail,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Emitting => "emitting",
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transition of a single firing, as produced by a dispatch strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeUpdate {
    fn bare(state: NodeState) -> Self {
        Self {
            state,
            output: None,
            error: None,
        }
    }

    pub fn pending() -> Self {
        Self::bare(NodeState::Pending)
    }

    pub fn running() -> Self {
        Self::bare(NodeState::Running)
    }

    pub fn emitting(output: OutputSnapshot) -> Self {
        Self {
            state: NodeState::Emitting,
            output: Some(output),
            error: None,
        }
    }

    pub fn success() -> Self {
        Self::bare(NodeState::Success)
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            state: NodeState::Fail,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// A node transition republished on a run's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub node_id: String,
    pub state: NodeState,
    /// Firing cycle this transition belongs to, starting at 1.
    pub cycle: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
    Deadlocked,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Deadlocked => "deadlocked",
        };
        f.write_str(s)
    }
}

/// Events published on the engine event bus for side observers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RunStarted {
        correlation_id: CorrelationId,
        nodes: usize,
    },
    NodeState {
        correlation_id: CorrelationId,
        event: StateEvent,
    },
    RunFinished {
        correlation_id: CorrelationId,
        outcome: RunOutcome,
    },
}

impl EngineEvent {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Self::RunStarted { correlation_id, .. }
            | Self::NodeState { correlation_id, .. }
            | Self::RunFinished { correlation_id, .. } => correlation_id,
        }
    }
}

/// Everything a handler receives for one firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInvocation {
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub inputs: InputSnapshot,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl NodeInvocation {
    pub fn new(node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            inputs: InputSnapshot::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_input(mut self, slot: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(slot.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn input(&self, slot: &str) -> Option<&Value> {
        self.inputs.get(slot)
    }

    /// Input value, or a `MissingInput` error naming the slot.
    pub fn require_input(&self, slot: &str) -> Result<&Value> {
        self.inputs.get(slot).ok_or_else(|| WeftError::MissingInput {
            node_type: self.node_type.clone(),
            slot: slot.to_string(),
        })
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }
}

/// Final result of a queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Success { outputs: Vec<OutputSnapshot> },
    Fail { error: String },
}

/// Registered node type, as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerDefinition {
    pub node_type: String,
    pub description: String,
    /// `local` or `remote:<peer>`.
    pub route: String,
}

/// Build an output snapshot from slot/value pairs.
pub fn output<I, K>(pairs: I) -> OutputSnapshot
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
