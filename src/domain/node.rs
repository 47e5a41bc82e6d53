use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Identifier of a graph node, assigned by the graph definition that
/// registered it. Stable for the lifetime of a run.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId: {:?}", self.0)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId::new(id)
    }
}

/// Rank of a worker process within its group. Ranks are dense, `0..world_size`,
/// and rank 0 doubles as the coordinator for group-wide announcements.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(rank: u32) -> Self {
        WorkerId(rank)
    }
}

/// Contract for the engine-owned value type that node output slots hold.
///
/// Values are expected to be cheap to clone (typically reference-counted
/// handles); the store clones on every read so callers never borrow into it.
pub trait NodeValue: Clone + Send + Sync + 'static {
    /// Short tag describing what kind of value this is. State snapshots embed
    /// the tag, never the value itself.
    fn kind(&self) -> String {
        let full_name = std::any::type_name::<Self>();
        full_name.rsplit("::").next().unwrap_or(full_name).to_string()
    }
}

impl NodeValue for serde_json::Value {
    fn kind(&self) -> String {
        match self {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "bool",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::Object(_) => "object",
        }
        .to_string()
    }
}

/// One entry of a node's declared input mapping: either a literal carried in
/// the graph definition, or a back-reference to an output slot of another
/// node, written in JSON as the two-element array `[node_id, slot]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    /// Back-reference `(source node, output slot)`.
    Link(NodeId, usize),
    /// Literal value used as-is.
    Literal(serde_json::Value),
}

impl InputSpec {
    pub fn as_link(&self) -> Option<(&NodeId, usize)> {
        match self {
            InputSpec::Link(source, slot) => Some((source, *slot)),
            InputSpec::Literal(_) => None,
        }
    }
}

/// Declared payload of a node registration: the node's type plus its raw
/// input specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub class_type: String,
    pub inputs: HashMap<String, InputSpec>,
}

impl NodeData {
    pub fn new(class_type: impl Into<String>) -> Self {
        NodeData { class_type: class_type.into(), inputs: HashMap::new() }
    }

    pub fn with_literal(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(name.into(), InputSpec::Literal(value));
        self
    }

    pub fn with_link(mut self, name: impl Into<String>, source: NodeId, slot: usize) -> Self {
        self.inputs.insert(name.into(), InputSpec::Link(source, slot));
        self
    }
}

/// Output record of a node. Some node types yield a single opaque result,
/// others an ordered sequence of slot values.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutputs<V> {
    Single(V),
    Slots(Vec<V>),
}

impl<V> NodeOutputs<V> {
    /// The value at `slot`, if the record has one there. A `Single` record
    /// only answers for slot 0.
    pub fn slot(&self, slot: usize) -> Option<&V> {
        match self {
            NodeOutputs::Single(value) if slot == 0 => Some(value),
            NodeOutputs::Single(_) => None,
            NodeOutputs::Slots(values) => values.get(slot),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NodeOutputs::Single(_) => 1,
            NodeOutputs::Slots(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: NodeValue> NodeOutputs<V> {
    /// Kind tag per slot, in slot order. Used by snapshot export.
    pub fn kinds(&self) -> Vec<String> {
        match self {
            NodeOutputs::Single(value) => vec![value.kind()],
            NodeOutputs::Slots(values) => values.iter().map(NodeValue::kind).collect(),
        }
    }
}

/// A live execution object parked in the store by the engine between runs.
/// Never serialized and never shared across processes. Any engine thread may
/// reach the record it sits on, hence the bounds.
pub type BoundInstance = Box<dyn Any + Send + Sync>;

/// Registration record held by the local state store.
pub struct NodeRecord {
    pub data: NodeData,
    pub instance: Option<BoundInstance>,
    pub last_executed: Option<DateTime<Local>>,
}

impl NodeRecord {
    pub fn new(data: NodeData) -> Self {
        NodeRecord { data, instance: None, last_executed: None }
    }
}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRecord")
            .field("data", &self.data)
            .field("instance_bound", &self.instance.is_some())
            .field("last_executed", &self.last_executed)
            .finish()
    }
}
