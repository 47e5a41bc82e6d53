use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::node::{NodeData, NodeId, NodeOutputs, NodeValue};

/// A single resolved input, ready to hand to the execution engine.
#[derive(Debug, Clone)]
pub enum ResolvedInput<V> {
    /// Literal from the graph definition or a custom override.
    Literal(serde_json::Value),
    /// Output of an upstream node, possibly fetched from its owning worker.
    Computed(V),
}

impl<V> ResolvedInput<V> {
    pub fn as_literal(&self) -> Option<&serde_json::Value> {
        match self {
            ResolvedInput::Literal(value) => Some(value),
            ResolvedInput::Computed(_) => None,
        }
    }

    pub fn as_computed(&self) -> Option<&V> {
        match self {
            ResolvedInput::Computed(value) => Some(value),
            ResolvedInput::Literal(_) => None,
        }
    }
}

pub type ResolvedInputs<V> = HashMap<String, ResolvedInput<V>>;

/// Contract with the node execution engine.
///
/// The coordination layer resolves inputs and persists outputs; what a node
/// actually computes is the engine's business. Engine failures come back as
/// plain messages so the engine does not have to share an error type with
/// this crate.
#[async_trait]
pub trait NodeExecutor<V: NodeValue>: Send + Sync {
    async fn execute(
        &self,
        node_id: &NodeId,
        data: &NodeData,
        inputs: ResolvedInputs<V>,
    ) -> std::result::Result<NodeOutputs<V>, String>;
}
