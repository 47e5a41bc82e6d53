use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Local};

use crate::api::node_dto::InputValueDto;
use crate::api::snapshot_dto::{NodeSnapshotDto, StateSnapshotDto};
use crate::domain::node::{BoundInstance, NodeData, NodeId, NodeOutputs, NodeRecord, NodeValue};
use crate::error::{Error, Result};

struct StoreInner<V> {
    /// Registration records, keyed by node id.
    nodes: HashMap<NodeId, NodeRecord>,

    /// Produced output slots. Kept apart from the records so that an output
    /// survives a re-registration of its node.
    outputs: HashMap<NodeId, NodeOutputs<V>>,

    /// Caller-supplied overrides, applied on top of the declared inputs.
    custom_inputs: HashMap<NodeId, HashMap<String, serde_json::Value>>,
}

/// Per-process store for node execution state.
///
/// All three maps are protected with a single lock; critical sections only
/// touch the maps and never perform I/O, so any thread of the engine may
/// call in concurrently. Reads hand out clones, never references into the
/// store.
pub struct NodeStateStore<V> {
    inner: Arc<RwLock<StoreInner<V>>>,
}

impl<V> Clone for NodeStateStore<V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<V: NodeValue> Default for NodeStateStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: NodeValue> NodeStateStore<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                nodes: HashMap::new(),
                outputs: HashMap::new(),
                custom_inputs: HashMap::new(),
            })),
        }
    }

    /// Registers `node_id` with its declared data. Registering an id again
    /// replaces the record, which drops any bound instance and clears the
    /// execution timestamp; existing outputs and custom inputs stay.
    pub fn register(&self, node_id: NodeId, data: NodeData) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.nodes.insert(node_id, NodeRecord::new(data));
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.nodes.contains_key(node_id)
    }

    /// Ids of all registered nodes, sorted for deterministic iteration.
    pub fn registered_nodes(&self) -> Vec<NodeId> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let mut ids: Vec<NodeId> = guard.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Declared data of a node, if registered.
    pub fn node_data(&self, node_id: &NodeId) -> Option<NodeData> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.nodes.get(node_id).map(|record| record.data.clone())
    }

    /// The value in output slot `slot` of `node_id`.
    ///
    /// # Returns
    /// Returns `None` when the node is unknown, has not produced outputs, or
    /// the slot index is out of range. A missing output is an expected state
    /// during execution, not a fault.
    pub fn get_output(&self, node_id: &NodeId, slot: usize) -> Option<V> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.outputs.get(node_id).and_then(|outputs| outputs.slot(slot)).cloned()
    }

    /// The whole output record of `node_id`, if the node has produced.
    pub fn get_outputs(&self, node_id: &NodeId) -> Option<NodeOutputs<V>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.outputs.get(node_id).cloned()
    }

    /// Stores the output record of `node_id`, replacing any previous record
    /// wholesale. The node does not have to be registered; outputs of
    /// never-registered ids are legal and simply unreachable via links.
    pub fn set_output(&self, node_id: NodeId, outputs: NodeOutputs<V>) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.outputs.insert(node_id, outputs);
    }

    pub fn has_output(&self, node_id: &NodeId) -> bool {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.outputs.contains_key(node_id)
    }

    /// Sets one custom input of `node_id`, shadowing the declared input of
    /// the same name during input resolution.
    pub fn set_custom_input(&self, node_id: NodeId, name: impl Into<String>, value: serde_json::Value) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.custom_inputs.entry(node_id).or_default().insert(name.into(), value);
    }

    /// All custom inputs of `node_id`. Empty map when none were set.
    pub fn get_custom_inputs(&self, node_id: &NodeId) -> HashMap<String, serde_json::Value> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.custom_inputs.get(node_id).cloned().unwrap_or_default()
    }

    /// Parks a live execution object on the node's record.
    pub fn bind_instance(&self, node_id: &NodeId, instance: BoundInstance) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let record = guard.nodes.get_mut(node_id).ok_or_else(|| Error::UnknownNode(node_id.clone()))?;
        record.instance = Some(instance);
        Ok(())
    }

    /// Takes the parked execution object off the node's record, leaving
    /// `None` behind.
    pub fn take_instance(&self, node_id: &NodeId) -> Option<BoundInstance> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.nodes.get_mut(node_id).and_then(|record| record.instance.take())
    }

    /// Stamps the node's record with the current local time.
    pub fn mark_executed(&self, node_id: &NodeId) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let record = guard.nodes.get_mut(node_id).ok_or_else(|| Error::UnknownNode(node_id.clone()))?;
        record.last_executed = Some(Local::now());
        Ok(())
    }

    pub fn last_executed(&self, node_id: &NodeId) -> Option<DateTime<Local>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.nodes.get(node_id).and_then(|record| record.last_executed)
    }

    /// Exports the registered nodes as a snapshot DTO. Output values are
    /// reduced to kind tags; the `distributed`, `worker`, `assignments` and
    /// per-node `owner` fields are left for the coordination layer to fill.
    pub fn export_snapshot(&self) -> StateSnapshotDto {
        let guard = self.inner.read().expect("RwLock poisoned");

        let mut nodes = BTreeMap::new();
        for (node_id, record) in &guard.nodes {
            let inputs = record
                .data
                .inputs
                .iter()
                .map(|(name, spec)| (name.clone(), InputValueDto::from(spec)))
                .collect();

            let custom_inputs = guard
                .custom_inputs
                .get(node_id)
                .map(|values| values.iter().map(|(name, value)| (name.clone(), value.clone())).collect())
                .unwrap_or_default();

            let node_snapshot = NodeSnapshotDto {
                class_type: record.data.class_type.clone(),
                inputs,
                custom_inputs,
                instance_bound: record.instance.is_some(),
                last_executed: record.last_executed.map(|timestamp| timestamp.to_rfc3339()),
                output_kinds: guard.outputs.get(node_id).map(NodeOutputs::kinds),
                owner: None,
            };

            nodes.insert(node_id.as_str().to_string(), node_snapshot);
        }

        StateSnapshotDto { distributed: false, worker: None, assignments: BTreeMap::new(), nodes }
    }
}
