use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::api::node_dto::InputValueDto;

/// Debug export of one worker's view of the graph state. Output values stay
/// behind; only their kind tags travel, so the snapshot is always small and
/// always serializable.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StateSnapshotDto {
    pub distributed: bool,

    /// Rank of the exporting worker. `None` for a bare local store.
    pub worker: Option<u32>,

    /// Ownership decisions known to this worker, keyed by node id. Empty for
    /// a bare local store.
    pub assignments: BTreeMap<String, u32>,

    /// Locally registered nodes, keyed by node id.
    pub nodes: BTreeMap<String, NodeSnapshotDto>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeSnapshotDto {
    pub class_type: String,
    pub inputs: BTreeMap<String, InputValueDto>,
    pub custom_inputs: BTreeMap<String, serde_json::Value>,
    pub instance_bound: bool,
    pub last_executed: Option<String>,

    /// Kind tag per output slot, `None` while the node has not produced yet.
    pub output_kinds: Option<Vec<String>>,

    /// Owning worker, when known to the exporting side.
    pub owner: Option<u32>,
}
