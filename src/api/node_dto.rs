use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::node::{InputSpec, NodeData, NodeId};

/// On-disk form of a graph definition: a JSON object keyed by node id.
///
/// The map is ordered so that every worker process walks the same file in
/// the same sequence; registration order is part of the group protocol.
pub type GraphDto = BTreeMap<String, NodeDto>;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeDto {
    pub class_type: String,

    #[serde(default)]
    pub inputs: BTreeMap<String, InputValueDto>,
}

/// An input as written in the graph file: a `[node_id, slot]` pair pointing
/// at an upstream output, or any other JSON value taken literally.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum InputValueDto {
    Link(String, usize),
    Literal(serde_json::Value),
}

impl From<NodeDto> for NodeData {
    fn from(dto: NodeDto) -> Self {
        let inputs = dto
            .inputs
            .into_iter()
            .map(|(name, value)| (name, InputSpec::from(value)))
            .collect();

        NodeData { class_type: dto.class_type, inputs }
    }
}

impl From<InputValueDto> for InputSpec {
    fn from(dto: InputValueDto) -> Self {
        match dto {
            InputValueDto::Link(source, slot) => InputSpec::Link(NodeId::new(source), slot),
            InputValueDto::Literal(value) => InputSpec::Literal(value),
        }
    }
}

impl From<&InputSpec> for InputValueDto {
    fn from(spec: &InputSpec) -> Self {
        match spec {
            InputSpec::Link(source, slot) => InputValueDto::Link(source.as_str().to_string(), *slot),
            InputSpec::Literal(value) => InputValueDto::Literal(value.clone()),
        }
    }
}
