use serde::de::DeserializeOwned;
use std::fs;

use crate::api::node_dto::GraphDto;
use crate::api::spec_dto::SpecTableDto;
use crate::domain::node::{NodeData, NodeId};
use crate::domain::specialization::SpecializationTable;
use crate::error::{Error, Result};

/// Parses a JSON file into a given type `T`.
///
/// This function reads a file from `file_path`, attempts to parse it
/// as JSON, and returns an instance of `T`.
///
/// Errors are automatically converted into `crate::error::Error` variants:
/// - `Error::IoError` if the file cannot be read.
/// - `Error::DeserializationError` if the JSON is malformed.
pub fn parse_json_file<T: DeserializeOwned>(file_path: &str) -> Result<T> {
    let data = fs::read_to_string(file_path).map_err(Error::IoError)?;

    let parsed_data: T = serde_json::from_str(&data).map_err(Error::DeserializationError)?;

    Ok(parsed_data)
}

/// Loads a graph definition file and returns its nodes in registration
/// order (sorted by node id, the order the file's map imposes).
pub fn load_graph_file(file_path: &str) -> Result<Vec<(NodeId, NodeData)>> {
    let graph: GraphDto = parse_json_file(file_path)?;

    let nodes = graph
        .into_iter()
        .map(|(id, dto)| (NodeId::new(id), NodeData::from(dto)))
        .collect();

    Ok(nodes)
}

/// Loads a specialization table file. Entry order in the file is preserved;
/// it decides resolution priority.
pub fn load_spec_table(file_path: &str) -> Result<SpecializationTable> {
    let dto: SpecTableDto = parse_json_file(file_path)?;

    Ok(SpecializationTable::from_dto(&dto))
}
