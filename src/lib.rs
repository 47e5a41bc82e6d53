use crate::domain::node::{NodeData, NodeId};
use crate::error::Result;
use crate::loader::parser::load_graph_file;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

/// Loads a graph definition file and returns its nodes, ready to register,
/// in the deterministic order every worker of a group must use.
pub fn load_graph(file_path: &str) -> Result<Vec<(NodeId, NodeData)>> {
    let nodes = load_graph_file(file_path)?;
    log::info!("loaded graph '{}' with {} nodes", file_path, nodes.len());

    Ok(nodes)
}
