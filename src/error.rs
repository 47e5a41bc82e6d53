use thiserror::Error;

use crate::domain::distributed::comm::CommError;
use crate::domain::node::{NodeId, WorkerId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON input: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Failed to encode wire message: {0}")]
    EncodeError(String),

    #[error("Failed to decode wire message: {0}")]
    DecodeError(String),

    #[error("Group communication failed: {0}")]
    CommError(#[from] CommError),

    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    #[error("Invalid worker configuration: {0}")]
    ConfigError(String),

    #[error("Node {0} is not registered on this worker")]
    UnknownNode(NodeId),

    #[error("Graph links form a cycle that blocks node {0}")]
    GraphCycle(NodeId),

    #[error("Fetch of node {node_id} from worker {owner} timed out")]
    FetchTimeout { node_id: NodeId, owner: WorkerId },

    #[error("Node execution failed: {0}")]
    ExecutionError(String),

    #[error("Value codec failed: {0}")]
    CodecError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
