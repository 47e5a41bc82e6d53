use serde::{Deserialize, Serialize};

use crate::domain::node::{NodeId, WorkerId};
use crate::error::{Error, Result};

/// Control-plane messages consumed by the per-worker output service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlMsg {
    /// Ownership decision for one node, announced group-wide at
    /// registration time. Receivers adopt the announced owner as-is.
    Assignment { node_id: NodeId, owner: WorkerId },

    /// `source` finished computing `node_id` and holds (or dropped) its
    /// output.
    Availability { node_id: NodeId, has_output: bool, source: WorkerId },

    /// Asks the owner of `node_id` for the value in one output slot. The
    /// reply goes to `requester` on the reply tag and must echo `seq`, the
    /// requester's exchange number.
    FetchRequest { node_id: NodeId, slot: usize, requester: WorkerId, seq: u64 },
}

/// Reply to a [`ControlMsg::FetchRequest`]. `output` carries the
/// codec-encoded slot value; `None` means the owner has nothing in that
/// slot. Absence is a protocol flag, never an encoded sentinel value.
///
/// `seq` echoes the request's exchange number, so a requester that gave up
/// on an exchange can tell the late reply to it from the reply it is
/// actually waiting for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub output: Option<Vec<u8>>,
    pub seq: u64,
}

pub fn encode_control(msg: &ControlMsg) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| Error::EncodeError(e.to_string()))
}

pub fn decode_control(bytes: &[u8]) -> Result<ControlMsg> {
    bincode::deserialize(bytes).map_err(|e| Error::DecodeError(e.to_string()))
}

pub fn encode_response(response: &FetchResponse) -> Result<Vec<u8>> {
    bincode::serialize(response).map_err(|e| Error::EncodeError(e.to_string()))
}

pub fn decode_response(bytes: &[u8]) -> Result<FetchResponse> {
    bincode::deserialize(bytes).map_err(|e| Error::DecodeError(e.to_string()))
}
