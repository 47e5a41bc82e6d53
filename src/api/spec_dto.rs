use serde::{Deserialize, Serialize};

/// On-disk form of the specialization table: an ordered list of workers and
/// the node types each one prefers to own. List order is resolution order.
pub type SpecTableDto = Vec<SpecEntryDto>;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SpecEntryDto {
    pub worker: u32,
    pub types: Vec<String>,
}
