pub mod node_dto;
pub mod snapshot_dto;
pub mod spec_dto;
