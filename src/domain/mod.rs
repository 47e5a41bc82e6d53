pub mod codec;
pub mod distributed;
pub mod executor;
pub mod graph;
pub mod node;
pub mod specialization;
pub mod state_store;
