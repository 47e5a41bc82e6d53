pub mod comm;
pub mod framing;
pub mod identity;
pub mod protocol;
pub mod service;
pub mod store;

pub use identity::WorkerIdentity;
pub use service::{OutputService, ServiceHandle};
pub use store::DistributedNodeStore;
