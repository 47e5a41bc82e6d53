use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::node::WorkerId;
use crate::error::{Error, Result};

/// Identity of this worker process within its group. Fixed at startup;
/// nothing in the coordination layer mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// False when the process runs alone; every node is then owned locally
    /// and no announcement traffic happens at all.
    pub distributed: bool,
    pub rank: WorkerId,
    pub world_size: usize,

    /// Index of the device this process drives on its host. Carried for the
    /// engine's benefit; ownership never depends on it.
    pub local_device: usize,
}

impl WorkerIdentity {
    pub fn single_process() -> Self {
        WorkerIdentity { distributed: false, rank: WorkerId(0), world_size: 1, local_device: 0 }
    }

    pub fn new(rank: WorkerId, world_size: usize, local_device: usize) -> Self {
        WorkerIdentity { distributed: world_size > 1, rank, world_size, local_device }
    }

    /// Builds the identity from launcher-provided environment variables:
    /// `RANK`, `WORLD_SIZE` and `LOCAL_RANK`. Absent variables default to a
    /// single-process identity.
    pub fn from_env() -> Result<Self> {
        let rank: u32 = read_env_var("RANK", 0)?;
        let world_size: usize = read_env_var("WORLD_SIZE", 1)?;
        let local_device: usize = read_env_var("LOCAL_RANK", 0)?;

        if world_size == 0 {
            return Err(Error::ConfigError("WORLD_SIZE must be at least 1".to_string()));
        }
        if rank as usize >= world_size {
            return Err(Error::ConfigError(format!(
                "RANK {rank} is out of range for WORLD_SIZE {world_size}"
            )));
        }

        Ok(Self::new(WorkerId(rank), world_size, local_device))
    }
}

fn read_env_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::ConfigError(format!("{name} must be an integer, got '{raw}'"))),
        Err(_) => Ok(default),
    }
}
