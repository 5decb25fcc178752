//! Firecracker VM management module
//!
//! - `config`: hypervisor API payloads
//! - `firecracker`: the control client and its trait
//! - `lifecycle`: process spawn + readiness
//! - `handle`: one running VM
//! - `manager`: boot / restore / snapshot / destroy of single VMs
//! - `pool`: the snapshot pool ledger, acquire/release and refill

pub mod config;
pub mod firecracker;
pub mod handle;
pub mod lifecycle;
pub mod manager;
pub mod pool;

use std::path::Path;

use thiserror::Error;

use crate::network::RegistryError;

pub use firecracker::{FirecrackerClient, HypervisorControl, HypervisorError};
pub use handle::{BootPath, RunningVm, VmStatus};
pub use lifecycle::{FirecrackerLauncher, HypervisorLauncher, LaunchSpec, LaunchedVm};
pub use manager::{VmManager, VmSettings};
pub use pool::{EntryState, PoolEntry, PoolSettings, PoolStats, VmAssignment, VmPool};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Network(#[from] RegistryError),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("vm acquire task ended without a result")]
    Abandoned,
}

impl PoolError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        PoolError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// No address available right now; the job should go back to the queue
    pub fn is_capacity(&self) -> bool {
        matches!(self, PoolError::Network(e) if e.is_exhausted())
    }
}
