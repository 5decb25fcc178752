//! VM network identity
//!
//! - `registry`: address → run identity + firewall policy (proxy lookup table)
//! - `allocator`: fixed /30 slot pool handing out per-VM addresses
//! - `host`: namespace / TAP / veth / iptables plumbing per slot

pub mod allocator;
pub mod host;
pub mod registry;

use thiserror::Error;

pub use allocator::{AddressAllocator, NetworkSlot};
pub use host::HostNetwork;
pub use registry::{Registration, RegistryStore, SqliteRegistryStore, VmPolicy, VmRegistry};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("address pool exhausted ({slots} slots in use)")]
    Exhausted { slots: usize },

    #[error("invalid address range: {0}")]
    InvalidRange(String),

    #[error("address range overflows the IPv4 space")]
    RangeOverflow,

    #[error("registry store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed registration record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("host network command `{command}` failed ({status:?}): {stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("failed to run host network command: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Exhaustion means "no capacity right now", not a broken host
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RegistryError::Exhausted { .. })
    }
}
