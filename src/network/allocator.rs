//! Network identity allocator
//!
//! The private range is carved into fixed /30 slots:
//!
//! ```text
//! base + 4i + 0   network
//! base + 4i + 1   host end of the veth pair (gateway for the VM namespace)
//! base + 4i + 2   VM address, the registry key the proxy sees as source
//! base + 4i + 3   broadcast
//! ```
//!
//! Slots are handed out round-robin. An address is skipped while it is
//! registered or allocated-but-not-yet-registered; when every slot is taken
//! allocation fails instead of reusing a live address.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::registry::VmRegistry;
use super::RegistryError;
use crate::metrics::ADDRESSES_IN_USE;

/// One address slot and the host-side names derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSlot {
    pub index: u32,
    /// Address the VM's traffic carries after NAT; registry key
    pub address: Ipv4Addr,
    pub host_address: Ipv4Addr,
    pub namespace: String,
    pub tap_name: String,
    pub host_veth: String,
    pub ns_veth: String,
}

impl NetworkSlot {
    fn new(base: Ipv4Addr, index: u32) -> Result<Self, RegistryError> {
        let start = u32::from(base)
            .checked_add(index.checked_mul(4).ok_or(RegistryError::RangeOverflow)?)
            .ok_or(RegistryError::RangeOverflow)?;
        start.checked_add(3).ok_or(RegistryError::RangeOverflow)?;
        Ok(Self {
            index,
            address: Ipv4Addr::from(start + 2),
            host_address: Ipv4Addr::from(start + 1),
            namespace: format!("rv{}", index),
            tap_name: format!("rvtap{}", index),
            host_veth: format!("rvh{}", index),
            ns_veth: format!("rvg{}", index),
        })
    }
}

struct AllocatorState {
    cursor: usize,
    pending: HashSet<Ipv4Addr>,
}

/// Fixed-size slot pool with collision checks against the registry
pub struct AddressAllocator {
    slots: Vec<NetworkSlot>,
    registry: VmRegistry,
    state: Mutex<AllocatorState>,
}

impl AddressAllocator {
    pub fn new(base: Ipv4Addr, slot_count: u32, registry: VmRegistry) -> Result<Self, RegistryError> {
        if u32::from(base) % 4 != 0 {
            return Err(RegistryError::InvalidRange(format!(
                "{} is not aligned to a /30",
                base
            )));
        }
        let slots = (0..slot_count)
            .map(|i| NetworkSlot::new(base, i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            slots,
            registry,
            state: Mutex::new(AllocatorState {
                cursor: 0,
                pending: HashSet::new(),
            }),
        })
    }

    /// Reserve the next free slot
    ///
    /// The returned address stays reserved until it is registered and then
    /// released with [`release_pending`](Self::release_pending), or released
    /// unregistered when the VM start is abandoned.
    pub fn allocate(&self) -> Result<NetworkSlot, RegistryError> {
        let live: HashSet<Ipv4Addr> = self
            .registry
            .list()?
            .into_iter()
            .map(|r| r.address)
            .collect();

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let n = self.slots.len();
        for step in 0..n {
            let idx = (state.cursor + step) % n;
            let slot = &self.slots[idx];
            if live.contains(&slot.address) || state.pending.contains(&slot.address) {
                continue;
            }
            state.pending.insert(slot.address);
            state.cursor = (idx + 1) % n;
            ADDRESSES_IN_USE.set((live.len() + state.pending.len()) as f64);
            debug!(address = %slot.address, slot = slot.index, "address allocated");
            return Ok(slot.clone());
        }

        Err(RegistryError::Exhausted { slots: n })
    }

    /// Drop the in-flight reservation for `address`
    ///
    /// Once registered, the registry itself keeps the address out of
    /// circulation until `unregister`.
    pub fn release_pending(&self, address: Ipv4Addr) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pending.remove(&address);
    }

    pub fn slot_for(&self, address: Ipv4Addr) -> Option<&NetworkSlot> {
        self.slots.iter().find(|s| s.address == address)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pending
            .len()
    }
}

/// Shared handle type used across the runner
pub type SharedAllocator = Arc<AddressAllocator>;
