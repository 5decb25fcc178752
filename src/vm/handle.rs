//! RunningVm - one live microVM and everything it holds
//!
//! A RunningVm owns its hypervisor process, its network slot and its
//! overlay disk. It is created by the pool on acquire and must go back
//! through `VmPool::release`, which is where the slot and the registry
//! entry are given up.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::warn;

use super::firecracker::HypervisorControl;
use crate::network::NetworkSlot;

/// How the VM came up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPath {
    /// Restored from a Free pool entry
    Restored,
    /// Booted from kernel + rootfs
    Cold,
}

impl BootPath {
    pub fn as_str(self) -> &'static str {
        match self {
            BootPath::Restored => "restore",
            BootPath::Cold => "cold",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VmStatus {
    Running,
    Paused,
    Failed(String),
}

pub struct RunningVm {
    pub vm_id: String,
    /// Pool entry this VM's files live in
    pub entry_id: String,
    pub slot: NetworkSlot,
    pub entry_dir: PathBuf,
    pub overlay_disk: PathBuf,
    pub api_socket: PathBuf,
    pub boot_path: BootPath,
    /// Times this VM's state has been snapshotted back into the pool
    pub reuse_count: u32,
    pub status: VmStatus,
    pub started_at: Instant,
    control: Arc<dyn HypervisorControl>,
    process: Option<Child>,
}

impl RunningVm {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        vm_id: String,
        entry_id: String,
        slot: NetworkSlot,
        entry_dir: PathBuf,
        overlay_disk: PathBuf,
        api_socket: PathBuf,
        boot_path: BootPath,
        reuse_count: u32,
        control: Arc<dyn HypervisorControl>,
        process: Option<Child>,
    ) -> Self {
        Self {
            vm_id,
            entry_id,
            slot,
            entry_dir,
            overlay_disk,
            api_socket,
            boot_path,
            reuse_count,
            status: VmStatus::Running,
            started_at: Instant::now(),
            control,
            process,
        }
    }

    /// Registry key and proxy source address
    pub fn address(&self) -> Ipv4Addr {
        self.slot.address
    }

    pub fn control(&self) -> &dyn HypervisorControl {
        self.control.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.id())
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = VmStatus::Failed(reason.into());
    }

    /// Process still running and API answering
    pub async fn is_healthy(&mut self) -> bool {
        if matches!(self.status, VmStatus::Failed(_)) {
            return false;
        }
        if let Some(process) = self.process.as_mut() {
            if !matches!(process.try_wait(), Ok(None)) {
                return false;
            }
        }
        self.control.ping().await.is_ok()
    }

    /// Kill the hypervisor process and remove its API socket
    pub async fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.kill().await {
                warn!(vm_id = %self.vm_id, error = %e, "failed to kill hypervisor");
            }
        }
        let _ = tokio::fs::remove_file(&self.api_socket).await;
    }
}

impl fmt::Debug for RunningVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningVm")
            .field("vm_id", &self.vm_id)
            .field("entry_id", &self.entry_id)
            .field("address", &self.slot.address)
            .field("boot_path", &self.boot_path)
            .field("reuse_count", &self.reuse_count)
            .field("status", &self.status)
            .field("pid", &self.pid())
            .finish()
    }
}
