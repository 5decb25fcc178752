//! VM Manager - boots, restores, snapshots and destroys individual VMs
//!
//! The VmManager knows how one VM comes up and goes away. It owns no
//! bookkeeping; which entry is free and who holds which address is the
//! pool's business.
//!
//! On-disk layout per pool entry:
//!
//! ```text
//! <pool_dir>/<entry_id>/
//!     vmstate       serialized device/CPU state
//!     memory        guest memory image
//!     overlay.ext4  writable copy of the base rootfs
//!     entry.json    ledger record, written when the entry turns Free
//! <vm_dir>/<vm_id>.sock   API socket of the live process
//! ```
//!
//! Every snapshot lands in a fresh entry directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::*;
use super::handle::{BootPath, RunningVm, VmStatus};
use super::lifecycle::{HypervisorLauncher, LaunchSpec};
use super::PoolError;
use crate::config::RunnerConfig;
use crate::metrics::VM_BOOT_DURATION;
use crate::network::{HostNetwork, NetworkSlot};

/// Fixed MAC for the guest interface; every guest lives in its own namespace
const GUEST_MAC: &str = "06:00:AC:10:00:02";

/// What a cold boot needs
#[derive(Debug, Clone)]
pub struct VmSettings {
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    pub boot_args: String,
    pub vcpu: u32,
    pub memory_mb: u32,
}

impl VmSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            kernel: config.firecracker.kernel.clone(),
            rootfs: config.firecracker.rootfs.clone(),
            boot_args: config.firecracker.boot_args.clone(),
            vcpu: config.sandbox.vcpu,
            memory_mb: config.sandbox.memory_mb,
        }
    }
}

/// File paths of one pool entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPaths {
    pub dir: PathBuf,
    pub snapshot: PathBuf,
    pub memory: PathBuf,
    pub overlay: PathBuf,
    pub record: PathBuf,
}

impl EntryPaths {
    pub fn new(pool_dir: &Path, entry_id: &str) -> Self {
        let dir = pool_dir.join(entry_id);
        Self {
            snapshot: dir.join("vmstate"),
            memory: dir.join("memory"),
            overlay: dir.join("overlay.ext4"),
            record: dir.join("entry.json"),
            dir,
        }
    }
}

pub struct VmManager {
    launcher: Arc<dyn HypervisorLauncher>,
    host: HostNetwork,
    settings: VmSettings,
    pool_dir: PathBuf,
    vm_dir: PathBuf,
}

impl VmManager {
    pub fn new(
        launcher: Arc<dyn HypervisorLauncher>,
        host: HostNetwork,
        settings: VmSettings,
        pool_dir: impl Into<PathBuf>,
        vm_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            host,
            settings,
            pool_dir: pool_dir.into(),
            vm_dir: vm_dir.into(),
        }
    }

    pub fn host(&self) -> &HostNetwork {
        &self.host
    }

    pub fn pool_dir(&self) -> &Path {
        &self.pool_dir
    }

    pub fn entry_paths(&self, entry_id: &str) -> EntryPaths {
        EntryPaths::new(&self.pool_dir, entry_id)
    }

    pub fn new_entry_id() -> String {
        format!("entry-{}", Uuid::now_v7())
    }

    async fn launch(
        &self,
        slot: &NetworkSlot,
        entry_id: &str,
        boot_path: BootPath,
        reuse_count: u32,
    ) -> Result<RunningVm, PoolError> {
        let vm_id = format!("vm-{}", Uuid::now_v7());
        tokio::fs::create_dir_all(&self.vm_dir)
            .await
            .map_err(|e| PoolError::io(&self.vm_dir, e))?;

        let spec = LaunchSpec {
            vm_id: vm_id.clone(),
            api_socket: self.vm_dir.join(format!("{}.sock", vm_id)),
            namespace: self.host.namespace_for(slot).map(str::to_string),
        };
        let launched = self.launcher.launch(&spec).await?;
        let paths = self.entry_paths(entry_id);

        Ok(RunningVm::new(
            vm_id,
            entry_id.to_string(),
            slot.clone(),
            paths.dir,
            paths.overlay,
            spec.api_socket,
            boot_path,
            reuse_count,
            launched.control,
            launched.process,
        ))
    }

    /// Boot a fresh VM from kernel + rootfs into the entry directory
    ///
    /// The base rootfs is copied to the entry's overlay so the template is
    /// never written to.
    pub async fn cold_boot(&self, slot: &NetworkSlot, entry_id: &str) -> Result<RunningVm, PoolError> {
        let start = Instant::now();
        let paths = self.entry_paths(entry_id);

        tokio::fs::create_dir_all(&paths.dir)
            .await
            .map_err(|e| PoolError::io(&paths.dir, e))?;
        if let Err(e) = tokio::fs::copy(&self.settings.rootfs, &paths.overlay).await {
            let _ = tokio::fs::remove_dir_all(&paths.dir).await;
            return Err(PoolError::io(&self.settings.rootfs, e));
        }

        let mut vm = match self.launch(slot, entry_id, BootPath::Cold, 0).await {
            Ok(vm) => vm,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&paths.dir).await;
                return Err(e);
            }
        };

        let plan = ColdBoot {
            boot_source: BootSource {
                kernel_image_path: self.settings.kernel.clone(),
                boot_args: format!(
                    "{} {}",
                    self.settings.boot_args,
                    guest_ip_arg(
                        self.host.guest_address(),
                        self.host.guest_gateway(),
                        self.host.dns_resolver()
                    )
                ),
            },
            machine: MachineConfig {
                vcpu_count: self.settings.vcpu,
                mem_size_mib: self.settings.memory_mb,
                smt: false,
            },
            drives: vec![Drive::root(&paths.overlay)],
            interface: NetworkInterface {
                iface_id: GUEST_IFACE_ID.to_string(),
                guest_mac: GUEST_MAC.to_string(),
                host_dev_name: slot.tap_name.clone(),
            },
        };

        if let Err(e) = vm.control().boot(&plan).await {
            self.destroy(&mut vm, true).await;
            return Err(e.into());
        }

        let elapsed = start.elapsed();
        VM_BOOT_DURATION.observe(elapsed.as_secs_f64());
        info!(
            vm_id = %vm.vm_id,
            address = %slot.address,
            boot_ms = elapsed.as_millis() as u64,
            "vm cold booted"
        );
        Ok(vm)
    }

    /// Restore a Free entry's snapshot onto `slot`
    ///
    /// The snapshot is loaded paused. Its interface is rebound to the
    /// slot's TAP device and its root drive to this entry's overlay before
    /// the guest resumes. On error the process is killed but the entry's
    /// files are left for the caller to discard.
    pub async fn restore(
        &self,
        slot: &NetworkSlot,
        entry_id: &str,
        reuse_count: u32,
    ) -> Result<RunningVm, PoolError> {
        let paths = self.entry_paths(entry_id);
        let mut vm = self.launch(slot, entry_id, BootPath::Restored, reuse_count).await?;

        let overrides = vec![NetworkOverride {
            iface_id: GUEST_IFACE_ID.to_string(),
            host_dev_name: slot.tap_name.clone(),
        }];
        let root = DriveUpdate {
            drive_id: ROOT_DRIVE_ID.to_string(),
            path_on_host: paths.overlay.clone(),
        };
        let loaded = async {
            vm.control()
                .load_snapshot(&paths.snapshot, MemBackend::file(&paths.memory), false, overrides)
                .await?;
            vm.control().update_drive(&root).await?;
            vm.control().resume().await
        }
        .await;
        if let Err(e) = loaded {
            self.destroy(&mut vm, false).await;
            return Err(e.into());
        }

        debug!(vm_id = %vm.vm_id, entry = entry_id, address = %slot.address, "vm restored");
        Ok(vm)
    }

    /// Pause the VM and write a Full snapshot into a new entry
    ///
    /// A restored VM's guest memory is backed by the memory file of the
    /// entry it came from, so that entry is never written to. Once the
    /// snapshot is on disk the VM is killed, its overlay moves into the new
    /// entry and the old entry directory is removed. Returns the new entry
    /// id; on error the VM is left for the caller to destroy.
    pub async fn snapshot_to_new_entry(&self, vm: &mut RunningVm) -> Result<String, PoolError> {
        let entry_id = Self::new_entry_id();
        let target = self.entry_paths(&entry_id);
        tokio::fs::create_dir_all(&target.dir)
            .await
            .map_err(|e| PoolError::io(&target.dir, e))?;

        let written: Result<(), PoolError> = async {
            vm.control().pause().await?;
            vm.status = VmStatus::Paused;
            vm.control()
                .create_snapshot(&target.snapshot, &target.memory, SnapshotType::Full)
                .await?;
            vm.kill().await;
            tokio::fs::rename(&vm.overlay_disk, &target.overlay)
                .await
                .map_err(|e| PoolError::io(&vm.overlay_disk, e))
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_dir_all(&target.dir).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::remove_dir_all(&vm.entry_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(vm_id = %vm.vm_id, error = %e, "failed to delete previous pool entry");
            }
        }
        debug!(vm_id = %vm.vm_id, from = %vm.entry_id, entry = %entry_id, "snapshot written");
        Ok(entry_id)
    }

    /// Kill the process; with `delete_files` also remove the entry directory
    pub async fn destroy(&self, vm: &mut RunningVm, delete_files: bool) {
        vm.kill().await;
        if delete_files {
            if let Err(e) = tokio::fs::remove_dir_all(&vm.entry_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(vm_id = %vm.vm_id, error = %e, "failed to delete vm disk");
                }
            }
        }
        debug!(vm_id = %vm.vm_id, uptime_ms = vm.uptime().as_millis() as u64, "vm destroyed");
    }

    /// Remove an entry's files without a live VM
    pub async fn delete_entry(&self, entry_id: &str) {
        let dir = self.entry_paths(entry_id).dir;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(entry = entry_id, error = %e, "failed to delete pool entry");
            }
        }
    }
}
