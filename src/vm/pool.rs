//! VM Pool - snapshot pool of paused microVMs
//!
//! The pool keeps a ledger of entries, each a paused VM serialized to disk
//! (state + memory + overlay disk). Acquiring restores a Free entry onto a
//! freshly allocated network slot; with nothing Free it cold boots. Release
//! either snapshots the VM back into a Free entry or destroys it.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  VM Pool ledger                                                   │
//! │                                                                   │
//! │   [Free]  [Free]  [Reserved]  [InUse]  [InUse]                    │
//! │     │                  ▲          │                               │
//! │     └── acquire() ─────┘          └── release(repool) ──► [Free]  │
//! │         restore / cold boot           release(!repool) ──► gone   │
//! │                                                                   │
//! │   refill loop: cold boot → warm up → pause → snapshot → [Free]    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entry state only moves under the ledger lock, so a Free entry is
//! reserved by exactly one caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{BootPath, RunningVm};
use super::manager::VmManager;
use super::PoolError;
use crate::config::RunnerConfig;
use crate::metrics::{POOL_FREE_ENTRIES, POOL_IN_USE_VMS, VM_ACQUIRE_DURATION};
use crate::network::{AddressAllocator, NetworkSlot, VmPolicy, VmRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Free,
    Reserved,
    InUse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: String,
    pub state: EntryState,
    pub snapshot_path: PathBuf,
    pub memory_path: PathBuf,
    pub overlay_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub reuse_count: u32,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Free entries the refill loop maintains
    pub target_size: usize,
    /// Snapshots a VM may go through before it is destroyed instead
    pub max_reuse: u32,
    pub refill_interval: Duration,
    /// Time a refill VM runs before it is snapshotted
    pub warmup: Duration,
    pub persist_on_shutdown: bool,
}

impl PoolSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            target_size: config.pool.target_size,
            max_reuse: config.pool.max_reuse,
            refill_interval: Duration::from_millis(config.pool.refill_interval_ms),
            warmup: Duration::from_secs(config.pool.warmup_secs),
            persist_on_shutdown: config.pool.persist_on_shutdown,
        }
    }
}

/// Who the VM is being handed to
#[derive(Debug, Clone)]
pub struct VmAssignment {
    pub run_id: String,
    pub sandbox_token: String,
    pub policy: VmPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub free: usize,
    pub reserved: usize,
    pub in_use: usize,
    pub target_size: usize,
    pub address_slots: usize,
}

pub struct VmPool {
    manager: VmManager,
    registry: VmRegistry,
    allocator: Arc<AddressAllocator>,
    entries: Mutex<Vec<PoolEntry>>,
    settings: PoolSettings,
    refill_wanted: Notify,
}

impl VmPool {
    /// Create a new VM pool
    ///
    /// # Arguments
    /// * `manager` - boots and restores individual VMs
    /// * `registry` - where acquired VMs are registered for the proxy
    /// * `allocator` - hands out network slots
    /// * `settings` - pool sizing and reuse limits
    pub fn new(
        manager: VmManager,
        registry: VmRegistry,
        allocator: Arc<AddressAllocator>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            manager,
            registry,
            allocator,
            entries: Mutex::new(Vec::new()),
            settings,
            refill_wanted: Notify::new(),
        }
    }

    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    /// Hand out a running, registered VM for `assignment`
    ///
    /// Restores a Free entry when there is one. If that restore fails the
    /// entry is discarded and the VM is cold booted instead. Address
    /// exhaustion fails with [`PoolError::is_capacity`].
    pub async fn acquire(&self, assignment: &VmAssignment) -> Result<RunningVm, PoolError> {
        let start = Instant::now();
        let slot = self.allocator.allocate()?;

        let result = self.start_vm(&slot, assignment).await;
        self.allocator.release_pending(slot.address);
        let vm = result?;

        let elapsed = start.elapsed();
        VM_ACQUIRE_DURATION
            .with_label_values(&[vm.boot_path.as_str()])
            .observe(elapsed.as_secs_f64());
        self.update_gauges().await;
        info!(
            run_id = %assignment.run_id,
            vm_id = %vm.vm_id,
            address = %vm.address(),
            path = vm.boot_path.as_str(),
            acquire_ms = elapsed.as_millis() as u64,
            "vm acquired"
        );
        Ok(vm)
    }

    /// [`acquire`](Self::acquire) that survives its caller going away
    ///
    /// The work runs on its own task. If the returned future is dropped
    /// before the VM is handed over, that task releases the VM without
    /// repooling, so registration, address and entry are never stranded.
    pub async fn acquire_owned(self: &Arc<Self>, assignment: VmAssignment) -> Result<RunningVm, PoolError> {
        let (tx, rx) = oneshot::channel();
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let result = pool.acquire(&assignment).await;
            if let Err(Ok(vm)) = tx.send(result) {
                debug!(run_id = %assignment.run_id, vm_id = %vm.vm_id, "acquire abandoned, releasing vm");
                pool.release(vm, false).await;
            }
        });
        rx.await.map_err(|_| PoolError::Abandoned)?
    }

    async fn start_vm(&self, slot: &NetworkSlot, assignment: &VmAssignment) -> Result<RunningVm, PoolError> {
        // Registered first so the proxy knows the VM from its first packet
        self.registry.register(
            slot.address,
            &assignment.run_id,
            &assignment.sandbox_token,
            assignment.policy.clone(),
        )?;

        if let Err(e) = self.manager.host().setup(slot).await {
            self.unregister_quietly(slot);
            return Err(e.into());
        }

        match self.restore_or_boot(slot).await {
            Ok(vm) => Ok(vm),
            Err(e) => {
                self.manager.host().teardown(slot).await;
                self.unregister_quietly(slot);
                Err(e)
            }
        }
    }

    async fn restore_or_boot(&self, slot: &NetworkSlot) -> Result<RunningVm, PoolError> {
        if let Some(entry) = self.reserve_free().await {
            match self.manager.restore(slot, &entry.id, entry.reuse_count).await {
                Ok(vm) => {
                    self.set_state(&entry.id, EntryState::InUse).await;
                    return Ok(vm);
                }
                Err(e) => {
                    warn!(entry = %entry.id, error = %e, "restore failed, discarding entry and cold booting");
                    self.discard(&entry.id).await;
                }
            }
        }

        let entry_id = VmManager::new_entry_id();
        let vm = self.manager.cold_boot(slot, &entry_id).await?;
        self.insert(self.entry_record(&entry_id, EntryState::InUse, 0)).await;
        Ok(vm)
    }

    /// Return a VM
    ///
    /// With `repool`, a healthy VM under its reuse limit is paused and
    /// snapshotted back into a Free entry; anything else is killed and its
    /// disk deleted. The registration and network slot are always released.
    pub async fn release(&self, mut vm: RunningVm, repool: bool) {
        self.unregister_quietly(&vm.slot);

        let mut repooled = None;
        if repool && self.may_repool(&mut vm).await {
            match self.manager.snapshot_to_new_entry(&mut vm).await {
                Ok(entry_id) => repooled = Some(entry_id),
                Err(e) => warn!(vm_id = %vm.vm_id, error = %e, "repool snapshot failed, destroying vm"),
            }
        }

        self.manager.destroy(&mut vm, repooled.is_none()).await;
        self.manager.host().teardown(&vm.slot).await;
        self.remove(&vm.entry_id).await;

        if let Some(entry_id) = &repooled {
            let record = self.entry_record(entry_id, EntryState::Free, vm.reuse_count + 1);
            self.write_record(&record).await;
            self.insert(record).await;
        }

        self.update_gauges().await;
        self.refill_wanted.notify_one();
        info!(vm_id = %vm.vm_id, address = %vm.address(), repooled = repooled.is_some(), "vm released");
    }

    async fn may_repool(&self, vm: &mut RunningVm) -> bool {
        if vm.reuse_count + 1 > self.settings.max_reuse {
            debug!(vm_id = %vm.vm_id, reuse = vm.reuse_count, "reuse limit reached");
            return false;
        }
        if self.stats().await.free >= self.settings.target_size {
            return false;
        }
        vm.is_healthy().await
    }

    /// Top the Free set up to the target size
    ///
    /// Returns how many entries were created.
    pub async fn refill_once(&self) -> Result<usize, PoolError> {
        let mut created = 0;
        while self.stats().await.free < self.settings.target_size {
            self.build_entry().await?;
            created += 1;
        }
        Ok(created)
    }

    async fn build_entry(&self) -> Result<(), PoolError> {
        let slot = self.allocator.allocate()?;
        let result = self.build_entry_on(&slot).await;
        self.allocator.release_pending(slot.address);
        result
    }

    async fn build_entry_on(&self, slot: &NetworkSlot) -> Result<(), PoolError> {
        self.manager.host().setup(slot).await?;

        let result: Result<String, PoolError> = async {
            let mut vm = self.manager.cold_boot(slot, &VmManager::new_entry_id()).await?;
            tokio::time::sleep(self.settings.warmup).await;
            let snapshot = self.manager.snapshot_to_new_entry(&mut vm).await;
            self.manager.destroy(&mut vm, snapshot.is_err()).await;
            snapshot
        }
        .await;
        self.manager.host().teardown(slot).await;
        let entry_id = result?;

        let record = self.entry_record(&entry_id, EntryState::Free, 0);
        self.write_record(&record).await;
        self.insert(record).await;
        self.update_gauges().await;
        debug!(entry = %entry_id, "pool entry created");
        Ok(())
    }

    /// Re-adopt Free entries a previous run left on disk
    ///
    /// Directories without a readable `entry.json` are leftovers of VMs
    /// that were in use when the runner died and are deleted.
    pub async fn adopt_persisted(&self) -> Result<usize, PoolError> {
        let dir = self.manager.pool_dir().to_path_buf();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(PoolError::io(&dir, e)),
        };

        let mut adopted = 0;
        while let Some(item) = read_dir.next_entry().await.map_err(|e| PoolError::io(&dir, e))? {
            let entry_id = item.file_name().to_string_lossy().into_owned();
            let paths = self.manager.entry_paths(&entry_id);
            let record = tokio::fs::read(&paths.record)
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice::<PoolEntry>(&bytes).ok())
                .filter(|r| r.id == entry_id && r.state == EntryState::Free);

            let complete = paths.snapshot.exists() && paths.memory.exists() && paths.overlay.exists();
            match record {
                Some(record) if complete && self.stats().await.free < self.settings.target_size => {
                    self.insert(record).await;
                    adopted += 1;
                }
                _ => self.manager.delete_entry(&entry_id).await,
            }
        }

        self.update_gauges().await;
        if adopted > 0 {
            info!(adopted, "persisted pool entries adopted");
        }
        Ok(adopted)
    }

    /// Get current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.lock().await;
        let count = |state| entries.iter().filter(|e| e.state == state).count();
        PoolStats {
            free: count(EntryState::Free),
            reserved: count(EntryState::Reserved),
            in_use: count(EntryState::InUse),
            target_size: self.settings.target_size,
            address_slots: self.allocator.capacity(),
        }
    }

    pub async fn entries(&self) -> Vec<PoolEntry> {
        self.entries.lock().await.clone()
    }

    /// Drop the Free set
    ///
    /// VMs still in use belong to their supervisors, which release them on
    /// cancellation. Free snapshots stay on disk with `persist_on_shutdown`.
    pub async fn shutdown(&self) {
        let free: Vec<PoolEntry> = {
            let mut entries = self.entries.lock().await;
            let (free, rest): (Vec<_>, Vec<_>) = entries.drain(..).partition(|e| e.state == EntryState::Free);
            *entries = rest;
            free
        };

        if !self.settings.persist_on_shutdown {
            for entry in &free {
                self.manager.delete_entry(&entry.id).await;
            }
        }

        self.update_gauges().await;
        info!(
            free = free.len(),
            persisted = self.settings.persist_on_shutdown,
            "vm pool shut down"
        );
    }

    /// Start the background refill task
    pub fn start_refill(pool: Arc<VmPool>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.settings.refill_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = pool.refill_wanted.notified() => {}
                }

                let refill = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = pool.refill_once() => r,
                };
                match refill {
                    Ok(0) => {}
                    Ok(n) => debug!(created = n, "pool refilled"),
                    Err(e) if e.is_capacity() => debug!("refill deferred, no free address"),
                    Err(e) => warn!(error = %e, "pool refill failed"),
                }
            }
            debug!("pool refill stopped");
        })
    }

    async fn reserve_free(&self) -> Option<PoolEntry> {
        let mut entries = self.entries.lock().await;
        let entry = entries.iter_mut().find(|e| e.state == EntryState::Free)?;
        entry.state = EntryState::Reserved;
        let reserved = entry.clone();
        POOL_FREE_ENTRIES.set(entries.iter().filter(|e| e.state == EntryState::Free).count() as f64);
        Some(reserved)
    }

    async fn set_state(&self, id: &str, state: EntryState) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.state = state;
        }
    }

    async fn insert(&self, entry: PoolEntry) {
        self.entries.lock().await.push(entry);
    }

    async fn remove(&self, id: &str) {
        self.entries.lock().await.retain(|e| e.id != id);
    }

    async fn discard(&self, id: &str) {
        self.remove(id).await;
        self.manager.delete_entry(id).await;
    }

    fn entry_record(&self, id: &str, state: EntryState, reuse_count: u32) -> PoolEntry {
        let paths = self.manager.entry_paths(id);
        PoolEntry {
            id: id.to_string(),
            state,
            snapshot_path: paths.snapshot,
            memory_path: paths.memory,
            overlay_path: paths.overlay,
            created_at: Utc::now(),
            reuse_count,
        }
    }

    async fn write_record(&self, entry: &PoolEntry) {
        let path = self.manager.entry_paths(&entry.id).record;
        let written = match serde_json::to_vec_pretty(entry) {
            Ok(bytes) => tokio::fs::write(&path, bytes).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = written {
            warn!(entry = %entry.id, error = %e, "failed to write pool entry record");
        }
    }

    fn unregister_quietly(&self, slot: &NetworkSlot) {
        if let Err(e) = self.registry.unregister(slot.address) {
            warn!(address = %slot.address, error = %e, "failed to unregister vm");
        }
    }

    async fn update_gauges(&self) {
        let stats = self.stats().await;
        POOL_FREE_ENTRIES.set(stats.free as f64);
        POOL_IN_USE_VMS.set((stats.in_use + stats.reserved) as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::network::HostNetwork;
    use crate::vm::config::{ColdBoot, Drive, DriveUpdate, MemBackend, NetworkOverride, SnapshotType};
    use crate::vm::firecracker::{HypervisorControl, HypervisorError};
    use crate::vm::lifecycle::{HypervisorLauncher, LaunchSpec, LaunchedVm};
    use crate::vm::manager::VmSettings;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    type DriveLog = Arc<std::sync::Mutex<Vec<PathBuf>>>;

    #[derive(Default)]
    struct FakeControl {
        fail_load: bool,
        drives: DriveLog,
    }

    #[async_trait]
    impl HypervisorControl for FakeControl {
        async fn pause(&self) -> Result<(), HypervisorError> {
            Ok(())
        }
        async fn resume(&self) -> Result<(), HypervisorError> {
            Ok(())
        }
        async fn create_snapshot(&self, state: &Path, mem: &Path, _: SnapshotType) -> Result<(), HypervisorError> {
            std::fs::write(state, b"state").unwrap();
            std::fs::write(mem, b"memory").unwrap();
            Ok(())
        }
        async fn load_snapshot(
            &self,
            _: &Path,
            _: MemBackend,
            _: bool,
            _: Vec<NetworkOverride>,
        ) -> Result<(), HypervisorError> {
            if self.fail_load {
                return Err(HypervisorError::Api {
                    endpoint: "/snapshot/load".into(),
                    status: 400,
                    fault_message: "bad snapshot".into(),
                });
            }
            Ok(())
        }
        async fn configure_drive(&self, _: &Drive) -> Result<(), HypervisorError> {
            Ok(())
        }
        async fn update_drive(&self, update: &DriveUpdate) -> Result<(), HypervisorError> {
            self.drives.lock().unwrap().push(update.path_on_host.clone());
            Ok(())
        }
        async fn boot(&self, _: &ColdBoot) -> Result<(), HypervisorError> {
            Ok(())
        }
        async fn put_metadata(&self, _: &serde_json::Value) -> Result<(), HypervisorError> {
            Ok(())
        }
        async fn ping(&self) -> Result<(), HypervisorError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        fail_load: AtomicBool,
        launches: AtomicUsize,
        delay_ms: AtomicU64,
        drives: DriveLog,
    }

    #[async_trait]
    impl HypervisorLauncher for FakeLauncher {
        async fn launch(&self, _: &LaunchSpec) -> Result<LaunchedVm, HypervisorError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(LaunchedVm {
                control: Arc::new(FakeControl {
                    fail_load: self.fail_load.load(Ordering::SeqCst),
                    drives: Arc::clone(&self.drives),
                }),
                process: None,
            })
        }
    }

    struct Harness {
        pool: VmPool,
        launcher: Arc<FakeLauncher>,
        registry: VmRegistry,
        _dir: tempfile::TempDir,
    }

    fn harness(slots: u32, target_size: usize, max_reuse: u32) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs.ext4");
        std::fs::write(&rootfs, b"rootfs").unwrap();

        let registry = VmRegistry::sqlite(Database::open_in_memory().unwrap());
        let allocator =
            Arc::new(AddressAllocator::new(Ipv4Addr::new(10, 200, 0, 0), slots, registry.clone()).unwrap());
        let launcher = Arc::new(FakeLauncher::default());
        let manager = VmManager::new(
            launcher.clone(),
            HostNetwork::disabled(),
            VmSettings {
                kernel: dir.path().join("vmlinux"),
                rootfs,
                boot_args: "console=ttyS0".into(),
                vcpu: 1,
                memory_mb: 128,
            },
            dir.path().join("pool"),
            dir.path().join("vms"),
        );
        let pool = VmPool::new(
            manager,
            registry.clone(),
            allocator,
            PoolSettings {
                target_size,
                max_reuse,
                refill_interval: Duration::from_millis(10),
                warmup: Duration::ZERO,
                persist_on_shutdown: false,
            },
        );
        Harness {
            pool,
            launcher,
            registry,
            _dir: dir,
        }
    }

    fn assignment(run_id: &str) -> VmAssignment {
        VmAssignment {
            run_id: run_id.into(),
            sandbox_token: format!("tok-{}", run_id),
            policy: VmPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_empty_pool_cold_boots_and_registers() {
        let h = harness(4, 0, 4);
        let vm = h.pool.acquire(&assignment("r1")).await.unwrap();

        assert_eq!(vm.boot_path, BootPath::Cold);
        assert!(vm.overlay_disk.exists());
        let reg = h.registry.lookup(vm.address()).unwrap().unwrap();
        assert_eq!(reg.run_id, "r1");
        assert_eq!(h.pool.stats().await.in_use, 1);
    }

    #[tokio::test]
    async fn test_release_without_repool_destroys() {
        let h = harness(4, 1, 4);
        let vm = h.pool.acquire(&assignment("r1")).await.unwrap();
        let address = vm.address();
        let dir = vm.entry_dir.clone();

        h.pool.release(vm, false).await;
        assert!(h.registry.lookup(address).unwrap().is_none());
        assert!(!dir.exists());
        assert_eq!(h.pool.stats().await.in_use, 0);
        assert_eq!(h.pool.stats().await.free, 0);
    }

    #[tokio::test]
    async fn test_repool_then_restore() {
        let h = harness(4, 1, 4);
        let vm = h.pool.acquire(&assignment("r1")).await.unwrap();
        h.pool.release(vm, true).await;
        assert_eq!(h.pool.stats().await.free, 1);

        let vm = h.pool.acquire(&assignment("r2")).await.unwrap();
        assert_eq!(vm.boot_path, BootPath::Restored);
        assert_eq!(vm.reuse_count, 1);
        assert_eq!(h.pool.stats().await.free, 0);
        assert_eq!(*h.launcher.drives.lock().unwrap(), vec![vm.overlay_disk.clone()]);
    }

    #[tokio::test]
    async fn test_repool_of_restored_vm_snapshots_into_new_entry() {
        let h = harness(4, 1, 4);
        h.pool.refill_once().await.unwrap();
        let vm = h.pool.acquire(&assignment("r1")).await.unwrap();
        assert_eq!(vm.boot_path, BootPath::Restored);
        let (restored_from, old_dir) = (vm.entry_id.clone(), vm.entry_dir.clone());

        h.pool.release(vm, true).await;

        let entries = h.pool.entries().await;
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_ne!(entry.id, restored_from);
        assert_eq!(entry.state, EntryState::Free);
        assert_eq!(entry.reuse_count, 1);
        assert!(!old_dir.exists());
        assert!(entry.snapshot_path.exists());
        assert!(entry.memory_path.exists());
        assert!(entry.overlay_path.exists());
    }

    #[tokio::test]
    async fn test_reuse_limit_destroys() {
        let h = harness(4, 1, 0);
        let vm = h.pool.acquire(&assignment("r1")).await.unwrap();
        h.pool.release(vm, true).await;
        assert_eq!(h.pool.stats().await.free, 0);
    }

    #[tokio::test]
    async fn test_restore_failure_discards_entry_and_cold_boots() {
        let h = harness(4, 1, 4);
        h.pool.refill_once().await.unwrap();
        let entry = h.pool.entries().await.pop().unwrap();

        h.launcher.fail_load.store(true, Ordering::SeqCst);
        let vm = h.pool.acquire(&assignment("r1")).await.unwrap();

        assert_eq!(vm.boot_path, BootPath::Cold);
        let entries = h.pool.entries().await;
        assert!(entries.iter().all(|e| e.id != entry.id));
        assert!(!entry.snapshot_path.exists());
    }

    #[tokio::test]
    async fn test_exhaustion_is_capacity_and_leaves_no_registration() {
        let h = harness(1, 0, 4);
        let _vm = h.pool.acquire(&assignment("r1")).await.unwrap();
        let err = h.pool.acquire(&assignment("r2")).await.unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(h.registry.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_single_free_entry_goes_to_one_caller() {
        let h = harness(4, 1, 4);
        h.pool.refill_once().await.unwrap();

        let (first, second) = (assignment("r1"), assignment("r2"));
        let (a, b) = tokio::join!(h.pool.acquire(&first), h.pool.acquire(&second));
        let paths = [a.unwrap().boot_path, b.unwrap().boot_path];
        assert_eq!(paths.iter().filter(|p| **p == BootPath::Restored).count(), 1);
        assert_eq!(paths.iter().filter(|p| **p == BootPath::Cold).count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_releases_slot_and_registration() {
        let Harness {
            pool,
            launcher,
            registry,
            _dir,
        } = harness(1, 0, 4);
        let pool = Arc::new(pool);
        launcher.delay_ms.store(200, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let acquiring = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    acquired = pool.acquire_owned(assignment("r1")) => Some(acquired),
                }
            }
        };
        let (acquired, _) = tokio::join!(acquiring, async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(registry.list().unwrap().len(), 1);
            cancel.cancel();
        });
        assert!(acquired.is_none());

        // the abandoned launch finishes in the background and is released
        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.list().unwrap().is_empty() || pool.stats().await.in_use > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        launcher.delay_ms.store(0, Ordering::SeqCst);
        let vm = pool.acquire(&assignment("r2")).await.unwrap();
        assert_eq!(vm.boot_path, BootPath::Cold);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refill_reaches_target_and_frees_addresses() {
        let h = harness(4, 2, 4);
        assert_eq!(h.pool.refill_once().await.unwrap(), 2);
        assert_eq!(h.pool.refill_once().await.unwrap(), 0);
        assert_eq!(h.pool.stats().await.free, 2);
        assert!(h.registry.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persisted_entries_are_adopted() {
        let h = harness(4, 2, 4);
        h.pool.refill_once().await.unwrap();
        let ids: Vec<String> = h.pool.entries().await.into_iter().map(|e| e.id).collect();

        // same directories, fresh ledger
        let before = h.pool.entries.lock().await.drain(..).count();
        assert_eq!(before, 2);
        assert_eq!(h.pool.adopt_persisted().await.unwrap(), 2);
        let mut adopted: Vec<String> = h.pool.entries().await.into_iter().map(|e| e.id).collect();
        adopted.sort();
        let mut expected = ids;
        expected.sort();
        assert_eq!(adopted, expected);
    }
}
