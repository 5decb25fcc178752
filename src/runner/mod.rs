//! The runner daemon
//!
//! Wires the queue, VM pool, registry, proxy, telemetry and API together
//! and runs the independent loops:
//!
//! ```text
//!   claim loop ──lease──► supervisor (one task per job, bounded by max_concurrent)
//!   lease sweeper         pool refill          egress proxy          runner API
//! ```
//!
//! Everything shares one cancellation token; ctrl-c cancels it, supervisors
//! run their cleanup, then the pool drops its Free set.

pub mod job;
pub mod supervisor;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::{self, ApiState};
use crate::config::{ConfigError, RunnerConfig};
use crate::db::Database;
use crate::lock::{InstanceLock, LockError};
use crate::network::{AddressAllocator, HostNetwork, RegistryError, VmRegistry};
use crate::proxy::log::NetworkLogSink;
use crate::proxy::{NetworkProxy, ProxyError};
use crate::queue::{self, jittered_backoff, JobQueue, QueueError};
use crate::telemetry::watcher::WatchSettings;
use crate::telemetry::{EventStore, RealtimeHub, RunState, TelemetryError};
use crate::vm::{FirecrackerLauncher, PoolError, PoolSettings, RunningVm, VmManager, VmPool, VmSettings};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("failed to bind runner api on {addr}: {source}")]
    ApiBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create {path}: {source}")]
    WorkDir {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Smallest pause between claim retries on lock contention
const CLAIM_BACKOFF_BASE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub group: String,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub repool_on_success: bool,
    /// Runner API port the VM reaches on its slot's host address
    pub api_port: u16,
    pub watch: WatchSettings,
}

impl RunnerSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            group: config.group.clone(),
            max_concurrent: config.sandbox.max_concurrent,
            poll_interval: config.sandbox.poll_interval(),
            job_timeout: config.sandbox.job_timeout(),
            repool_on_success: config.pool.repool_on_success,
            api_port: config.api.listen.port(),
            watch: WatchSettings::from_config(&config.telemetry),
        }
    }
}

/// Shared state of the claim loop and every supervisor
pub struct Runner {
    pub queue: Arc<JobQueue>,
    pub pool: Arc<VmPool>,
    pub store: EventStore,
    pub hub: RealtimeHub,
    pub settings: RunnerSettings,
}

impl Runner {
    pub fn new(
        queue: Arc<JobQueue>,
        pool: Arc<VmPool>,
        store: EventStore,
        hub: RealtimeHub,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            queue,
            pool,
            store,
            hub,
            settings,
        }
    }

    /// Where the VM posts telemetry and completion
    pub fn api_url_for(&self, vm: &RunningVm) -> String {
        format!("http://{}:{}", vm.slot.host_address, self.settings.api_port)
    }

    pub(crate) async fn mark_running(&self, run_id: &str) {
        let store = self.store.clone();
        let id = run_id.to_string();
        match tokio::task::spawn_blocking(move || store.set_status(&id, RunState::Running, None)).await {
            Ok(Ok(Some(status))) => {
                self.hub.publish_status(run_id, status);
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(run_id, error = %e, "failed to record running status"),
            Err(e) => warn!(run_id, error = %e, "status task failed"),
        }
    }

    /// Store and publish a terminal status; returns the state that stuck
    ///
    /// If the run already reached a terminal state (the VM reported first),
    /// that state wins.
    pub(crate) async fn finish_status(&self, run_id: &str, state: RunState, detail: Option<&str>) -> RunState {
        let store = self.store.clone();
        let id = run_id.to_string();
        let detail_owned = detail.map(str::to_string);
        let result = tokio::task::spawn_blocking(move || {
            let updated = store.set_status(&id, state, detail_owned.as_deref())?;
            let current = match &updated {
                Some(_) => None,
                None => store.status(&id)?,
            };
            Ok::<_, TelemetryError>((updated, current))
        })
        .await;

        match result {
            Ok(Ok((Some(status), _))) => {
                self.hub.publish_status(run_id, status);
                state
            }
            Ok(Ok((None, current))) => current.map(|s| s.state).unwrap_or(state),
            Ok(Err(e)) => {
                warn!(run_id, error = %e, "failed to record terminal status");
                state
            }
            Err(e) => {
                warn!(run_id, error = %e, "status task failed");
                state
            }
        }
    }

    /// End a job that never reached a VM
    pub(crate) async fn finish(&self, run_id: &str, state: RunState, detail: Option<&str>) {
        let state = self.finish_status(run_id, state, detail).await;
        self.complete_lease(run_id).await;
        crate::metrics::JOBS_FINISHED
            .with_label_values(&[state.as_str()])
            .inc();
    }

    pub(crate) async fn complete_lease(&self, run_id: &str) {
        let queue = Arc::clone(&self.queue);
        let id = run_id.to_string();
        match tokio::task::spawn_blocking(move || queue.complete(&id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(run_id, error = %e, "failed to complete lease; the sweeper will purge it"),
            Err(e) => warn!(run_id, error = %e, "lease task failed"),
        }
    }

    pub(crate) async fn requeue(&self, run_id: &str) {
        let queue = Arc::clone(&self.queue);
        let id = run_id.to_string();
        match tokio::task::spawn_blocking(move || queue.requeue(&id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(run_id, error = %e, "failed to requeue lease"),
            Err(e) => warn!(run_id, error = %e, "lease task failed"),
        }
    }
}

/// Claim leases and spawn a supervisor for each, at most `max_concurrent` at once
///
/// Supervisors are spawned on `tracker` so shutdown can wait for their
/// cleanup.
pub async fn claim_loop(runner: Arc<Runner>, tracker: TaskTracker, cancel: CancellationToken) {
    let slots = Arc::new(Semaphore::new(runner.settings.max_concurrent));
    let mut contention = 0u32;

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let queue = Arc::clone(&runner.queue);
        let group = runner.settings.group.clone();
        let claimed = tokio::task::spawn_blocking(move || queue.claim(&group)).await;

        let delay = match claimed {
            Ok(Ok(Some(lease))) => {
                contention = 0;
                info!(run_id = %lease.run_id, "job claimed");
                let runner = Arc::clone(&runner);
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    supervisor::supervise(runner, lease, cancel).await;
                    drop(permit);
                });
                continue;
            }
            Ok(Ok(None)) => {
                contention = 0;
                runner.settings.poll_interval
            }
            Ok(Err(e)) if e.is_contention() => {
                contention = contention.saturating_add(1);
                let delay = jittered_backoff(contention, CLAIM_BACKOFF_BASE, runner.settings.poll_interval);
                debug!(attempt = contention, delay_ms = delay.as_millis() as u64, "lease claim contended");
                delay
            }
            Ok(Err(e)) => {
                warn!(error = %e, "lease claim failed");
                runner.settings.poll_interval
            }
            Err(e) => {
                warn!(error = %e, "lease claim task failed");
                runner.settings.poll_interval
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("claim loop stopped");
}

/// Run the daemon until ctrl-c
pub async fn run(config: RunnerConfig) -> Result<(), RunnerError> {
    for dir in [config.work_dir.clone(), config.pool_dir(), config.vm_dir()] {
        std::fs::create_dir_all(&dir).map_err(|source| RunnerError::WorkDir {
            path: dir.display().to_string(),
            source,
        })?;
    }
    let _lock = InstanceLock::acquire(config.lock_path())?;

    let db = Database::open(config.database_path())?;
    let queue = Arc::new(JobQueue::new(db.clone()));
    let registry = VmRegistry::sqlite(db.clone());
    let store = EventStore::new(db);
    let hub = RealtimeHub::new(Duration::from_secs(config.telemetry.rewind_secs));

    // we hold the instance lock, so every registration left is from a dead process
    for stale in registry.list()? {
        warn!(address = %stale.address, run_id = %stale.run_id, "dropping stale registration");
        registry.unregister(stale.address)?;
    }

    let allocator = Arc::new(AddressAllocator::new(
        config.network.base,
        config.network.slots,
        registry.clone(),
    )?);
    let host = HostNetwork::new(
        config.network.guest_address,
        config.network.dns_resolver,
        config.proxy.port,
        config.network.manage_host,
    )
    .with_api_port(config.api.listen.port());
    let launcher = Arc::new(FirecrackerLauncher::new(
        config.firecracker.binary.clone(),
        config.firecracker.request_timeout(),
        config.firecracker.ready_timeout(),
    ));
    let manager = VmManager::new(
        launcher,
        host,
        VmSettings::from_config(&config),
        config.pool_dir(),
        config.vm_dir(),
    );
    let pool = Arc::new(VmPool::new(
        manager,
        registry.clone(),
        allocator,
        PoolSettings::from_config(&config),
    ));
    pool.adopt_persisted().await?;

    let cancel = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let sink: Arc<dyn NetworkLogSink> = Arc::new(store.clone());
    let proxy = Arc::new(NetworkProxy::new(registry.clone(), Some(sink), &config.proxy));
    let proxy_listener = NetworkProxy::bind(config.proxy.listen_addr()).await?;
    background.push(tokio::spawn(Arc::clone(&proxy).serve(proxy_listener, cancel.clone())));

    let api_state = ApiState {
        queue: JobQueue::clone(&queue),
        store: store.clone(),
        hub: hub.clone(),
        registry: registry.clone(),
        pool: Some(Arc::clone(&pool)),
        server_token: Arc::from(config.server.token.as_str()),
        runner_group: config.group.clone(),
        lease_ttl: config.lease_ttl(),
        page_size: config.telemetry.page_size,
    };
    let api_addr = config.api.listen;
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .map_err(|source| RunnerError::ApiBind { addr: api_addr, source })?;
    let api_cancel = cancel.clone();
    background.push(tokio::spawn(async move {
        if let Err(e) = api::serve(api_listener, api_state, api_cancel).await {
            warn!(error = %e, "runner api stopped with error");
        }
    }));

    background.push(queue::start_sweeper(
        Arc::clone(&queue),
        Duration::from_secs(config.lease.sweep_interval_secs),
        cancel.clone(),
    ));
    background.push(VmPool::start_refill(Arc::clone(&pool), cancel.clone()));

    let runner = Arc::new(Runner::new(
        Arc::clone(&queue),
        Arc::clone(&pool),
        store,
        hub,
        RunnerSettings::from_config(&config),
    ));
    let supervisors = TaskTracker::new();
    let claims = tokio::spawn(claim_loop(runner, supervisors.clone(), cancel.clone()));

    info!(
        name = %config.name,
        group = %config.group,
        max_concurrent = config.sandbox.max_concurrent,
        pool_target = config.pool.target_size,
        proxy = %config.proxy.listen_addr(),
        api = %api_addr,
        "runner started"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
    }
    cancel.cancel();

    let _ = claims.await;
    supervisors.close();
    supervisors.wait().await;
    for handle in background {
        let _ = handle.await;
    }
    pool.shutdown().await;
    info!("runner stopped");
    Ok(())
}
