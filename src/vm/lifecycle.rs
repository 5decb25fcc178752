//! Hypervisor process lifecycle
//!
//! Spawning a Firecracker process (optionally inside the slot's network
//! namespace) and waiting for its API to answer.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use super::firecracker::{FirecrackerClient, HypervisorControl, HypervisorError};

/// What to launch
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub vm_id: String,
    pub api_socket: PathBuf,
    /// Network namespace to run the process in
    pub namespace: Option<String>,
}

/// A freshly started hypervisor, API ready
pub struct LaunchedVm {
    pub control: Arc<dyn HypervisorControl>,
    /// `None` when the hypervisor is not a local child (test fakes)
    pub process: Option<Child>,
}

/// Starts hypervisor processes
#[async_trait]
pub trait HypervisorLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedVm, HypervisorError>;
}

/// Launches the Firecracker binary
pub struct FirecrackerLauncher {
    binary: PathBuf,
    request_timeout: Duration,
    ready_timeout: Duration,
}

impl FirecrackerLauncher {
    pub fn new(binary: impl Into<PathBuf>, request_timeout: Duration, ready_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            request_timeout,
            ready_timeout,
        }
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = match &spec.namespace {
            Some(ns) => {
                let mut c = Command::new("ip");
                c.arg("netns").arg("exec").arg(ns).arg(&self.binary);
                c
            }
            None => Command::new(&self.binary),
        };
        cmd.arg("--api-sock")
            .arg(&spec.api_socket)
            .arg("--id")
            .arg(&spec.vm_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl HypervisorLauncher for FirecrackerLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedVm, HypervisorError> {
        // Stale socket from a crashed run makes the new process fail to bind
        let _ = tokio::fs::remove_file(&spec.api_socket).await;

        let mut child = self
            .command(spec)
            .spawn()
            .map_err(|e| HypervisorError::Spawn(e).record())?;
        debug!(vm_id = %spec.vm_id, pid = ?child.id(), "hypervisor spawned");

        let client = FirecrackerClient::new(&spec.api_socket, self.request_timeout);
        if let Err(e) = wait_for_ready(&spec.api_socket, &client, &mut child, self.ready_timeout).await {
            let _ = child.kill().await;
            return Err(e);
        }

        Ok(LaunchedVm {
            control: Arc::new(client),
            process: Some(child),
        })
    }
}

/// Wait until the API socket exists and answers a trial request
///
/// A process that exits while we wait is fatal for this attempt, as is
/// running past `timeout`.
pub async fn wait_for_ready(
    socket_path: &Path,
    control: &dyn HypervisorControl,
    child: &mut Child,
    timeout: Duration,
) -> Result<(), HypervisorError> {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(20);

    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(HypervisorError::Exited(status.code()).record());
        }

        if socket_path.exists() && control.ping().await.is_ok() {
            debug!(elapsed_ms = start.elapsed().as_millis() as u64, "hypervisor API ready");
            return Ok(());
        }

        if start.elapsed() > timeout {
            return Err(HypervisorError::NotReady(timeout).record());
        }

        tokio::time::sleep(poll_interval).await;
    }
}
