//! Firecracker API client
//!
//! Talks to one hypervisor process over its Unix-socket HTTP API. Every call
//! is bounded by the configured request timeout, and every non-2xx reply is
//! turned into [`HypervisorError::Api`] carrying the hypervisor's
//! `fault_message`. Nothing here retries; the pool decides what a failure
//! means for the attempt.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Method;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use super::config::*;
use crate::metrics::HYPERVISOR_ERRORS;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("{endpoint} returned {status}: {fault_message}")]
    Api {
        endpoint: String,
        status: u16,
        fault_message: String,
    },

    #[error("transport error on {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to spawn hypervisor: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("hypervisor API not ready after {0:?}")]
    NotReady(Duration),

    #[error("hypervisor exited during startup (status {0:?})")]
    Exited(Option<i32>),
}

impl HypervisorError {
    /// Endpoint label for metrics
    fn endpoint(&self) -> &str {
        match self {
            HypervisorError::Api { endpoint, .. }
            | HypervisorError::Transport { endpoint, .. }
            | HypervisorError::Timeout { endpoint, .. } => endpoint,
            HypervisorError::Encode(_) => "encode",
            HypervisorError::Spawn(_) | HypervisorError::NotReady(_) | HypervisorError::Exited(_) => {
                "launch"
            }
        }
    }

    pub(crate) fn record(self) -> Self {
        HYPERVISOR_ERRORS.with_label_values(&[self.endpoint()]).inc();
        self
    }
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Control surface of one running hypervisor process
///
/// The snapshot primitives, drive binding, the cold-boot sequence, a metadata
/// push and a liveness ping. Implemented by [`FirecrackerClient`]; tests
/// substitute an in-memory fake.
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn create_snapshot(&self, state_path: &Path, mem_path: &Path, kind: SnapshotType) -> Result<()>;

    async fn load_snapshot(
        &self,
        state_path: &Path,
        mem_backend: MemBackend,
        resume: bool,
        network_overrides: Vec<NetworkOverride>,
    ) -> Result<()>;

    async fn configure_drive(&self, drive: &Drive) -> Result<()>;

    /// Swap the backing file of a configured drive, e.g. after a restore
    async fn update_drive(&self, update: &DriveUpdate) -> Result<()>;

    /// Configure boot source, machine, drives and network, then start
    async fn boot(&self, plan: &ColdBoot) -> Result<()>;

    /// Replace the guest-visible metadata document
    async fn put_metadata(&self, metadata: &serde_json::Value) -> Result<()>;

    /// Cheap request proving the API answers
    async fn ping(&self) -> Result<()>;
}

/// Client for one Firecracker API socket
pub struct FirecrackerClient {
    client: HyperClient,
    socket_path: PathBuf,
    timeout: Duration,
}

impl FirecrackerClient {
    /// Create a client
    ///
    /// # Arguments
    /// * `socket_path` - Path to the Firecracker API Unix socket
    /// * `timeout` - Upper bound for every request
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn send<T: Serialize + ?Sized>(&self, method: Method, endpoint: &str, body: Option<&T>) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.send_inner(method, endpoint, body)).await {
            Ok(result) => result.map_err(HypervisorError::record),
            Err(_) => Err(HypervisorError::Timeout {
                endpoint: endpoint.to_string(),
                timeout: self.timeout,
            }
            .record()),
        }
    }

    async fn send_inner<T: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&T>,
    ) -> Result<()> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let payload = match body {
            Some(b) => Bytes::from(serde_json::to_vec(b)?),
            None => Bytes::new(),
        };

        let transport = |e: &dyn std::fmt::Display| HypervisorError::Transport {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        };

        let req = hyper::Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Full::new(payload))
            .map_err(|e| transport(&e))?;

        let res = self.client.request(req).await.map_err(|e| transport(&e))?;
        let status = res.status();
        trace!(%method, endpoint, status = status.as_u16(), "hypervisor call");

        if status.is_success() {
            return Ok(());
        }

        let bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| transport(&e))?
            .to_bytes();
        let fault_message = serde_json::from_slice::<FaultBody>(&bytes)
            .map(|f| f.fault_message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());

        Err(HypervisorError::Api {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            fault_message,
        })
    }

    async fn put<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<()> {
        self.send(Method::PUT, endpoint, Some(body)).await
    }

    async fn patch<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<()> {
        self.send(Method::PATCH, endpoint, Some(body)).await
    }
}

#[async_trait]
impl HypervisorControl for FirecrackerClient {
    async fn pause(&self) -> Result<()> {
        self.patch("/vm", &VmState { state: VmStateKind::Paused }).await
    }

    async fn resume(&self) -> Result<()> {
        self.patch("/vm", &VmState { state: VmStateKind::Resumed }).await
    }

    async fn create_snapshot(&self, state_path: &Path, mem_path: &Path, kind: SnapshotType) -> Result<()> {
        self.put(
            "/snapshot/create",
            &SnapshotCreate {
                snapshot_type: kind,
                snapshot_path: state_path.to_path_buf(),
                mem_file_path: mem_path.to_path_buf(),
            },
        )
        .await
    }

    async fn load_snapshot(
        &self,
        state_path: &Path,
        mem_backend: MemBackend,
        resume: bool,
        network_overrides: Vec<NetworkOverride>,
    ) -> Result<()> {
        self.put(
            "/snapshot/load",
            &SnapshotLoad {
                snapshot_path: state_path.to_path_buf(),
                mem_backend,
                resume_vm: resume,
                network_overrides,
            },
        )
        .await
    }

    async fn configure_drive(&self, drive: &Drive) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    async fn update_drive(&self, update: &DriveUpdate) -> Result<()> {
        self.patch(&format!("/drives/{}", update.drive_id), update).await
    }

    async fn boot(&self, plan: &ColdBoot) -> Result<()> {
        self.put("/boot-source", &plan.boot_source).await?;
        self.put("/machine-config", &plan.machine).await?;
        for drive in &plan.drives {
            self.configure_drive(drive).await?;
        }
        self.put(
            &format!("/network-interfaces/{}", plan.interface.iface_id),
            &plan.interface,
        )
        .await?;
        self.put(
            "/mmds/config",
            &MmdsConfig {
                version: "V2",
                network_interfaces: vec![plan.interface.iface_id.clone()],
            },
        )
        .await?;
        self.put("/actions", &Action { action_type: "InstanceStart" }).await
    }

    async fn put_metadata(&self, metadata: &serde_json::Value) -> Result<()> {
        self.put("/mmds", metadata).await
    }

    async fn ping(&self) -> Result<()> {
        self.send::<()>(Method::GET, "/", None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_socket_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = FirecrackerClient::new(dir.path().join("absent.sock"), Duration::from_secs(1));
        match client.ping().await {
            Err(HypervisorError::Transport { endpoint, .. }) => assert_eq!(endpoint, "/"),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_api_error_display_carries_fault() {
        let err = HypervisorError::Api {
            endpoint: "/snapshot/load".into(),
            status: 400,
            fault_message: "Invalid memory file".into(),
        };
        assert_eq!(err.to_string(), "/snapshot/load returned 400: Invalid memory file");
    }
}
