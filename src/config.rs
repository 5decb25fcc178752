//! Runner configuration file
//!
//! ```yaml
//! name: host-07
//! group: acme/default
//! server:
//!   url: https://control.example.com
//!   token: rnr_xxx
//! sandbox:
//!   max_concurrent: 4
//!   vcpu: 2
//!   memory_mb: 2048
//!   poll_interval_ms: 1000
//! firecracker:
//!   binary: /usr/local/bin/firecracker
//!   kernel: /var/lib/runvisor/vmlinux
//!   rootfs: /var/lib/runvisor/rootfs.ext4
//! proxy:
//!   port: 8080
//! ```
//!
//! Everything other than `name`, `group`, `server` and the firecracker paths
//! has a default.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    /// `scope/name`
    pub group: String,
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    pub firecracker: FirecrackerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_concurrent: usize,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub poll_interval_ms: u64,
    /// Hard deadline per job; must stay below `lease.ttl_secs`
    pub job_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            vcpu: 2,
            memory_mb: 2048,
            poll_interval_ms: 1000,
            job_timeout_secs: 3000,
        }
    }
}

impl SandboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    pub binary: PathBuf,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    #[serde(default = "default_boot_args")]
    pub boot_args: String,
    /// Per-request bound on control socket calls
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Bound on socket appearance plus trial request after spawn
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

impl FirecrackerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port: u16,
    pub bind: Ipv4Addr,
    /// Upper bound on connecting to the real destination
    pub connect_timeout_ms: u64,
    /// Bytes of request/response body kept in MITM logs
    pub max_logged_body: usize,
    /// Largest request or response body MITM mode will buffer
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: Ipv4Addr::UNSPECIFIED,
            connect_timeout_ms: 10_000,
            max_logged_body: 4096,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((self.bind, self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Free entries the refill loop maintains
    pub target_size: usize,
    /// Restores per entry before it is discarded
    pub max_reuse: u32,
    /// Repool VMs after a successful job instead of destroying them
    pub repool_on_success: bool,
    /// Seconds a cold-booted template VM runs before it is snapshotted
    pub warmup_secs: u64,
    pub refill_interval_ms: u64,
    /// Keep Free snapshots on disk across restarts
    pub persist_on_shutdown: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 2,
            max_reuse: 8,
            repool_on_success: false,
            warmup_secs: 5,
            refill_interval_ms: 1000,
            persist_on_shutdown: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// First address of the private slot range; each slot takes a /30
    pub base: Ipv4Addr,
    pub slots: u32,
    /// Address the guest uses inside its namespace
    pub guest_address: Ipv4Addr,
    /// Skip `ip`/`iptables` plumbing (hosts where networking is set up externally)
    pub manage_host: bool,
    /// Guests resolve through this server; no other UDP leaves a slot
    pub dns_resolver: Ipv4Addr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base: Ipv4Addr::new(10, 200, 0, 0),
            slots: 64,
            guest_address: Ipv4Addr::new(172, 16, 0, 2),
            manage_host: true,
            dns_resolver: crate::network::host::DEFAULT_DNS_RESOLVER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub json_logs: bool,
    /// Default rewind window for realtime subscribers
    pub rewind_secs: u64,
    pub page_size: usize,
    pub poll_interval_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            json_logs: false,
            rewind_secs: 120,
            page_size: 100,
            poll_interval_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/runvisor")
}

fn default_boot_args() -> String {
    "console=ttyS0 reboot=k panic=1 pci=off quiet loglevel=0 root=/dev/vda rw".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

impl RunnerConfig {
    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RunnerConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: RunnerConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        match self.group.split_once('/') {
            Some((scope, name))
                if !scope.is_empty() && !name.is_empty() && !name.contains('/') => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "group '{}' must be in scope/name form",
                    self.group
                )))
            }
        }
        reqwest::Url::parse(&self.server.url)
            .map_err(|e| ConfigError::Invalid(format!("server.url: {}", e)))?;
        if self.server.token.trim().is_empty() {
            return Err(ConfigError::Invalid("server.token must not be empty".into()));
        }
        if self.sandbox.max_concurrent == 0 {
            return Err(ConfigError::Invalid("sandbox.max_concurrent must be > 0".into()));
        }
        if self.sandbox.vcpu == 0 || self.sandbox.memory_mb == 0 {
            return Err(ConfigError::Invalid("sandbox vcpu and memory_mb must be > 0".into()));
        }
        if self.sandbox.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("sandbox.poll_interval_ms must be > 0".into()));
        }
        if self.proxy.port == 0 {
            return Err(ConfigError::Invalid("proxy.port must be > 0".into()));
        }
        if self.network.slots == 0 {
            return Err(ConfigError::Invalid("network.slots must be > 0".into()));
        }
        if self.pool.target_size > self.network.slots as usize {
            return Err(ConfigError::Invalid(
                "pool.target_size cannot exceed network.slots".into(),
            ));
        }
        if self.sandbox.job_timeout_secs >= self.lease.ttl_secs {
            return Err(ConfigError::Invalid(
                "sandbox.job_timeout_secs must be below lease.ttl_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease.ttl_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        self.work_dir.join("state.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.work_dir.join("runner.lock")
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.work_dir.join("pool")
    }

    pub fn vm_dir(&self) -> PathBuf {
        self.work_dir.join("vms")
    }
}
