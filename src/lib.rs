//! Runvisor - self-hosted runner control plane for Firecracker microVMs
//!
//! A runner claims job leases from a shared queue, runs each job inside a
//! pooled microVM on its own private network slot, forces the VM's egress
//! through a per-VM firewall proxy, and relays the events the VM reports
//! to anyone watching the run.
//!
//! # Modules
//!
//! - `queue` - job lease queue with TTL expiry (SQLite)
//! - `vm` - Firecracker client, launcher, snapshot-backed VM pool
//! - `network` - address allocator, VM registry, host netns plumbing
//! - `proxy` - transparent egress proxy with firewall and HTTP capture
//! - `telemetry` - event store, realtime fan-out, polling watcher
//! - `api` - runner HTTP API (job submission, agent webhooks, run streams)
//! - `runner` - the daemon: claim loop and per-job supervisors
//! - `metrics` - Prometheus metrics
//!
//! # Quick Start
//!
//! ```ignore
//! use runvisor::{RunnerConfig, runner};
//!
//! let config = RunnerConfig::load("/etc/runvisor/runner.yaml")?;
//! runner::run(config).await?;
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod lock;
pub mod metrics;
pub mod network;
pub mod proxy;
pub mod queue;
pub mod runner;
pub mod telemetry;
pub mod tracing;
pub mod vm;

pub use config::RunnerConfig;
pub use network::{AddressAllocator, VmPolicy, VmRegistry};
pub use queue::{JobLease, JobQueue};
pub use vm::{RunningVm, VmPool};
