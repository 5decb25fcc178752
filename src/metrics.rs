//! Prometheus metrics for the runner
//!
//! All metrics live in the default prometheus registry and are exposed as
//! text at `GET /metrics` on the runner API.
//!
//! ```text
//! queue      runvisor_lease_claims_total{outcome}, runvisor_leases_swept_total
//! pool       runvisor_pool_free_entries, runvisor_pool_in_use_vms,
//!            runvisor_vm_acquire_duration_seconds{path}, runvisor_vm_boot_duration_seconds
//! hypervisor runvisor_hypervisor_errors_total{endpoint}
//! network    runvisor_addresses_in_use
//! proxy      runvisor_proxy_decisions_total{action,mode}, runvisor_proxy_connections_active
//! telemetry  runvisor_telemetry_events_total, runvisor_telemetry_gaps_total
//! jobs       runvisor_jobs_finished_total{status}
//! ```

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};

lazy_static! {
    /// Claim attempts by outcome: claimed, empty, contention
    pub static ref LEASE_CLAIMS: CounterVec = register_counter_vec!(
        "runvisor_lease_claims_total",
        "Lease claim attempts by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref LEASES_SWEPT: Counter = register_counter!(
        "runvisor_leases_swept_total",
        "Leases deleted by the TTL sweep"
    )
    .unwrap();

    pub static ref POOL_FREE_ENTRIES: Gauge = register_gauge!(
        "runvisor_pool_free_entries",
        "Snapshot-backed pool entries ready for restore"
    )
    .unwrap();

    pub static ref POOL_IN_USE_VMS: Gauge = register_gauge!(
        "runvisor_pool_in_use_vms",
        "VMs currently handed out to jobs"
    )
    .unwrap();

    /// Acquire latency split by path: restore or cold
    pub static ref VM_ACQUIRE_DURATION: HistogramVec = register_histogram_vec!(
        "runvisor_vm_acquire_duration_seconds",
        "Time to hand a running VM to a job",
        &["path"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    pub static ref VM_BOOT_DURATION: Histogram = register_histogram!(
        "runvisor_vm_boot_duration_seconds",
        "Cold boot duration from process spawn to InstanceStart",
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    pub static ref HYPERVISOR_ERRORS: CounterVec = register_counter_vec!(
        "runvisor_hypervisor_errors_total",
        "Hypervisor API failures by endpoint",
        &["endpoint"]
    )
    .unwrap();

    pub static ref ADDRESSES_IN_USE: Gauge = register_gauge!(
        "runvisor_addresses_in_use",
        "Network slots held by live or pending VMs"
    )
    .unwrap();

    pub static ref PROXY_DECISIONS: CounterVec = register_counter_vec!(
        "runvisor_proxy_decisions_total",
        "Firewall decisions taken by the proxy",
        &["action", "mode"]
    )
    .unwrap();

    pub static ref PROXY_CONNECTIONS_ACTIVE: Gauge = register_gauge!(
        "runvisor_proxy_connections_active",
        "Proxied connections currently open"
    )
    .unwrap();

    pub static ref TELEMETRY_EVENTS: Counter = register_counter!(
        "runvisor_telemetry_events_total",
        "Agent events accepted through ingress"
    )
    .unwrap();

    pub static ref TELEMETRY_GAPS: Counter = register_counter!(
        "runvisor_telemetry_gaps_total",
        "Sequence gaps observed by watchers"
    )
    .unwrap();

    pub static ref JOBS_FINISHED: CounterVec = register_counter_vec!(
        "runvisor_jobs_finished_total",
        "Jobs finished by terminal status",
        &["status"]
    )
    .unwrap();
}

/// Render every registered metric in the prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
