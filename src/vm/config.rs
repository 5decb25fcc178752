//! Firecracker API payloads
//!
//! These structs mirror the JSON bodies of the hypervisor's control API.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Interface id every guest sees; snapshots are rebound by this id
pub const GUEST_IFACE_ID: &str = "eth0";

/// Drive id of the root filesystem
pub const ROOT_DRIVE_ID: &str = "rootfs";

/// Kernel and command line
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub smt: bool,
}

/// Block device
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl Drive {
    /// Writable root drive backed by a per-VM overlay
    pub fn root(path_on_host: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: ROOT_DRIVE_ID.to_string(),
            path_on_host: path_on_host.into(),
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// `PATCH /drives/{id}`: points an existing drive at another backing file
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DriveUpdate {
    pub drive_id: String,
    pub path_on_host: PathBuf,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

/// Metadata service exposure on the guest interface
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MmdsConfig {
    pub version: &'static str,
    pub network_interfaces: Vec<String>,
}

/// `PUT /actions`
#[derive(Serialize, Debug, Clone)]
pub struct Action {
    pub action_type: &'static str,
}

/// `PATCH /vm`
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmState {
    pub state: VmStateKind,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStateKind {
    Paused,
    Resumed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    Full,
    Diff,
}

/// `PUT /snapshot/create`
#[derive(Serialize, Debug, Clone)]
pub struct SnapshotCreate {
    pub snapshot_type: SnapshotType,
    pub snapshot_path: PathBuf,
    pub mem_file_path: PathBuf,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemBackendType {
    File,
    Uffd,
}

/// Where guest memory comes from on snapshot load
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MemBackend {
    pub backend_type: MemBackendType,
    pub backend_path: PathBuf,
}

impl MemBackend {
    pub fn file(path: &Path) -> Self {
        Self {
            backend_type: MemBackendType::File,
            backend_path: path.to_path_buf(),
        }
    }
}

/// Rebinds a snapshotted interface to a different host device
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NetworkOverride {
    pub iface_id: String,
    pub host_dev_name: String,
}

/// `PUT /snapshot/load`
#[derive(Serialize, Debug, Clone)]
pub struct SnapshotLoad {
    pub snapshot_path: PathBuf,
    pub mem_backend: MemBackend,
    pub resume_vm: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_overrides: Vec<NetworkOverride>,
}

/// Error body returned by the hypervisor on non-2xx
#[derive(Deserialize, Debug, Clone)]
pub struct FaultBody {
    pub fault_message: String,
}

/// Everything a cold boot configures before `InstanceStart`
#[derive(Debug, Clone)]
pub struct ColdBoot {
    pub boot_source: BootSource,
    pub machine: MachineConfig,
    pub drives: Vec<Drive>,
    pub interface: NetworkInterface,
}

/// Kernel `ip=` argument for a static guest address
pub fn guest_ip_arg(guest: std::net::Ipv4Addr, gateway: std::net::Ipv4Addr, dns: std::net::Ipv4Addr) -> String {
    format!("ip={}::{}:255.255.255.252::{}:off:{}", guest, gateway, GUEST_IFACE_ID, dns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::Ipv4Addr;

    #[test]
    fn test_snapshot_load_body() {
        let body = SnapshotLoad {
            snapshot_path: "/pool/e1/vmstate".into(),
            mem_backend: MemBackend::file(Path::new("/pool/e1/memory")),
            resume_vm: true,
            network_overrides: vec![NetworkOverride {
                iface_id: "eth0".into(),
                host_dev_name: "rvtap3".into(),
            }],
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "snapshot_path": "/pool/e1/vmstate",
                "mem_backend": {"backend_type": "File", "backend_path": "/pool/e1/memory"},
                "resume_vm": true,
                "network_overrides": [{"iface_id": "eth0", "host_dev_name": "rvtap3"}]
            })
        );
    }

    #[test]
    fn test_empty_overrides_omitted() {
        let body = SnapshotLoad {
            snapshot_path: "/s".into(),
            mem_backend: MemBackend::file(Path::new("/m")),
            resume_vm: false,
            network_overrides: vec![],
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("network_overrides").is_none());
    }

    #[test]
    fn test_vm_state_and_snapshot_type() {
        assert_eq!(
            serde_json::to_value(VmState { state: VmStateKind::Paused }).unwrap(),
            json!({"state": "Paused"})
        );
        assert_eq!(serde_json::to_value(SnapshotType::Diff).unwrap(), json!("Diff"));
    }

    #[test]
    fn test_drive_update_body() {
        let body = DriveUpdate {
            drive_id: ROOT_DRIVE_ID.into(),
            path_on_host: "/pool/e2/overlay.ext4".into(),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"drive_id": "rootfs", "path_on_host": "/pool/e2/overlay.ext4"})
        );
    }

    #[test]
    fn test_guest_ip_arg() {
        assert_eq!(
            guest_ip_arg(
                Ipv4Addr::new(172, 16, 0, 2),
                Ipv4Addr::new(172, 16, 0, 1),
                Ipv4Addr::new(1, 1, 1, 1)
            ),
            "ip=172.16.0.2::172.16.0.1:255.255.255.252::eth0:off:1.1.1.1"
        );
    }
}
