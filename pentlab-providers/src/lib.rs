use async_trait::async_trait;

/// Single error kind surfaced by every hypervisor call.
///
/// Two distinguishable causes: the cluster is not reachable (connection
/// failure, negative reachability probe) or the hypervisor reported a
/// resource error (not found, already exists, rejected config).
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("hypervisor not reachable: {0}")]
    NotConnected(String),
    #[error("{0}")]
    Vendor(String),
}

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::NotConnected(_))
    }

    pub fn vendor(msg: impl Into<String>) -> Self {
        DriverError::Vendor(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Probe the cluster. Implementations may cache the answer briefly.
    async fn reachable(&self) -> bool;

    // Reads
    async fn list_bridges(&self, node: &str) -> Result<Vec<inventory::Bridge>>;
    async fn list_vms(&self, node: &str) -> Result<Vec<inventory::VmSummary>>;
    async fn get_vm(&self, node: &str, vmid: i64) -> Result<inventory::VmSummary>;
    async fn get_vm_config(&self, node: &str, vmid: i64) -> Result<inventory::VmConfig>;
    async fn list_pools(&self) -> Result<Vec<String>>;
    async fn get_pool(&self, poolid: &str) -> Result<inventory::PoolInfo>;
    async fn next_vmid(&self) -> Result<i64>;

    // Mutations (guarded: referenced entities are re-checked remotely first)
    async fn create_pool(&self, poolid: &str, comment: &str) -> Result<()>;
    async fn delete_pool(&self, poolid: &str) -> Result<()>;
    async fn clone_vm(
        &self,
        node: &str,
        template: i64,
        newid: i64,
        name: &str,
        pool: Option<&str>,
    ) -> Result<i64>;
    async fn set_ram(&self, node: &str, vmid: i64, max_mb: i64, min_mb: i64) -> Result<()>;
    async fn set_cores(&self, node: &str, vmid: i64, cores: i32) -> Result<()>;
    async fn attach_nic(&self, node: &str, vmid: i64, bridge: &str)
        -> Result<inventory::NicAttachment>;
    async fn detach_nic(&self, node: &str, vmid: i64, nic: &str) -> Result<()>;
    async fn delete_vm(&self, node: &str, vmid: i64) -> Result<()>;

    // Cloud-init
    async fn set_cloud_init(
        &self,
        node: &str,
        vmid: i64,
        ipconfig: &str,
        password: Option<&str>,
    ) -> Result<()>;
    async fn attach_cloud_init_drive(&self, node: &str, vmid: i64, storage: &str) -> Result<()>;

    // Evidence storage (two calls on purpose: allocation and attachment are
    // separate workflow steps with separate rollback)
    async fn create_volume(
        &self,
        node: &str,
        storage: &str,
        vmid: i64,
        name: &str,
        size_gb: i64,
    ) -> Result<String>;
    async fn attach_volume(&self, node: &str, vmid: i64, volid: &str) -> Result<String>;
    async fn delete_volume(&self, node: &str, storage: &str, volid: &str) -> Result<()>;
}

pub mod inventory {
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct Bridge {
        pub iface: String,
        pub active: bool,
        pub comment: Option<String>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct VmSummary {
        pub vmid: i64,
        pub name: String,
        pub status: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct PoolInfo {
        pub poolid: String,
        pub comment: Option<String>,
        pub members: Vec<i64>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct NicAttachment {
        /// Guest-side interface name ("eth0", ...)
        pub iface: String,
        /// Hypervisor config key slot ("net0", ...)
        pub slot: String,
        pub mac: String,
    }

    /// Raw qemu config: key -> value ("net0" -> "virtio,bridge=vmbr0,...").
    pub type VmConfig = BTreeMap<String, String>;
}

/// Locally-administered MAC in the QEMU/KVM reserved 52:54:00 prefix.
pub fn random_mac() -> String {
    let tail: [u8; 3] = rand::random();
    format!(
        "52:54:00:{:02X}:{:02X}:{:02X}",
        tail[0], tail[1], tail[2]
    )
}

/// Next free numbered config slot ("net", "scsi", ...): max existing + 1,
/// or 0 when none exist.
pub fn next_slot<'a>(keys: impl Iterator<Item = &'a str>, prefix: &str) -> u32 {
    keys.filter_map(|k| k.strip_prefix(prefix))
        .filter_map(|n| n.parse::<u32>().ok())
        .map(|n| n + 1)
        .max()
        .unwrap_or(0)
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "proxmox")]
pub mod proxmox;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_mac_uses_reserved_prefix() {
        for _ in 0..64 {
            let mac = random_mac();
            assert!(mac.starts_with("52:54:00:"), "unexpected prefix: {}", mac);
            assert_eq!(mac.len(), 17);
            assert_eq!(mac, mac.to_uppercase());
            assert_eq!(mac.split(':').count(), 6);
        }
    }

    #[test]
    fn next_slot_starts_at_zero() {
        let keys = ["ide2", "scsi0", "memory"];
        assert_eq!(next_slot(keys.iter().copied(), "net"), 0);
    }

    #[test]
    fn next_slot_skips_past_max() {
        let keys = ["net0", "net3", "net1", "scsi0"];
        assert_eq!(next_slot(keys.iter().copied(), "net"), 4);
        assert_eq!(next_slot(keys.iter().copied(), "scsi"), 1);
    }

    #[test]
    fn next_slot_ignores_non_numeric_suffixes() {
        let keys = ["netX", "net1a", "net2"];
        assert_eq!(next_slot(keys.iter().copied(), "net"), 3);
    }

    #[test]
    fn driver_error_retryability() {
        assert!(DriverError::NotConnected("timeout".into()).is_retryable());
        assert!(!DriverError::vendor("pool already exists").is_retryable());
    }
}
