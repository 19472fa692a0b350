use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bus;
pub mod naming;
pub mod schema;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "vm_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Unprovisioned,       // No remote resource yet
    Provisioning,        // Workflow running
    Provisioned,         // vmid assigned, spec frozen
    #[sqlx(rename = "provisioning_failed")]
    #[serde(rename = "provisioning_failed")]
    ProvisioningFailed,  // Workflow exhausted retries, compensated
    Destroying,          // Remote delete requested
    Destroyed,           // Remote resource gone
}

/// Guest OS templates available on the cluster.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "vm_os", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VmOs {
    Win7,
    Win10,
    Kali,
}

// --- Entities (SQLx Mapped) ---

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, utoipa::ToSchema)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, utoipa::ToSchema)]
pub struct Tester {
    pub id: Uuid,
    pub name: String,
    pub tester_identifier: String,
    pub company_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, utoipa::ToSchema)]
pub struct TesterIpAddress {
    pub id: Uuid,
    pub tester_id: Uuid,
    pub ip: String, // INET cast to text in queries
    pub cidr: i32,
    pub gateway: Option<String>,
}

/// One engagement. Maps 1:1 to a remote resource pool named
/// by the uppercased slug of `activity_identifier`.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, utoipa::ToSchema)]
pub struct Activity {
    pub id: Uuid,
    pub activity_identifier: String,
    pub target_application_identifier: String,
    pub target_application_name: String,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    /// Remote resource pool id for this activity.
    pub fn pool_id(&self) -> String {
        naming::pool_slug(&self.activity_identifier)
    }

    /// Comment stored on the remote pool.
    pub fn pool_comment(&self) -> String {
        format!(
            "{} - {} {}",
            self.activity_identifier,
            self.target_application_identifier,
            self.target_application_name
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, utoipa::ToSchema)]
pub struct Network {
    pub id: Uuid,
    pub network_description: String,
    pub bridge_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, utoipa::ToSchema)]
pub struct VirtualMachine {
    pub id: Uuid,
    pub name: String,
    pub os: VmOs,
    pub ram_mb: i32,
    pub cpu_cores: i32,
    pub activity_id: Uuid,

    /// Hypervisor-assigned id. Set exactly once by the provisioning
    /// workflow; presence means the VM is provisioned and its spec frozen.
    pub vmid: Option<i64>,
    pub status: VmStatus,
    pub created_at: DateTime<Utc>,
}

impl VirtualMachine {
    /// DNS-safe guest hostname, used as the cloned VM's name on the node.
    pub fn hostname(&self) -> String {
        naming::hostname(&self.name)
    }
}

/// RAM bounds (MB) enforced on VM create/update.
pub const VM_RAM_MIN_MB: i32 = 512;
pub const VM_RAM_MAX_MB: i32 = 8192;
/// CPU core bounds enforced on VM create/update.
pub const VM_CPU_MIN: i32 = 1;
pub const VM_CPU_MAX: i32 = 8;

pub fn validate_vm_spec(ram_mb: i32, cpu_cores: i32) -> Result<(), String> {
    if !(VM_RAM_MIN_MB..=VM_RAM_MAX_MB).contains(&ram_mb) {
        return Err(format!(
            "ram_mb must be between {} and {}",
            VM_RAM_MIN_MB, VM_RAM_MAX_MB
        ));
    }
    if !(VM_CPU_MIN..=VM_CPU_MAX).contains(&cpu_cores) {
        return Err(format!(
            "cpu_cores must be between {} and {}",
            VM_CPU_MIN, VM_CPU_MAX
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(identifier: &str) -> Activity {
        Activity {
            id: Uuid::new_v4(),
            activity_identifier: identifier.to_string(),
            target_application_identifier: "APP01".to_string(),
            target_application_name: "Internet Banking".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn pool_id_is_uppercased_slug() {
        assert_eq!(activity("act 2024/17").pool_id(), "ACT-2024-17");
    }

    #[test]
    fn pool_comment_includes_target() {
        let a = activity("ACT-1");
        assert_eq!(a.pool_comment(), "ACT-1 - APP01 Internet Banking");
    }

    #[test]
    fn vm_hostname_is_normalized() {
        let vm = VirtualMachine {
            id: Uuid::new_v4(),
            name: "Kali Attack Box".to_string(),
            os: VmOs::Kali,
            ram_mb: 2048,
            cpu_cores: 2,
            activity_id: Uuid::new_v4(),
            vmid: None,
            status: VmStatus::Unprovisioned,
            created_at: Utc::now(),
        };
        assert_eq!(vm.hostname(), "kali-attack-box");
    }

    #[test]
    fn vm_spec_bounds() {
        assert!(validate_vm_spec(512, 1).is_ok());
        assert!(validate_vm_spec(8192, 8).is_ok());
        assert!(validate_vm_spec(256, 2).is_err());
        assert!(validate_vm_spec(16384, 2).is_err());
        assert!(validate_vm_spec(1024, 0).is_err());
        assert!(validate_vm_spec(1024, 9).is_err());
    }
}
