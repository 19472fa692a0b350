use pentlab_providers::mock::MockHypervisor;
use pentlab_providers::proxmox::{ProxmoxConfig, ProxmoxHypervisor};
use pentlab_providers::Hypervisor;
use sqlx::{Pool, Postgres};
use std::env;
use std::fs;
use std::sync::Arc;

pub struct HypervisorManager;

impl HypervisorManager {
    pub fn current_hypervisor_name() -> String {
        env::var("HYPERVISOR").unwrap_or_else(|_| "proxmox".to_string())
    }

    pub fn get_hypervisor(name: &str, db: Pool<Postgres>) -> Option<Arc<dyn Hypervisor>> {
        match name.to_lowercase().as_str() {
            "proxmox" => {
                let base_url = env::var("PROXMOX_URL").ok().map(|s| s.trim().to_string())?;
                let token_id = env::var("PROXMOX_TOKEN_ID")
                    .ok()
                    .map(|s| s.trim().to_string())?;
                // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
                let token_secret_file = env::var("PROXMOX_TOKEN_SECRET_FILE")
                    .unwrap_or_else(|_| "/run/secrets/proxmox_token_secret".to_string());
                let token_secret = fs::read_to_string(&token_secret_file)
                    .ok()
                    .or_else(|| env::var("PROXMOX_TOKEN_SECRET").ok())
                    .map(|s| s.trim().to_string())?;
                if base_url.is_empty() || token_id.is_empty() || token_secret.is_empty() {
                    return None;
                }
                let verify_ssl = env::var("PROXMOX_VERIFY_SSL")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false);
                let _ = db; // not needed for real hypervisor
                let hv = ProxmoxHypervisor::new(ProxmoxConfig {
                    base_url,
                    token_id,
                    token_secret,
                    verify_ssl,
                })
                .ok()?;
                Some(Arc::new(hv))
            }
            "mock" => Some(Arc::new(MockHypervisor::new(db))),
            _ => None,
        }
    }
}

/// Lab-wide settings the workflow needs besides credentials.
#[derive(Debug, Clone)]
pub struct LabSettings {
    pub node: String,
    pub template_win7: i64,
    pub template_win10: i64,
    pub template_kali: i64,
    pub min_ram_mb: i64,
    pub cloudinit_storage: String,
    pub cloudinit_password: Option<String>,
    pub evidence_storage: String,
    pub evidence_size_gb: i64,
}

impl LabSettings {
    pub fn from_env() -> Self {
        let template = |var: &str, default: i64| {
            env::var(var)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let cloudinit_password_file = env::var("CLOUDINIT_PASSWORD_FILE")
            .unwrap_or_else(|_| "/run/secrets/cloudinit_password".to_string());
        let cloudinit_password = fs::read_to_string(&cloudinit_password_file)
            .ok()
            .or_else(|| env::var("CLOUDINIT_PASSWORD").ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            node: env::var("PROXMOX_NODE").unwrap_or_else(|_| "pve".to_string()),
            template_win7: template("PROXMOX_TEMPLATE_WIN7", 9007),
            template_win10: template("PROXMOX_TEMPLATE_WIN10", 9010),
            template_kali: template("PROXMOX_TEMPLATE_KALI", 9020),
            min_ram_mb: template("PROXMOX_MIN_RAM_MB", 512),
            cloudinit_storage: env::var("CLOUDINIT_STORAGE")
                .unwrap_or_else(|_| "local-lvm".to_string()),
            cloudinit_password,
            evidence_storage: env::var("EVIDENCE_STORAGE")
                .unwrap_or_else(|_| "local-lvm".to_string()),
            evidence_size_gb: template("EVIDENCE_SIZE_GB", 10),
        }
    }

    pub fn template_for(&self, os: &pentlab_common::VmOs) -> i64 {
        match os {
            pentlab_common::VmOs::Win7 => self.template_win7,
            pentlab_common::VmOs::Win10 => self.template_win10,
            pentlab_common::VmOs::Kali => self.template_kali,
        }
    }
}
