use std::collections::HashSet;
use std::time::Duration;

/// Ordered steps of the provisioning workflow. The order is also the
/// compensation order, reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    EnsurePool,
    CloneTemplate,
    SetRam,
    SetCpu,
    AttachNetworks,
    PrepareCloudInit,
    AttachCloudInit,
    CreateEvidenceStorage,
    AttachEvidenceStorage,
    PersistVmid,
}

pub const STEP_ORDER: [ProvisionStep; 10] = [
    ProvisionStep::EnsurePool,
    ProvisionStep::CloneTemplate,
    ProvisionStep::SetRam,
    ProvisionStep::SetCpu,
    ProvisionStep::AttachNetworks,
    ProvisionStep::PrepareCloudInit,
    ProvisionStep::AttachCloudInit,
    ProvisionStep::CreateEvidenceStorage,
    ProvisionStep::AttachEvidenceStorage,
    ProvisionStep::PersistVmid,
];

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::EnsurePool => "ensure_pool",
            ProvisionStep::CloneTemplate => "clone_template",
            ProvisionStep::SetRam => "set_ram",
            ProvisionStep::SetCpu => "set_cpu",
            ProvisionStep::AttachNetworks => "attach_networks",
            ProvisionStep::PrepareCloudInit => "prepare_cloud_init",
            ProvisionStep::AttachCloudInit => "attach_cloud_init",
            ProvisionStep::CreateEvidenceStorage => "create_evidence_storage",
            ProvisionStep::AttachEvidenceStorage => "attach_evidence_storage",
            ProvisionStep::PersistVmid => "persist_vmid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        STEP_ORDER.iter().copied().find(|step| step.as_str() == s)
    }
}

/// Per-step retry budget for transient (connectivity) failures.
pub const STEP_MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff between retries of the same step: 2s, 4s, 8s.
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

/// Durable-state snapshot rebuilt when a run resumes: which steps already
/// completed, plus the recorded outputs later steps depend on. Steps absent
/// from the rows (never started, failed, compensated) run again.
#[derive(Debug, Default)]
pub struct ResumeState {
    completed: HashSet<String>,
    pub vmid: Option<i64>,
    pub volid: Option<String>,
}

impl ResumeState {
    /// Build from the persisted `(step, output)` rows of completed steps.
    pub fn from_step_rows(rows: &[(String, Option<serde_json::Value>)]) -> Self {
        let mut state = ResumeState::default();
        for (step, output) in rows {
            state.completed.insert(step.clone());
            let Some(output) = output else { continue };
            if let Some(vmid) = output.get("vmid").and_then(|v| v.as_i64()) {
                state.vmid = Some(vmid);
            }
            if let Some(volid) = output.get("volid").and_then(|v| v.as_str()) {
                state.volid = Some(volid.to_string());
            }
        }
        state
    }

    pub fn is_done(&self, step: ProvisionStep) -> bool {
        self.completed.contains(step.as_str())
    }
}

/// True when a VM config value names this exact bridge. Net lines are
/// comma-separated key=value pairs and the bridge can sit in any position,
/// including last with no trailing comma.
pub fn names_bridge(value: &str, bridge: &str) -> bool {
    value.split(',').any(|pair| {
        let mut kv = pair.splitn(2, '=');
        kv.next() == Some("bridge") && kv.next() == Some(bridge)
    })
}

/// Build the cloud-init ipconfig string for a NIC. No address means DHCP.
pub fn ipconfig(address: Option<&str>, cidr: u8, gateway: Option<&str>) -> String {
    match address {
        None => "ip=dhcp".to_string(),
        Some(addr) => match gateway {
            Some(gw) => format!("ip={}/{},gw={}", addr, cidr, gw),
            None => format!("ip={}/{}", addr, cidr),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resume_skips_completed_steps_and_replays_outputs() {
        let rows = vec![
            (
                "ensure_pool".to_string(),
                Some(json!({"pool": "ACT-1", "created": true})),
            ),
            ("clone_template".to_string(), Some(json!({"vmid": 101}))),
            (
                "create_evidence_storage".to_string(),
                Some(json!({"volid": "local-lvm:vm-101-evidence"})),
            ),
        ];
        let resume = ResumeState::from_step_rows(&rows);

        assert!(resume.is_done(ProvisionStep::EnsurePool));
        assert!(resume.is_done(ProvisionStep::CloneTemplate));
        assert!(resume.is_done(ProvisionStep::CreateEvidenceStorage));
        // Steps with no completed row run again.
        assert!(!resume.is_done(ProvisionStep::SetRam));
        assert!(!resume.is_done(ProvisionStep::PersistVmid));

        assert_eq!(resume.vmid, Some(101));
        assert_eq!(resume.volid.as_deref(), Some("local-lvm:vm-101-evidence"));
    }

    #[test]
    fn resume_with_no_completed_steps_runs_everything() {
        let resume = ResumeState::from_step_rows(&[]);
        for step in STEP_ORDER {
            assert!(!resume.is_done(step));
        }
        assert_eq!(resume.vmid, None);
        assert_eq!(resume.volid, None);
    }

    #[test]
    fn resume_tolerates_missing_and_unknown_outputs() {
        let rows = vec![
            ("set_ram".to_string(), None),
            ("legacy_step".to_string(), Some(json!({"vmid": "not-a-number"}))),
        ];
        let resume = ResumeState::from_step_rows(&rows);
        assert!(resume.is_done(ProvisionStep::SetRam));
        assert_eq!(resume.vmid, None);
    }

    #[test]
    fn bridge_match_is_exact_in_any_position() {
        let mid = "virtio=52:54:00:aa:bb:cc,bridge=vmbr0,firewall=1";
        let last = "virtio=52:54:00:aa:bb:cc,bridge=vmbr1";
        assert!(names_bridge(mid, "vmbr0"));
        assert!(names_bridge(last, "vmbr1"));
        // Prefix of a longer bridge name must not match.
        assert!(!names_bridge("bridge=vmbr10", "vmbr1"));
        assert!(!names_bridge(mid, "vmbr1"));
        assert!(!names_bridge("scsi0=local-lvm:vm-101-disk-0", "vmbr0"));
    }

    #[test]
    fn step_names_round_trip() {
        for step in STEP_ORDER {
            assert_eq!(ProvisionStep::parse(step.as_str()), Some(step));
        }
        assert_eq!(ProvisionStep::parse("no_such_step"), None);
    }

    #[test]
    fn persist_vmid_is_last() {
        assert_eq!(STEP_ORDER[STEP_ORDER.len() - 1], ProvisionStep::PersistVmid);
        assert_eq!(STEP_ORDER[0], ProvisionStep::EnsurePool);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn ipconfig_static_and_dhcp() {
        assert_eq!(ipconfig(None, 24, None), "ip=dhcp");
        assert_eq!(ipconfig(Some("10.0.0.5"), 24, None), "ip=10.0.0.5/24");
        assert_eq!(
            ipconfig(Some("10.0.0.5"), 24, Some("10.0.0.1")),
            "ip=10.0.0.5/24,gw=10.0.0.1"
        );
    }
}
