use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_ORCHESTRATOR_COMMANDS: &str = "lab_orchestrator_events";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CommandType {
    #[serde(rename = "CMD:PROVISION_VM")]
    ProvisionVm,
    #[serde(rename = "CMD:DESTROY_VM")]
    DestroyVm,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::ProvisionVm => "CMD:PROVISION_VM",
            CommandType::DestroyVm => "CMD:DESTROY_VM",
        }
    }
}

/// Payload for CMD:PROVISION_VM. The run row already exists (pending) when
/// the command is published; the orchestrator claims it by run_id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProvisionVmCommand {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub vm_id: Uuid,
    pub run_id: Uuid,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DestroyVmCommand {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub vm_id: Uuid,
    pub correlation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_type_round_trips_wire_names() {
        let cmd = ProvisionVmCommand {
            command_type: CommandType::ProvisionVm,
            vm_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            correlation_id: Some("req-1".to_string()),
        };
        let wire = serde_json::to_value(&cmd).unwrap();
        assert_eq!(wire["type"], "CMD:PROVISION_VM");
        let back: ProvisionVmCommand = serde_json::from_value(wire).unwrap();
        assert_eq!(back.command_type, CommandType::ProvisionVm);
        assert_eq!(back.vm_id, cmd.vm_id);
    }

    #[test]
    fn as_str_matches_serde_rename() {
        for ct in [CommandType::ProvisionVm, CommandType::DestroyVm] {
            let json = serde_json::to_string(&ct).unwrap();
            assert_eq!(json, format!("\"{}\"", ct.as_str()));
        }
    }
}
