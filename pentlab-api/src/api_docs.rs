use crate::action_logs;
use crate::activities;
use crate::bridges;
use crate::companies;
use crate::networks;
use crate::testers;
use crate::vms;
use axum::Json;
use pentlab_common::{Activity, Company, Network, Tester, TesterIpAddress, VmOs, VmStatus};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        // Companies
        companies::list_companies,
        companies::create_company,
        companies::get_company,
        companies::update_company,
        companies::delete_company,
        // Testers
        testers::list_testers,
        testers::create_tester,
        testers::get_tester,
        testers::update_tester,
        testers::delete_tester,
        testers::list_tester_ips,
        testers::create_tester_ip,
        testers::delete_tester_ip,
        // Activities
        activities::list_activities,
        activities::create_activity,
        activities::get_activity,
        activities::update_activity,
        activities::delete_activity,
        activities::list_activity_testers,
        activities::assign_activity_testers,
        activities::create_activity_pool,
        activities::delete_activity_pool,
        // Networks
        networks::list_networks,
        networks::create_network,
        networks::update_network,
        networks::delete_network,
        bridges::list_bridges_for_select,
        // VMs
        vms::list_vms,
        vms::create_vm,
        vms::get_vm,
        vms::update_vm,
        vms::delete_vm,
        vms::provision_vm,
        vms::get_provision_run,
        vms::destroy_vm,
        // Audit
        action_logs::list_action_logs
    ),
    components(
        schemas(
            Company,
            Tester,
            TesterIpAddress,
            Activity,
            Network,
            VmStatus,
            VmOs,
            companies::CompanyRequest,
            testers::TesterRequest,
            testers::TesterIpRequest,
            activities::ActivityRequest,
            activities::AssignTestersRequest,
            networks::NetworkRequest,
            vms::CreateVmRequest,
            vms::UpdateVmRequest,
            vms::VmNetworkRequest,
            vms::VmResponse,
            vms::VmNetworkResponse,
            vms::ProvisionRunResponse,
            vms::ProvisionStepResponse,
            action_logs::ActionLogResponse
        )
    ),
    tags(
        (name = "pentlab-api", description = "Pentest Lab Provisioning API")
    )
)]
pub struct ApiDoc;

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
