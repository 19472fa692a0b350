use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::Postgres;
use std::sync::Arc;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::simple_logger;
use crate::AppState;
use pentlab_common::bus::{
    CommandType, DestroyVmCommand, ProvisionVmCommand, CHANNEL_ORCHESTRATOR_COMMANDS,
};
use pentlab_common::{validate_vm_spec, VmOs};

#[derive(Deserialize, utoipa::ToSchema)]
pub struct VmNetworkRequest {
    pub network_id: Uuid,
    pub tester_ip_id: Option<Uuid>,
}

#[derive(Deserialize, utoipa::ToSchema)]
pub struct CreateVmRequest {
    pub name: String,
    pub os: VmOs,
    pub ram_mb: i32,
    pub cpu_cores: i32,
    pub activity_id: Uuid,
    pub networks: Vec<VmNetworkRequest>,
}

#[derive(Deserialize, utoipa::ToSchema)]
pub struct UpdateVmRequest {
    pub name: String,
    pub ram_mb: i32,
    pub cpu_cores: i32,
}

#[derive(Deserialize, IntoParams)]
pub struct ListVmParams {
    pub activity_id: Option<Uuid>,
    pub status: Option<String>,
}

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct VmResponse {
    pub id: Uuid,
    pub name: String,
    pub os: String,
    pub ram_mb: i32,
    pub cpu_cores: i32,
    pub activity_id: Uuid,
    pub vmid: Option<i64>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub provisioned_at: Option<chrono::DateTime<chrono::Utc>>,
    pub destroyed_at: Option<chrono::DateTime<chrono::Utc>>,

    // Joined Fields
    pub activity_identifier: String,
}

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct VmNetworkResponse {
    pub id: Uuid,
    pub network_id: Uuid,
    pub bridge_name: String,
    pub tester_ip: Option<String>,
    pub tester_ip_cidr: Option<i32>,
}

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct ProvisionRunResponse {
    pub id: Uuid,
    pub vm_id: Uuid,
    pub status: String,
    pub current_step: Option<String>,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct ProvisionStepResponse {
    pub step: String,
    pub status: String,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Once the hypervisor has assigned a vmid the spec is frozen.
fn spec_locked(vmid: Option<i64>) -> bool {
    vmid.is_some()
}

/// Only VMs that never reached the cluster (or whose last run was rolled
/// back) may start a provisioning run.
fn provisionable(status: &str) -> bool {
    matches!(status, "unprovisioned" | "provisioning_failed")
}

const VM_LIST_SELECT: &str = "SELECT v.id, v.name, v.os::text as os, v.ram_mb, v.cpu_cores,
        v.activity_id, v.vmid, v.status::text as status, v.error_message,
        v.created_at, v.provisioned_at, v.destroyed_at,
        a.activity_identifier
 FROM vms v
 JOIN activities a ON a.id = v.activity_id";

#[utoipa::path(
    get,
    path = "/vms",
    params(ListVmParams),
    responses((status = 200, description = "List VMs, optionally filtered", body = Vec<VmResponse>))
)]
pub async fn list_vms(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListVmParams>,
) -> Json<Vec<VmResponse>> {
    let sql = format!(
        "{} WHERE ($1::uuid IS NULL OR v.activity_id = $1)
           AND ($2::text IS NULL OR v.status::text = $2)
         ORDER BY v.created_at DESC",
        VM_LIST_SELECT
    );
    let rows = sqlx::query_as::<Postgres, VmResponse>(&sql)
        .bind(params.activity_id)
        .bind(params.status)
        .fetch_all(&state.db)
        .await
        .unwrap_or_default();

    Json(rows)
}

#[utoipa::path(
    post,
    path = "/vms",
    request_body = CreateVmRequest,
    responses(
        (status = 201, description = "VM created (unprovisioned)", body = VmResponse),
        (status = 400, description = "Invalid spec or empty network list")
    )
)]
pub async fn create_vm(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateVmRequest>,
) -> impl IntoResponse {
    let name = payload.name.trim();
    if name.is_empty() || name.len() > 50 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "name must be 1..=50 characters"})),
        )
            .into_response();
    }
    if let Err(msg) = validate_vm_spec(payload.ram_mb, payload.cpu_cores) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response();
    }
    if payload.networks.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "at least one network is required"})),
        )
            .into_response();
    }

    let vm_id = Uuid::new_v4();
    let mut tx = match state.db.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "db_error", "message": e.to_string()})),
            )
                .into_response()
        }
    };

    let insert = sqlx::query(
        "INSERT INTO vms (id, name, os, ram_mb, cpu_cores, activity_id)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(vm_id)
    .bind(name)
    .bind(payload.os)
    .bind(payload.ram_mb)
    .bind(payload.cpu_cores)
    .bind(payload.activity_id)
    .execute(&mut *tx)
    .await;

    if let Err(e) = insert {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "db_error", "message": e.to_string()})),
        )
            .into_response();
    }

    for nic in &payload.networks {
        if let Err(e) = sqlx::query(
            "INSERT INTO vm_networks (id, vm_id, network_id, tester_ip_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(vm_id)
        .bind(nic.network_id)
        .bind(nic.tester_ip_id)
        .execute(&mut *tx)
        .await
        {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "db_error", "message": e.to_string()})),
            )
                .into_response();
        }
    }

    if let Err(e) = tx.commit().await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "db_error", "message": e.to_string()})),
        )
            .into_response();
    }

    let sql = format!("{} WHERE v.id = $1", VM_LIST_SELECT);
    let row = sqlx::query_as::<Postgres, VmResponse>(&sql)
        .bind(vm_id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();

    match row {
        Some(vm) => (StatusCode::CREATED, Json(vm)).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "VM vanished after insert").into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/vms/{id}",
    params(("id" = Uuid, Path, description = "VM Database UUID")),
    responses(
        (status = 200, description = "VM details with networks", body = serde_json::Value),
        (status = 404, description = "VM not found")
    )
)]
pub async fn get_vm(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let sql = format!("{} WHERE v.id = $1", VM_LIST_SELECT);
    let row = sqlx::query_as::<Postgres, VmResponse>(&sql)
        .bind(id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();

    let Some(vm) = row else {
        return (StatusCode::NOT_FOUND, "VM not found").into_response();
    };

    let networks = sqlx::query_as::<Postgres, VmNetworkResponse>(
        "SELECT vn.id, vn.network_id, n.bridge_name,
                t.ip::text as tester_ip, t.cidr as tester_ip_cidr
         FROM vm_networks vn
         JOIN networks n ON n.id = vn.network_id
         LEFT JOIN tester_ip_addresses t ON t.id = vn.tester_ip_id
         WHERE vn.vm_id = $1
         ORDER BY n.bridge_name ASC",
    )
    .bind(id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    let mut body = serde_json::to_value(&vm).unwrap_or_default();
    body["networks"] = serde_json::to_value(&networks).unwrap_or_default();
    Json(body).into_response()
}

#[utoipa::path(
    put,
    path = "/vms/{id}",
    params(("id" = Uuid, Path, description = "VM Database UUID")),
    request_body = UpdateVmRequest,
    responses(
        (status = 200, description = "VM spec updated"),
        (status = 404, description = "VM not found"),
        (status = 409, description = "Spec frozen (vmid assigned)")
    )
)]
pub async fn update_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateVmRequest>,
) -> impl IntoResponse {
    let name = payload.name.trim();
    if name.is_empty() || name.len() > 50 {
        return (StatusCode::BAD_REQUEST, "name must be 1..=50 characters").into_response();
    }
    if let Err(msg) = validate_vm_spec(payload.ram_mb, payload.cpu_cores) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    let vmid: Option<Option<i64>> = sqlx::query_scalar("SELECT vmid FROM vms WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db)
        .await
        .unwrap_or(None);

    let Some(vmid) = vmid else {
        return (StatusCode::NOT_FOUND, "VM not found").into_response();
    };
    if spec_locked(vmid) {
        return (
            StatusCode::CONFLICT,
            "VM is provisioned; its spec is frozen",
        )
            .into_response();
    }

    // Guard repeated in the UPDATE against a concurrent PersistVmid.
    let result = sqlx::query(
        "UPDATE vms SET name = $2, ram_mb = $3, cpu_cores = $4
         WHERE id = $1 AND vmid IS NULL",
    )
    .bind(id)
    .bind(name)
    .bind(payload.ram_mb)
    .bind(payload.cpu_cores)
    .execute(&state.db)
    .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "VM updated").into_response(),
        Ok(_) => (
            StatusCode::CONFLICT,
            "VM is provisioned; its spec is frozen",
        )
            .into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/vms/{id}",
    params(("id" = Uuid, Path, description = "VM Database UUID")),
    responses(
        (status = 200, description = "VM row deleted"),
        (status = 404, description = "VM not found"),
        (status = 409, description = "VM still exists on the cluster")
    )
)]
pub async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    // Rows are only removable when nothing remote can be orphaned.
    let result = sqlx::query(
        "DELETE FROM vms
         WHERE id = $1 AND status IN ('unprovisioned', 'provisioning_failed', 'destroyed')",
    )
    .bind(id)
    .execute(&state.db)
    .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "VM deleted").into_response(),
        Ok(_) => {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM vms WHERE id = $1)")
                .bind(id)
                .fetch_one(&state.db)
                .await
                .unwrap_or(false);
            if exists {
                (
                    StatusCode::CONFLICT,
                    "VM still exists on the cluster; destroy it first",
                )
                    .into_response()
            } else {
                (StatusCode::NOT_FOUND, "VM not found").into_response()
            }
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

// COMMAND : PROVISION VM
#[utoipa::path(
    post,
    path = "/vms/{id}/provision",
    params(("id" = Uuid, Path, description = "VM Database UUID")),
    responses(
        (status = 202, description = "Provisioning run accepted", body = serde_json::Value),
        (status = 404, description = "VM not found"),
        (status = 409, description = "VM not provisionable or run already active")
    )
)]
pub async fn provision_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let start = std::time::Instant::now();

    let status: Option<String> = sqlx::query_scalar("SELECT status::text FROM vms WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db)
        .await
        .unwrap_or(None);

    let Some(status) = status else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "vm_not_found"}))).into_response();
    };
    if !provisionable(&status) {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "vm_not_provisionable", "status": status})),
        )
            .into_response();
    }

    let log_id = simple_logger::log_action_with_metadata(
        &state.db,
        "REQUEST_PROVISION",
        "in_progress",
        Some(id),
        None,
        Some(json!({"vm_status": status})),
    )
    .await
    .ok();

    // One active run per VM, enforced by the partial unique index.
    let run_id = Uuid::new_v4();
    let insert = sqlx::query("INSERT INTO provision_runs (id, vm_id, status) VALUES ($1, $2, 'pending')")
        .bind(run_id)
        .bind(id)
        .execute(&state.db)
        .await;

    if let Err(e) = insert {
        let is_unique = matches!(&e, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"));
        let (code, msg) = if is_unique {
            (StatusCode::CONFLICT, "a provisioning run is already active")
        } else {
            (StatusCode::INTERNAL_SERVER_ERROR, "database error")
        };
        if let Some(lid) = log_id {
            let duration = start.elapsed().as_millis() as i32;
            let _ = simple_logger::log_action_complete(&state.db, lid, "failed", duration, Some(msg))
                .await;
        }
        return (code, Json(json!({"error": msg}))).into_response();
    }

    println!("🚀 Provision Request: vm={} run={}", id, run_id);

    let command = ProvisionVmCommand {
        command_type: CommandType::ProvisionVm,
        vm_id: id,
        run_id,
        correlation_id: log_id.map(|l| l.to_string()),
    };
    let event_payload = serde_json::to_string(&command).unwrap_or_default();

    println!("📤 Publishing provisioning event to Redis: {}", event_payload);

    let publish = match state.redis_client.get_multiplexed_async_connection().await {
        Ok(mut conn) => conn
            .publish::<_, _, ()>(CHANNEL_ORCHESTRATOR_COMMANDS, &event_payload)
            .await
            .map_err(|e| format!("Failed to publish to Redis: {:?}", e)),
        Err(e) => Err(format!("Failed to connect to Redis: {:?}", e)),
    };

    match publish {
        Ok(()) => {
            println!("✅ Provisioning event published successfully");
            if let Some(lid) = log_id {
                let duration = start.elapsed().as_millis() as i32;
                let _ = simple_logger::log_action_complete(&state.db, lid, "success", duration, None)
                    .await;
            }
            (
                StatusCode::ACCEPTED,
                Json(json!({"status": "accepted", "run_id": run_id})),
            )
                .into_response()
        }
        Err(error_msg) => {
            println!("❌ {}", error_msg);
            // The run stays pending; the requeue job will pick it up, so
            // this is a degraded accept rather than a failure.
            if let Some(lid) = log_id {
                let duration = start.elapsed().as_millis() as i32;
                let _ = simple_logger::log_action_complete(
                    &state.db,
                    lid,
                    "success",
                    duration,
                    Some(&error_msg),
                )
                .await;
            }
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "accepted",
                    "run_id": run_id,
                    "message": "event publish failed; run will be picked up by the requeue job"
                })),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/vms/{id}/provision",
    params(("id" = Uuid, Path, description = "VM Database UUID")),
    responses(
        (status = 200, description = "Latest run with step detail", body = serde_json::Value),
        (status = 404, description = "No run for this VM")
    )
)]
pub async fn get_provision_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let run = sqlx::query_as::<Postgres, ProvisionRunResponse>(
        "SELECT id, vm_id, status::text as status, current_step, attempt, last_error,
                created_at, completed_at
         FROM provision_runs
         WHERE vm_id = $1
         ORDER BY created_at DESC
         LIMIT 1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    let Some(run) = run else {
        return (StatusCode::NOT_FOUND, "No provisioning run for this VM").into_response();
    };

    let steps = sqlx::query_as::<Postgres, ProvisionStepResponse>(
        "SELECT step, status::text as status, output, error_message, started_at, completed_at
         FROM provision_steps
         WHERE run_id = $1
         ORDER BY started_at ASC",
    )
    .bind(run.id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    let mut body = serde_json::to_value(&run).unwrap_or_default();
    body["steps"] = serde_json::to_value(&steps).unwrap_or_default();
    Json(body).into_response()
}

// COMMAND : DESTROY VM
#[utoipa::path(
    post,
    path = "/vms/{id}/destroy",
    params(("id" = Uuid, Path, description = "VM Database UUID")),
    responses(
        (status = 202, description = "Destruction initiated"),
        (status = 404, description = "VM not found"),
        (status = 409, description = "VM is not provisioned")
    )
)]
pub async fn destroy_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let start = std::time::Instant::now();

    let status: Option<String> = sqlx::query_scalar("SELECT status::text FROM vms WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db)
        .await
        .unwrap_or(None);

    let Some(status) = status else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "vm_not_found"}))).into_response();
    };
    if status != "provisioned" && status != "destroying" {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "vm_not_destroyable", "status": status})),
        )
            .into_response();
    }

    let log_id = simple_logger::log_action(
        &state.db,
        "REQUEST_DESTROY",
        "in_progress",
        Some(id),
        None,
    )
    .await
    .ok();

    println!("🗑️ Destroy Request: {}", id);

    let command = DestroyVmCommand {
        command_type: CommandType::DestroyVm,
        vm_id: id,
        correlation_id: log_id.map(|l| l.to_string()),
    };
    let event_payload = serde_json::to_string(&command).unwrap_or_default();

    println!("📤 Publishing destroy event to Redis: {}", event_payload);

    let publish = match state.redis_client.get_multiplexed_async_connection().await {
        Ok(mut conn) => conn
            .publish::<_, _, ()>(CHANNEL_ORCHESTRATOR_COMMANDS, &event_payload)
            .await
            .map_err(|e| format!("Failed to publish to Redis: {:?}", e)),
        Err(e) => Err(format!("Failed to connect to Redis: {:?}", e)),
    };

    match publish {
        Ok(()) => {
            println!("✅ Destroy event published successfully");
            if let Some(lid) = log_id {
                let duration = start.elapsed().as_millis() as i32;
                let _ = simple_logger::log_action_complete(&state.db, lid, "success", duration, None)
                    .await;
            }
            (StatusCode::ACCEPTED, "Destruction initiated").into_response()
        }
        Err(error_msg) => {
            println!("❌ {}", error_msg);
            if let Some(lid) = log_id {
                let duration = start.elapsed().as_millis() as i32;
                let _ = simple_logger::log_action_complete(
                    &state.db,
                    lid,
                    "failed",
                    duration,
                    Some(&error_msg),
                )
                .await;
            }
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue destruction").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_lock_follows_vmid() {
        assert!(!spec_locked(None));
        assert!(spec_locked(Some(101)));
    }

    #[test]
    fn only_fresh_or_rolled_back_vms_are_provisionable() {
        assert!(provisionable("unprovisioned"));
        assert!(provisionable("provisioning_failed"));
        assert!(!provisionable("provisioning"));
        assert!(!provisionable("provisioned"));
        assert!(!provisionable("destroying"));
        assert!(!provisionable("destroyed"));
    }
}
