use crate::hypervisor_manager::LabSettings;
use crate::logger;
use crate::state_machine::VmStateMachine;
use crate::workflow::{
    backoff, ipconfig, names_bridge, ProvisionStep, ResumeState, STEP_MAX_ATTEMPTS, STEP_ORDER,
};
use pentlab_common::{Activity, VirtualMachine};
use pentlab_providers::{DriverError, Hypervisor};
use serde_json::json;
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use uuid::Uuid;

/// How long a claimed run stays owned before the requeue job may steal it.
const LEASE_SECONDS: i32 = 120;

struct StepFailure {
    retryable: bool,
    message: String,
}

impl From<DriverError> for StepFailure {
    fn from(e: DriverError) -> Self {
        StepFailure {
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

fn db_failure(e: sqlx::Error) -> StepFailure {
    StepFailure {
        retryable: false,
        message: format!("database error: {}", e),
    }
}

fn terminal(message: impl Into<String>) -> StepFailure {
    StepFailure {
        retryable: false,
        message: message.into(),
    }
}

/// Planned NIC for one VM: which bridge, and the tester address if the
/// network carries one (otherwise cloud-init falls back to DHCP).
struct NicPlan {
    bridge: String,
    address: Option<String>,
    cidr: i32,
    gateway: Option<String>,
}

struct WorkflowCtx {
    pool: String,
    pool_comment: String,
    pool_created: bool,
    hostname: String,
    template: i64,
    ram_mb: i64,
    cpu_cores: i32,
    nics: Vec<NicPlan>,
    vmid: Option<i64>,
    volid: Option<String>,
}

/// Run (or resume) the provisioning workflow for one VM. Invoked from the
/// command subscriber and again from the requeue job when a run goes stale.
pub async fn process_provisioning(
    db: Pool<Postgres>,
    hv: Arc<dyn Hypervisor>,
    settings: LabSettings,
    vm_id: Uuid,
    run_id: Uuid,
    correlation_id: Option<String>,
) {
    println!(
        "🚀 [process_provisioning] vm={} run={} correlation_id={:?}",
        vm_id, run_id, correlation_id
    );

    // Claim the run. Either it is fresh (pending) or its lease expired and
    // we are taking over from a dead worker. Anything else means another
    // worker owns it right now.
    let claim: Option<(i32, bool)> = match sqlx::query_as(
        "UPDATE provision_runs
         SET status = 'running', attempt = attempt + 1,
             lease_until = NOW() + make_interval(secs => $2)
         WHERE id = $1
           AND (status = 'pending' OR (status = 'running' AND lease_until < NOW()))
         RETURNING attempt, pool_created",
    )
    .bind(run_id)
    .bind(LEASE_SECONDS as f64)
    .fetch_optional(&db)
    .await
    {
        Ok(claim) => claim,
        Err(e) => {
            eprintln!("❌ [process_provisioning] Failed to claim run {}: {}", run_id, e);
            return;
        }
    };

    let Some((attempt, pool_created)) = claim else {
        println!(
            "⏭️ [process_provisioning] Run {} not claimable (done or leased elsewhere)",
            run_id
        );
        return;
    };

    let start = Instant::now();
    let log_id = logger::log_event_with_metadata(
        &db,
        "PROVISION_VM",
        "in_progress",
        Some(vm_id),
        None,
        Some(json!({"run_id": run_id, "attempt": attempt, "correlation_id": correlation_id})),
    )
    .await
    .ok();

    // Move the VM into provisioning. A resumed run finds it there already.
    match VmStateMachine::to_provisioning(&db, vm_id).await {
        Ok(true) => {}
        Ok(false) => {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status::text FROM vms WHERE id = $1")
                    .bind(vm_id)
                    .fetch_optional(&db)
                    .await
                    .unwrap_or(None);
            if status.as_deref() != Some("provisioning") {
                let msg = format!(
                    "VM not in a provisionable state (status={:?})",
                    status.as_deref()
                );
                eprintln!("⚠️ [process_provisioning] {}", msg);
                finish_run(&db, run_id, "failed", Some(&msg)).await;
                if let Some(log_id) = log_id {
                    let _ = logger::log_event_complete(
                        &db,
                        log_id,
                        "failed",
                        start.elapsed().as_millis() as i32,
                        Some(&msg),
                    )
                    .await;
                }
                return;
            }
        }
        Err(e) => {
            eprintln!("❌ [process_provisioning] State transition failed: {}", e);
            finish_run(&db, run_id, "failed", Some(&e.to_string())).await;
            return;
        }
    }

    let mut ctx = match load_context(&db, &settings, vm_id, pool_created).await {
        Ok(ctx) => ctx,
        Err(msg) => {
            eprintln!("❌ [process_provisioning] {}", msg);
            let _ = VmStateMachine::to_failed(&db, vm_id, &msg).await;
            finish_run(&db, run_id, "failed", Some(&msg)).await;
            if let Some(log_id) = log_id {
                let _ = logger::log_event_complete(
                    &db,
                    log_id,
                    "failed",
                    start.elapsed().as_millis() as i32,
                    Some(&msg),
                )
                .await;
            }
            return;
        }
    };

    match drive_steps(&db, hv.as_ref(), &settings, vm_id, run_id, &mut ctx).await {
        Ok(vmid) => {
            finish_run(&db, run_id, "succeeded", None).await;
            println!(
                "✅ [process_provisioning] VM {} provisioned as vmid {} in {:?}",
                vm_id,
                vmid,
                start.elapsed()
            );
            if let Some(log_id) = log_id {
                let _ = logger::log_event_complete(
                    &db,
                    log_id,
                    "success",
                    start.elapsed().as_millis() as i32,
                    None,
                )
                .await;
            }
        }
        Err(msg) => {
            eprintln!("❌ [process_provisioning] VM {} failed: {}", vm_id, msg);
            let _ = VmStateMachine::to_failed(&db, vm_id, &msg).await;
            finish_run(&db, run_id, "failed", Some(&msg)).await;
            if let Some(log_id) = log_id {
                let _ = logger::log_event_complete(
                    &db,
                    log_id,
                    "failed",
                    start.elapsed().as_millis() as i32,
                    Some(&msg),
                )
                .await;
            }
        }
    }
}

async fn load_context(
    db: &Pool<Postgres>,
    settings: &LabSettings,
    vm_id: Uuid,
    pool_created: bool,
) -> Result<WorkflowCtx, String> {
    let vm: Option<VirtualMachine> = sqlx::query_as(
        "SELECT id, name, os, ram_mb, cpu_cores, activity_id, vmid, status, created_at
         FROM vms WHERE id = $1",
    )
    .bind(vm_id)
    .fetch_optional(db)
    .await
    .map_err(|e| format!("Failed to load VM: {}", e))?;

    let Some(vm) = vm else {
        return Err(format!("VM {} not found", vm_id));
    };

    let activity: Activity = sqlx::query_as(
        "SELECT id, activity_identifier, target_application_identifier,
                target_application_name, created_at
         FROM activities WHERE id = $1",
    )
    .bind(vm.activity_id)
    .fetch_one(db)
    .await
    .map_err(|e| format!("Failed to load activity: {}", e))?;

    let nic_rows: Vec<(String, Option<String>, Option<i32>, Option<String>)> = sqlx::query_as(
        "SELECT n.bridge_name, t.ip::text, t.cidr, t.gateway::text
         FROM vm_networks vn
         JOIN networks n ON n.id = vn.network_id
         LEFT JOIN tester_ip_addresses t ON t.id = vn.tester_ip_id
         WHERE vn.vm_id = $1
         ORDER BY n.bridge_name",
    )
    .bind(vm_id)
    .fetch_all(db)
    .await
    .map_err(|e| format!("Failed to load VM networks: {}", e))?;

    if nic_rows.is_empty() {
        return Err(format!("VM {} has no networks configured", vm_id));
    }

    let nics = nic_rows
        .into_iter()
        .map(|(bridge, address, cidr, gateway)| NicPlan {
            bridge,
            address,
            cidr: cidr.unwrap_or(25),
            gateway,
        })
        .collect();

    Ok(WorkflowCtx {
        pool: activity.pool_id(),
        pool_comment: activity.pool_comment(),
        pool_created,
        hostname: vm.hostname(),
        template: settings.template_for(&vm.os),
        ram_mb: vm.ram_mb as i64,
        cpu_cores: vm.cpu_cores,
        nics,
        vmid: vm.vmid,
        volid: None,
    })
}

async fn drive_steps(
    db: &Pool<Postgres>,
    hv: &dyn Hypervisor,
    settings: &LabSettings,
    vm_id: Uuid,
    run_id: Uuid,
    ctx: &mut WorkflowCtx,
) -> Result<i64, String> {
    // Steps completed by a previous attempt are skipped; their outputs are
    // replayed into the context so later steps see the same values.
    let done_rows: Vec<(String, Option<serde_json::Value>)> = sqlx::query_as(
        "SELECT step, output FROM provision_steps WHERE run_id = $1 AND status = 'done'",
    )
    .bind(run_id)
    .fetch_all(db)
    .await
    .map_err(|e| format!("Failed to load completed steps: {}", e))?;

    let resume = ResumeState::from_step_rows(&done_rows);
    if let Some(vmid) = resume.vmid {
        ctx.vmid = Some(vmid);
    }
    if let Some(volid) = &resume.volid {
        ctx.volid = Some(volid.clone());
    }

    for step in STEP_ORDER {
        if resume.is_done(step) {
            println!("⏭️ [workflow] {} already done, skipping", step.as_str());
            continue;
        }

        mark_step_running(db, run_id, step).await;
        let step_start = Instant::now();

        let mut attempt: u32 = 0;
        let output = loop {
            attempt += 1;
            match execute_step(step, db, hv, settings, vm_id, run_id, ctx).await {
                Ok(output) => break output,
                Err(failure) if failure.retryable && attempt < STEP_MAX_ATTEMPTS => {
                    println!(
                        "🔁 [workflow] {} attempt {}/{} failed ({}), retrying in {:?}",
                        step.as_str(),
                        attempt,
                        STEP_MAX_ATTEMPTS,
                        failure.message,
                        backoff(attempt)
                    );
                    sleep(backoff(attempt)).await;
                    renew_lease(db, run_id).await;
                }
                Err(failure) => {
                    mark_step_failed(db, run_id, step, &failure.message).await;
                    let _ = logger::log_event_with_metadata(
                        db,
                        "PROVISION_STEP",
                        "failed",
                        Some(vm_id),
                        Some(&failure.message),
                        Some(json!({"run_id": run_id, "step": step.as_str(), "attempt": attempt})),
                    )
                    .await;
                    compensate(db, hv, settings, vm_id, run_id, ctx).await;
                    return Err(format!("Step {} failed: {}", step.as_str(), failure.message));
                }
            }
        };

        mark_step_done(db, run_id, step, &output).await;
        println!(
            "✅ [workflow] {} done in {:?}",
            step.as_str(),
            step_start.elapsed()
        );
    }

    ctx.vmid
        .ok_or_else(|| "Workflow finished without a vmid".to_string())
}

async fn execute_step(
    step: ProvisionStep,
    db: &Pool<Postgres>,
    hv: &dyn Hypervisor,
    settings: &LabSettings,
    vm_id: Uuid,
    run_id: Uuid,
    ctx: &mut WorkflowCtx,
) -> Result<serde_json::Value, StepFailure> {
    match step {
        ProvisionStep::EnsurePool => {
            let pools = hv.list_pools().await?;
            let created = if pools.iter().any(|p| p == &ctx.pool) {
                false
            } else {
                hv.create_pool(&ctx.pool, &ctx.pool_comment).await?;
                // Remembered on the run so rollback only deletes pools
                // this workflow created.
                sqlx::query("UPDATE provision_runs SET pool_created = TRUE WHERE id = $1")
                    .bind(run_id)
                    .execute(db)
                    .await
                    .map_err(db_failure)?;
                ctx.pool_created = true;
                true
            };
            Ok(json!({"pool": ctx.pool, "created": created}))
        }
        ProvisionStep::CloneTemplate => {
            // A crashed attempt may have cloned before recording the vmid;
            // look for the hostname on the node first.
            let existing = hv
                .list_vms(&settings.node)
                .await?
                .into_iter()
                .find(|v| v.name == ctx.hostname)
                .map(|v| v.vmid);
            let vmid = match existing {
                Some(vmid) => vmid,
                None => {
                    let newid = hv.next_vmid().await?;
                    hv.clone_vm(
                        &settings.node,
                        ctx.template,
                        newid,
                        &ctx.hostname,
                        Some(&ctx.pool),
                    )
                    .await?
                }
            };
            ctx.vmid = Some(vmid);
            Ok(json!({"vmid": vmid}))
        }
        ProvisionStep::SetRam => {
            let vmid = require_vmid(ctx)?;
            let min_mb = settings.min_ram_mb.min(ctx.ram_mb);
            hv.set_ram(&settings.node, vmid, ctx.ram_mb, min_mb).await?;
            Ok(json!({"ram_mb": ctx.ram_mb, "min_mb": min_mb}))
        }
        ProvisionStep::SetCpu => {
            let vmid = require_vmid(ctx)?;
            hv.set_cores(&settings.node, vmid, ctx.cpu_cores).await?;
            Ok(json!({"cpu_cores": ctx.cpu_cores}))
        }
        ProvisionStep::AttachNetworks => {
            let vmid = require_vmid(ctx)?;
            // Skip bridges a previous attempt already wired up.
            let config = hv.get_vm_config(&settings.node, vmid).await?;
            let mut attached = Vec::new();
            for nic in &ctx.nics {
                if config.values().any(|v| names_bridge(v, &nic.bridge)) {
                    continue;
                }
                let nic_info = hv.attach_nic(&settings.node, vmid, &nic.bridge).await?;
                attached.push(json!({
                    "bridge": nic.bridge,
                    "slot": nic_info.slot,
                    "mac": nic_info.mac,
                }));
            }
            Ok(json!({"nics": attached}))
        }
        ProvisionStep::PrepareCloudInit => {
            let vmid = require_vmid(ctx)?;
            let primary = ctx.nics.iter().find(|n| n.address.is_some());
            let ipcfg = match primary {
                Some(nic) => ipconfig(
                    nic.address.as_deref(),
                    nic.cidr as u8,
                    nic.gateway.as_deref(),
                ),
                None => ipconfig(None, 0, None),
            };
            hv.set_cloud_init(
                &settings.node,
                vmid,
                &ipcfg,
                settings.cloudinit_password.as_deref(),
            )
            .await?;
            Ok(json!({"ipconfig": ipcfg}))
        }
        ProvisionStep::AttachCloudInit => {
            let vmid = require_vmid(ctx)?;
            hv.attach_cloud_init_drive(&settings.node, vmid, &settings.cloudinit_storage)
                .await?;
            Ok(json!({"storage": settings.cloudinit_storage}))
        }
        ProvisionStep::CreateEvidenceStorage => {
            let vmid = require_vmid(ctx)?;
            let name = format!("vm-{}-evidence", vmid);
            let volid = hv
                .create_volume(
                    &settings.node,
                    &settings.evidence_storage,
                    vmid,
                    &name,
                    settings.evidence_size_gb,
                )
                .await?;
            ctx.volid = Some(volid.clone());
            Ok(json!({"volid": volid}))
        }
        ProvisionStep::AttachEvidenceStorage => {
            let vmid = require_vmid(ctx)?;
            let volid = ctx
                .volid
                .clone()
                .ok_or_else(|| terminal("No evidence volume recorded"))?;
            let slot = hv.attach_volume(&settings.node, vmid, &volid).await?;
            Ok(json!({"volid": volid, "slot": slot}))
        }
        ProvisionStep::PersistVmid => {
            let vmid = require_vmid(ctx)?;
            let moved = VmStateMachine::to_provisioned(db, vm_id, vmid)
                .await
                .map_err(db_failure)?;
            if !moved {
                // A replayed run finds the vmid already written; only a
                // conflicting value is an error.
                let current: Option<i64> = sqlx::query_scalar("SELECT vmid FROM vms WHERE id = $1")
                    .bind(vm_id)
                    .fetch_optional(db)
                    .await
                    .map_err(db_failure)?
                    .flatten();
                if current != Some(vmid) {
                    return Err(terminal(format!(
                        "VM already carries vmid {:?}, refusing to overwrite with {}",
                        current, vmid
                    )));
                }
            }
            Ok(json!({"vmid": vmid}))
        }
    }
}

fn require_vmid(ctx: &WorkflowCtx) -> Result<i64, StepFailure> {
    ctx.vmid.ok_or_else(|| terminal("No vmid in workflow context"))
}

/// Undo remote resources in reverse order after a terminal step failure.
/// Best effort: a failed undo is logged and skipped, the run still ends
/// as failed.
async fn compensate(
    db: &Pool<Postgres>,
    hv: &dyn Hypervisor,
    settings: &LabSettings,
    vm_id: Uuid,
    run_id: Uuid,
    ctx: &WorkflowCtx,
) {
    println!("↩️ [workflow] Rolling back remote resources for VM {}", vm_id);

    if let Some(volid) = &ctx.volid {
        let storage = volid.split(':').next().unwrap_or(&settings.evidence_storage);
        if let Err(e) = hv.delete_volume(&settings.node, storage, volid).await {
            eprintln!("⚠️ [workflow] Rollback: failed to delete volume {}: {}", volid, e);
        }
    }

    if let Some(vmid) = ctx.vmid {
        match hv.delete_vm(&settings.node, vmid).await {
            Ok(()) => println!("🗑️ [workflow] Rollback: deleted VM {}", vmid),
            Err(DriverError::Vendor(msg)) if msg.contains("does not exist") => {}
            Err(e) => eprintln!("⚠️ [workflow] Rollback: failed to delete VM {}: {}", vmid, e),
        }
    }

    if ctx.pool_created {
        match hv.delete_pool(&ctx.pool).await {
            Ok(()) => println!("🗑️ [workflow] Rollback: deleted pool {}", ctx.pool),
            Err(e) => eprintln!(
                "⚠️ [workflow] Rollback: failed to delete pool {}: {}",
                ctx.pool, e
            ),
        }
    }

    let _ = sqlx::query(
        "UPDATE provision_steps SET status = 'compensated', completed_at = NOW()
         WHERE run_id = $1 AND status = 'done'",
    )
    .bind(run_id)
    .execute(db)
    .await;

    let _ = logger::log_event_with_metadata(
        db,
        "PROVISION_ROLLBACK",
        "success",
        Some(vm_id),
        None,
        Some(json!({"run_id": run_id, "pool_deleted": ctx.pool_created})),
    )
    .await;
}

// --- Run / step bookkeeping ---

async fn mark_step_running(db: &Pool<Postgres>, run_id: Uuid, step: ProvisionStep) {
    let _ = sqlx::query(
        "INSERT INTO provision_steps (run_id, step, status, started_at)
         VALUES ($1, $2, 'running', NOW())
         ON CONFLICT (run_id, step) DO UPDATE
         SET status = 'running', started_at = NOW(), completed_at = NULL, error_message = NULL",
    )
    .bind(run_id)
    .bind(step.as_str())
    .execute(db)
    .await;
    let _ = sqlx::query(
        "UPDATE provision_runs
         SET current_step = $2, lease_until = NOW() + make_interval(secs => $3)
         WHERE id = $1",
    )
    .bind(run_id)
    .bind(step.as_str())
    .bind(LEASE_SECONDS as f64)
    .execute(db)
    .await;
}

async fn mark_step_done(
    db: &Pool<Postgres>,
    run_id: Uuid,
    step: ProvisionStep,
    output: &serde_json::Value,
) {
    let _ = sqlx::query(
        "UPDATE provision_steps
         SET status = 'done', output = $3, completed_at = NOW()
         WHERE run_id = $1 AND step = $2",
    )
    .bind(run_id)
    .bind(step.as_str())
    .bind(output)
    .execute(db)
    .await;
}

async fn mark_step_failed(db: &Pool<Postgres>, run_id: Uuid, step: ProvisionStep, message: &str) {
    let _ = sqlx::query(
        "UPDATE provision_steps
         SET status = 'failed', error_message = $3, completed_at = NOW()
         WHERE run_id = $1 AND step = $2",
    )
    .bind(run_id)
    .bind(step.as_str())
    .bind(message)
    .execute(db)
    .await;
}

async fn renew_lease(db: &Pool<Postgres>, run_id: Uuid) {
    let _ = sqlx::query(
        "UPDATE provision_runs SET lease_until = NOW() + make_interval(secs => $2) WHERE id = $1",
    )
    .bind(run_id)
    .bind(LEASE_SECONDS as f64)
    .execute(db)
    .await;
}

async fn finish_run(db: &Pool<Postgres>, run_id: Uuid, status: &str, last_error: Option<&str>) {
    let _ = sqlx::query(
        "UPDATE provision_runs
         SET status = $2::run_status, last_error = $3, lease_until = NULL, completed_at = NOW()
         WHERE id = $1",
    )
    .bind(run_id)
    .bind(status)
    .bind(last_error)
    .execute(db)
    .await;
}

// --- Destroy ---

/// Delete the remote VM and mark the row destroyed. The vmid stays on the
/// row for the audit trail.
pub async fn process_destroy(
    db: Pool<Postgres>,
    hv: Arc<dyn Hypervisor>,
    settings: LabSettings,
    vm_id: Uuid,
    correlation_id: Option<String>,
) {
    println!(
        "🗑️ [process_destroy] vm={} correlation_id={:?}",
        vm_id, correlation_id
    );

    let start = Instant::now();
    let log_id = logger::log_event_with_metadata(
        &db,
        "DESTROY_VM",
        "in_progress",
        Some(vm_id),
        None,
        Some(json!({"correlation_id": correlation_id})),
    )
    .await
    .ok();

    match VmStateMachine::to_destroying(&db, vm_id).await {
        Ok(true) => {}
        Ok(false) => {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status::text FROM vms WHERE id = $1")
                    .bind(vm_id)
                    .fetch_optional(&db)
                    .await
                    .unwrap_or(None);
            if status.as_deref() != Some("destroying") {
                println!(
                    "⏭️ [process_destroy] VM {} not destroyable (status={:?})",
                    vm_id,
                    status.as_deref()
                );
                return;
            }
        }
        Err(e) => {
            eprintln!("❌ [process_destroy] State transition failed: {}", e);
            return;
        }
    }

    let vmid: Option<i64> = sqlx::query_scalar("SELECT vmid FROM vms WHERE id = $1")
        .bind(vm_id)
        .fetch_optional(&db)
        .await
        .ok()
        .flatten()
        .flatten();

    if let Some(vmid) = vmid {
        match hv.delete_vm(&settings.node, vmid).await {
            Ok(()) => println!("✅ [process_destroy] Deleted remote VM {}", vmid),
            Err(DriverError::Vendor(msg)) if msg.contains("does not exist") => {
                println!("⏭️ [process_destroy] Remote VM {} already gone", vmid);
            }
            Err(e) => {
                let msg = e.to_string();
                eprintln!("❌ [process_destroy] Failed to delete VM {}: {}", vmid, msg);
                if let Some(log_id) = log_id {
                    let _ = logger::log_event_complete(
                        &db,
                        log_id,
                        "failed",
                        start.elapsed().as_millis() as i32,
                        Some(&msg),
                    )
                    .await;
                }
                // Stay in destroying; the command can be replayed.
                return;
            }
        }
    }

    let _ = VmStateMachine::to_destroyed(&db, vm_id).await;
    if let Some(log_id) = log_id {
        let _ = logger::log_event_complete(
            &db,
            log_id,
            "success",
            start.elapsed().as_millis() as i32,
            None,
        )
        .await;
    }
}

// --- Pool lifecycle (internal HTTP) ---

/// Create the remote pool backing an activity. Fails if it already exists.
pub async fn create_activity_pool(
    db: &Pool<Postgres>,
    hv: &dyn Hypervisor,
    activity_id: Uuid,
) -> Result<String, DriverError> {
    let activity = load_activity(db, activity_id).await?;
    let pool = activity.pool_id();
    hv.create_pool(&pool, &activity.pool_comment()).await?;
    let _ = logger::log_event_with_metadata(
        db,
        "CREATE_POOL",
        "success",
        None,
        None,
        Some(json!({"activity_id": activity_id, "pool": pool})),
    )
    .await;
    Ok(pool)
}

/// Delete the remote pool backing an activity. The cluster refuses while
/// the pool still has members.
pub async fn delete_activity_pool(
    db: &Pool<Postgres>,
    hv: &dyn Hypervisor,
    activity_id: Uuid,
) -> Result<String, DriverError> {
    let activity = load_activity(db, activity_id).await?;
    let pool = activity.pool_id();
    let info = hv.get_pool(&pool).await?;
    if !info.members.is_empty() {
        return Err(DriverError::vendor(format!(
            "Pool {} still has {} member(s)",
            pool,
            info.members.len()
        )));
    }
    hv.delete_pool(&pool).await?;
    let _ = logger::log_event_with_metadata(
        db,
        "DELETE_POOL",
        "success",
        None,
        None,
        Some(json!({"activity_id": activity_id, "pool": pool})),
    )
    .await;
    Ok(pool)
}

async fn load_activity(db: &Pool<Postgres>, activity_id: Uuid) -> Result<Activity, DriverError> {
    let activity: Option<Activity> = sqlx::query_as(
        "SELECT id, activity_identifier, target_application_identifier,
                target_application_name, created_at
         FROM activities WHERE id = $1",
    )
    .bind(activity_id)
    .fetch_optional(db)
    .await
    .map_err(|e| DriverError::vendor(format!("database error: {}", e)))?;
    activity.ok_or_else(|| DriverError::vendor(format!("Activity {} not found", activity_id)))
}
