use pentlab_providers::Hypervisor;
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use uuid::Uuid;

use crate::hypervisor_manager::LabSettings;
use crate::provisioning;
use crate::state_machine::VmStateMachine;

/// How many times a whole run may be (re)claimed before it is abandoned.
const RUN_MAX_ATTEMPTS: i32 = 5;

/// job-requeue: resumes stale provisioning runs.
///
/// Redis Pub/Sub is not durable. If the orchestrator is down during publish,
/// or a worker dies mid-run, the run sits in `pending` forever or in
/// `running` with an expired lease. This job picks those up and drives them
/// again; the durable step log makes the resume safe.
pub async fn run(pool: Pool<Postgres>, hv: Arc<dyn Hypervisor>, settings: LabSettings) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(10));
    println!("🔁 job-requeue started (resume stale provisioning runs)");

    loop {
        interval.tick().await;

        if let Err(e) = fail_exhausted_runs(&pool).await {
            eprintln!("❌ [job-requeue] Error failing exhausted runs: {:?}", e);
        }

        match requeue_stale_runs(&pool, hv.clone(), settings.clone()).await {
            Ok(count) if count > 0 => {
                eprintln!("🔁 [job-requeue] Re-queued {} stale run(s)", count)
            }
            Ok(_) => {
                // Silent - no stale runs found (this is normal)
            }
            Err(e) => eprintln!("❌ [job-requeue] Error: {:?}", e),
        }
    }
}

/// Runs that burned their whole attempt budget are closed out so they stop
/// matching the stale scan; their VMs are marked failed.
async fn fail_exhausted_runs(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    let closed: Vec<(Uuid, Uuid)> = sqlx::query_as(
        "UPDATE provision_runs
         SET status = 'failed', last_error = 'Retry budget exhausted',
             lease_until = NULL, completed_at = NOW()
         WHERE status = 'running' AND lease_until < NOW() AND attempt >= $1
         RETURNING id, vm_id",
    )
    .bind(RUN_MAX_ATTEMPTS)
    .fetch_all(pool)
    .await?;

    for (run_id, vm_id) in closed {
        eprintln!(
            "💀 [job-requeue] Run {} exhausted its retry budget, failing VM {}",
            run_id, vm_id
        );
        let _ = VmStateMachine::to_failed(pool, vm_id, "Retry budget exhausted").await;
    }
    Ok(())
}

async fn requeue_stale_runs(
    pool: &Pool<Postgres>,
    hv: Arc<dyn Hypervisor>,
    settings: LabSettings,
) -> Result<usize, sqlx::Error> {
    // Only identify candidates here; the actual claim (attempt bump + lease)
    // happens inside process_provisioning so there is a single claim path.
    let stale: Vec<(Uuid, Uuid, i32)> = sqlx::query_as(
        "SELECT id, vm_id, attempt FROM provision_runs
         WHERE ((status = 'pending' AND created_at < NOW() - INTERVAL '30 seconds')
             OR (status = 'running' AND lease_until < NOW()))
           AND attempt < $1
         ORDER BY created_at ASC
         LIMIT 25
         FOR UPDATE SKIP LOCKED",
    )
    .bind(RUN_MAX_ATTEMPTS)
    .fetch_all(pool)
    .await?;

    if stale.is_empty() {
        return Ok(0);
    }

    let stale_len = stale.len();
    eprintln!("🔁 [job-requeue] Found {} stale run(s) to resume", stale_len);

    for (run_id, vm_id, attempt) in stale {
        let db = pool.clone();
        let hv = hv.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            let correlation_id = Some(format!("requeue-{}-{}", run_id, attempt + 1));
            eprintln!(
                "🔁 [job-requeue] Resuming run {} for VM {} (attempt {})",
                run_id,
                vm_id,
                attempt + 1
            );
            provisioning::process_provisioning(db, hv, settings, vm_id, run_id, correlation_id)
                .await;
        });
    }

    Ok(stale_len)
}
