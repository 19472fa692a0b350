use sqlx::{Pool, Postgres};
use uuid::Uuid;

/// VM status transitions as conditional UPDATEs. Every function returns
/// whether the transition actually happened; callers must check the bool
/// instead of assuming the row was in the expected state.
pub struct VmStateMachine;

impl VmStateMachine {
    /// unprovisioned | provisioning_failed -> provisioning
    pub async fn to_provisioning(db: &Pool<Postgres>, vm_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE vms SET status = 'provisioning', error_message = NULL
             WHERE id = $1 AND status IN ('unprovisioned', 'provisioning_failed')",
        )
        .bind(vm_id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// provisioning -> provisioned, persisting the vmid exactly once.
    /// The `vmid IS NULL` condition makes a duplicate or replayed run a
    /// no-op rather than an overwrite.
    pub async fn to_provisioned(
        db: &Pool<Postgres>,
        vm_id: Uuid,
        vmid: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE vms SET vmid = $2, status = 'provisioned', provisioned_at = NOW()
             WHERE id = $1 AND status = 'provisioning' AND vmid IS NULL",
        )
        .bind(vm_id)
        .bind(vmid)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// provisioning -> provisioning_failed
    pub async fn to_failed(
        db: &Pool<Postgres>,
        vm_id: Uuid,
        error_message: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE vms SET status = 'provisioning_failed', error_message = $2
             WHERE id = $1 AND status = 'provisioning'",
        )
        .bind(vm_id)
        .bind(error_message)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// provisioned -> destroying
    pub async fn to_destroying(db: &Pool<Postgres>, vm_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE vms SET status = 'destroying'
             WHERE id = $1 AND status = 'provisioned'",
        )
        .bind(vm_id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// destroying -> destroyed. Keeps vmid for the audit trail.
    pub async fn to_destroyed(db: &Pool<Postgres>, vm_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE vms SET status = 'destroyed', destroyed_at = NOW()
             WHERE id = $1 AND status = 'destroying'",
        )
        .bind(vm_id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
