use sqlx::{Pool, Postgres};

/// Inline schema migrations. Both planes run this on startup; every
/// statement is idempotent (IF NOT EXISTS / ON CONFLICT) so order of
/// startup does not matter.
pub async fn run_inline_migrations(pool: &Pool<Postgres>) {
    println!("📦 Running Migrations (Inline Schema)...");

    let schema_sql = r#"
        CREATE TYPE vm_status AS ENUM (
            'unprovisioned', 'provisioning', 'provisioned',
            'provisioning_failed', 'destroying', 'destroyed'
        );
        CREATE TYPE vm_os AS ENUM ('win7', 'win10', 'kali');
        CREATE TYPE run_status AS ENUM ('pending', 'running', 'succeeded', 'failed');
        CREATE TYPE step_status AS ENUM ('running', 'done', 'failed', 'compensated');

        CREATE TABLE IF NOT EXISTS companies (
            id UUID PRIMARY KEY,
            name VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS testers (
            id UUID PRIMARY KEY,
            name VARCHAR(50) NOT NULL,
            tester_identifier VARCHAR(10) NOT NULL,
            company_id UUID NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS tester_ip_addresses (
            id UUID PRIMARY KEY,
            tester_id UUID NOT NULL REFERENCES testers(id) ON DELETE CASCADE,
            ip INET NOT NULL,
            cidr INTEGER NOT NULL DEFAULT 25,
            gateway INET
        );
        CREATE TABLE IF NOT EXISTS activities (
            id UUID PRIMARY KEY,
            activity_identifier VARCHAR(15) NOT NULL UNIQUE,
            target_application_identifier VARCHAR(10) NOT NULL,
            target_application_name VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS activity_testers (
            activity_id UUID NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
            tester_id UUID NOT NULL REFERENCES testers(id) ON DELETE CASCADE,
            PRIMARY KEY (activity_id, tester_id)
        );
        CREATE TABLE IF NOT EXISTS networks (
            id UUID PRIMARY KEY,
            network_description VARCHAR(20) NOT NULL,
            bridge_name VARCHAR(10) NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS vms (
            id UUID PRIMARY KEY,
            name VARCHAR(50) NOT NULL,
            os vm_os NOT NULL,
            ram_mb INTEGER NOT NULL,
            cpu_cores INTEGER NOT NULL,
            activity_id UUID NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
            vmid BIGINT,
            status vm_status NOT NULL DEFAULT 'unprovisioned',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS vm_networks (
            id UUID PRIMARY KEY,
            vm_id UUID NOT NULL REFERENCES vms(id) ON DELETE CASCADE,
            network_id UUID NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
            tester_ip_id UUID REFERENCES tester_ip_addresses(id) ON DELETE SET NULL,
            UNIQUE (vm_id, network_id)
        );

        CREATE TABLE IF NOT EXISTS provision_runs (
            id UUID PRIMARY KEY,
            vm_id UUID NOT NULL REFERENCES vms(id) ON DELETE CASCADE,
            status run_status NOT NULL DEFAULT 'pending',
            current_step TEXT,
            attempt INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            lease_until TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            completed_at TIMESTAMPTZ
        );
        CREATE UNIQUE INDEX IF NOT EXISTS provision_runs_one_active
            ON provision_runs (vm_id)
            WHERE status IN ('pending', 'running');

        CREATE TABLE IF NOT EXISTS provision_steps (
            run_id UUID NOT NULL REFERENCES provision_runs(id) ON DELETE CASCADE,
            step TEXT NOT NULL,
            status step_status NOT NULL DEFAULT 'running',
            output JSONB,
            error_message TEXT,
            started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            completed_at TIMESTAMPTZ,
            PRIMARY KEY (run_id, step)
        );

        CREATE TABLE IF NOT EXISTS action_logs (
            id UUID PRIMARY KEY,
            action_type VARCHAR(50) NOT NULL,
            component VARCHAR(20) NOT NULL,
            status VARCHAR(20) NOT NULL,
            error_message TEXT,
            vm_id UUID,
            duration_ms INTEGER,
            metadata JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            completed_at TIMESTAMPTZ
        );
        CREATE INDEX IF NOT EXISTS action_logs_vm_idx ON action_logs (vm_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS mock_hv_pools (
            poolid TEXT PRIMARY KEY,
            comment TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS mock_hv_vms (
            vmid BIGINT PRIMARY KEY,
            node TEXT NOT NULL,
            name TEXT NOT NULL,
            pool TEXT,
            config JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
    "#;

    for statement in schema_sql.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            // CREATE TYPE has no IF NOT EXISTS; re-runs fail harmlessly.
            let _ = sqlx::query(stmt).execute(pool).await;
        }
    }

    let db_updates = vec![
        r#"ALTER TABLE vms ADD COLUMN IF NOT EXISTS error_message TEXT"#,
        r#"ALTER TABLE vms ADD COLUMN IF NOT EXISTS provisioned_at TIMESTAMPTZ"#,
        r#"ALTER TABLE vms ADD COLUMN IF NOT EXISTS destroyed_at TIMESTAMPTZ"#,
        r#"ALTER TABLE provision_runs ADD COLUMN IF NOT EXISTS pool_created BOOLEAN NOT NULL DEFAULT FALSE"#,
    ];

    for stmt in db_updates {
        let _ = sqlx::query(stmt).execute(pool).await;
    }

    println!("✅ Migrations (Inline) Applied");
}
