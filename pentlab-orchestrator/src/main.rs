use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, put};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

mod hypervisor_manager;
mod logger;
mod provisioning;
mod requeue_job;
mod state_machine;
mod workflow;

use hypervisor_manager::{HypervisorManager, LabSettings};
use pentlab_common::bus::{
    DestroyVmCommand, ProvisionVmCommand, CHANNEL_ORCHESTRATOR_COMMANDS,
};
use pentlab_providers::{DriverError, Hypervisor};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

struct AppState {
    db: Pool<Postgres>,
    hv: Arc<dyn Hypervisor>,
    settings: LabSettings,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let redis_client = redis::Client::open(redis_url.clone()).unwrap();

    // Connect to Postgres
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to Postgres");

    sqlx::query("SELECT 1").execute(&pool).await.unwrap();
    println!("✅ Connected to Database");

    pentlab_common::schema::run_inline_migrations(&pool).await;

    let hv_name = HypervisorManager::current_hypervisor_name();
    let hv = HypervisorManager::get_hypervisor(&hv_name, pool.clone())
        .unwrap_or_else(|| panic!("Hypervisor '{}' is not configured", hv_name));
    let settings = LabSettings::from_env();
    println!(
        "🖥️ Using hypervisor '{}' on node '{}'",
        hv_name, settings.node
    );

    let state = Arc::new(AppState {
        db: pool,
        hv: hv.clone(),
        settings: settings.clone(),
    });

    // Event Listener (Redis Subscriber) on a dedicated PubSub connection
    let mut pubsub = redis_client.get_async_pubsub().await.unwrap();
    pubsub.subscribe(CHANNEL_ORCHESTRATOR_COMMANDS).await.unwrap();
    println!(
        "🎧 Orchestrator listening on Redis channel '{}'...",
        CHANNEL_ORCHESTRATOR_COMMANDS
    );

    let state_redis = state.clone();
    tokio::spawn(async move {
        use futures_util::StreamExt;
        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("⚠️ Bad pubsub payload: {}", e);
                    continue;
                }
            };
            println!("📩 Received Event: {}", payload);

            let Ok(event_json) = serde_json::from_str::<serde_json::Value>(&payload) else {
                eprintln!("⚠️ Event is not JSON: {}", payload);
                continue;
            };
            let event_type = event_json["type"].as_str().unwrap_or("");

            match event_type {
                "CMD:PROVISION_VM" => {
                    if let Ok(cmd) = serde_json::from_value::<ProvisionVmCommand>(event_json.clone())
                    {
                        let db = state_redis.db.clone();
                        let hv = state_redis.hv.clone();
                        let settings = state_redis.settings.clone();
                        tokio::spawn(async move {
                            provisioning::process_provisioning(
                                db,
                                hv,
                                settings,
                                cmd.vm_id,
                                cmd.run_id,
                                cmd.correlation_id,
                            )
                            .await;
                        });
                    }
                }
                "CMD:DESTROY_VM" => {
                    if let Ok(cmd) = serde_json::from_value::<DestroyVmCommand>(event_json.clone()) {
                        let db = state_redis.db.clone();
                        let hv = state_redis.hv.clone();
                        let settings = state_redis.settings.clone();
                        tokio::spawn(async move {
                            provisioning::process_destroy(
                                db,
                                hv,
                                settings,
                                cmd.vm_id,
                                cmd.correlation_id,
                            )
                            .await;
                        });
                    }
                }
                _ => eprintln!("⚠️ Unknown event type: {}", event_type),
            }
        }
    });

    // job-requeue (resume stale provisioning runs when pubsub events were missed)
    let db_requeue = state.db.clone();
    let hv_requeue = state.hv.clone();
    let settings_requeue = state.settings.clone();
    tokio::spawn(async move {
        requeue_job::run(db_requeue, hv_requeue, settings_requeue).await;
    });

    // Internal HTTP server (admin status, bridge inventory, pool lifecycle)
    let app = Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .route("/internal/bridges", get(list_bridges))
        .route(
            "/internal/activities/:id/pool",
            put(create_pool).delete(delete_pool),
        )
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], 8001));
    println!("Orchestrator listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn root() -> &'static str {
    "Pentlab Orchestrator Online (Postgres Backed)"
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let vm_count: i64 =
        sqlx::query_scalar("SELECT count(*) FROM vms WHERE status != 'destroyed'")
            .fetch_one(&state.db)
            .await
            .unwrap_or(0);
    let active_runs: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM provision_runs WHERE status IN ('pending', 'running')",
    )
    .fetch_one(&state.db)
    .await
    .unwrap_or(0);
    let reachable = state.hv.reachable().await;

    Json(json!({
        "vm_count": vm_count,
        "active_runs": active_runs,
        "hypervisor_reachable": reachable,
        "node": state.settings.node,
    }))
    .into_response()
}

/// Bridge inventory for the node. Returns 503 when the cluster is
/// unreachable so callers can show a placeholder instead of an error page.
async fn list_bridges(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.hv.list_bridges(&state.settings.node).await {
        Ok(bridges) => (StatusCode::OK, Json(json!({ "bridges": bridges }))).into_response(),
        Err(DriverError::NotConnected(msg)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "not_connected", "message": msg})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "hypervisor_error", "message": e.to_string()})),
        )
            .into_response(),
    }
}

async fn create_pool(
    State(state): State<Arc<AppState>>,
    Path(activity_id): Path<Uuid>,
) -> impl IntoResponse {
    match provisioning::create_activity_pool(&state.db, state.hv.as_ref(), activity_id).await {
        Ok(pool) => (StatusCode::CREATED, Json(json!({"pool": pool}))).into_response(),
        Err(e) => pool_error_response(e),
    }
}

async fn delete_pool(
    State(state): State<Arc<AppState>>,
    Path(activity_id): Path<Uuid>,
) -> impl IntoResponse {
    match provisioning::delete_activity_pool(&state.db, state.hv.as_ref(), activity_id).await {
        Ok(pool) => (StatusCode::OK, Json(json!({"pool": pool}))).into_response(),
        Err(e) => pool_error_response(e),
    }
}

fn pool_error_response(e: DriverError) -> axum::response::Response {
    match e {
        DriverError::NotConnected(msg) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "not_connected", "message": msg})),
        )
            .into_response(),
        DriverError::Vendor(msg) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "pool_conflict", "message": msg})),
        )
            .into_response(),
    }
}
