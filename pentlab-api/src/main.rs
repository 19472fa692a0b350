use axum::routing::{get, post, put};
use axum::Router;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

mod action_logs;
mod activities;
mod api_docs;
mod bridges;
mod companies;
mod networks;
mod orchestrator_proxy;
mod simple_logger;
mod testers;
mod vms;

#[derive(Clone)]
pub struct AppState {
    pub redis_client: redis::Client,
    pub db: Pool<Postgres>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let client = redis::Client::open(redis_url).unwrap();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to Postgres");

    // Schema is shared with the orchestrator; every statement is idempotent.
    pentlab_common::schema::run_inline_migrations(&pool).await;

    let state = Arc::new(AppState {
        redis_client: client,
        db: pool,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/api-docs/openapi.json", get(api_docs::openapi_json))
        // Companies
        .route(
            "/companies",
            get(companies::list_companies).post(companies::create_company),
        )
        .route(
            "/companies/:id",
            get(companies::get_company)
                .put(companies::update_company)
                .delete(companies::delete_company),
        )
        // Testers + static addresses
        .route(
            "/testers",
            get(testers::list_testers).post(testers::create_tester),
        )
        .route(
            "/testers/:id",
            get(testers::get_tester)
                .put(testers::update_tester)
                .delete(testers::delete_tester),
        )
        .route(
            "/testers/:id/ips",
            get(testers::list_tester_ips).post(testers::create_tester_ip),
        )
        .route(
            "/tester_ips/:id",
            axum::routing::delete(testers::delete_tester_ip),
        )
        // Activities (1:1 with a remote resource pool)
        .route(
            "/activities",
            get(activities::list_activities).post(activities::create_activity),
        )
        .route(
            "/activities/:id",
            get(activities::get_activity)
                .put(activities::update_activity)
                .delete(activities::delete_activity),
        )
        .route(
            "/activities/:id/testers",
            get(activities::list_activity_testers).put(activities::assign_activity_testers),
        )
        .route(
            "/activities/:id/pool",
            put(activities::create_activity_pool).delete(activities::delete_activity_pool),
        )
        // Networks + live bridge inventory
        .route(
            "/networks",
            get(networks::list_networks).post(networks::create_network),
        )
        .route(
            "/networks/bridges",
            get(bridges::list_bridges_for_select),
        )
        .route(
            "/networks/:id",
            axum::routing::put(networks::update_network).delete(networks::delete_network),
        )
        // VMs + provisioning commands
        .route("/vms", get(vms::list_vms).post(vms::create_vm))
        .route(
            "/vms/:id",
            get(vms::get_vm).put(vms::update_vm).delete(vms::delete_vm),
        )
        .route(
            "/vms/:id/provision",
            post(vms::provision_vm).get(vms::get_provision_run),
        )
        .route("/vms/:id/destroy", post(vms::destroy_vm))
        // Audit trail
        .route("/action_logs", get(action_logs::list_action_logs))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8003));
    println!("Pentlab API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn root() -> &'static str {
    "Pentlab API (Control Plane) - CQRS Enabled"
}
