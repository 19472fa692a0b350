use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sqlx::Postgres;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use pentlab_common::Network;

#[derive(Deserialize, utoipa::ToSchema)]
pub struct NetworkRequest {
    pub network_description: String,
    pub bridge_name: String,
}

fn validate_network(payload: &NetworkRequest) -> Option<&'static str> {
    if payload.network_description.trim().is_empty()
        || payload.network_description.trim().len() > 20
    {
        return Some("network_description must be 1..=20 characters");
    }
    let bridge = payload.bridge_name.trim();
    if bridge.is_empty() || bridge.len() > 10 {
        return Some("bridge_name must be 1..=10 characters");
    }
    None
}

#[utoipa::path(
    get,
    path = "/networks",
    responses((status = 200, description = "List all networks", body = Vec<Network>))
)]
pub async fn list_networks(State(state): State<Arc<AppState>>) -> Json<Vec<Network>> {
    let rows = sqlx::query_as::<Postgres, Network>(
        "SELECT id, network_description, bridge_name FROM networks ORDER BY bridge_name ASC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    Json(rows)
}

#[utoipa::path(
    post,
    path = "/networks",
    request_body = NetworkRequest,
    responses(
        (status = 201, description = "Network created", body = Network),
        (status = 409, description = "bridge_name already used")
    )
)]
pub async fn create_network(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NetworkRequest>,
) -> impl IntoResponse {
    if let Some(msg) = validate_network(&payload) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response();
    }

    let row = sqlx::query_as::<Postgres, Network>(
        "INSERT INTO networks (id, network_description, bridge_name)
         VALUES ($1, $2, $3)
         RETURNING id, network_description, bridge_name",
    )
    .bind(Uuid::new_v4())
    .bind(payload.network_description.trim())
    .bind(payload.bridge_name.trim())
    .fetch_one(&state.db)
    .await;

    match row {
        Ok(network) => (StatusCode::CREATED, Json(network)).into_response(),
        Err(e) => {
            let is_unique = matches!(&e, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"));
            let status = if is_unique {
                StatusCode::CONFLICT
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (
                status,
                Json(json!({"error": "db_error", "message": e.to_string()})),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    put,
    path = "/networks/{id}",
    params(("id" = Uuid, Path, description = "Network UUID")),
    request_body = NetworkRequest,
    responses(
        (status = 200, description = "Network updated"),
        (status = 404, description = "Network not found")
    )
)]
pub async fn update_network(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<NetworkRequest>,
) -> impl IntoResponse {
    if let Some(msg) = validate_network(&payload) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    let result =
        sqlx::query("UPDATE networks SET network_description = $2, bridge_name = $3 WHERE id = $1")
            .bind(id)
            .bind(payload.network_description.trim())
            .bind(payload.bridge_name.trim())
            .execute(&state.db)
            .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "Network updated").into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "Network not found").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/networks/{id}",
    params(("id" = Uuid, Path, description = "Network UUID")),
    responses(
        (status = 200, description = "Network deleted"),
        (status = 404, description = "Network not found"),
        (status = 409, description = "Network still attached to VMs")
    )
)]
pub async fn delete_network(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let in_use: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1 FROM vm_networks vn
            JOIN vms v ON v.id = vn.vm_id
            WHERE vn.network_id = $1 AND v.status NOT IN ('unprovisioned', 'destroyed')
         )",
    )
    .bind(id)
    .fetch_one(&state.db)
    .await
    .unwrap_or(false);

    if in_use {
        return (
            StatusCode::CONFLICT,
            "Network is attached to live VMs",
        )
            .into_response();
    }

    let result = sqlx::query("DELETE FROM networks WHERE id = $1")
        .bind(id)
        .execute(&state.db)
        .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "Network deleted").into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "Network not found").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}
