use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sqlx::Postgres;
use std::sync::Arc;
use uuid::Uuid;

use crate::orchestrator_proxy;
use crate::AppState;
use pentlab_common::{Activity, Tester};

#[derive(Deserialize, utoipa::ToSchema)]
pub struct ActivityRequest {
    pub activity_identifier: String,
    pub target_application_identifier: String,
    pub target_application_name: String,
}

#[derive(Deserialize, utoipa::ToSchema)]
pub struct AssignTestersRequest {
    pub tester_ids: Vec<Uuid>,
}

fn validate_activity(payload: &ActivityRequest) -> Option<&'static str> {
    if payload.activity_identifier.trim().is_empty()
        || payload.activity_identifier.trim().len() > 15
    {
        return Some("activity_identifier must be 1..=15 characters");
    }
    if payload.target_application_identifier.trim().is_empty()
        || payload.target_application_identifier.trim().len() > 10
    {
        return Some("target_application_identifier must be 1..=10 characters");
    }
    if payload.target_application_name.trim().is_empty()
        || payload.target_application_name.trim().len() > 50
    {
        return Some("target_application_name must be 1..=50 characters");
    }
    None
}

#[utoipa::path(
    get,
    path = "/activities",
    responses((status = 200, description = "List all activities", body = Vec<Activity>))
)]
pub async fn list_activities(State(state): State<Arc<AppState>>) -> Json<Vec<Activity>> {
    let rows = sqlx::query_as::<Postgres, Activity>(
        "SELECT id, activity_identifier, target_application_identifier,
                target_application_name, created_at
         FROM activities ORDER BY created_at DESC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    Json(rows)
}

#[utoipa::path(
    post,
    path = "/activities",
    request_body = ActivityRequest,
    responses(
        (status = 201, description = "Activity created", body = Activity),
        (status = 400, description = "Invalid payload"),
        (status = 409, description = "activity_identifier already used")
    )
)]
pub async fn create_activity(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ActivityRequest>,
) -> impl IntoResponse {
    if let Some(msg) = validate_activity(&payload) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response();
    }

    let row = sqlx::query_as::<Postgres, Activity>(
        "INSERT INTO activities
         (id, activity_identifier, target_application_identifier, target_application_name)
         VALUES ($1, $2, $3, $4)
         RETURNING id, activity_identifier, target_application_identifier,
                   target_application_name, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(payload.activity_identifier.trim())
    .bind(payload.target_application_identifier.trim())
    .bind(payload.target_application_name.trim())
    .fetch_one(&state.db)
    .await;

    match row {
        Ok(activity) => (StatusCode::CREATED, Json(activity)).into_response(),
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
    get,
    path = "/activities/{id}",
    params(("id" = Uuid, Path, description = "Activity UUID")),
    responses(
        (status = 200, description = "Activity details (with pool id)", body = serde_json::Value),
        (status = 404, description = "Activity not found")
    )
)]
pub async fn get_activity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let row = sqlx::query_as::<Postgres, Activity>(
        "SELECT id, activity_identifier, target_application_identifier,
                target_application_name, created_at
         FROM activities WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    match row {
        Some(activity) => {
            let pool = activity.pool_id();
            let mut body = serde_json::to_value(&activity).unwrap_or_default();
            body["pool_id"] = json!(pool);
            Json(body).into_response()
        }
        None => (StatusCode::NOT_FOUND, "Activity not found").into_response(),
    }
}

#[utoipa::path(
    put,
    path = "/activities/{id}",
    params(("id" = Uuid, Path, description = "Activity UUID")),
    request_body = ActivityRequest,
    responses(
        (status = 200, description = "Activity updated"),
        (status = 404, description = "Activity not found"),
        (status = 409, description = "Identifier locked while VMs exist")
    )
)]
pub async fn update_activity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ActivityRequest>,
) -> impl IntoResponse {
    if let Some(msg) = validate_activity(&payload) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    // The identifier names the remote pool; renaming it under provisioned
    // VMs would orphan them.
    let has_vms: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM vms WHERE activity_id = $1 AND vmid IS NOT NULL)",
    )
    .bind(id)
    .fetch_one(&state.db)
    .await
    .unwrap_or(false);

    let current_identifier: Option<String> =
        sqlx::query_scalar("SELECT activity_identifier FROM activities WHERE id = $1")
            .bind(id)
            .fetch_optional(&state.db)
            .await
            .unwrap_or(None);

    if has_vms && current_identifier.as_deref() != Some(payload.activity_identifier.trim()) {
        return (
            StatusCode::CONFLICT,
            "activity_identifier is locked while provisioned VMs exist",
        )
            .into_response();
    }

    let result = sqlx::query(
        "UPDATE activities
         SET activity_identifier = $2, target_application_identifier = $3,
             target_application_name = $4
         WHERE id = $1",
    )
    .bind(id)
    .bind(payload.activity_identifier.trim())
    .bind(payload.target_application_identifier.trim())
    .bind(payload.target_application_name.trim())
    .execute(&state.db)
    .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "Activity updated").into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "Activity not found").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/activities/{id}",
    params(("id" = Uuid, Path, description = "Activity UUID")),
    responses(
        (status = 200, description = "Activity deleted"),
        (status = 404, description = "Activity not found"),
        (status = 409, description = "Activity still has undestroyed VMs")
    )
)]
pub async fn delete_activity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let live_vms: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM vms WHERE activity_id = $1 AND status NOT IN ('unprovisioned', 'destroyed')",
    )
    .bind(id)
    .fetch_one(&state.db)
    .await
    .unwrap_or(0);

    if live_vms > 0 {
        return (
            StatusCode::CONFLICT,
            "Activity still has VMs; destroy them first",
        )
            .into_response();
    }

    let result = sqlx::query("DELETE FROM activities WHERE id = $1")
        .bind(id)
        .execute(&state.db)
        .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "Activity deleted").into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "Activity not found").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/activities/{id}/testers",
    params(("id" = Uuid, Path, description = "Activity UUID")),
    responses((status = 200, description = "Testers assigned to an activity", body = Vec<Tester>))
)]
pub async fn list_activity_testers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<Vec<Tester>> {
    let rows = sqlx::query_as::<Postgres, Tester>(
        "SELECT t.id, t.name, t.tester_identifier, t.company_id, t.created_at
         FROM activity_testers at
         JOIN testers t ON t.id = at.tester_id
         WHERE at.activity_id = $1
         ORDER BY t.name ASC",
    )
    .bind(id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    Json(rows)
}

#[utoipa::path(
    put,
    path = "/activities/{id}/testers",
    params(("id" = Uuid, Path, description = "Activity UUID")),
    request_body = AssignTestersRequest,
    responses(
        (status = 200, description = "Assignment replaced"),
        (status = 500, description = "Database error")
    )
)]
pub async fn assign_activity_testers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AssignTestersRequest>,
) -> impl IntoResponse {
    // Replace the whole assignment set atomically.
    let mut tx = match state.db.begin().await {
        Ok(tx) => tx,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    };

    if sqlx::query("DELETE FROM activity_testers WHERE activity_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .is_err()
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
    }

    for tester_id in &payload.tester_ids {
        if sqlx::query(
            "INSERT INTO activity_testers (activity_id, tester_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .bind(tester_id)
        .execute(&mut *tx)
        .await
        .is_err()
        {
            return (StatusCode::BAD_REQUEST, "Unknown tester in assignment").into_response();
        }
    }

    match tx.commit().await {
        Ok(()) => (StatusCode::OK, "Assignment replaced").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

#[utoipa::path(
    put,
    path = "/activities/{id}/pool",
    params(("id" = Uuid, Path, description = "Activity UUID")),
    responses(
        (status = 201, description = "Remote pool created"),
        (status = 409, description = "Pool already exists"),
        (status = 503, description = "Cluster unreachable")
    )
)]
pub async fn create_activity_pool(Path(id): Path<Uuid>) -> impl IntoResponse {
    orchestrator_proxy::forward(
        reqwest::Method::PUT,
        &format!("/internal/activities/{}/pool", id),
    )
    .await
}

#[utoipa::path(
    delete,
    path = "/activities/{id}/pool",
    params(("id" = Uuid, Path, description = "Activity UUID")),
    responses(
        (status = 200, description = "Remote pool deleted"),
        (status = 409, description = "Pool missing or not empty"),
        (status = 503, description = "Cluster unreachable")
    )
)]
pub async fn delete_activity_pool(Path(id): Path<Uuid>) -> impl IntoResponse {
    orchestrator_proxy::forward(
        reqwest::Method::DELETE,
        &format!("/internal/activities/{}/pool", id),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_payload_bounds() {
        let ok = ActivityRequest {
            activity_identifier: "ACME-Q3".into(),
            target_application_identifier: "CRM".into(),
            target_application_name: "Acme CRM".into(),
        };
        assert!(validate_activity(&ok).is_none());

        let too_long = ActivityRequest {
            activity_identifier: "X".repeat(16),
            target_application_identifier: "CRM".into(),
            target_application_name: "Acme CRM".into(),
        };
        assert!(validate_activity(&too_long).is_some());
    }
}
