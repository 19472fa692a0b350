use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use sqlx::Postgres;
use std::sync::Arc;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::AppState;

#[derive(Deserialize, IntoParams)]
pub struct ListActionLogParams {
    pub vm_id: Option<Uuid>,
    pub component: Option<String>,
    pub status: Option<String>,
    pub action_type: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct ActionLogResponse {
    pub id: Uuid,
    pub action_type: String,
    pub component: String,
    pub status: String,
    pub error_message: Option<String>,
    pub vm_id: Option<Uuid>,
    pub duration_ms: Option<i32>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[utoipa::path(
    get,
    path = "/action_logs",
    params(ListActionLogParams),
    responses((status = 200, description = "Audit trail, newest first", body = Vec<ActionLogResponse>))
)]
pub async fn list_action_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListActionLogParams>,
) -> Json<Vec<ActionLogResponse>> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);

    let rows = sqlx::query_as::<Postgres, ActionLogResponse>(
        "SELECT id, action_type, component, status, error_message, vm_id,
                duration_ms, metadata, created_at, completed_at
         FROM action_logs
         WHERE ($1::uuid IS NULL OR vm_id = $1)
           AND ($2::text IS NULL OR component = $2)
           AND ($3::text IS NULL OR status = $3)
           AND ($4::text IS NULL OR action_type = $4)
         ORDER BY created_at DESC
         LIMIT $5",
    )
    .bind(params.vm_id)
    .bind(params.component)
    .bind(params.status)
    .bind(params.action_type)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    Json(rows)
}
