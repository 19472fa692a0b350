use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use sqlx::Postgres;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use pentlab_common::Company;

#[derive(Deserialize, utoipa::ToSchema)]
pub struct CompanyRequest {
    pub name: String,
}

#[utoipa::path(
    get,
    path = "/companies",
    responses((status = 200, description = "List all companies", body = Vec<Company>))
)]
pub async fn list_companies(State(state): State<Arc<AppState>>) -> Json<Vec<Company>> {
    let rows = sqlx::query_as::<Postgres, Company>(
        "SELECT id, name, created_at FROM companies ORDER BY name ASC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    Json(rows)
}

#[utoipa::path(
    post,
    path = "/companies",
    request_body = CompanyRequest,
    responses(
        (status = 201, description = "Company created", body = Company),
        (status = 400, description = "Invalid name")
    )
)]
pub async fn create_company(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CompanyRequest>,
) -> impl IntoResponse {
    let name = payload.name.trim();
    if name.is_empty() || name.len() > 50 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "name must be 1..=50 characters"})),
        )
            .into_response();
    }

    let id = Uuid::new_v4();
    let row = sqlx::query_as::<Postgres, Company>(
        "INSERT INTO companies (id, name) VALUES ($1, $2) RETURNING id, name, created_at",
    )
    .bind(id)
    .bind(name)
    .fetch_one(&state.db)
    .await;

    match row {
        Ok(company) => (StatusCode::CREATED, Json(company)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "db_error", "message": e.to_string()})),
        )
            .into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/companies/{id}",
    params(("id" = Uuid, Path, description = "Company UUID")),
    responses(
        (status = 200, description = "Company details", body = Company),
        (status = 404, description = "Company not found")
    )
)]
pub async fn get_company(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let row = sqlx::query_as::<Postgres, Company>(
        "SELECT id, name, created_at FROM companies WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    match row {
        Some(company) => Json(company).into_response(),
        None => (StatusCode::NOT_FOUND, "Company not found").into_response(),
    }
}

#[utoipa::path(
    put,
    path = "/companies/{id}",
    params(("id" = Uuid, Path, description = "Company UUID")),
    request_body = CompanyRequest,
    responses(
        (status = 200, description = "Company updated"),
        (status = 404, description = "Company not found")
    )
)]
pub async fn update_company(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompanyRequest>,
) -> impl IntoResponse {
    let name = payload.name.trim();
    if name.is_empty() || name.len() > 50 {
        return (StatusCode::BAD_REQUEST, "name must be 1..=50 characters").into_response();
    }

    let result = sqlx::query("UPDATE companies SET name = $2 WHERE id = $1")
        .bind(id)
        .bind(name)
        .execute(&state.db)
        .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "Company updated").into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "Company not found").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/companies/{id}",
    params(("id" = Uuid, Path, description = "Company UUID")),
    responses(
        (status = 200, description = "Company deleted (testers cascade)"),
        (status = 404, description = "Company not found")
    )
)]
pub async fn delete_company(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let result = sqlx::query("DELETE FROM companies WHERE id = $1")
        .bind(id)
        .execute(&state.db)
        .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "Company deleted").into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "Company not found").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}
