use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sqlx::Postgres;
use std::net::Ipv4Addr;
use std::sync::Arc;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::AppState;
use pentlab_common::{Tester, TesterIpAddress};

#[derive(Deserialize, utoipa::ToSchema)]
pub struct TesterRequest {
    pub name: String,
    pub tester_identifier: String,
    pub company_id: Uuid,
}

#[derive(Deserialize, IntoParams)]
pub struct ListTesterParams {
    pub company_id: Option<Uuid>,
}

#[derive(Deserialize, utoipa::ToSchema)]
pub struct TesterIpRequest {
    pub ip: String,
    pub cidr: Option<i32>,
    pub gateway: Option<String>,
}

fn validate_tester(payload: &TesterRequest) -> Option<&'static str> {
    if payload.name.trim().is_empty() || payload.name.trim().len() > 50 {
        return Some("name must be 1..=50 characters");
    }
    if payload.tester_identifier.trim().is_empty() || payload.tester_identifier.trim().len() > 10 {
        return Some("tester_identifier must be 1..=10 characters");
    }
    None
}

fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    s.trim().parse().ok()
}

#[utoipa::path(
    get,
    path = "/testers",
    params(ListTesterParams),
    responses((status = 200, description = "List testers, optionally by company", body = Vec<Tester>))
)]
pub async fn list_testers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListTesterParams>,
) -> Json<Vec<Tester>> {
    let rows = sqlx::query_as::<Postgres, Tester>(
        "SELECT id, name, tester_identifier, company_id, created_at
         FROM testers
         WHERE ($1::uuid IS NULL OR company_id = $1)
         ORDER BY name ASC",
    )
    .bind(params.company_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    Json(rows)
}

#[utoipa::path(
    post,
    path = "/testers",
    request_body = TesterRequest,
    responses(
        (status = 201, description = "Tester created", body = Tester),
        (status = 400, description = "Invalid payload")
    )
)]
pub async fn create_tester(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TesterRequest>,
) -> impl IntoResponse {
    if let Some(msg) = validate_tester(&payload) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response();
    }

    let row = sqlx::query_as::<Postgres, Tester>(
        "INSERT INTO testers (id, name, tester_identifier, company_id)
         VALUES ($1, $2, $3, $4)
         RETURNING id, name, tester_identifier, company_id, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(payload.name.trim())
    .bind(payload.tester_identifier.trim())
    .bind(payload.company_id)
    .fetch_one(&state.db)
    .await;

    match row {
        Ok(tester) => (StatusCode::CREATED, Json(tester)).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "db_error", "message": e.to_string()})),
        )
            .into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/testers/{id}",
    params(("id" = Uuid, Path, description = "Tester UUID")),
    responses(
        (status = 200, description = "Tester details", body = Tester),
        (status = 404, description = "Tester not found")
    )
)]
pub async fn get_tester(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let row = sqlx::query_as::<Postgres, Tester>(
        "SELECT id, name, tester_identifier, company_id, created_at FROM testers WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    match row {
        Some(tester) => Json(tester).into_response(),
        None => (StatusCode::NOT_FOUND, "Tester not found").into_response(),
    }
}

#[utoipa::path(
    put,
    path = "/testers/{id}",
    params(("id" = Uuid, Path, description = "Tester UUID")),
    request_body = TesterRequest,
    responses(
        (status = 200, description = "Tester updated"),
        (status = 404, description = "Tester not found")
    )
)]
pub async fn update_tester(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TesterRequest>,
) -> impl IntoResponse {
    if let Some(msg) = validate_tester(&payload) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    let result = sqlx::query(
        "UPDATE testers SET name = $2, tester_identifier = $3, company_id = $4 WHERE id = $1",
    )
    .bind(id)
    .bind(payload.name.trim())
    .bind(payload.tester_identifier.trim())
    .bind(payload.company_id)
    .execute(&state.db)
    .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "Tester updated").into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "Tester not found").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/testers/{id}",
    params(("id" = Uuid, Path, description = "Tester UUID")),
    responses(
        (status = 200, description = "Tester deleted (addresses cascade)"),
        (status = 404, description = "Tester not found")
    )
)]
pub async fn delete_tester(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let result = sqlx::query("DELETE FROM testers WHERE id = $1")
        .bind(id)
        .execute(&state.db)
        .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "Tester deleted").into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "Tester not found").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/testers/{id}/ips",
    params(("id" = Uuid, Path, description = "Tester UUID")),
    responses((status = 200, description = "Static addresses of a tester", body = Vec<TesterIpAddress>))
)]
pub async fn list_tester_ips(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<Vec<TesterIpAddress>> {
    let rows = sqlx::query_as::<Postgres, TesterIpAddress>(
        "SELECT id, tester_id, ip::text as ip, cidr, gateway::text as gateway
         FROM tester_ip_addresses
         WHERE tester_id = $1
         ORDER BY ip ASC",
    )
    .bind(id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    Json(rows)
}

#[utoipa::path(
    post,
    path = "/testers/{id}/ips",
    params(("id" = Uuid, Path, description = "Tester UUID")),
    request_body = TesterIpRequest,
    responses(
        (status = 201, description = "Address created", body = TesterIpAddress),
        (status = 400, description = "Invalid address")
    )
)]
pub async fn create_tester_ip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TesterIpRequest>,
) -> impl IntoResponse {
    let Some(ip) = parse_ipv4(&payload.ip) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "ip must be a valid IPv4 address"})),
        )
            .into_response();
    };
    let cidr = payload.cidr.unwrap_or(25);
    if !(1..=32).contains(&cidr) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "cidr must be 1..=32"})),
        )
            .into_response();
    }
    let gateway = match payload.gateway.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(g) => match parse_ipv4(g) {
            Some(gw) => Some(gw),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "gateway must be a valid IPv4 address"})),
                )
                    .into_response()
            }
        },
        None => None,
    };

    let row = sqlx::query_as::<Postgres, TesterIpAddress>(
        "INSERT INTO tester_ip_addresses (id, tester_id, ip, cidr, gateway)
         VALUES ($1, $2, $3::inet, $4, $5::inet)
         RETURNING id, tester_id, ip::text as ip, cidr, gateway::text as gateway",
    )
    .bind(Uuid::new_v4())
    .bind(id)
    .bind(ip.to_string())
    .bind(cidr)
    .bind(gateway.map(|g| g.to_string()))
    .fetch_one(&state.db)
    .await;

    match row {
        Ok(addr) => (StatusCode::CREATED, Json(addr)).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "db_error", "message": e.to_string()})),
        )
            .into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/tester_ips/{id}",
    params(("id" = Uuid, Path, description = "Address UUID")),
    responses(
        (status = 200, description = "Address deleted"),
        (status = 404, description = "Address not found")
    )
)]
pub async fn delete_tester_ip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let result = sqlx::query("DELETE FROM tester_ip_addresses WHERE id = $1")
        .bind(id)
        .execute(&state.db)
        .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => (StatusCode::OK, "Address deleted").into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "Address not found").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_parsing() {
        assert!(parse_ipv4("10.0.0.5").is_some());
        assert!(parse_ipv4(" 192.168.1.1 ").is_some());
        assert!(parse_ipv4("10.0.0.5/24").is_none());
        assert!(parse_ipv4("not-an-ip").is_none());
        assert!(parse_ipv4("::1").is_none());
    }

    #[test]
    fn tester_payload_bounds() {
        let ok = TesterRequest {
            name: "Alice".into(),
            tester_identifier: "AL".into(),
            company_id: Uuid::new_v4(),
        };
        assert!(validate_tester(&ok).is_none());

        let bad = TesterRequest {
            name: "".into(),
            tester_identifier: "AL".into(),
            company_id: Uuid::new_v4(),
        };
        assert!(validate_tester(&bad).is_some());

        let bad_ident = TesterRequest {
            name: "Alice".into(),
            tester_identifier: "TOOLONGIDENT".into(),
            company_id: Uuid::new_v4(),
        };
        assert!(validate_tester(&bad_ident).is_some());
    }
}
