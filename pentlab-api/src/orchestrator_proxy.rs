use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

pub fn orchestrator_internal_url() -> String {
    std::env::var("ORCHESTRATOR_INTERNAL_URL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "http://orchestrator:8001".to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Forward a bodyless request to the orchestrator's internal surface and
/// relay status + body unchanged. Only the orchestrator owns a hypervisor
/// handle, so cluster-touching calls route through it.
pub async fn forward(method: reqwest::Method, path: &str) -> axum::response::Response {
    let base = orchestrator_internal_url();
    let url = format!("{}/{}", base, path.trim_start_matches('/'));

    match reqwest::Client::new().request(method, url).send().await {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let bytes = resp.bytes().await.unwrap_or_default();
            (status, bytes).into_response()
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": "orchestrator_unreachable", "message": e.to_string()})),
        )
            .into_response(),
    }
}

/// Same as forward but hands the parsed payload back to the caller for
/// reshaping instead of relaying it.
pub async fn fetch_json(
    method: reqwest::Method,
    path: &str,
) -> Result<(StatusCode, serde_json::Value), String> {
    let base = orchestrator_internal_url();
    let url = format!("{}/{}", base, path.trim_start_matches('/'));

    let resp = reqwest::Client::new()
        .request(method, url)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = resp.json().await.map_err(|e| e.to_string())?;
    Ok((status, body))
}
