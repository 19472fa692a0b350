use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::orchestrator_proxy;

#[derive(Deserialize)]
struct BridgeItem {
    iface: String,
    comment: Option<String>,
}

/// Shape bridges for a select widget: one `{id, text}` entry per bridge.
fn select_results(bridges: &[BridgeItem]) -> Value {
    let results: Vec<Value> = bridges
        .iter()
        .map(|b| {
            let text = match b.comment.as_deref().filter(|c| !c.trim().is_empty()) {
                Some(comment) => format!("{} ({})", b.iface, comment),
                None => b.iface.clone(),
            };
            json!({"id": b.iface, "text": text})
        })
        .collect();
    json!({"results": results, "more": false})
}

/// One disabled, non-selectable row carrying a message.
fn error_row(text: &str) -> Value {
    json!({
        "results": [{"text": text, "disabled": true}],
        "more": false
    })
}

fn unreachable_placeholder() -> Value {
    error_row("Could not connect to Proxmox!")
}

/// GET /networks/bridges - live bridge inventory for the network form.
/// Proxied to the orchestrator. When the cluster (or the orchestrator
/// itself) is down the widget gets the connectivity placeholder; other
/// hypervisor errors keep their own message.
#[utoipa::path(
    get,
    path = "/networks/bridges",
    responses(
        (status = 200, description = "Bridges available on the node", body = serde_json::Value),
        (status = 500, description = "Cluster unreachable or hypervisor error (disabled item)", body = serde_json::Value)
    )
)]
pub async fn list_bridges_for_select() -> impl IntoResponse {
    match orchestrator_proxy::fetch_json(reqwest::Method::GET, "/internal/bridges").await {
        Ok((status, body)) if status.is_success() => {
            let bridges: Vec<BridgeItem> =
                serde_json::from_value(body["bridges"].clone()).unwrap_or_default();
            (StatusCode::OK, Json(select_results(&bridges))).into_response()
        }
        // 503 means the orchestrator answered but cannot reach the cluster;
        // an unreachable orchestrator reads the same to the widget.
        Ok((StatusCode::SERVICE_UNAVAILABLE, _)) | Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(unreachable_placeholder()),
        )
            .into_response(),
        Ok((_, body)) => {
            let message = body["message"].as_str().unwrap_or("Hypervisor error");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error_row(message))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_bridges_with_and_without_comment() {
        let bridges = vec![
            BridgeItem {
                iface: "vmbr0".into(),
                comment: Some("management".into()),
            },
            BridgeItem {
                iface: "vmbr1".into(),
                comment: None,
            },
        ];
        let shaped = select_results(&bridges);
        assert_eq!(shaped["more"], false);
        assert_eq!(shaped["results"][0]["id"], "vmbr0");
        assert_eq!(shaped["results"][0]["text"], "vmbr0 (management)");
        assert_eq!(shaped["results"][1]["text"], "vmbr1");
    }

    #[test]
    fn empty_inventory_is_valid() {
        let shaped = select_results(&[]);
        assert_eq!(shaped["results"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn placeholder_row_is_disabled() {
        let shaped = unreachable_placeholder();
        assert_eq!(shaped["results"][0]["text"], "Could not connect to Proxmox!");
        assert_eq!(shaped["results"][0]["disabled"], true);
        assert!(shaped["results"][0].get("id").is_none());
    }

    #[test]
    fn vendor_errors_keep_their_message() {
        let shaped = error_row("VM 101 does not exist");
        assert_eq!(shaped["results"][0]["text"], "VM 101 does not exist");
        assert_eq!(shaped["results"][0]["disabled"], true);
        assert_eq!(shaped["more"], false);
    }
}
