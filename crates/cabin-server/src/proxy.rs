//! `/proxy/<machineId>/…` entry points.
//!
//! The machine id is resolved to its private IPv6 address through the
//! orchestrator, then the request is handed to the proxy crate: WebSocket
//! upgrades are bridged, `preview/…` paths are fetched over HTTP. A plain
//! HTTP request on a non-preview path has no forwardable target (that
//! target is a WebSocket URL) and is rejected.

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use cabin_core::AgentError;
use cabin_proxy::{bridge, forward_http, query_without_port, resolve_target, ProxyTarget};

use crate::AppState;

/// `/proxy/:machine_id`: no path below the machine id.
#[allow(clippy::too_many_arguments)]
pub async fn proxy_root(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    proxy_request(state, machine_id, String::new(), ws, method, headers, query, body).await
}

/// `/proxy/:machine_id/*rest`.
#[allow(clippy::too_many_arguments)]
pub async fn proxy_rest(
    State(state): State<AppState>,
    Path((machine_id, rest)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    proxy_request(state, machine_id, rest, ws, method, headers, query, body).await
}

#[allow(clippy::too_many_arguments)]
async fn proxy_request(
    state: AppState,
    machine_id: String,
    rest: String,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
) -> Response {
    let ip = match resolve_ip(&state, &machine_id).await {
        Ok(ip) => ip,
        Err(rejection) => return rejection,
    };

    let port = query.as_deref().and_then(port_param);
    let target = resolve_target(&ip, &rest, port);
    debug!(machine_id = %machine_id, target = %target.url(), "proxying request");

    match (ws, target) {
        (Some(upgrade), target) => {
            // Upgrades on preview paths (e.g. HMR sockets) bridge to the
            // WebSocket flavour of the preview URL.
            let url = match target {
                ProxyTarget::Bridge(url) => url,
                ProxyTarget::Preview(url) => http_to_ws_url(url),
            };
            upgrade
                .on_upgrade(move |socket| bridge(socket, url))
                .into_response()
        }
        (None, ProxyTarget::Preview(url)) => {
            let url = match query.as_deref().and_then(query_without_port) {
                Some(remaining) => format!("{}?{}", url, remaining),
                None => url,
            };
            forward_http(&state.http, method, &url, &headers, body).await
        }
        (None, ProxyTarget::Bridge(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "WebSocket upgrade required for non-preview proxy paths"
            })),
        )
            .into_response(),
    }
}

/// Machine id → private IPv6, with the orchestrator's failures mapped to
/// HTTP rejections.
async fn resolve_ip(state: &AppState, machine_id: &str) -> Result<String, Response> {
    let client = state.machines.get().await.map_err(|e| {
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "orchestrator unavailable", "details": e.to_string() })),
        )
            .into_response()
    })?;

    match client.machine_ip(machine_id).await {
        Ok(ip) => Ok(ip),
        Err(AgentError::MachineNotFound(_)) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown machine", "details": machine_id })),
        )
            .into_response()),
        Err(e) => Err((
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "machine resolution failed", "details": e.to_string() })),
        )
            .into_response()),
    }
}

/// Parse the `port` query parameter, ignoring everything else.
fn port_param(query: &str) -> Option<u16> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("port="))
        .and_then(|value| value.parse().ok())
}

fn http_to_ws_url(url: String) -> String {
    url.replacen("http://", "ws://", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_param_parses_only_the_port_pair() {
        assert_eq!(port_param("port=8123"), Some(8123));
        assert_eq!(port_param("theme=dark&port=8123"), Some(8123));
        assert_eq!(port_param("theme=dark"), None);
        assert_eq!(port_param("port=notaport"), None);
        assert_eq!(port_param(""), None);
    }

    #[test]
    fn preview_urls_upgrade_to_websocket_scheme() {
        assert_eq!(
            http_to_ws_url("http://[fdaa::1]:5174/hmr".to_string()),
            "ws://[fdaa::1]:5174/hmr"
        );
    }
}
