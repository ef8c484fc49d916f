//! Reverse-proxy bridging to sibling agents.
//!
//! A `/proxy/<machineId>/…` request resolves the machine id to a private
//! IPv6 address and is then forwarded one of two ways:
//!
//! - `preview/…` paths fetch `http://[ip]:<port>/…` (port from the `port`
//!   query parameter, default 5174) and stream the response back;
//! - everything else is a WebSocket bridged to `ws://[ip]:3000/…`, both
//!   directions forwarded frame-for-frame until either side closes.
//!
//! The bridge is deliberately blind: frames are not inspected, text and
//! binary framing is preserved, and closing one leg closes the other.

use axum::body::{Body, Bytes};
use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket};
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, Method, Response, StatusCode};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, warn};

/// Port previews default to when the `port` query parameter is absent.
pub const DEFAULT_PREVIEW_PORT: u16 = 5174;

/// Port sibling agents listen on for control/WS traffic.
pub const AGENT_PORT: u16 = 3000;

/// Where a proxied request should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTarget {
    /// Plain HTTP fetch of a user dev server.
    Preview(String),

    /// WebSocket bridge to the sibling agent.
    Bridge(String),
}

impl ProxyTarget {
    pub fn url(&self) -> &str {
        match self {
            ProxyTarget::Preview(url) | ProxyTarget::Bridge(url) => url,
        }
    }
}

/// Resolve the upstream target for a request path below the machine id.
///
/// `rest` is the remaining path without a leading slash; `port` is the
/// already-parsed `port` query parameter.
pub fn resolve_target(ip: &str, rest: &str, port: Option<u16>) -> ProxyTarget {
    let (first, remainder) = match rest.split_once('/') {
        Some((first, remainder)) => (first, remainder),
        None => (rest, ""),
    };

    if first == "preview" {
        let port = port.unwrap_or(DEFAULT_PREVIEW_PORT);
        ProxyTarget::Preview(format!("http://[{}]:{}/{}", ip, port, remainder))
    } else {
        ProxyTarget::Bridge(format!("ws://[{}]:{}/{}", ip, AGENT_PORT, rest))
    }
}

/// Re-serialise a query string without the `port` parameter the proxy
/// consumed; `None` when nothing else remains.
pub fn query_without_port(query: &str) -> Option<String> {
    let rest: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            !pair.is_empty() && pair.split('=').next().map(|k| k != "port").unwrap_or(true)
        })
        .collect();

    if rest.is_empty() {
        None
    } else {
        Some(rest.join("&"))
    }
}

/// Bridge an accepted client WebSocket to `target_url`.
///
/// Runs until either leg closes or errors; the other leg is closed in
/// response. Consumes the client socket either way.
pub async fn bridge(client: WebSocket, target_url: String) {
    let upstream = match connect_async(&target_url).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(target = %target_url, error = %e, "upstream connect failed; dropping client");
            let mut client = client;
            let _ = client
                .send(ClientMessage::Close(Some(ClientCloseFrame {
                    code: 1011,
                    reason: "upstream unavailable".into(),
                })))
                .await;
            return;
        }
    };

    debug!(target = %target_url, "proxy bridge established");

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let Some(forward) = client_to_upstream_message(message) else {
                continue;
            };
            if upstream_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let Some(forward) = upstream_to_client_message(message) else {
                continue;
            };
            if client_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
    debug!(target = %target_url, "proxy bridge closed");
}

/// Fetch `target_url` with the client's method/headers/body and stream
/// the response back.
pub async fn forward_http(
    http: &reqwest::Client,
    method: Method,
    target_url: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let mut request = http.request(method, target_url);
    for (name, value) in headers {
        if is_skipped_request_header(name) {
            continue;
        }
        request = request.header(name, value);
    }

    let upstream = match request.body(body).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(target = %target_url, error = %e, "preview fetch failed");
            return plain_response(
                StatusCode::BAD_GATEWAY,
                format!("upstream fetch failed: {}", e),
            );
        }
    };

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|e| {
            plain_response(
                StatusCode::BAD_GATEWAY,
                format!("failed to assemble upstream response: {}", e),
            )
        })
}

fn plain_response(status: StatusCode, message: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        // Infallible for a status + string body.
        .unwrap_or_default()
}

/// Headers never replayed towards the upstream.
fn is_skipped_request_header(name: &HeaderName) -> bool {
    name == axum::http::header::HOST || is_hop_by_hop(name)
}

/// RFC 7230 hop-by-hop headers, dropped in both directions.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn client_to_upstream_message(message: ClientMessage) -> Option<UpstreamMessage> {
    match message {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text)),
        ClientMessage::Binary(bytes) => Some(UpstreamMessage::Binary(bytes)),
        ClientMessage::Ping(bytes) => Some(UpstreamMessage::Ping(bytes)),
        ClientMessage::Pong(bytes) => Some(UpstreamMessage::Pong(bytes)),
        ClientMessage::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| {
            UpstreamCloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason,
            }
        }))),
    }
}

fn upstream_to_client_message(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text)),
        UpstreamMessage::Binary(bytes) => Some(ClientMessage::Binary(bytes)),
        UpstreamMessage::Ping(bytes) => Some(ClientMessage::Ping(bytes)),
        UpstreamMessage::Pong(bytes) => Some(ClientMessage::Pong(bytes)),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| {
            ClientCloseFrame {
                code: f.code.into(),
                reason: f.reason,
            }
        }))),
        // Raw frames never surface from a read loop.
        UpstreamMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_preview_paths_bridge_to_the_agent_port() {
        let target = resolve_target("fdaa:0:1::2", "rpc", None);
        assert_eq!(target, ProxyTarget::Bridge("ws://[fdaa:0:1::2]:3000/rpc".into()));

        let target = resolve_target("fdaa:0:1::2", "", None);
        assert_eq!(target, ProxyTarget::Bridge("ws://[fdaa:0:1::2]:3000/".into()));

        let target = resolve_target("fdaa:0:1::2", "a/b/c", Some(9000));
        assert_eq!(target, ProxyTarget::Bridge("ws://[fdaa:0:1::2]:3000/a/b/c".into()));
    }

    #[test]
    fn preview_paths_fetch_the_user_port() {
        let target = resolve_target("fdaa:0:1::2", "preview/", None);
        assert_eq!(
            target,
            ProxyTarget::Preview("http://[fdaa:0:1::2]:5174/".into())
        );

        let target = resolve_target("fdaa:0:1::2", "preview/assets/app.js", Some(8123));
        assert_eq!(
            target,
            ProxyTarget::Preview("http://[fdaa:0:1::2]:8123/assets/app.js".into())
        );

        // Bare "preview" with no trailing slash is still a preview of /.
        let target = resolve_target("fdaa:0:1::2", "preview", None);
        assert_eq!(
            target,
            ProxyTarget::Preview("http://[fdaa:0:1::2]:5174/".into())
        );
    }

    #[test]
    fn port_parameter_is_stripped_from_forwarded_queries() {
        assert_eq!(query_without_port("port=8123"), None);
        assert_eq!(
            query_without_port("port=8123&theme=dark"),
            Some("theme=dark".to_string())
        );
        assert_eq!(
            query_without_port("a=1&port=2&b=3"),
            Some("a=1&b=3".to_string())
        );
        assert_eq!(query_without_port(""), None);
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        use axum::http::header;
        assert!(is_hop_by_hop(&header::TRANSFER_ENCODING));
        assert!(is_hop_by_hop(&header::CONNECTION));
        assert!(!is_hop_by_hop(&header::CONTENT_TYPE));
        assert!(is_skipped_request_header(&header::HOST));
        assert!(!is_skipped_request_header(&header::AUTHORIZATION));
    }

    #[test]
    fn frames_survive_the_type_conversion_round_trip() {
        let text = client_to_upstream_message(ClientMessage::Text("hi".into()))
            .expect("text forwards");
        assert_eq!(text, UpstreamMessage::Text("hi".into()));

        let binary = upstream_to_client_message(UpstreamMessage::Binary(vec![1, 2, 3]))
            .expect("binary forwards");
        assert_eq!(binary, ClientMessage::Binary(vec![1, 2, 3]));

        let close = client_to_upstream_message(ClientMessage::Close(Some(ClientCloseFrame {
            code: 1000,
            reason: "done".into(),
        })))
        .expect("close forwards");
        match close {
            UpstreamMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason, "done");
            }
            other => panic!("unexpected conversion: {:?}", other),
        }
    }
}
