//! Control-channel multiplexer.
//!
//! One task per connection reads frames; each parsed request is handled
//! on its own task, so slow operations never block the socket and
//! responses may arrive out of order; clients correlate by `id`. A frame
//! that fails to parse as an envelope carries no id to answer with, so it
//! is logged and dropped. Operation failures always come back as response
//! envelopes; the connection itself is never closed over them.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cabin_core::{AgentError, Operation, RequestEnvelope, ResponseEnvelope, Result};

use crate::AppState;

/// Drive one control connection to completion.
pub async fn handle_control_socket(state: AppState, socket: WebSocket) {
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    let ws_id = state.connections.register(outbox_tx);
    info!(ws_id = %ws_id, "control connection established");

    let (mut sink, mut stream) = socket.split();

    // Writer task: the only place that touches the sink, so concurrent
    // handlers and event pumps all funnel through the outbox.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let envelope: RequestEnvelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        // No id to respond with; log and move on.
                        warn!(ws_id = %ws_id, error = %e, "dropping unparseable frame");
                        continue;
                    }
                };

                let state = state.clone();
                let ws_id = ws_id.clone();
                tokio::spawn(async move {
                    let response = handle_request(&state, &ws_id, envelope).await;
                    match serde_json::to_string(&response) {
                        Ok(text) => {
                            state.connections.send_to(&ws_id, text);
                        }
                        Err(e) => {
                            warn!(ws_id = %ws_id, error = %e, "failed to serialise response")
                        }
                    }
                });
            }
            Ok(Message::Binary(_)) => {
                debug!(ws_id = %ws_id, "ignoring binary frame on control channel");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!(ws_id = %ws_id, error = %e, "control socket read error");
                break;
            }
        }
    }

    // Disconnect cleanup: subscriptions go away, processes keep running.
    state.connections.deregister(&ws_id);
    state.watchers.unsubscribe(&ws_id);
    writer.abort();
    info!(
        ws_id = %ws_id,
        remaining = state.connections.connection_count(),
        "control connection closed"
    );
}

/// Turn one request envelope into exactly one response envelope.
pub async fn handle_request(
    state: &AppState,
    ws_id: &str,
    envelope: RequestEnvelope,
) -> ResponseEnvelope {
    let RequestEnvelope { id, operation } = envelope;

    let operation = match Operation::from_value(operation) {
        Ok(operation) => operation,
        Err(err) => return ResponseEnvelope::failure(id, &err),
    };

    match dispatch(state, ws_id, operation).await {
        Ok(Value::Null) => ResponseEnvelope::ok(id, None),
        Ok(data) => ResponseEnvelope::ok(id, Some(data)),
        Err(err) => ResponseEnvelope::failure(id, &err),
    }
}

/// Route an operation to its handler.
async fn dispatch(state: &AppState, ws_id: &str, operation: Operation) -> Result<Value> {
    match operation {
        Operation::ReadFile { path, encoding } => {
            state.workspace.read_file(&path, encoding.as_deref()).await
        }
        Operation::WriteFile {
            path,
            content,
            encoding,
        } => {
            state
                .workspace
                .write_file(&path, content.as_deref(), encoding.as_deref())
                .await
        }
        Operation::Rm { path, recursive } => state.workspace.remove(&path, recursive).await,
        Operation::Readdir { path } => state.workspace.read_dir(&path).await,
        Operation::Mkdir { path, recursive } => state.workspace.make_dir(&path, recursive).await,
        Operation::Stat { path } => state.workspace.stat(&path).await,
        Operation::Mount { path, content } => {
            state
                .workspace
                .mount(path.as_deref(), content.as_ref())
                .await
        }

        Operation::Spawn { command, args } => {
            // Subscribe inside the spawn callback so the child's first
            // output chunk cannot beat the subscription.
            let pid = state
                .supervisor
                .spawn(&command, &args, |pid| {
                    state.connections.subscribe_process(ws_id, pid)
                })
                .await?;
            Ok(json!({ "pid": pid }))
        }
        Operation::Input { pid, data } => {
            state.supervisor.input(pid, &data).await?;
            Ok(Value::Null)
        }
        Operation::Kill { pid } => {
            state.supervisor.kill(pid)?;
            Ok(Value::Null)
        }
        Operation::Resize { pid, cols, rows } => {
            state.supervisor.resize(pid, cols, rows).await?;
            Ok(Value::Null)
        }

        Operation::Watch {
            patterns,
            persistent: _,
        } => {
            let watcher_id = state.watchers.watch(&patterns, ws_id)?;
            Ok(json!({ "watcherId": watcher_id }))
        }
        Operation::WatchPaths { include } => {
            let watcher_id = state.watchers.watch(&include, ws_id)?;
            Ok(json!({ "watcherId": watcher_id }))
        }

        Operation::Auth { token } => {
            if !state.auth.verify(&token).await? {
                return Err(AgentError::auth("token verification failed"));
            }
            state.connections.set_auth_token(ws_id, &token);
            Ok(json!({ "authenticated": true }))
        }
    }
}
