//! Push-event fan-out.
//!
//! Three pumps bridge subsystem event channels onto client sockets:
//!
//! - process output/exit → the pid's subscribers,
//! - debounced file changes → the watcher's subscribers,
//! - port open/close → every connected client.
//!
//! Pump failures are logged and swallowed; nothing here may surface into
//! client control flow.

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cabin_core::EventEnvelope;
use cabin_proc::{ProcessEvent, StreamKind};
use cabin_watch::WatchEvent;

use crate::AppState;

/// Launch all three fan-out pumps.
pub fn spawn_event_pumps(
    state: AppState,
    proc_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    watch_rx: mpsc::UnboundedReceiver<WatchEvent>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(pump_process_events(state.clone(), proc_rx)),
        tokio::spawn(pump_watch_events(state.clone(), watch_rx)),
        tokio::spawn(pump_port_events(state)),
    ]
}

async fn pump_process_events(
    state: AppState,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        let subscribers = state.connections.process_subscribers(event.pid);

        if !subscribers.is_empty() {
            let envelope = EventEnvelope::new(
                "process",
                json!({
                    "pid": event.pid,
                    "stream": event.stream.as_str(),
                    "data": event.data,
                }),
            );
            match serde_json::to_string(&envelope) {
                Ok(text) => {
                    for ws_id in &subscribers {
                        state.connections.send_to(ws_id, text.clone());
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialise process event"),
            }
        }

        if event.stream == StreamKind::Exit {
            state.connections.drop_process(event.pid);
            debug!(pid = event.pid, "process subscriptions dropped after exit");
        }
    }
}

async fn pump_watch_events(state: AppState, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
    while let Some(event) = events.recv().await {
        let subscribers = state.watchers.subscribers(&event.watcher_id);
        if subscribers.is_empty() {
            continue;
        }

        let envelope = EventEnvelope::new(
            "file-change",
            json!({
                "watcherId": event.watcher_id,
                "eventType": event.kind.as_str(),
                "filename": event.filename,
            }),
        );
        match serde_json::to_string(&envelope) {
            Ok(text) => {
                for ws_id in &subscribers {
                    state.connections.send_to(ws_id, text.clone());
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise file-change event"),
        }
    }
}

async fn pump_port_events(state: AppState) {
    let mut events = state.ports.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let message = json!({
                    "type": "port",
                    "data": {
                        "port": event.port,
                        "type": event.change.as_str(),
                        "url": preview_url(&state, event.port),
                    },
                });
                match serde_json::to_string(&message) {
                    Ok(text) => state.connections.broadcast(&text),
                    Err(e) => warn!(error = %e, "failed to serialise port event"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "port event pump lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Public preview URL for a port on this machine.
fn preview_url(state: &AppState, port: u16) -> String {
    format!(
        "https://{}/proxy/{}/preview/?port={}",
        state.config.server.app_host,
        state.config.machine_id_or_local(),
        port
    )
}
