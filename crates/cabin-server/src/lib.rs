//! HTTP+WS listener composition for the cabin agent.
//!
//! One listener serves three surfaces:
//!
//! - `GET /` upgraded to the control WebSocket (request/response mux plus
//!   push events),
//! - `/proxy/:machine_id/…` bridged or fetched towards sibling agents,
//! - `/api/machine*` REST routes for machine lifecycle.
//!
//! [`AgentServer::new`] wires the subsystems together; [`AgentServer::run`]
//! launches the port scanner and event pumps, binds the listener, and
//! serves connections with the http1 + upgrades loop.

pub mod events;
pub mod mux;
pub mod proxy;
pub mod registry;
pub mod rest;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use cabin_config::AgentConfig;
use cabin_fs::Workspace;
use cabin_machines::{AuthVerifier, MachinesHandle};
use cabin_ports::{PortScanner, ScannerConfig};
use cabin_proc::{ProcessEvent, ProcessSupervisor, PtyConfig};
use cabin_watch::{WatchConfig, WatchEvent, WatcherRegistry};

use registry::Connections;

/// Error type for the HTTP server.
#[derive(Debug)]
pub enum ServerError {
    /// Failed to bind on the requested address.
    BindFailed(String),
    /// The HTTP server encountered a runtime error.
    ServeFailed(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::BindFailed(msg) => write!(f, "failed to bind HTTP server: {}", msg),
            ServerError::ServeFailed(msg) => write!(f, "HTTP server error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub connections: Arc<Connections>,
    pub workspace: Arc<Workspace>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub watchers: Arc<WatcherRegistry>,
    pub ports: Arc<PortScanner>,
    pub machines: Arc<MachinesHandle>,
    pub auth: Arc<AuthVerifier>,
    /// Shared client for preview forwarding.
    pub http: reqwest::Client,
}

/// The assembled agent server.
pub struct AgentServer {
    state: AppState,
    bind_addr: SocketAddr,
    proc_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    watch_rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl AgentServer {
    /// Construct every subsystem from configuration.
    ///
    /// `bind_override` (the daemon's `--bind-addr`) beats the configured
    /// port; the effective listening port is always excluded from port
    /// scanning.
    pub fn new(config: AgentConfig, bind_override: Option<SocketAddr>) -> Self {
        let bind_addr = bind_override
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.server.port)));

        let pty = PtyConfig {
            helper_path: config.pty.helper_path.clone(),
            fallback_relative: config.pty.fallback_relative.clone(),
            coep: config.pty.coep.clone(),
            ..PtyConfig::default()
        };
        let (supervisor, proc_rx) = ProcessSupervisor::new(pty);

        let (watchers, watch_rx) =
            WatcherRegistry::new(config.workspace.root.clone(), WatchConfig::default());

        let mut exclude: BTreeSet<u16> = config.scan.exclude_ports.iter().copied().collect();
        exclude.insert(bind_addr.port());
        let ports = PortScanner::new(ScannerConfig {
            interval: Duration::from_millis(config.scan.interval_ms),
            exclude,
        });

        let machines = MachinesHandle::new(config.orchestrator.clone());
        let auth = AuthVerifier::from_config(&config.auth);
        let workspace = Workspace::new(config.workspace.root.clone());

        let state = AppState {
            config: Arc::new(config),
            connections: Arc::new(Connections::new()),
            workspace: Arc::new(workspace),
            supervisor: Arc::new(supervisor),
            watchers: Arc::new(watchers),
            ports: Arc::new(ports),
            machines: Arc::new(machines),
            auth: Arc::new(auth),
            http: reqwest::Client::new(),
        };

        Self {
            state,
            bind_addr,
            proc_rx,
            watch_rx,
        }
    }

    /// A handle to the shared state, e.g. for shutdown from the daemon.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the router over the given state.
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/", get(control_upgrade))
            .route("/proxy/:machine_id", any(proxy::proxy_root))
            .route("/proxy/:machine_id/*rest", any(proxy::proxy_rest))
            .merge(rest::rest_router())
            .with_state(state)
    }

    /// Run the server until it fails; `Ok` is never returned in normal
    /// operation (the daemon stops it by dropping the runtime on
    /// shutdown).
    pub async fn run(self) -> Result<(), ServerError> {
        let AgentServer {
            state,
            bind_addr,
            proc_rx,
            watch_rx,
        } = self;

        events::spawn_event_pumps(state.clone(), proc_rx, watch_rx);
        state.ports.spawn();

        let app = Self::router(state.clone());

        info!("cabin-server: binding HTTP server on {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ServerError::BindFailed(e.to_string()))?;
        info!("cabin-server: listening on {}", bind_addr);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("cabin-server: accept error: {}", e);
                    return Err(ServerError::ServeFailed(e.to_string()));
                }
            };

            let svc = app.clone();
            let io = TokioIo::new(stream);
            let conn = http1::Builder::new()
                .serve_connection(io, TowerToHyperService::new(svc))
                .with_upgrades();

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    error!("cabin-server: error serving {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// `GET /`: upgrade to a control socket.
async fn control_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| mux::handle_control_socket(state, socket))
}

/// The teardown sequence: kill every tracked child, close every watcher,
/// drop every connection record.
pub fn shutdown(state: &AppState) {
    info!("cabin-server: shutting down");
    state.supervisor.shutdown();
    state.watchers.clear();
    state.connections.clear();
}
