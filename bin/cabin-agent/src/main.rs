use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser};
use cabin_config::{load_default, load_from_path, AgentConfig};
use cabin_core::AgentError;
use cabin_server::AgentServer;
use tracing::info;

/// cabind - the in-container workspace agent
///
/// cabind exposes the container's filesystem, process execution, and port
/// visibility to remote clients over a single WebSocket, and forwards
/// `/proxy/<machineId>/…` traffic to sibling agents.
///
/// Configuration discovery rules:
/// 1. If `--config PATH` (or `-c PATH`) is provided, that path is used.
/// 2. Otherwise, `cabin_config::load_default()` probes:
///    - `/etc/cabin/cabin.toml`
///    - `./cabin.toml`
///    and falls back to built-in defaults when neither exists.
///
/// Environment variables (AUTH_SERVER_URL, FLY_API_TOKEN, FLY_APP_NAME,
/// FLY_IMAGE_REF, FLY_MACHINE_ID, APP_HOST, WORKSPACE_ROOT, PORT) always
/// override the file.
#[derive(Debug, Parser)]
#[command(
    name = "cabind",
    version,
    about = "cabin workspace agent",
    long_about = "cabind is the in-container agent of the cabin platform: it multiplexes filesystem, process, watch, and auth operations over one WebSocket, publishes port and file-change events, and reverse-proxies traffic to sibling machines.",
    disable_help_subcommand = true
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When provided, this path is used instead of the default search
    /// locations.
    #[arg(long = "config", short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level for cabind (overrides RUST_LOG if set).
    ///
    /// Accepts standard tracing levels (trace, debug, info, warn, error)
    /// or a full filter expression (e.g. "info,cabin_server=debug").
    #[arg(long = "log-level", short = 'L', value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print loaded configuration summary and exit without starting the
    /// agent.
    #[arg(long = "print-config", action = ArgAction::SetTrue)]
    print_config: bool,

    /// Optional address for the HTTP server to bind on.
    ///
    /// Defaults to 0.0.0.0 on the configured port.
    #[arg(long = "bind-addr", value_name = "ADDR")]
    bind_addr: Option<String>,

    /// Validate configuration and exit without starting the agent.
    #[arg(long = "check-config", action = ArgAction::SetTrue)]
    check_config: bool,
}

fn main() {
    let cli = Cli::parse();

    // Initialise telemetry as early as possible so subsequent logs use
    // the configured subscriber.
    if let Err(err) = cabin_telemetry::init(cli.log_level.as_deref()) {
        eprintln!("cabind: failed to initialise telemetry: {}", err);
        process::exit(1);
    }

    let config_result: Result<AgentConfig, AgentError> = if let Some(ref path) = cli.config {
        match load_from_path(path) {
            Ok(cfg) => {
                tracing::info!("loaded configuration from {}", path.display());
                Ok(cfg)
            }
            Err(err) => {
                tracing::error!(
                    "failed to load configuration from {}: {}",
                    path.display(),
                    err
                );
                Err(err)
            }
        }
    } else {
        match load_default() {
            Ok(cfg) => Ok(cfg),
            Err(err) => {
                tracing::error!("failed to load configuration from default locations: {err}");
                Err(err)
            }
        }
    };

    let mut config = match config_result {
        Ok(cfg) => cfg,
        Err(_) => {
            // Error already printed above; exit with a non-zero status.
            process::exit(1);
        }
    };

    config.apply_env_overrides();

    if let Err(err) = config.validate() {
        tracing::error!("configuration validation failed: {}", err);
        process::exit(1);
    }

    if cli.check_config {
        tracing::info!("configuration is valid");
        return;
    }

    if cli.print_config {
        print_config_summary(&config);
        return;
    }

    let bind_addr = match resolve_bind_addr(&cli) {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!("invalid bind address: {}", err);
            process::exit(1);
        }
    };

    let server = AgentServer::new(config, bind_addr);

    if let Err(err) = run_server_blocking(server) {
        tracing::error!("cabin agent terminated with error: {}", err);
        process::exit(1);
    }
}

/// Parse the optional `--bind-addr` flag.
fn resolve_bind_addr(cli: &Cli) -> Result<Option<SocketAddr>, String> {
    match cli.bind_addr.as_deref() {
        None => Ok(None),
        Some(addr_str) => addr_str
            .parse::<SocketAddr>()
            .map(Some)
            .map_err(|e| format!("failed to parse --bind-addr '{}': {}", addr_str, e)),
    }
}

/// Run the agent server on a multi-thread Tokio runtime, shutting down
/// cleanly on SIGINT.
fn run_server_blocking(server: AgentServer) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let state = server.state();

        tokio::select! {
            result = server.run() => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt; shutting down");
                cabin_server::shutdown(&state);
            }
        }

        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}

/// Print a concise summary of the loaded configuration.
fn print_config_summary(cfg: &AgentConfig) {
    println!("cabind configuration summary:");
    println!("  server.port         = {}", cfg.server.port);
    println!("  server.app_host     = {}", cfg.server.app_host);
    println!(
        "  server.machine_id   = {}",
        cfg.server.machine_id.as_deref().unwrap_or("<not set>")
    );
    println!("  workspace.root      = {}", cfg.workspace.root.display());
    println!("  pty.helper_path     = {}", cfg.pty.helper_path.display());
    println!("  pty.coep            = {}", cfg.pty.coep);
    println!("  scan.interval_ms    = {}", cfg.scan.interval_ms);
    println!(
        "  scan.exclude_ports  = [{}]",
        cfg.scan
            .exclude_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  auth.server_url     = {}", cfg.auth.server_url);
    println!(
        "  orchestrator.app    = {}",
        cfg.orchestrator.app_name.as_deref().unwrap_or("<not set>")
    );
    println!(
        "  orchestrator.image  = {}",
        cfg.orchestrator.image_ref.as_deref().unwrap_or("<not set>")
    );
    println!(
        "  orchestrator.token  = {}",
        if cfg.orchestrator.api_token.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
}
