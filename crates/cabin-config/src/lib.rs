//! Configuration loading and types for the cabin agent.
//!
//! This crate is responsible for:
//! - Defining the configuration model consumed by the daemon and the
//!   server crates
//! - Loading configuration from TOML files
//! - Applying environment overrides for the variables the platform
//!   injects into the container (`AUTH_SERVER_URL`, `FLY_API_TOKEN`,
//!   `FLY_APP_NAME`, `FLY_IMAGE_REF`, `FLY_MACHINE_ID`, `APP_HOST`,
//!   `WORKSPACE_ROOT`, `PORT`)
//!
//! Inside a container the agent usually runs with no config file at all:
//! [`AgentConfig::default()`] plus the environment is a complete
//! configuration. The TOML file exists for local development and tests.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use cabin_core::{AgentError, Result};

/// Root configuration struct for the agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// HTTP/WS listener and public-URL settings.
    pub server: ServerConfig,

    /// Workspace-root confinement for filesystem operations.
    pub workspace: WorkspaceConfig,

    /// PTY helper binary settings.
    pub pty: PtyConfig,

    /// Listening-port scanner settings.
    pub scan: ScanConfig,

    /// Token verification service.
    pub auth: AuthConfig,

    /// Machine orchestrator credentials.
    pub orchestrator: OrchestratorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            workspace: WorkspaceConfig::default(),
            pty: PtyConfig::default(),
            scan: ScanConfig::default(),
            auth: AuthConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Listener configuration section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port the agent binds HTTP+WS on.
    pub port: u16,

    /// Public hostname used when building preview URLs in port events,
    /// e.g. `app.example.dev`.
    pub app_host: String,

    /// This machine's orchestrator id, used in preview URLs. Normally
    /// injected as `FLY_MACHINE_ID`; falls back to `local` when absent.
    pub machine_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            app_host: default_app_host(),
            machine_id: None,
        }
    }
}

/// Workspace confinement section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Absolute directory all filesystem operations are confined to.
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/workspace"),
        }
    }
}

/// PTY helper binary section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Container-install location of the helper; tried first.
    pub helper_path: PathBuf,

    /// Fallback location relative to the agent's working directory.
    pub fallback_relative: PathBuf,

    /// Value of the `COEP` environment variable handed to children.
    pub coep: String,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            helper_path: PathBuf::from("/usr/local/bin/cabin-pty"),
            fallback_relative: PathBuf::from("bin/cabin-pty"),
            coep: "credentialless".to_string(),
        }
    }
}

/// Port scanner section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan interval in milliseconds.
    pub interval_ms: u64,

    /// Ports excluded from reporting, in addition to the agent's own
    /// listening port.
    pub exclude_ports: Vec<u16>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            exclude_ports: Vec::new(),
        }
    }
}

/// Auth service section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base URL of the token verification service.
    pub server_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            server_url: default_auth_server_url(),
        }
    }
}

/// Orchestrator (machine control plane) section.
///
/// `api_token`, `app_name`, and `image_ref` have no sensible defaults:
/// they are normally injected as `FLY_API_TOKEN` / `FLY_APP_NAME` /
/// `FLY_IMAGE_REF`. The REST surface reports machine creation as
/// unavailable while they are missing; the rest of the agent works
/// without them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Base URL of the machines API.
    pub api_base: String,

    /// Bearer token for the machines API.
    pub api_token: Option<String>,

    /// Application the created machines belong to.
    pub app_name: Option<String>,

    /// Image new machines are created from.
    pub image_ref: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.machines.dev/v1".to_string(),
            api_token: None,
            app_name: None,
            image_ref: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_app_host() -> String {
    "localhost".to_string()
}

fn default_auth_server_url() -> String {
    "https://auth.agent8.dev".to_string()
}

/// Load configuration from a specific TOML file path.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<AgentConfig> {
    let path_ref = path.as_ref();
    let contents = fs::read_to_string(path_ref).map_err(|err| {
        AgentError::config(format!(
            "failed to read config file '{}': {}",
            path_ref.display(),
            err
        ))
    })?;

    let cfg: AgentConfig = toml::from_str(&contents).map_err(|err| {
        AgentError::invalid_config(
            path_ref.display().to_string(),
            format!("failed to parse config: {}", err),
        )
    })?;

    Ok(cfg)
}

/// Load configuration using the default search strategy, falling back to
/// built-in defaults when no file exists.
///
/// Search order:
/// 1. `/etc/cabin/cabin.toml`
/// 2. `./cabin.toml` (in the current working directory)
pub fn load_default() -> Result<AgentConfig> {
    let candidates = [
        PathBuf::from("/etc/cabin/cabin.toml"),
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("cabin.toml"),
    ];

    for candidate in &candidates {
        if candidate.exists() {
            return load_from_path(candidate);
        }
    }

    Ok(AgentConfig::default())
}

impl AgentConfig {
    /// Apply environment overrides on top of the loaded configuration.
    ///
    /// Environment always wins over the file: in a container, these
    /// variables are the authoritative source.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("AUTH_SERVER_URL") {
            self.auth.server_url = url;
        }
        if let Ok(token) = env::var("FLY_API_TOKEN") {
            self.orchestrator.api_token = Some(token);
        }
        if let Ok(app) = env::var("FLY_APP_NAME") {
            self.orchestrator.app_name = Some(app);
        }
        if let Ok(image) = env::var("FLY_IMAGE_REF") {
            self.orchestrator.image_ref = Some(image);
        }
        if let Ok(machine) = env::var("FLY_MACHINE_ID") {
            self.server.machine_id = Some(machine);
        }
        if let Ok(host) = env::var("APP_HOST") {
            self.server.app_host = host;
        }
        if let Ok(root) = env::var("WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(root);
        }
        if let Ok(port) = env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }
    }

    /// Structural validation, run once before startup.
    pub fn validate(&self) -> Result<()> {
        if !self.workspace.root.is_absolute() {
            return Err(AgentError::invalid_config(
                "workspace.root".to_string(),
                format!("must be absolute, got '{}'", self.workspace.root.display()),
            ));
        }
        if self.scan.interval_ms == 0 {
            return Err(AgentError::invalid_config(
                "scan.interval_ms",
                "must be greater than zero",
            ));
        }
        if self.auth.server_url.is_empty() {
            return Err(AgentError::invalid_config(
                "auth.server_url",
                "must not be empty",
            ));
        }
        Ok(())
    }

    /// Machine id used in public preview URLs.
    pub fn machine_id_or_local(&self) -> &str {
        self.server.machine_id.as_deref().unwrap_or("local")
    }
}
