//! Orchestrator client and token verification.
//!
//! The orchestrator is the external control plane that creates machines
//! and resolves machine ids to their private IPv6 addresses. The agent
//! only needs three calls (create, inspect, resolve-ip); everything else
//! about the machines API is out of scope.
//!
//! Construction is lazy: [`MachinesHandle`] defers client creation to the
//! first request, so the HTTP server can bind and serve the control
//! channel before the orchestrator is reachable or even configured.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::debug;

use cabin_config::{AuthConfig, OrchestratorConfig};
use cabin_core::{AgentError, Result};

/// A machine as reported by the orchestrator.
///
/// Only the fields the agent interprets are typed; everything else is
/// passed through untouched so REST clients see the full object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Private IPv6 address inside the orchestrator's network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Client for the machines API.
#[derive(Debug)]
pub struct MachinesClient {
    http: reqwest::Client,
    api_base: String,
    api_token: String,
    app_name: String,
    image_ref: Option<String>,
}

impl MachinesClient {
    /// Build a client from configuration. Fails when the credentials the
    /// API requires are missing.
    pub fn from_config(cfg: &OrchestratorConfig) -> Result<Self> {
        let api_token = cfg.api_token.clone().ok_or_else(|| {
            AgentError::orchestrator("no API token configured (FLY_API_TOKEN)")
        })?;
        let app_name = cfg.app_name.clone().ok_or_else(|| {
            AgentError::orchestrator("no application configured (FLY_APP_NAME)")
        })?;

        Ok(Self {
            http: reqwest::Client::new(),
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            api_token,
            app_name,
            image_ref: cfg.image_ref.clone(),
        })
    }

    fn machines_url(&self, rest: &str) -> String {
        format!("{}/apps/{}/machines{}", self.api_base, self.app_name, rest)
    }

    /// Create a machine from the configured image.
    pub async fn create_machine(&self) -> Result<Machine> {
        let image = self.image_ref.as_deref().ok_or_else(|| {
            AgentError::orchestrator("no machine image configured (FLY_IMAGE_REF)")
        })?;

        let response = self
            .http
            .post(self.machines_url(""))
            .bearer_auth(&self.api_token)
            .json(&json!({ "config": { "image": image } }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::orchestrator(format!(
                "machine creation failed ({}): {}",
                status, body
            )));
        }

        let machine: Machine = response.json().await?;
        debug!(machine_id = %machine.id, "machine created");
        Ok(machine)
    }

    /// Inspect a machine by id.
    pub async fn get_machine(&self, id: &str) -> Result<Machine> {
        let response = self
            .http
            .get(self.machines_url(&format!("/{}", id)))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AgentError::MachineNotFound(id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::orchestrator(format!(
                "machine lookup failed ({}): {}",
                status, body
            )));
        }

        Ok(response.json().await?)
    }

    /// Resolve a machine id to its private IPv6 address.
    pub async fn machine_ip(&self, id: &str) -> Result<String> {
        let machine = self.get_machine(id).await?;
        machine.private_ip.ok_or_else(|| {
            AgentError::orchestrator(format!("machine '{}' has no private ip", id))
        })
    }
}

/// Lazily-initialised shared handle to the machines client.
///
/// The first caller pays the construction cost; configuration errors are
/// reported per request rather than at startup, so a container without
/// orchestrator credentials still serves its control channel.
#[derive(Debug)]
pub struct MachinesHandle {
    cfg: OrchestratorConfig,
    cell: OnceCell<MachinesClient>,
}

impl MachinesHandle {
    pub fn new(cfg: OrchestratorConfig) -> Self {
        Self {
            cfg,
            cell: OnceCell::new(),
        }
    }

    /// Get (or build) the underlying client.
    pub async fn get(&self) -> Result<&MachinesClient> {
        self.cell
            .get_or_try_init(|| async { MachinesClient::from_config(&self.cfg) })
            .await
    }
}

/// Token verification against the external auth service.
#[derive(Debug, Clone)]
pub struct AuthVerifier {
    http: reqwest::Client,
    verify_url: String,
}

impl AuthVerifier {
    pub fn from_config(cfg: &AuthConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            verify_url: format!(
                "{}/api/auth/verify",
                cfg.server_url.trim_end_matches('/')
            ),
        }
    }

    /// Verify a bearer token. `Ok(false)` means the service rejected the
    /// token; transport failures are auth errors too, so callers surface
    /// a single error code.
    pub async fn verify(&self, token: &str) -> Result<bool> {
        if token.is_empty() {
            return Err(AgentError::auth("missing token"));
        }

        let response = self
            .http
            .post(&self.verify_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AgentError::auth(format!("verification request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Ok(false);
        }

        Err(AgentError::auth(format!(
            "verification service returned {}",
            status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config() -> OrchestratorConfig {
        OrchestratorConfig {
            api_base: "https://api.machines.dev/v1/".to_string(),
            api_token: Some("tok".to_string()),
            app_name: Some("demo-app".to_string()),
            image_ref: Some("registry/image:tag".to_string()),
        }
    }

    #[test]
    fn client_requires_token_and_app() {
        let mut cfg = full_config();
        cfg.api_token = None;
        assert!(MachinesClient::from_config(&cfg).is_err());

        let mut cfg = full_config();
        cfg.app_name = None;
        assert!(MachinesClient::from_config(&cfg).is_err());

        assert!(MachinesClient::from_config(&full_config()).is_ok());
    }

    #[test]
    fn machine_urls_are_built_without_double_slashes() {
        let client = MachinesClient::from_config(&full_config()).expect("client");
        assert_eq!(
            client.machines_url(""),
            "https://api.machines.dev/v1/apps/demo-app/machines"
        );
        assert_eq!(
            client.machines_url("/m1"),
            "https://api.machines.dev/v1/apps/demo-app/machines/m1"
        );
    }

    #[test]
    fn machine_deserialises_with_passthrough_fields() {
        let machine: Machine = serde_json::from_str(
            r#"{
                "id": "e784079b",
                "state": "started",
                "private_ip": "fdaa:0:1::2",
                "region": "iad",
                "config": {"image": "x"}
            }"#,
        )
        .expect("deserialise");

        assert_eq!(machine.id, "e784079b");
        assert_eq!(machine.private_ip.as_deref(), Some("fdaa:0:1::2"));
        assert!(machine.extra.contains_key("region"));
        assert!(machine.extra.contains_key("config"));
    }

    #[tokio::test]
    async fn handle_reports_missing_credentials_per_request() {
        let handle = MachinesHandle::new(OrchestratorConfig::default());
        let err = handle.get().await.expect_err("no credentials");
        assert!(err.to_string().contains("FLY_API_TOKEN"));
        // And the error repeats on the next call instead of poisoning.
        assert!(handle.get().await.is_err());
    }

    #[test]
    fn verifier_builds_verify_url() {
        let verifier = AuthVerifier::from_config(&AuthConfig {
            server_url: "https://auth.example.dev/".to_string(),
        });
        assert_eq!(verifier.verify_url, "https://auth.example.dev/api/auth/verify");
    }

    #[tokio::test]
    async fn empty_token_is_rejected_without_a_request() {
        let verifier = AuthVerifier::from_config(&AuthConfig::default());
        let err = verifier.verify("").await.expect_err("empty token");
        assert_eq!(err.code(), "auth_error");
    }
}
