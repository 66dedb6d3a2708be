//! Workflow trigger adapters.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use pairwise_core::{Error, RequestContext, Result, WorkflowStartRequest, WorkflowTrigger};
use pairwise_vision::bearer_header;

pub const ENV_WORKFLOW_BASE_URL: &str = "WORKFLOW_BASE_URL";
pub const ENV_WORKFLOW_SERVICE_TOKEN: &str = "WORKFLOW_SERVICE_TOKEN";
pub const ENV_WORKFLOW_TIMEOUT_SECS: &str = "WORKFLOW_TIMEOUT_SECS";

pub const WORKFLOW_START_PATH: &str = "/api/workflows/start";

const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 15;

/// Trigger used when no workflow engine is configured. Every start fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledWorkflowTrigger;

#[async_trait]
impl WorkflowTrigger for DisabledWorkflowTrigger {
    async fn start(&self, _ctx: &RequestContext, request: &WorkflowStartRequest) -> Result<String> {
        Err(Error::Workflow(format!(
            "no workflow engine configured (workflow_map_id={})",
            request.workflow_map_id
        )))
    }
}

/// Starts workflows through the engine's HTTP API.
///
/// `POST {base}/api/workflows/start` with the request as JSON; the process
/// id is read from `process_id` or `id` in the response.
#[derive(Debug, Clone)]
pub struct HttpWorkflowTrigger {
    client: Client,
    base_url: String,
    service_token: Option<String>,
}

impl HttpWorkflowTrigger {
    pub fn new(base_url: impl Into<String>, timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        info!(
            subsystem = "dedup",
            component = "workflow",
            base_url = %base_url,
            "Initializing workflow trigger"
        );
        Ok(Self {
            client,
            base_url,
            service_token: None,
        })
    }

    pub fn with_service_token(mut self, token: impl Into<String>) -> Self {
        self.service_token = Some(token.into());
        self
    }

    /// Build from the environment. `None` when no base URL is set.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(base_url) = std::env::var(ENV_WORKFLOW_BASE_URL)
            .ok()
            .filter(|u| !u.trim().is_empty())
        else {
            return Ok(None);
        };
        let timeout = std::env::var(ENV_WORKFLOW_TIMEOUT_SECS)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WORKFLOW_TIMEOUT_SECS);
        let mut trigger = Self::new(base_url, timeout)?;
        if let Some(token) = std::env::var(ENV_WORKFLOW_SERVICE_TOKEN)
            .ok()
            .filter(|t| !t.trim().is_empty())
        {
            trigger = trigger.with_service_token(token);
        }
        Ok(Some(trigger))
    }
}

#[async_trait]
impl WorkflowTrigger for HttpWorkflowTrigger {
    async fn start(&self, ctx: &RequestContext, request: &WorkflowStartRequest) -> Result<String> {
        let url = format!("{}{}", self.base_url, WORKFLOW_START_PATH);
        let mut req = self
            .client
            .post(&url)
            .header("X-Request-ID", ctx.request_id.to_string())
            .json(&json!({
                "workflow_map_id": request.workflow_map_id,
                "record_id": request.record_id,
                "source_file_id": request.source_file_id,
                "target_file_id": request.target_file_id,
                "started_by": ctx.actor(),
            }));
        let token = ctx
            .authorization
            .as_deref()
            .or(self.service_token.as_deref());
        if let Some(value) = token.and_then(bearer_header) {
            req = req.header("Authorization", value);
        }
        if let Some(tenant) = &ctx.tenant_id {
            req = req.header("X-Tenant-ID", tenant);
        }
        if let Some(org) = &ctx.org_id {
            req = req.header("X-Org-ID", org);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::Workflow(format!("workflow start request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Workflow(format!(
                "workflow start returned {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| Error::Workflow(format!("invalid workflow start response: {e}")))?;
        let process_id = ["process_id", "id"]
            .iter()
            .find_map(|k| match body.get(*k) {
                Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(JsonValue::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| Error::Workflow("workflow start response has no process id".into()))?;

        debug!(
            subsystem = "dedup",
            component = "workflow",
            workflow_map_id = %request.workflow_map_id,
            process_id = %process_id,
            "Workflow started"
        );
        Ok(process_id)
    }
}
