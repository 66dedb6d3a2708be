//! HTTP client for the vision similarity service.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use pairwise_core::{
    Artifact, Error, MatchQuery, MatchResponse, RequestContext, Result, SimilarityMatcher,
    WireVersion,
};

use crate::config::VisionConfig;
use crate::modes::{normalize_legacy_mode, to_v2_mode};

pub const V2_SEARCH_PATH: &str = "/api/v2/search";
pub const V1_SEARCH_PATH: &str = "/api/search";
pub const INDEX_ADD_PATH: &str = "/api/index/add";
pub const HEALTH_PATH: &str = "/health";

/// Longest upstream body excerpt carried in an error message.
const ERROR_BODY_LIMIT: usize = 500;

/// Outcome of a single HTTP attempt, before classification.
#[derive(Debug)]
enum AttemptError {
    /// Connection refused, DNS failure or timeout.
    Unreachable(String),
    /// Non-success status with a body excerpt.
    Status(u16, String),
    Other(Error),
}

/// Client for the vision service's versioned search API.
///
/// Searches try v2 first and fall back to v1 when v2 is unreachable or
/// answers with one of [`VisionConfig::fallback_statuses`].
#[derive(Debug, Clone)]
pub struct VisionClient {
    client: Client,
    config: VisionConfig,
}

impl VisionClient {
    pub fn new(config: VisionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "vision",
            base_url = %config.base_url,
            timeout_secs = config.timeout_seconds,
            "Initializing vision client"
        );

        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(VisionConfig::from_env())
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Attach credential and correlation headers.
    fn with_headers(&self, mut req: RequestBuilder, ctx: &RequestContext) -> RequestBuilder {
        let token = ctx
            .authorization
            .as_deref()
            .or(self.config.service_token.as_deref());
        if let Some(value) = token.and_then(bearer_header) {
            req = req.header("Authorization", value);
        }
        req = req.header("X-Request-ID", ctx.request_id.to_string());
        if let Some(tenant) = &ctx.tenant_id {
            req = req.header("X-Tenant-ID", tenant);
        }
        if let Some(org) = &ctx.org_id {
            req = req.header("X-Org-ID", org);
        }
        req
    }

    fn file_part(filename: &str, bytes: &[u8]) -> Part {
        Part::bytes(bytes.to_vec()).file_name(filename.to_string())
    }

    fn v2_form(query: &MatchQuery) -> Form {
        let mode = normalize_legacy_mode(&query.mode);
        Form::new()
            .part("file", Self::file_part(&query.filename, &query.bytes))
            .text("mode", to_v2_mode(&mode).to_string())
            .text("max_results", query.max_results.to_string())
            .text("compute_diff", "false")
            .text("exclude_self", query.exclude_self.to_string())
            .text("enable_ml", "false")
            .text("enable_geometric", "false")
    }

    fn v1_form(query: &MatchQuery) -> Form {
        Form::new()
            .part("file", Self::file_part(&query.filename, &query.bytes))
            .text("mode", normalize_legacy_mode(&query.mode))
            .text("phash_threshold", query.phash_threshold.to_string())
            .text("feature_threshold", query.feature_threshold.to_string())
            .text("max_results", query.max_results.to_string())
            .text("exclude_self", query.exclude_self.to_string())
            .text("diff_top_k", "0")
    }

    async fn send_json(
        &self,
        req: RequestBuilder,
    ) -> std::result::Result<JsonValue, AttemptError> {
        let response = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                AttemptError::Unreachable(e.to_string())
            } else {
                AttemptError::Other(Error::Request(format!("Request failed: {}", e)))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(AttemptError::Status(status.as_u16(), excerpt));
        }

        response.json::<JsonValue>().await.map_err(|e| {
            AttemptError::Other(Error::Request(format!("Failed to parse response: {}", e)))
        })
    }

    /// Map an attempt failure to the retry classification the queue uses.
    fn classify(&self, operation: &str, err: AttemptError) -> Error {
        match err {
            AttemptError::Unreachable(msg) => {
                Error::Request(format!("vision {} unreachable: {}", operation, msg))
            }
            AttemptError::Status(status, body) if self.config.is_permanent(status) => {
                Error::Fatal(format!(
                    "vision {} rejected input ({}): {}",
                    operation, status, body
                ))
            }
            AttemptError::Status(status, body) => {
                Error::Request(format!("vision {} failed ({}): {}", operation, status, body))
            }
            AttemptError::Other(e) => e,
        }
    }
}

/// Normalize a credential to a `Bearer` header value. Blank tokens yield
/// nothing; an existing scheme prefix is kept.
pub fn bearer_header(token: &str) -> Option<String> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    let has_scheme = token
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bearer "));
    if has_scheme {
        Some(token.to_string())
    } else {
        Some(format!("Bearer {}", token))
    }
}

#[async_trait]
impl SimilarityMatcher for VisionClient {
    #[instrument(skip(self, ctx, query), fields(subsystem = "vision", op = "search", request_id = %ctx.request_id))]
    async fn search(&self, ctx: &RequestContext, query: &MatchQuery) -> Result<MatchResponse> {
        let start = Instant::now();
        let v2 = self.with_headers(
            self.client
                .post(self.url(V2_SEARCH_PATH))
                .multipart(Self::v2_form(query)),
            ctx,
        );

        match self.send_json(v2).await {
            Ok(body) => {
                debug!(
                    version = "v2",
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Vision search complete"
                );
                return Ok(MatchResponse {
                    version: WireVersion::V2,
                    body,
                });
            }
            Err(AttemptError::Unreachable(msg)) => {
                warn!(error = %msg, "Vision v2 search unreachable, falling back to v1");
            }
            Err(AttemptError::Status(status, _)) if self.config.falls_back_on(status) => {
                warn!(status, "Vision v2 search rejected, falling back to v1");
            }
            Err(other) => return Err(self.classify("search", other)),
        }

        let v1 = self.with_headers(
            self.client
                .post(self.url(V1_SEARCH_PATH))
                .multipart(Self::v1_form(query)),
            ctx,
        );
        let body = self
            .send_json(v1)
            .await
            .map_err(|e| self.classify("search", e))?;

        debug!(
            version = "v1",
            duration_ms = start.elapsed().as_millis() as u64,
            "Vision search complete"
        );
        Ok(MatchResponse {
            version: WireVersion::V1,
            body,
        })
    }

    #[instrument(skip(self, ctx, artifact), fields(subsystem = "vision", op = "index_add", file_id = %artifact.file_id))]
    async fn index_add(
        &self,
        ctx: &RequestContext,
        artifact: &Artifact,
        user_name: Option<&str>,
    ) -> Result<JsonValue> {
        let user_name = user_name
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| ctx.actor());
        let form = Form::new().part("file", Self::file_part(&artifact.filename, &artifact.bytes));
        let req = self.with_headers(
            self.client
                .post(self.url(INDEX_ADD_PATH))
                .query(&[("user_name", user_name), ("upload_to_s3", "false")])
                .multipart(form),
            ctx,
        );
        self.send_json(req)
            .await
            .map_err(|e| self.classify("index add", e))
    }

    async fn health(&self, ctx: &RequestContext) -> Result<JsonValue> {
        let req = self.with_headers(self.client.get(self.url(HEALTH_PATH)), ctx);
        self.send_json(req)
            .await
            .map_err(|e| self.classify("health", e))
    }
}
