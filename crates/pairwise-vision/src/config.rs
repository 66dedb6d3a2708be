//! Vision client configuration.

use pairwise_core::defaults;

/// Environment variable names.
pub const ENV_BASE_URL: &str = "DEDUP_VISION_BASE_URL";
pub const ENV_SERVICE_TOKEN: &str = "DEDUP_VISION_SERVICE_TOKEN";
pub const ENV_TIMEOUT_SECS: &str = "DEDUP_VISION_TIMEOUT_SECS";
pub const ENV_FALLBACK_STATUSES: &str = "DEDUP_VISION_FALLBACK_STATUSES";

/// Configuration for [`crate::VisionClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionConfig {
    /// Base URL of the vision service, without trailing slash.
    pub base_url: String,
    /// Service credential used when the request context carries none.
    pub service_token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_seconds: u64,
    /// v2 statuses that trigger the v1 fallback.
    pub fallback_statuses: Vec<u16>,
    /// Statuses treated as a permanent rejection of the input.
    pub permanent_statuses: Vec<u16>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::VISION_BASE_URL.to_string(),
            service_token: None,
            timeout_seconds: defaults::VISION_TIMEOUT_SECS,
            fallback_statuses: defaults::VISION_FALLBACK_STATUSES.to_vec(),
            permanent_statuses: defaults::VISION_PERMANENT_STATUSES.to_vec(),
        }
    }
}

impl VisionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    pub fn with_service_token(mut self, token: impl Into<String>) -> Self {
        self.service_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_fallback_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.fallback_statuses = statuses;
        self
    }

    /// Create from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::new(
            std::env::var(ENV_BASE_URL).unwrap_or_else(|_| defaults::VISION_BASE_URL.to_string()),
        );
        config.service_token = std::env::var(ENV_SERVICE_TOKEN)
            .ok()
            .filter(|t| !t.trim().is_empty());
        config.timeout_seconds = std::env::var(ENV_TIMEOUT_SECS)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::VISION_TIMEOUT_SECS);
        if let Some(statuses) = std::env::var(ENV_FALLBACK_STATUSES)
            .ok()
            .and_then(|s| parse_status_list(&s))
        {
            config.fallback_statuses = statuses;
        }
        config
    }

    pub fn falls_back_on(&self, status: u16) -> bool {
        self.fallback_statuses.contains(&status)
    }

    pub fn is_permanent(&self, status: u16) -> bool {
        self.permanent_statuses.contains(&status)
    }
}

/// Parse `"400, 404,503"` into status codes. `None` if nothing valid.
pub fn parse_status_list(raw: &str) -> Option<Vec<u16>> {
    let statuses: Vec<u16> = raw
        .split(',')
        .filter_map(|s| s.trim().parse::<u16>().ok())
        .filter(|s| (100..=599).contains(s))
        .collect();
    (!statuses.is_empty()).then_some(statuses)
}
