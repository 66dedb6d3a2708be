//! Explicit request context passed through every call boundary.
//!
//! Tenant, organization and user identity travel as a value argument to the
//! queue, handlers, the matcher and the workflow port. Nothing is read from
//! ambient task-local or global state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Job;

/// Identity and correlation data for one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Correlation ID propagated across request → job → sub-calls.
    pub request_id: Uuid,
    pub tenant_id: Option<String>,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    /// Bearer credential forwarded to external collaborators.
    #[serde(skip)]
    pub authorization: Option<String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::system()
    }
}

impl RequestContext {
    /// Context for background work not attributable to a user.
    pub fn system() -> Self {
        Self {
            request_id: Uuid::now_v7(),
            tenant_id: None,
            org_id: None,
            user_id: None,
            authorization: None,
        }
    }

    /// Context for an authenticated user.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::system()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn with_authorization(mut self, token: impl Into<String>) -> Self {
        self.authorization = Some(token.into());
        self
    }

    /// Rebuild the context a job was enqueued under.
    ///
    /// The correlation ID is fresh per execution; tenant, org and user are
    /// restored from the job row.
    pub fn from_job(job: &Job) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            tenant_id: job.tenant_id.clone(),
            org_id: job.org_id.clone(),
            user_id: job.created_by.clone(),
            authorization: None,
        }
    }

    /// Display name for the acting principal.
    pub fn actor(&self) -> &str {
        self.user_id.as_deref().unwrap_or("system")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_context_has_no_identity() {
        let ctx = RequestContext::system();
        assert!(ctx.tenant_id.is_none());
        assert!(ctx.user_id.is_none());
        assert_eq!(ctx.actor(), "system");
    }

    #[test]
    fn test_builder_methods() {
        let ctx = RequestContext::for_user("u-1")
            .with_tenant("t-1")
            .with_org("o-1")
            .with_authorization("secret");
        assert_eq!(ctx.user_id.as_deref(), Some("u-1"));
        assert_eq!(ctx.tenant_id.as_deref(), Some("t-1"));
        assert_eq!(ctx.org_id.as_deref(), Some("o-1"));
        assert_eq!(ctx.authorization.as_deref(), Some("secret"));
        assert_eq!(ctx.actor(), "u-1");
    }

    #[test]
    fn test_authorization_is_never_serialized() {
        let ctx = RequestContext::system().with_authorization("secret");
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(!json.contains("secret"));
    }
}
