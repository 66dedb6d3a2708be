//! Typed job payloads and the promotion merge.
//!
//! The queue stores payloads as opaque JSON. Handlers decode them into a
//! [`TaskPayload`] at the dispatch boundary, keyed by `task_type`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Task type tag for similarity matching jobs.
pub const SIMILARITY_MATCH: &str = "similarity_match";

/// Payload of a `similarity_match` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarityMatchPayload {
    pub file_id: String,
    /// Also add the file to the search index. Monotonic under promotion.
    #[serde(default)]
    pub index: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

impl SimilarityMatchPayload {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            index: false,
            mode: None,
            batch_id: None,
            rule_id: None,
            user_name: None,
        }
    }

    pub fn with_index(mut self, index: bool) -> Self {
        self.index = index;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_rule(mut self, rule_id: Uuid) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    /// Dedupe key coalescing jobs for the same file.
    pub fn dedupe_key(&self) -> String {
        format!("{SIMILARITY_MATCH}:{}", self.file_id.trim())
    }

    fn validate(self) -> Result<Self> {
        if self.file_id.trim().is_empty() {
            return Err(Error::Fatal("similarity_match payload missing file_id".into()));
        }
        Ok(self)
    }
}

/// Tagged union of every payload the worker pool understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    SimilarityMatch(SimilarityMatchPayload),
}

impl TaskPayload {
    /// Decode a stored payload for `task_type`.
    ///
    /// Unknown task types and malformed payloads are fatal: retrying the same
    /// bytes cannot succeed.
    pub fn decode(task_type: &str, payload: &JsonValue) -> Result<Self> {
        match task_type {
            SIMILARITY_MATCH => {
                let parsed: SimilarityMatchPayload = serde_json::from_value(payload.clone())
                    .map_err(|e| Error::Fatal(format!("malformed {task_type} payload: {e}")))?;
                Ok(TaskPayload::SimilarityMatch(parsed.validate()?))
            }
            other => Err(Error::Fatal(format!("unknown task type: {other}"))),
        }
    }

    pub fn task_type(&self) -> &'static str {
        match self {
            TaskPayload::SimilarityMatch(_) => SIMILARITY_MATCH,
        }
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        match self {
            TaskPayload::SimilarityMatch(p) => Ok(serde_json::to_value(p)?),
        }
    }

    pub fn dedupe_key(&self) -> String {
        match self {
            TaskPayload::SimilarityMatch(p) => p.dedupe_key(),
        }
    }
}

/// Merge monotonic flags from `incoming` into `existing`.
///
/// Every top-level boolean that is `true` in `incoming` is set to `true` in
/// the result. Flags are never demoted and no other field is touched.
/// Returns `None` when the merge would not change `existing`.
pub fn promote_payload(existing: &JsonValue, incoming: &JsonValue) -> Option<JsonValue> {
    let incoming = incoming.as_object()?;
    let mut merged: Map<String, JsonValue> = existing.as_object().cloned().unwrap_or_default();
    let mut changed = false;

    for (key, value) in incoming {
        if value.as_bool() != Some(true) {
            continue;
        }
        if merged.get(key).and_then(JsonValue::as_bool) != Some(true) {
            merged.insert(key.clone(), JsonValue::Bool(true));
            changed = true;
        }
    }

    changed.then_some(JsonValue::Object(merged))
}
