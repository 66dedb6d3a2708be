//! Dedup rule validation, patching and resolution.
//!
//! Everything here is pure. The service loads rules from the store and hands
//! them to these functions, so the selection order is identical for the
//! Postgres and in-memory backends.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use pairwise_core::{
    defaults, CreateRuleRequest, DedupRule, Error, RequestContext, Result, UpdateRuleRequest,
};
use pairwise_db::ANY_DOCUMENT_TYPE;
use pairwise_vision::{is_known_mode, normalize_legacy_mode, MatchThresholds};

/// Largest meaningful perceptual-hash distance (64-bit hashes).
pub const MAX_PHASH_DISTANCE: i32 = 64;

/// Build a new rule from a creation request.
pub fn build_rule(
    ctx: &RequestContext,
    req: CreateRuleRequest,
    now: DateTime<Utc>,
) -> Result<DedupRule> {
    let rule = DedupRule {
        id: Uuid::now_v7(),
        name: req.name.trim().to_string(),
        description: req.description,
        item_type: non_blank(req.item_type),
        document_type: non_blank(req.document_type),
        threshold: req.threshold.unwrap_or(defaults::DEDUP_COMBINED_THRESHOLD),
        phash_threshold: req.phash_threshold.unwrap_or(defaults::DEDUP_PHASH_THRESHOLD),
        feature_threshold: req
            .feature_threshold
            .unwrap_or(defaults::DEDUP_FEATURE_THRESHOLD),
        mode: req
            .mode
            .as_deref()
            .map(normalize_legacy_mode)
            .unwrap_or_else(|| defaults::DEDUP_MODE.to_string()),
        auto_trigger_workflow: req.auto_trigger_workflow,
        workflow_map_id: non_blank(req.workflow_map_id),
        priority: req.priority.unwrap_or(defaults::DEDUP_RULE_PRIORITY),
        is_active: true,
        created_by: ctx.user_id.clone(),
        created_at: now,
        updated_at: None,
    };
    validate_rule(&rule)?;
    Ok(rule)
}

/// Apply a partial update and validate the resulting state.
///
/// The workflow requirement is checked against the rule as it would be
/// after the patch, so enabling the trigger and setting the map in one
/// request is accepted while clearing the map of a triggering rule is not.
pub fn apply_update(
    rule: &DedupRule,
    req: UpdateRuleRequest,
    now: DateTime<Utc>,
) -> Result<DedupRule> {
    let mut next = rule.clone();
    if let Some(name) = req.name {
        next.name = name.trim().to_string();
    }
    if let Some(description) = req.description {
        next.description = Some(description);
    }
    if let Some(item_type) = req.item_type {
        next.item_type = non_blank(Some(item_type));
    }
    if let Some(document_type) = req.document_type {
        next.document_type = non_blank(Some(document_type));
    }
    if let Some(threshold) = req.threshold {
        next.threshold = threshold;
    }
    if let Some(phash) = req.phash_threshold {
        next.phash_threshold = phash;
    }
    if let Some(feature) = req.feature_threshold {
        next.feature_threshold = feature;
    }
    if let Some(mode) = req.mode {
        next.mode = normalize_legacy_mode(&mode);
    }
    if let Some(auto) = req.auto_trigger_workflow {
        next.auto_trigger_workflow = auto;
    }
    if let Some(map_id) = req.workflow_map_id {
        next.workflow_map_id = non_blank(map_id);
    }
    if let Some(priority) = req.priority {
        next.priority = priority;
    }
    if let Some(active) = req.is_active {
        next.is_active = active;
    }
    next.updated_at = Some(now);

    validate_rule(&next)?;
    Ok(next)
}

/// Check every rule invariant. Violations are configuration errors.
pub fn validate_rule(rule: &DedupRule) -> Result<()> {
    if rule.name.is_empty() {
        return Err(Error::Config("rule name required".into()));
    }
    if !(0.0..=1.0).contains(&rule.threshold) {
        return Err(Error::Config(format!(
            "threshold must be within [0, 1], got {}",
            rule.threshold
        )));
    }
    if !(0.0..=1.0).contains(&rule.feature_threshold) {
        return Err(Error::Config(format!(
            "feature_threshold must be within [0, 1], got {}",
            rule.feature_threshold
        )));
    }
    if !(0..=MAX_PHASH_DISTANCE).contains(&rule.phash_threshold) {
        return Err(Error::Config(format!(
            "phash_threshold must be within [0, {MAX_PHASH_DISTANCE}], got {}",
            rule.phash_threshold
        )));
    }
    if !is_known_mode(&rule.mode) {
        return Err(Error::Config(format!("unknown detection mode: {}", rule.mode)));
    }
    if rule.auto_trigger_workflow && rule.workflow_map_id.is_none() {
        return Err(Error::Config(
            "workflow_map_id required when auto_trigger_workflow=true".into(),
        ));
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Pick the active rule that applies to a file.
///
/// Candidates are tried by scope: rules for the file's item type, then
/// rules for its document type (or `"all"`) without an item type, then
/// global rules. Within a scope the winner has the lowest priority, then
/// the newest `created_at`, then the smallest name.
pub fn select_applicable<'a>(
    rules: &'a [DedupRule],
    item_type: Option<&str>,
    document_type: Option<&str>,
) -> Option<&'a DedupRule> {
    if let Some(item_type) = item_type {
        if let Some(rule) = best_rule(rules, |r| r.item_type.as_deref() == Some(item_type)) {
            return Some(rule);
        }
    }
    if let Some(document_type) = document_type {
        let found = best_rule(rules, |r| {
            r.item_type.is_none()
                && r.document_type
                    .as_deref()
                    .is_some_and(|d| d == document_type || d == ANY_DOCUMENT_TYPE)
        });
        if found.is_some() {
            return found;
        }
    }
    best_rule(rules, |r| {
        r.item_type.is_none()
            && r.document_type
                .as_deref()
                .map_or(true, |d| d == ANY_DOCUMENT_TYPE)
    })
}

fn best_rule(rules: &[DedupRule], pred: impl Fn(&DedupRule) -> bool) -> Option<&DedupRule> {
    rules.iter().filter(|r| r.is_active && pred(r)).min_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.name.cmp(&b.name))
    })
}

/// Effective matching parameters for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchSettings {
    pub rule_id: Option<Uuid>,
    /// Legacy mode name.
    pub mode: String,
    pub thresholds: MatchThresholds,
}

impl MatchSettings {
    /// Resolve from the governing rule and an optional per-job mode.
    ///
    /// The job's mode wins over the rule's; without a rule the defaults
    /// apply.
    pub fn resolve(rule: Option<&DedupRule>, mode_override: Option<&str>) -> Self {
        let mode = mode_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(normalize_legacy_mode)
            .or_else(|| rule.map(|r| r.mode.clone()))
            .unwrap_or_else(|| defaults::DEDUP_MODE.to_string());
        let thresholds = rule.map_or_else(MatchThresholds::default, |r| MatchThresholds {
            combined: r.threshold,
            phash: r.phash_threshold,
            feature: r.feature_threshold,
        });
        Self {
            rule_id: rule.map(|r| r.id),
            mode,
            thresholds,
        }
    }

    /// Parameters recorded on each ingested record.
    pub fn detection_params(&self, raw: &JsonValue) -> JsonValue {
        json!({
            "mode": self.mode,
            "phash_threshold": self.thresholds.phash,
            "feature_threshold": self.thresholds.feature,
            "combined_threshold": self.thresholds.combined,
            "rule_id": self.rule_id,
            "raw": raw,
        })
    }
}
