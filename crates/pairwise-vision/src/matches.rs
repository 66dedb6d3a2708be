//! Match extraction from raw search responses.
//!
//! Deployments of the vision service disagree on response shape, so
//! extraction is tolerant: matches may sit under several list keys, either at
//! the top level or under `search`, and scores and identifiers have aliases.

use serde::Serialize;
use serde_json::Value as JsonValue;

use pairwise_core::defaults;

const LIST_KEYS: &[&str] = &["results", "duplicates", "similar", "matches"];
const SCORE_KEYS: &[&str] = &["similarity", "score", "confidence"];
const ID_KEYS: &[&str] = &["file_id", "drawing_id", "id"];
const CHECKSUM_KEYS: &[&str] = &["file_hash", "checksum", "sha256"];

/// Thresholds applied to raw matches before ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchThresholds {
    /// Minimum combined score.
    pub combined: f64,
    /// Maximum perceptual-hash distance.
    pub phash: i32,
    /// Minimum feature similarity.
    pub feature: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            combined: defaults::DEDUP_COMBINED_THRESHOLD,
            phash: defaults::DEDUP_PHASH_THRESHOLD,
            feature: defaults::DEDUP_FEATURE_THRESHOLD,
        }
    }
}

/// One match reported by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionMatch {
    /// Identifier candidates in alias order (`file_id`, `drawing_id`, `id`).
    pub candidate_ids: Vec<String>,
    /// Checksum candidates in alias order.
    pub checksums: Vec<String>,
    pub score: Option<f64>,
    pub phash_distance: Option<i64>,
    pub feature_similarity: Option<f64>,
    pub raw: JsonValue,
}

impl VisionMatch {
    fn from_json(raw: &JsonValue) -> Self {
        Self {
            candidate_ids: ID_KEYS.iter().filter_map(|k| text_field(raw, k)).collect(),
            checksums: CHECKSUM_KEYS
                .iter()
                .filter_map(|k| text_field(raw, k))
                .collect(),
            score: SCORE_KEYS.iter().find_map(|k| number_field(raw, k)),
            phash_distance: number_field(raw, "phash_distance")
                .or_else(|| nested_number(raw, "l1", "phash_distance"))
                .map(|d| d.round() as i64),
            feature_similarity: number_field(raw, "feature_similarity")
                .or_else(|| nested_number(raw, "l2", "feature_similarity")),
            raw: raw.clone(),
        }
    }

    /// Whether the match clears every threshold.
    ///
    /// A match without a score never passes. Missing per-level metrics do
    /// not disqualify a match.
    pub fn passes(&self, thresholds: &MatchThresholds) -> bool {
        let Some(score) = self.score else {
            return false;
        };
        if score < thresholds.combined {
            return false;
        }
        if self
            .phash_distance
            .is_some_and(|d| d > i64::from(thresholds.phash))
        {
            return false;
        }
        if self
            .feature_similarity
            .is_some_and(|f| f < thresholds.feature)
        {
            return false;
        }
        true
    }
}

/// Every match object in a search response, in response order.
pub fn extract_matches(body: &JsonValue) -> Vec<VisionMatch> {
    let mut out = Vec::new();
    collect_lists(body, &mut out);
    if let Some(nested) = body.get("search").filter(|v| v.is_object()) {
        collect_lists(nested, &mut out);
    }
    out
}

fn collect_lists(container: &JsonValue, out: &mut Vec<VisionMatch>) {
    for key in LIST_KEYS {
        if let Some(items) = container.get(key).and_then(JsonValue::as_array) {
            out.extend(
                items
                    .iter()
                    .filter(|item| item.is_object())
                    .map(VisionMatch::from_json),
            );
        }
    }
}

/// Non-empty string or number field rendered as text.
fn text_field(obj: &JsonValue, key: &str) -> Option<String> {
    match obj.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Finite numeric field, accepting numeric strings. `"NaN"` and `"inf"`
/// parse as floats but are treated as absent.
fn number_field(obj: &JsonValue, key: &str) -> Option<f64> {
    let value = match obj.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

fn nested_number(obj: &JsonValue, level: &str, key: &str) -> Option<f64> {
    let level = obj.get("levels")?.get(level)?;
    number_field(level, key)
}
