//! Operational reports and flat exports over similarity records.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use pairwise_core::{RecordSummary, ResolvedRecordFilter, SimilarityRecord, SimilarityStatus};

/// Resolved time window of a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportWindow {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub days: i64,
}

/// Filters echoed back in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportFilters {
    pub status: Option<SimilarityStatus>,
    pub rule_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
}

/// Aggregated counts plus the most recent records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupReport {
    pub generated_at: DateTime<Utc>,
    pub window: ReportWindow,
    pub filters: ReportFilters,
    #[serde(flatten)]
    pub summary: RecordSummary,
    /// Newest first.
    pub latest: Vec<ExportRow>,
}

impl DedupReport {
    pub fn new(
        generated_at: DateTime<Utc>,
        filter: &ResolvedRecordFilter,
        summary: RecordSummary,
        latest: &[SimilarityRecord],
    ) -> Self {
        Self {
            generated_at,
            window: ReportWindow {
                start_date: filter.start,
                end_date: filter.end,
                days: filter.days,
            },
            filters: ReportFilters {
                status: filter.status,
                rule_id: filter.rule_id,
                batch_id: filter.batch_id,
            },
            summary,
            latest: latest.iter().map(ExportRow::from).collect(),
        }
    }
}

/// One record flattened for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub id: Uuid,
    pub status: SimilarityStatus,
    pub source_file_id: String,
    pub target_file_id: String,
    pub pair_key: String,
    pub score: f64,
    pub rule_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub detection_mode: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub workflow_process_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&SimilarityRecord> for ExportRow {
    fn from(r: &SimilarityRecord) -> Self {
        Self {
            id: r.id,
            status: r.status,
            source_file_id: r.source_file_id.clone(),
            target_file_id: r.target_file_id.clone(),
            pair_key: r.pair_key.clone(),
            score: r.score,
            rule_id: r.rule_id,
            batch_id: r.batch_id,
            detection_mode: r.detection_mode.clone(),
            reviewed_by: r.reviewed_by.clone(),
            reviewed_at: r.reviewed_at,
            workflow_process_id: r.workflow_process_id.clone(),
            created_at: r.created_at,
        }
    }
}

/// CSV column order.
pub const CSV_HEADER: &[&str] = &[
    "id",
    "status",
    "source_file_id",
    "target_file_id",
    "pair_key",
    "score",
    "rule_id",
    "batch_id",
    "detection_mode",
    "reviewed_by",
    "reviewed_at",
    "workflow_process_id",
    "created_at",
];

impl ExportRow {
    fn csv_fields(&self) -> [String; 13] {
        let opt_id = |id: Option<Uuid>| id.map(|i| i.to_string()).unwrap_or_default();
        let ts = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Micros, true);
        [
            self.id.to_string(),
            self.status.as_str().to_string(),
            self.source_file_id.clone(),
            self.target_file_id.clone(),
            self.pair_key.clone(),
            self.score.to_string(),
            opt_id(self.rule_id),
            opt_id(self.batch_id),
            self.detection_mode.clone().unwrap_or_default(),
            self.reviewed_by.clone().unwrap_or_default(),
            self.reviewed_at.map(ts).unwrap_or_default(),
            self.workflow_process_id.clone().unwrap_or_default(),
            ts(self.created_at),
        ]
    }
}

/// Render rows as RFC 4180 CSV with a header line.
pub fn to_csv(rows: &[ExportRow]) -> String {
    let mut out = String::new();
    push_line(&mut out, CSV_HEADER.iter().map(|h| h.to_string()));
    for row in rows {
        push_line(&mut out, row.csv_fields().into_iter());
    }
    out
}

fn push_line(out: &mut String, fields: impl Iterator<Item = String>) {
    let line: Vec<String> = fields.map(|f| escape_csv(&f)).collect();
    out.push_str(&line.join(","));
    out.push_str("\r\n");
}

fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairwise_core::{CandidatePair, RecordFilter};

    #[test]
    fn test_escape_csv() {
        assert_eq!(escape_csv("plain"), "plain");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_csv_has_header_and_rows() {
        let now = Utc::now();
        let mut record = CandidatePair::new("f-1", "f-2", 0.91)
            .with_mode("balanced")
            .into_record(now);
        record.reviewed_by = Some("Doe, Jane".into());
        let csv = to_csv(&[ExportRow::from(&record)]);

        let lines: Vec<&str> = csv.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert!(lines[1].starts_with(&record.id.to_string()));
        assert!(lines[1].contains(",pending_review,f-1,f-2,f-1|f-2,0.91,"));
        assert!(lines[1].contains("\"Doe, Jane\""));
    }

    #[test]
    fn test_report_serializes_flat_summary() {
        let now = Utc::now();
        let filter = RecordFilter::default().resolve(now).unwrap();
        let mut summary = RecordSummary::default();
        summary.total = 3;
        summary.no_batch = 3;
        let report = DedupReport::new(now, &filter, summary, &[]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["total"], 3);
        assert_eq!(json["no_batch"], 3);
        assert_eq!(json["window"]["days"], 30);
        assert!(json["latest"].as_array().unwrap().is_empty());
        assert!(json["filters"]["status"].is_null());
    }
}
