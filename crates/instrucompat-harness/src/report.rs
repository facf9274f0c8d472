//! Aggregated compatibility report.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::case::CaseVariant;
use crate::result::{CaseResult, CaseStatus};

pub const REPORT_SCHEMA_VERSION: &str = "v1";

/// Diagnostics longer than this are cut to their tail in markdown.
const MARKDOWN_DIAGNOSTIC_LIMIT: usize = 4_000;

/// Counts per terminal status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub infra_errors: u64,
    pub pass_rate_percent: f64,
}

impl StatusSummary {
    fn record(&mut self, status: CaseStatus) {
        self.total = self.total.saturating_add(1);
        let slot = match status {
            CaseStatus::Passed => &mut self.passed,
            CaseStatus::Failed => &mut self.failed,
            CaseStatus::Skipped => &mut self.skipped,
            CaseStatus::InfraError => &mut self.infra_errors,
        };
        *slot = slot.saturating_add(1);
    }

    fn finish(&mut self) {
        let attempted = self.total.saturating_sub(self.skipped);
        self.pass_rate_percent = ratio_percent(self.passed, attempted);
    }
}

/// One row per case: its combinations folded together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseMatrixRow {
    pub case: String,
    pub variant: CaseVariant,
    /// Worst status across the case's combinations.
    pub status: CaseStatus,
    pub counts: StatusSummary,
    pub combinations: Vec<String>,
}

/// Top-level report payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatReport {
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub summary: StatusSummary,
    pub case_matrix: Vec<CaseMatrixRow>,
    pub results: Vec<CaseResult>,
}

impl CompatReport {
    /// Aggregate `results`, which must already be in report order.
    #[must_use]
    pub fn build(run_id: &str, generated_at: &str, results: Vec<CaseResult>) -> Self {
        let mut summary = StatusSummary::default();
        let mut order: Vec<String> = Vec::new();
        let mut rows: BTreeMap<String, CaseMatrixRow> = BTreeMap::new();

        for result in &results {
            summary.record(result.status);
            let row = rows.entry(result.case.clone()).or_insert_with(|| {
                order.push(result.case.clone());
                CaseMatrixRow {
                    case: result.case.clone(),
                    variant: result.variant,
                    status: CaseStatus::Skipped,
                    counts: StatusSummary::default(),
                    combinations: Vec::new(),
                }
            });
            row.counts.record(result.status);
            if severity(result.status) > severity(row.status) {
                row.status = result.status;
            }
            if let Some(combo) = &result.combination {
                row.combinations.push(combo.to_string());
            }
        }
        summary.finish();

        let case_matrix = order
            .iter()
            .filter_map(|name| rows.remove(name))
            .map(|mut row| {
                row.counts.finish();
                row
            })
            .collect();

        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            run_id: run_id.to_string(),
            generated_at: generated_at.to_string(),
            summary,
            case_matrix,
            results,
        }
    }

    /// No Failed and no InfraError result.
    #[must_use]
    pub const fn all_passed(&self) -> bool {
        self.summary.failed == 0 && self.summary.infra_errors == 0
    }

    /// Results for `case`, in report order.
    pub fn results_for<'a>(&'a self, case: &'a str) -> impl Iterator<Item = &'a CaseResult> + 'a {
        self.results.iter().filter(move |r| r.case == case)
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Instrumentation compatibility report\n\n");
        out.push_str(&format!("- Run: {}\n", self.run_id));
        out.push_str(&format!("- Generated: {}\n", self.generated_at));
        out.push_str(&format!("- Total: {}\n", self.summary.total));
        out.push_str(&format!("- Passed: {}\n", self.summary.passed));
        out.push_str(&format!("- Failed: {}\n", self.summary.failed));
        out.push_str(&format!("- Skipped: {}\n", self.summary.skipped));
        out.push_str(&format!("- Infra errors: {}\n", self.summary.infra_errors));
        out.push_str(&format!("- Pass rate: {:.2}%\n\n", self.summary.pass_rate_percent));

        out.push_str("| Case | Variant | Combination | Status | Stage | Failure |\n");
        out.push_str("|------|---------|-------------|--------|-------|---------|\n");
        for r in &self.results {
            let combo = r
                .combination
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string);
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                r.case,
                r.variant.as_str(),
                combo,
                r.status.as_str().to_ascii_uppercase(),
                r.stage_reached.as_str(),
                r.failure_kind.map_or("-", |k| k.as_str()),
            ));
        }

        let noteworthy: Vec<&CaseResult> = self
            .results
            .iter()
            .filter(|r| r.status != CaseStatus::Passed && r.diagnostic.is_some())
            .collect();
        if !noteworthy.is_empty() {
            out.push_str("\n## Diagnostics\n");
            for r in noteworthy {
                let combo = r
                    .combination
                    .as_ref()
                    .map_or_else(|| "no combination".to_string(), ToString::to_string);
                out.push_str(&format!("\n### {} ({combo})\n\n```\n", r.case));
                let diagnostic = r.diagnostic.as_deref().unwrap_or_default();
                out.push_str(tail(diagnostic, MARKDOWN_DIAGNOSTIC_LIMIT).trim_end());
                out.push_str("\n```\n");
            }
        }
        out
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

const fn severity(status: CaseStatus) -> u8 {
    match status {
        CaseStatus::Skipped => 0,
        CaseStatus::Passed => 1,
        CaseStatus::Failed => 2,
        CaseStatus::InfraError => 3,
    }
}

fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn ratio_percent(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let pct = (numerator as f64 / denominator as f64) * 100.0;
    (pct * 100.0).round() / 100.0
}
