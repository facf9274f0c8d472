//! Per-combination outcomes.

use serde::{Deserialize, Serialize};

use crate::case::CaseVariant;
use crate::context::Stage;
use crate::error::{FailureKind, HarnessError};
use crate::resolver::VersionCombination;
use crate::structured_log::Outcome;

/// Terminal state of one (case, combination) unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
    InfraError,
}

impl CaseStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::InfraError => "infra_error",
        }
    }

    #[must_use]
    pub const fn outcome(self) -> Outcome {
        match self {
            Self::Passed => Outcome::Pass,
            Self::Failed => Outcome::Fail,
            Self::Skipped => Outcome::Skip,
            Self::InfraError => Outcome::Error,
        }
    }

    /// Terminal status for an error raised while in `stage`.
    ///
    /// Skipped is only reachable before instrumentation starts.
    #[must_use]
    pub fn for_error(err: &HarnessError, stage: Stage) -> Self {
        match err.kind() {
            FailureKind::ServiceUnavailable if stage <= Stage::Provisioning => Self::Skipped,
            FailureKind::ServiceUnavailable
            | FailureKind::Infrastructure
            | FailureKind::Cancelled => Self::InfraError,
            FailureKind::Configuration
            | FailureKind::Build
            | FailureKind::Runtime
            | FailureKind::Surface
            | FailureKind::Assertion
            | FailureKind::Panic => Self::Failed,
        }
    }
}

/// Outcome of one (case, combination) execution. Built once by the
/// dispatcher and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case: String,
    pub variant: CaseVariant,
    /// Absent when the case never reached a combination (empty matrix,
    /// resolution error).
    pub combination: Option<VersionCombination>,
    pub status: CaseStatus,
    pub stage_reached: Stage,
    pub failure_kind: Option<FailureKind>,
    pub diagnostic: Option<String>,
    pub duration_ms: u64,
    /// Diagnostic files written for this unit.
    pub artifacts: Vec<String>,
}

impl CaseResult {
    /// Empty matrix: not applicable in this environment.
    #[must_use]
    pub fn not_applicable(case: &str, variant: CaseVariant, reason: &str) -> Self {
        Self {
            case: case.to_string(),
            variant,
            combination: None,
            status: CaseStatus::Skipped,
            stage_reached: Stage::Pending,
            failure_kind: None,
            diagnostic: Some(reason.to_string()),
            duration_ms: 0,
            artifacts: Vec::new(),
        }
    }

    /// Unit cancelled before it started.
    #[must_use]
    pub fn cancelled(case: &str, variant: CaseVariant, combination: VersionCombination) -> Self {
        Self {
            case: case.to_string(),
            variant,
            combination: Some(combination),
            status: CaseStatus::Skipped,
            stage_reached: Stage::Pending,
            failure_kind: Some(FailureKind::Cancelled),
            diagnostic: Some("cancelled".to_string()),
            duration_ms: 0,
            artifacts: Vec::new(),
        }
    }

    /// Failure before any combination was attempted.
    #[must_use]
    pub fn resolution_failed(case: &str, variant: CaseVariant, err: &HarnessError) -> Self {
        Self {
            case: case.to_string(),
            variant,
            combination: None,
            status: CaseStatus::for_error(err, Stage::Pending),
            stage_reached: Stage::Pending,
            failure_kind: Some(err.kind()),
            diagnostic: Some(err.diagnostic()),
            duration_ms: 0,
            artifacts: Vec::new(),
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_unavailable_skips_only_before_instrumenting() {
        let err = HarnessError::ServiceUnavailable("mongo".into());
        assert_eq!(CaseStatus::for_error(&err, Stage::Provisioning), CaseStatus::Skipped);
        assert_eq!(CaseStatus::for_error(&err, Stage::Executing), CaseStatus::InfraError);
    }

    #[test]
    fn taxonomy_maps_to_statuses() {
        let cases = [
            (HarnessError::Configuration("bad rule".into()), CaseStatus::Failed),
            (HarnessError::Infrastructure("no docker".into()), CaseStatus::InfraError),
            (HarnessError::Cancelled("deadline".into()), CaseStatus::InfraError),
            (
                HarnessError::BuildFailure {
                    exit_code: 1,
                    summary: String::new(),
                    log: String::new(),
                },
                CaseStatus::Failed,
            ),
            (HarnessError::Assertion("x".into()), CaseStatus::Failed),
        ];
        for (err, expected) in cases {
            assert_eq!(CaseStatus::for_error(&err, Stage::Instrumenting), expected, "{err}");
        }
    }

    #[test]
    fn result_serializes_snake_case() {
        let result = CaseResult::not_applicable("mongo-crud", CaseVariant::General, "no versions");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["stage_reached"], "pending");
        assert!(json["combination"].is_null());
        assert_eq!(CaseStatus::InfraError.outcome(), Outcome::Error);
    }
}
