//! Failure taxonomy shared by every stage of a case run.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`HarnessError`], carried into results and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Infrastructure,
    ServiceUnavailable,
    Build,
    Runtime,
    Surface,
    Assertion,
    Panic,
    Cancelled,
}

impl FailureKind {
    /// Stable label used in reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Infrastructure => "infrastructure",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Build => "build",
            Self::Runtime => "runtime",
            Self::Surface => "surface",
            Self::Assertion => "assertion",
            Self::Panic => "panic",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Every way a stage of a case run can stop short of success.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Malformed rule reference, unknown dependency, unparsable version.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Container failed to start, toolchain missing, launch failed.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// The requested backing service is disabled for this run.
    #[error("service '{0}' is unavailable in this run")]
    ServiceUnavailable(String),

    /// Instrumentation or compilation failed.
    #[error("build failed (exit {exit_code}): {summary}")]
    BuildFailure {
        exit_code: i32,
        summary: String,
        log: String,
    },

    /// The instrumented artifact exited non-zero or timed out.
    #[error("{artifact} exited with {exit_code}")]
    RuntimeFailure {
        artifact: String,
        exit_code: i32,
        output: String,
    },

    /// Muzzle check found references outside the declared API surface.
    #[error("{count} reference(s) outside the declared surface of {dependency}@{version}")]
    SurfaceViolation {
        dependency: String,
        version: String,
        count: usize,
        report: String,
    },

    /// An expectation inside a case behavior did not hold.
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// The run was cancelled or hit its deadline.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Infrastructure(_) | Self::Io(_) => FailureKind::Infrastructure,
            Self::ServiceUnavailable(_) => FailureKind::ServiceUnavailable,
            Self::BuildFailure { .. } => FailureKind::Build,
            Self::RuntimeFailure { .. } => FailureKind::Runtime,
            Self::SurfaceViolation { .. } => FailureKind::Surface,
            Self::Assertion(_) => FailureKind::Assertion,
            Self::Cancelled(_) => FailureKind::Cancelled,
        }
    }

    /// Long-form payload (build log, captured output, surface report).
    #[must_use]
    pub fn diagnostic(&self) -> String {
        match self {
            Self::BuildFailure { log, .. } => log.clone(),
            Self::RuntimeFailure { output, .. } => output.clone(),
            Self::SurfaceViolation { report, .. } => report.clone(),
            other => other.to_string(),
        }
    }

    pub(crate) fn timed_out(what: &str, timeout: Duration) -> Self {
        Self::Infrastructure(format!("{what} timed out after {timeout:?}"))
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(
            HarnessError::Configuration("x".into()).kind(),
            FailureKind::Configuration
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(HarnessError::from(io).kind(), FailureKind::Infrastructure);
        assert_eq!(
            HarnessError::BuildFailure {
                exit_code: 1,
                summary: "undefined: foo".into(),
                log: "full log".into(),
            }
            .kind(),
            FailureKind::Build
        );
    }

    #[test]
    fn diagnostic_prefers_payload() {
        let err = HarnessError::RuntimeFailure {
            artifact: "test_crud_mongo".into(),
            exit_code: 3,
            output: "panic: boom".into(),
        };
        assert_eq!(err.diagnostic(), "panic: boom");
        assert_eq!(err.to_string(), "test_crud_mongo exited with 3");
        assert_eq!(FailureKind::ServiceUnavailable.as_str(), "service_unavailable");
    }
}
