//! Harness configuration.
//!
//! Values come from `COMPAT_*` environment variables with defaults, and the
//! CLI may override any of them afterwards:
//! - `COMPAT_APPS_ROOT`: directory holding the application templates (`test`).
//! - `COMPAT_WORK_ROOT`: case-scoped build directories (`target/compat`).
//! - `COMPAT_TOOL`, `COMPAT_GO`, `COMPAT_DOCKER`: external binaries.
//! - `COMPAT_JOBS`: worker pool size.
//! - `COMPAT_*_TIMEOUT_SECS`, `COMPAT_SERVICE_SETTLE_SECS`,
//!   `COMPAT_RUN_DEADLINE_SECS`: bounds on every blocking step.
//! - `COMPAT_RUNTIME_VERSIONS`: comma list overriding toolchain detection.
//! - `COMPAT_RELEASE_INDEX`: JSON release index instead of `go list`.
//! - `COMPAT_SURFACES_ROOT`: muzzle API surface manifests.
//! - `COMPAT_DISABLE_SERVICES`: service kinds to skip (`all` disables every one).
//! - `COMPAT_INCLUDE_PRERELEASE`: admit pre-release dependency versions.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::HarnessError;
use crate::version::RuntimeVersion;

/// Resolved configuration for one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub apps_root: PathBuf,
    pub work_root: PathBuf,
    pub tool: PathBuf,
    pub go: PathBuf,
    pub docker: PathBuf,
    pub jobs: usize,
    pub build_timeout: Duration,
    pub run_timeout: Duration,
    pub service_start_timeout: Duration,
    /// Minimum wait after a service reports started.
    pub service_settle: Duration,
    /// Overall run deadline, if any.
    pub run_deadline: Option<Duration>,
    pub runtime_versions: Option<Vec<RuntimeVersion>>,
    pub release_index: Option<PathBuf>,
    pub surfaces_root: PathBuf,
    pub disabled_services: ServiceFilter,
    pub include_prerelease: bool,
}

/// Which backing-service kinds are disabled for the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ServiceFilter {
    #[default]
    None,
    All,
    Kinds(BTreeSet<String>),
}

impl ServiceFilter {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let kinds: BTreeSet<String> = raw
            .split(',')
            .map(|k| k.trim().to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if kinds.is_empty() {
            Self::None
        } else if kinds.contains("all") {
            Self::All
        } else {
            Self::Kinds(kinds)
        }
    }

    #[must_use]
    pub fn disables(&self, kind: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&kind.to_ascii_lowercase()),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            apps_root: PathBuf::from("test"),
            work_root: PathBuf::from("target/compat"),
            tool: PathBuf::from("otel"),
            go: PathBuf::from("go"),
            docker: PathBuf::from("docker"),
            jobs: 4,
            build_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(120),
            service_start_timeout: Duration::from_secs(120),
            service_settle: Duration::from_secs(5),
            run_deadline: None,
            runtime_versions: None,
            release_index: None,
            surfaces_root: PathBuf::from("test/surfaces"),
            disabled_services: ServiceFilter::None,
            include_prerelease: false,
        }
    }
}

impl HarnessConfig {
    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, HarnessError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("COMPAT_APPS_ROOT") {
            cfg.apps_root = PathBuf::from(v);
        }
        if let Some(v) = get("COMPAT_WORK_ROOT") {
            cfg.work_root = PathBuf::from(v);
        }
        if let Some(v) = get("COMPAT_TOOL") {
            cfg.tool = PathBuf::from(v);
        }
        if let Some(v) = get("COMPAT_GO") {
            cfg.go = PathBuf::from(v);
        }
        if let Some(v) = get("COMPAT_DOCKER") {
            cfg.docker = PathBuf::from(v);
        }
        if let Some(v) = get("COMPAT_JOBS") {
            cfg.jobs = parse_number("COMPAT_JOBS", &v)?.max(1) as usize;
        }
        if let Some(v) = get("COMPAT_BUILD_TIMEOUT_SECS") {
            cfg.build_timeout = parse_secs("COMPAT_BUILD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("COMPAT_RUN_TIMEOUT_SECS") {
            cfg.run_timeout = parse_secs("COMPAT_RUN_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("COMPAT_SERVICE_START_TIMEOUT_SECS") {
            cfg.service_start_timeout = parse_secs("COMPAT_SERVICE_START_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("COMPAT_SERVICE_SETTLE_SECS") {
            cfg.service_settle = parse_secs("COMPAT_SERVICE_SETTLE_SECS", &v)?;
        }
        if let Some(v) = get("COMPAT_RUN_DEADLINE_SECS") {
            cfg.run_deadline = Some(parse_secs("COMPAT_RUN_DEADLINE_SECS", &v)?);
        }
        if let Some(v) = get("COMPAT_RUNTIME_VERSIONS") {
            cfg.runtime_versions = Some(parse_runtime_list(&v)?);
        }
        if let Some(v) = get("COMPAT_RELEASE_INDEX") {
            cfg.release_index = Some(PathBuf::from(v));
        }
        if let Some(v) = get("COMPAT_SURFACES_ROOT") {
            cfg.surfaces_root = PathBuf::from(v);
        }
        if let Some(v) = get("COMPAT_DISABLE_SERVICES") {
            cfg.disabled_services = ServiceFilter::parse(&v);
        }
        if let Some(v) = get("COMPAT_INCLUDE_PRERELEASE") {
            cfg.include_prerelease = parse_bool_loose(&v);
        }
        Ok(cfg)
    }
}

/// Comma-separated runtime versions, e.g. `1.18,1.21.3`.
pub fn parse_runtime_list(raw: &str) -> Result<Vec<RuntimeVersion>, HarnessError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[must_use]
pub fn parse_bool_loose(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number(key: &str, raw: &str) -> Result<u64, HarnessError> {
    raw.trim()
        .replace('_', "")
        .parse::<u64>()
        .map_err(|e| HarnessError::Configuration(format!("{key}='{raw}': {e}")))
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration, HarnessError> {
    parse_number(key, raw).map(Duration::from_secs)
}
