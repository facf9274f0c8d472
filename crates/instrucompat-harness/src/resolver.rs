//! Version matrix resolution.
//!
//! A case's declared `[min, max]` dependency range and runtime bounds are
//! intersected with the known release set and the locally available
//! toolchains to produce the ordered list of combinations to exercise.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::case::{CaseVariant, TestCase};
use crate::error::{HarnessError, HarnessResult};
use crate::process::{CancelToken, ProcessSpec, run_process};
use crate::version::{ModuleVersion, RuntimeVersion};

/// One (dependency version, runtime version) pair to run a case against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionCombination {
    /// `None` for toolchain-only cases.
    pub dependency_version: Option<ModuleVersion>,
    pub runtime: RuntimeVersion,
}

impl VersionCombination {
    /// Filesystem-safe identifier, e.g. `v1.11.1_go1.18`.
    #[must_use]
    pub fn slug(&self) -> String {
        let runtime = self.runtime.toolchain_name();
        match &self.dependency_version {
            Some(v) => format!("{}_{runtime}", sanitize(v.as_str())),
            None => runtime,
        }
    }
}

impl fmt::Display for VersionCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dependency_version {
            Some(v) => write!(f, "{v} @ go{}", self.runtime),
            None => write!(f, "go{}", self.runtime),
        }
    }
}

pub(crate) fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Known releases of a dependency (the module proxy, or a pinned index).
pub trait ReleaseSource: Send + Sync {
    /// All published versions. An unknown dependency is a configuration error.
    fn releases(&self, dependency: &str, cancel: &CancelToken) -> HarnessResult<Vec<ModuleVersion>>;
}

/// Release index loaded from JSON or declared in code.
///
/// JSON shape: `{"go.mongodb.org/mongo-driver": ["v1.11.1", "v1.13.0"]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticReleaseIndex {
    releases: BTreeMap<String, Vec<ModuleVersion>>,
}

impl StaticReleaseIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add releases for `dependency`.
    pub fn with(mut self, dependency: &str, versions: &[&str]) -> HarnessResult<Self> {
        let parsed = versions
            .iter()
            .map(|v| v.parse())
            .collect::<HarnessResult<Vec<ModuleVersion>>>()?;
        self.releases
            .entry(dependency.to_string())
            .or_default()
            .extend(parsed);
        Ok(self)
    }

    pub fn from_json(json: &str) -> HarnessResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| HarnessError::Configuration(format!("invalid release index: {e}")))
    }

    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let body = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Configuration(format!("release index {}: {e}", path.display()))
        })?;
        Self::from_json(&body)
    }
}

impl ReleaseSource for StaticReleaseIndex {
    fn releases(
        &self,
        dependency: &str,
        _cancel: &CancelToken,
    ) -> HarnessResult<Vec<ModuleVersion>> {
        self.releases.get(dependency).cloned().ok_or_else(|| {
            HarnessError::Configuration(format!("unknown dependency '{dependency}'"))
        })
    }
}

/// Queries the module proxy through `go list -m -versions`.
#[derive(Debug, Clone)]
pub struct GoProxyReleases {
    pub go: PathBuf,
    pub timeout: Duration,
    pub cwd: Option<PathBuf>,
}

impl ReleaseSource for GoProxyReleases {
    fn releases(
        &self,
        dependency: &str,
        cancel: &CancelToken,
    ) -> HarnessResult<Vec<ModuleVersion>> {
        let mut spec = ProcessSpec::new(&self.go, self.timeout)
            .args(["list", "-m", "-versions", dependency])
            .env("GOFLAGS", "-mod=mod");
        if let Some(dir) = &self.cwd {
            spec = spec.cwd(dir);
        }
        let out = run_process(&spec, cancel)?;
        if out.timed_out {
            return Err(HarnessError::timed_out("go list -m -versions", self.timeout));
        }
        if !out.success() {
            let stderr = out.stderr.trim();
            let lowered = stderr.to_ascii_lowercase();
            if lowered.contains("not found") || lowered.contains("no matching versions") {
                return Err(HarnessError::Configuration(format!(
                    "unknown dependency '{dependency}': {stderr}"
                )));
            }
            return Err(HarnessError::Infrastructure(format!(
                "go list -m -versions {dependency} failed: {stderr}"
            )));
        }
        Ok(parse_version_listing(&out.stdout))
    }
}

/// Parse `go list -m -versions` output: the module path followed by versions.
#[must_use]
pub fn parse_version_listing(stdout: &str) -> Vec<ModuleVersion> {
    stdout
        .split_whitespace()
        .skip(1)
        .filter_map(|tok| tok.parse().ok())
        .collect()
}

/// Runtime versions available in the local toolchain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolchainSet {
    versions: Vec<RuntimeVersion>,
}

impl ToolchainSet {
    #[must_use]
    pub fn from_versions(mut versions: Vec<RuntimeVersion>) -> Self {
        versions.sort_unstable();
        versions.dedup();
        Self { versions }
    }

    /// Ask the local `go` for its version.
    pub fn detect(go: &Path, timeout: Duration, cancel: &CancelToken) -> HarnessResult<Self> {
        let spec = ProcessSpec::new(go, timeout).args(["env", "GOVERSION"]);
        let out = run_process(&spec, cancel)?;
        if !out.success() {
            return Err(HarnessError::Infrastructure(format!(
                "toolchain detection failed: {}",
                out.combined().trim()
            )));
        }
        let version = out.stdout.trim().parse().map_err(|_| {
            HarnessError::Infrastructure(format!(
                "unrecognized toolchain version '{}'",
                out.stdout.trim()
            ))
        })?;
        Ok(Self::from_versions(vec![version]))
    }

    /// Ascending.
    #[must_use]
    pub fn versions(&self) -> &[RuntimeVersion] {
        &self.versions
    }
}

/// Resolves case matrices against a release source and toolchain set.
pub struct Resolver<'a> {
    releases: &'a dyn ReleaseSource,
    toolchains: &'a ToolchainSet,
    include_prerelease: bool,
}

impl<'a> Resolver<'a> {
    #[must_use]
    pub fn new(
        releases: &'a dyn ReleaseSource,
        toolchains: &'a ToolchainSet,
        include_prerelease: bool,
    ) -> Self {
        Self {
            releases,
            toolchains,
            include_prerelease,
        }
    }

    /// Ordered combinations for `case`. Empty means "not applicable here".
    pub fn resolve(
        &self,
        case: &TestCase,
        cancel: &CancelToken,
    ) -> HarnessResult<Vec<VersionCombination>> {
        let releases = match case.dependency_name() {
            Some(dep) => self.releases.releases(dep, cancel)?,
            None => Vec::new(),
        };
        Ok(resolve_matrix(
            case,
            &releases,
            self.toolchains.versions(),
            self.include_prerelease,
        ))
    }
}

/// Pure matrix computation.
///
/// Dependency versions ascend; for each one, runtimes descend so the newest
/// toolchain is exercised first. LatestDepth keeps only the highest version
/// paired with the highest runtime.
#[must_use]
pub fn resolve_matrix(
    case: &TestCase,
    releases: &[ModuleVersion],
    runtimes: &[RuntimeVersion],
    include_prerelease: bool,
) -> Vec<VersionCombination> {
    let mut runtimes: Vec<RuntimeVersion> = runtimes
        .iter()
        .copied()
        .filter(|r| *r >= case.min_runtime && case.max_runtime.is_none_or(|max| *r <= max))
        .collect();
    runtimes.sort_unstable_by(|a, b| b.cmp(a));
    runtimes.dedup();

    let Some(range) = &case.dependency else {
        return runtimes
            .into_iter()
            .map(|runtime| VersionCombination {
                dependency_version: None,
                runtime,
            })
            .collect();
    };

    let mut versions: Vec<ModuleVersion> = releases
        .iter()
        .filter(|v| range.contains(v) && (include_prerelease || !v.is_prerelease()))
        .cloned()
        .collect();
    versions.sort();
    versions.dedup();

    if case.variant() == CaseVariant::LatestDepth {
        versions = versions.pop().into_iter().collect();
        runtimes.truncate(1);
    }

    versions
        .iter()
        .flat_map(|version| {
            runtimes.iter().map(move |runtime| VersionCombination {
                dependency_version: Some(version.clone()),
                runtime: *runtime,
            })
        })
        .collect()
}
