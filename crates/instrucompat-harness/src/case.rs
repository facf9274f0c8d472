//! Test case model: one tagged union for the three kinds of check.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::CaseContext;
use crate::error::{HarnessError, HarnessResult};
use crate::provision::ServiceSpec;
use crate::version::{ModuleVersion, RuntimeVersion, VersionBound};

/// Environment assignments handed to a behavior and merged into launches.
pub type EnvVars = BTreeMap<String, String>;

/// Executable body of a General or LatestDepth case.
pub type CaseBehavior =
    Arc<dyn Fn(&mut CaseContext<'_>, &EnvVars) -> HarnessResult<()> + Send + Sync>;

/// Serializable label for the case variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseVariant {
    General,
    Muzzle,
    LatestDepth,
}

impl CaseVariant {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Muzzle => "muzzle",
            Self::LatestDepth => "latest_depth",
        }
    }
}

/// Variant-specific payload.
#[derive(Clone)]
pub enum CaseKind {
    /// Full build, instrument, run and assert cycle.
    General { behavior: CaseBehavior },
    /// Static API-surface check of `sources` across the range.
    Muzzle { sources: Vec<String> },
    /// Regression check against the newest resolvable version only.
    LatestDepth { behavior: CaseBehavior },
}

impl CaseKind {
    #[must_use]
    pub const fn variant(&self) -> CaseVariant {
        match self {
            Self::General { .. } => CaseVariant::General,
            Self::Muzzle { .. } => CaseVariant::Muzzle,
            Self::LatestDepth { .. } => CaseVariant::LatestDepth,
        }
    }
}

impl fmt::Debug for CaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::General { .. } => f.write_str("General { .. }"),
            Self::Muzzle { sources } => f.debug_struct("Muzzle").field("sources", sources).finish(),
            Self::LatestDepth { .. } => f.write_str("LatestDepth { .. }"),
        }
    }
}

/// Declared dependency range of a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRange {
    pub name: String,
    pub min: ModuleVersion,
    pub max: VersionBound,
}

impl DependencyRange {
    pub fn parse(name: &str, min: &str, max: &str) -> HarnessResult<Self> {
        if name.trim().is_empty() {
            return Err(HarnessError::Configuration(
                "dependency name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name: name.trim().to_string(),
            min: min.parse()?,
            max: VersionBound::parse(max)?,
        })
    }

    #[must_use]
    pub fn contains(&self, version: &ModuleVersion) -> bool {
        *version >= self.min && self.max.admits(version)
    }
}

/// A registered compatibility case.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: String,
    /// Application/module directory under the apps root.
    pub module: String,
    /// `None` for toolchain-only cases (build-project checks).
    pub dependency: Option<DependencyRange>,
    pub min_runtime: RuntimeVersion,
    pub max_runtime: Option<RuntimeVersion>,
    /// Backing service the dispatcher provisions before the behavior runs.
    pub service: Option<ServiceSpec>,
    /// Negative test: build failure is the passing outcome.
    pub expect_failure: bool,
    pub kind: CaseKind,
}

impl TestCase {
    /// Full build-instrument-run case over `[min, max]`.
    #[allow(clippy::too_many_arguments)]
    pub fn general(
        name: &str,
        module: &str,
        dependency: &str,
        min_version: &str,
        max_version: &str,
        min_runtime: &str,
        max_runtime: &str,
        behavior: CaseBehavior,
    ) -> HarnessResult<Self> {
        Self::build(
            name,
            module,
            Some(DependencyRange::parse(dependency, min_version, max_version)?),
            min_runtime,
            max_runtime,
            CaseKind::General { behavior },
        )
    }

    /// Static muzzle check of `sources` over `[min, max]`.
    #[allow(clippy::too_many_arguments)]
    pub fn muzzle(
        name: &str,
        module: &str,
        dependency: &str,
        min_version: &str,
        max_version: &str,
        min_runtime: &str,
        max_runtime: &str,
        sources: &[&str],
    ) -> HarnessResult<Self> {
        if sources.is_empty() {
            return Err(HarnessError::Configuration(format!(
                "muzzle case '{name}' declares no source files"
            )));
        }
        Self::build(
            name,
            module,
            Some(DependencyRange::parse(dependency, min_version, max_version)?),
            min_runtime,
            max_runtime,
            CaseKind::Muzzle {
                sources: sources.iter().map(|s| (*s).to_string()).collect(),
            },
        )
    }

    /// Regression case run only against the newest version in `[min, max]`.
    #[allow(clippy::too_many_arguments)]
    pub fn latest_depth(
        name: &str,
        module: &str,
        dependency: &str,
        min_version: &str,
        max_version: &str,
        min_runtime: &str,
        max_runtime: &str,
        behavior: CaseBehavior,
    ) -> HarnessResult<Self> {
        Self::build(
            name,
            module,
            Some(DependencyRange::parse(dependency, min_version, max_version)?),
            min_runtime,
            max_runtime,
            CaseKind::LatestDepth { behavior },
        )
    }

    /// General case with no dependency axis; the matrix is runtimes only.
    pub fn toolchain(
        name: &str,
        module: &str,
        min_runtime: &str,
        max_runtime: &str,
        behavior: CaseBehavior,
    ) -> HarnessResult<Self> {
        Self::build(
            name,
            module,
            None,
            min_runtime,
            max_runtime,
            CaseKind::General { behavior },
        )
    }

    fn build(
        name: &str,
        module: &str,
        dependency: Option<DependencyRange>,
        min_runtime: &str,
        max_runtime: &str,
        kind: CaseKind,
    ) -> HarnessResult<Self> {
        if name.trim().is_empty() {
            return Err(HarnessError::Configuration(
                "case name must not be empty".to_string(),
            ));
        }
        let max_runtime = match max_runtime.trim() {
            "" => None,
            raw => Some(raw.parse()?),
        };
        Ok(Self {
            name: name.trim().to_string(),
            module: module.to_string(),
            dependency,
            min_runtime: min_runtime.parse()?,
            max_runtime,
            service: None,
            expect_failure: false,
            kind,
        })
    }

    #[must_use]
    pub fn with_service(mut self, service: ServiceSpec) -> Self {
        self.service = Some(service);
        self
    }

    #[must_use]
    pub fn expecting_failure(mut self) -> Self {
        self.expect_failure = true;
        self
    }

    #[must_use]
    pub const fn variant(&self) -> CaseVariant {
        self.kind.variant()
    }

    #[must_use]
    pub fn dependency_name(&self) -> Option<&str> {
        self.dependency.as_ref().map(|d| d.name.as_str())
    }
}

/// Wrap a plain function as a [`CaseBehavior`].
pub fn behavior<F>(f: F) -> CaseBehavior
where
    F: Fn(&mut CaseContext<'_>, &EnvVars) -> HarnessResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> CaseBehavior {
        behavior(|_, _| Ok(()))
    }

    #[test]
    fn general_case_parses_declared_ranges() {
        let case = TestCase::general(
            "mongo-crud",
            "mongo",
            "go.mongodb.org/mongo-driver",
            "v1.11.1",
            "v1.15.1",
            "1.18",
            "",
            noop(),
        )
        .unwrap();
        assert_eq!(case.variant(), CaseVariant::General);
        assert_eq!(case.dependency_name(), Some("go.mongodb.org/mongo-driver"));
        assert_eq!(case.max_runtime, None);
        let range = case.dependency.as_ref().unwrap();
        assert!(range.contains(&"v1.13.0".parse().unwrap()));
        assert!(!range.contains(&"v1.16.0".parse().unwrap()));
    }

    #[test]
    fn muzzle_requires_sources() {
        let err = TestCase::muzzle("m", "mongo", "dep", "v1.0.0", "v1.1.0", "1.18", "", &[])
            .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn malformed_versions_are_configuration_errors() {
        let err = TestCase::latest_depth("l", "mongo", "dep", "1.x", "", "1.18", "", noop())
            .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn builders_set_flags() {
        let case = TestCase::toolchain("build", "build", "1.18", "1.22", noop())
            .unwrap()
            .expecting_failure();
        assert!(case.expect_failure);
        assert!(case.dependency.is_none());
        assert_eq!(case.max_runtime, Some(RuntimeVersion::new(1, 22, 0)));
        assert_eq!(format!("{:?}", case.kind), "General { .. }");
    }
}
