//! Per-unit case context and stage machine.
//!
//! A [`CaseContext`] is what a case behavior drives: it selects the
//! application, provisions services, instruments and runs. Stages only move
//! forward; the stage in effect when the unit stops is part of its result.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::case::{EnvVars, TestCase};
use crate::config::HarnessConfig;
use crate::dispatcher::Collaborators;
use crate::error::{HarnessError, HarnessResult};
use crate::execute::{RunRecord, run_app, run_muzzle};
use crate::instrument::{BuildArtifact, InstrumentRequest, Workspace};
use crate::muzzle::SurfaceReport;
use crate::process::{CancelToken, ProcessSpec, run_process};
use crate::provision::{ServiceLease, ServiceSpec};
use crate::resolver::VersionCombination;
use crate::structured_log::{LogEntry, LogLevel, SharedEmitter, emit_shared};
use crate::version::ModuleVersion;

/// Dispatcher state of one (case, combination) unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Provisioning,
    Instrumenting,
    Executing,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Instrumenting => "instrumenting",
            Self::Executing => "executing",
        }
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

/// Pins the dependency of an application copy to one version.
pub trait DependencyPinner: Send + Sync {
    fn pin(
        &self,
        app_dir: &Path,
        dependency: &str,
        version: &ModuleVersion,
        env: &EnvVars,
        cancel: &CancelToken,
    ) -> HarnessResult<()>;
}

/// `go get <dependency>@<version>` in the application directory.
#[derive(Debug, Clone)]
pub struct GoGetPinner {
    pub go: PathBuf,
    pub timeout: Duration,
}

impl DependencyPinner for GoGetPinner {
    fn pin(
        &self,
        app_dir: &Path,
        dependency: &str,
        version: &ModuleVersion,
        env: &EnvVars,
        cancel: &CancelToken,
    ) -> HarnessResult<()> {
        let spec = ProcessSpec::new(&self.go, self.timeout)
            .arg("get")
            .arg(format!("{dependency}@{version}"))
            .cwd(app_dir)
            .envs(env);
        let out = run_process(&spec, cancel)?;
        if out.timed_out {
            return Err(HarnessError::timed_out(&spec.command_line(), self.timeout));
        }
        if !out.success() {
            return Err(HarnessError::Infrastructure(format!(
                "pinning {dependency}@{version} failed: {}",
                out.combined().trim()
            )));
        }
        Ok(())
    }
}

/// Everything one behavior invocation may touch.
pub struct CaseContext<'a> {
    case: &'a TestCase,
    combination: &'a VersionCombination,
    tools: &'a Collaborators,
    config: &'a HarnessConfig,
    cancel: &'a CancelToken,
    log: &'a SharedEmitter,
    workspace: Workspace,
    app: Option<AppCheckout>,
    stage: Stage,
    started: Instant,
    transitions: Vec<StageRecord>,
    leases: Vec<ServiceLease>,
    artifacts: Vec<PathBuf>,
    /// Rendered error of the last rule or build rejection from [`Self::instrument`].
    rejection: Option<String>,
}

struct AppCheckout {
    template: PathBuf,
    dir: PathBuf,
}

impl<'a> CaseContext<'a> {
    /// Fresh context in `Pending`, with its own work directory.
    pub fn new(
        case: &'a TestCase,
        combination: &'a VersionCombination,
        tools: &'a Collaborators,
        config: &'a HarnessConfig,
        cancel: &'a CancelToken,
        log: &'a SharedEmitter,
    ) -> HarnessResult<Self> {
        let workspace = Workspace::create(&config.work_root, &case.name, combination)?;
        Ok(Self {
            case,
            combination,
            tools,
            config,
            cancel,
            log,
            workspace,
            app: None,
            stage: Stage::Pending,
            started: Instant::now(),
            transitions: vec![StageRecord {
                stage: Stage::Pending,
                elapsed_ms: 0,
            }],
            leases: Vec::new(),
            artifacts: Vec::new(),
            rejection: None,
        })
    }

    #[must_use]
    pub fn case(&self) -> &TestCase {
        self.case
    }

    #[must_use]
    pub fn combination(&self) -> &VersionCombination {
        self.combination
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub fn transitions(&self) -> &[StageRecord] {
        &self.transitions
    }

    #[must_use]
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        self.cancel
    }

    /// Diagnostic files written so far.
    #[must_use]
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// The last rule or build rejection raised by the tool step and not yet
    /// consumed by [`Self::instrument_expecting_failure`].
    #[must_use]
    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    /// Whether `err` is the rejection the tool step raised, as opposed to a
    /// configuration error from anywhere else in the behavior.
    #[must_use]
    pub fn is_rejection(&self, err: &HarnessError) -> bool {
        matches!(err, HarnessError::Configuration(_) | HarnessError::BuildFailure { .. })
            && self.rejection.as_deref() == Some(err.to_string().as_str())
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Move to `next`. Staying put is allowed; going back is a case
    /// definition error.
    pub fn advance(&mut self, next: Stage) -> HarnessResult<()> {
        if next < self.stage {
            return Err(HarnessError::Configuration(format!(
                "case '{}' moved from {} back to {}",
                self.case.name,
                self.stage.as_str(),
                next.as_str()
            )));
        }
        if next > self.stage {
            self.stage = next;
            self.transitions.push(StageRecord {
                stage: next,
                elapsed_ms: duration_ms(self.started.elapsed()),
            });
            self.emit(self.entry(LogLevel::Debug, "stage_transition"));
        }
        Ok(())
    }

    /// Toolchain selection and combination markers for every child process.
    #[must_use]
    pub fn env_for_runtime(&self) -> EnvVars {
        let mut env = EnvVars::new();
        env.insert("GOTOOLCHAIN".to_string(), self.combination.runtime.toolchain_name());
        env.insert("COMPAT_CASE".to_string(), self.case.name.clone());
        if let Some(version) = &self.combination.dependency_version {
            env.insert("COMPAT_DEPENDENCY_VERSION".to_string(), version.to_string());
        }
        env
    }

    /// Environment of every live lease (`MONGO_HOST`, `MONGO_PORT`, ..).
    #[must_use]
    pub fn service_env(&self) -> EnvVars {
        self.leases.iter().flat_map(ServiceLease::env_vars).collect()
    }

    /// Start `spec` for the rest of this unit. The lease is released when the
    /// context is released or dropped.
    pub fn provision(&mut self, spec: &ServiceSpec) -> HarnessResult<&ServiceLease> {
        self.advance(Stage::Provisioning)?;
        let lease = self.tools.provisioner.provision(spec, self.cancel)?;
        self.emit(
            self.entry(LogLevel::Info, "service_start").with_details(serde_json::json!({
                "kind": lease.kind(),
                "container": lease.container_id(),
                "port": lease.endpoint().port,
            })),
        );
        self.leases.push(lease);
        let idx = self.leases.len() - 1;
        Ok(&self.leases[idx])
    }

    /// Check out application template `name` into the work directory and pin
    /// the dependency to this combination's version.
    pub fn use_app(&mut self, name: &str) -> HarnessResult<&Path> {
        let dir = self.workspace.checkout_app(&self.config.apps_root, name)?;
        if let (Some(dependency), Some(version)) =
            (self.case.dependency_name(), &self.combination.dependency_version)
        {
            self.tools
                .pinner
                .pin(&dir, dependency, version, &self.env_for_runtime(), self.cancel)?;
        }
        let app = self.app.insert(AppCheckout {
            template: self.config.apps_root.join(name),
            dir,
        });
        Ok(app.dir.as_path())
    }

    /// Instrument and build the selected application with tool-style
    /// arguments, e.g. `["-rule=a.json", "--", "cmd/foo.go"]`.
    ///
    /// Rule paths resolve against the application template.
    pub fn instrument(&mut self, args: &[&str]) -> HarnessResult<BuildArtifact> {
        self.advance(Stage::Instrumenting)?;
        let (template, dir) = self.app_paths()?;
        let request = match InstrumentRequest::from_args(args, &template) {
            Ok(request) => request,
            Err(err) => {
                self.rejection = Some(err.to_string());
                return Err(err);
            }
        };
        let started = Instant::now();
        let result = self
            .tools
            .instrumenter
            .instrument(&dir, &request, &self.env_for_runtime(), self.cancel);
        if let Err(err @ (HarnessError::Configuration(_) | HarnessError::BuildFailure { .. })) =
            &result
        {
            self.rejection = Some(err.to_string());
        }

        let build_log = dir.join("build.log");
        if build_log.is_file() && !self.artifacts.contains(&build_log) {
            self.artifacts.push(build_log);
        }
        let mut entry = self
            .entry(LogLevel::Info, "instrument")
            .with_duration_ms(duration_ms(started.elapsed()))
            .with_details(serde_json::json!({ "args": request.to_tool_args() }));
        if let Err(err) = &result {
            entry = entry.with_details(serde_json::json!({
                "args": request.to_tool_args(),
                "error": err.to_string(),
            }));
            if let HarnessError::BuildFailure { exit_code, .. } = err {
                entry = entry.with_exit_code(*exit_code);
            }
        }
        self.emit(entry);
        result
    }

    /// Negative instrumentation step: succeeds only when the tool rejects the
    /// rules or the build fails.
    pub fn instrument_expecting_failure(&mut self, args: &[&str]) -> HarnessResult<HarnessError> {
        match self.instrument(args) {
            Ok(_) => Err(HarnessError::Assertion(format!(
                "instrumentation of {args:?} was expected to fail but succeeded"
            ))),
            Err(err) if self.is_rejection(&err) => {
                self.rejection = None;
                Ok(err)
            }
            Err(other) => Err(other),
        }
    }

    /// Run a built artifact with `env` layered over the runtime environment.
    pub fn run_app(&mut self, artifact: &str, env: &EnvVars) -> HarnessResult<RunRecord> {
        self.advance(Stage::Executing)?;
        let (_, dir) = self.app_paths()?;
        let mut merged = self.env_for_runtime();
        merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let result = run_app(self.tools.launcher.as_ref(), &dir, artifact, &merged, self.cancel);
        let output_log = dir.join(format!("{artifact}.run.log"));
        if output_log.is_file() && !self.artifacts.contains(&output_log) {
            self.artifacts.push(output_log);
        }
        let mut entry = self.entry(LogLevel::Info, "run_app").with_details(serde_json::json!({
            "artifact": artifact,
        }));
        match &result {
            Ok(record) => {
                entry = entry
                    .with_exit_code(0)
                    .with_duration_ms(duration_ms(record.duration));
            }
            Err(HarnessError::RuntimeFailure { exit_code, .. }) => {
                entry = entry.with_exit_code(*exit_code);
            }
            Err(_) => {}
        }
        self.emit(entry);
        result
    }

    /// Static surface check of `sources` from the case's application template.
    pub fn check_surface(&mut self, sources: &[String]) -> HarnessResult<SurfaceReport> {
        self.advance(Stage::Executing)?;
        let (Some(dependency), Some(version)) =
            (self.case.dependency_name(), &self.combination.dependency_version)
        else {
            return Err(HarnessError::Configuration(format!(
                "muzzle case '{}' has no dependency version",
                self.case.name
            )));
        };
        let app_dir = self.config.apps_root.join(&self.case.module);
        let result = run_muzzle(
            self.tools.surfaces.as_ref(),
            &app_dir,
            dependency,
            version,
            sources,
            self.workspace.root(),
        );
        let report_path = self.workspace.root().join("muzzle-report.json");
        if report_path.is_file() {
            self.artifacts.push(report_path);
        }
        result
    }

    /// Re-pin the selected application to `version` (LatestDepth behaviors
    /// and explicit version checks).
    pub fn pin_dependency(&mut self, version: &ModuleVersion) -> HarnessResult<()> {
        let Some(dependency) = self.case.dependency_name() else {
            return Err(HarnessError::Configuration(format!(
                "case '{}' declares no dependency to pin",
                self.case.name
            )));
        };
        let (_, dir) = self.app_paths()?;
        self.tools
            .pinner
            .pin(&dir, dependency, version, &self.env_for_runtime(), self.cancel)
    }

    /// Stop every service this unit started. The first failure is returned
    /// after all leases have been attempted.
    pub fn release_services(&mut self) -> HarnessResult<()> {
        let mut first_err = None;
        for lease in std::mem::take(&mut self.leases) {
            let details = serde_json::json!({
                "kind": lease.kind(),
                "container": lease.container_id(),
            });
            let outcome = lease.release();
            let mut entry = self.entry(LogLevel::Info, "service_stop").with_details(details);
            if let Err(err) = outcome {
                entry.level = LogLevel::Warn;
                entry = entry.with_details(serde_json::json!({ "error": err.to_string() }));
                first_err.get_or_insert(err);
            }
            self.emit(entry);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Log entry prefilled with this unit's case, combination and stage.
    #[must_use]
    pub fn entry(&self, level: LogLevel, event: &str) -> LogEntry {
        LogEntry::new("", level, event)
            .with_case(&self.case.name)
            .with_combination(
                self.combination.dependency_version.as_ref().map(ToString::to_string),
                self.combination.runtime.to_string(),
            )
            .with_stage(self.stage.as_str())
    }

    pub fn emit(&self, entry: LogEntry) {
        emit_shared(self.log, entry);
    }

    fn app_paths(&self) -> HarnessResult<(PathBuf, PathBuf)> {
        self.app
            .as_ref()
            .map(|a| (a.template.clone(), a.dir.clone()))
            .ok_or_else(|| {
                HarnessError::Configuration(format!(
                    "case '{}' must select an application before building or running",
                    self.case.name
                ))
            })
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
