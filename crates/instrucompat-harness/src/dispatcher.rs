//! Case dispatcher: resolve every case, run each combination through
//! provision, instrument and execute on a bounded worker pool, and fold the
//! outcomes into a [`CompatReport`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::case::{CaseKind, TestCase};
use crate::config::HarnessConfig;
use crate::context::{CaseContext, DependencyPinner, GoGetPinner, Stage, duration_ms};
use crate::error::{FailureKind, HarnessError, HarnessResult};
use crate::execute::{AppLauncher, ProcessLauncher};
use crate::instrument::{Instrumenter, ToolInstrumenter};
use crate::muzzle::{ApiSurfaceSource, SurfaceCatalog};
use crate::process::CancelToken;
use crate::provision::{DockerCli, Provisioner};
use crate::registry::CaseRegistry;
use crate::report::CompatReport;
use crate::resolver::{
    GoProxyReleases, ReleaseSource, Resolver, StaticReleaseIndex, ToolchainSet, VersionCombination,
};
use crate::result::{CaseResult, CaseStatus};
use crate::structured_log::{
    LogEmitter, LogEntry, LogLevel, SharedEmitter, emit_shared, now_utc,
};

const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// External systems the harness drives.
pub struct Collaborators {
    pub releases: Arc<dyn ReleaseSource>,
    pub toolchains: ToolchainSet,
    pub provisioner: Provisioner,
    pub instrumenter: Arc<dyn Instrumenter>,
    pub launcher: Arc<dyn AppLauncher>,
    pub surfaces: Arc<dyn ApiSurfaceSource>,
    pub pinner: Arc<dyn DependencyPinner>,
}

impl Collaborators {
    /// Real collaborators: docker, the instrumentation tool, `go`.
    pub fn from_config(config: &HarnessConfig, cancel: &CancelToken) -> HarnessResult<Self> {
        let releases: Arc<dyn ReleaseSource> = match &config.release_index {
            Some(path) => Arc::new(StaticReleaseIndex::from_file(path)?),
            None => Arc::new(GoProxyReleases {
                go: config.go.clone(),
                timeout: config.run_timeout,
                cwd: None,
            }),
        };
        let toolchains = match &config.runtime_versions {
            Some(versions) => ToolchainSet::from_versions(versions.clone()),
            None => ToolchainSet::detect(&config.go, config.run_timeout, cancel)?,
        };
        let runtime = Arc::new(DockerCli {
            docker: config.docker.clone(),
            start_timeout: config.service_start_timeout,
            stop_timeout: CONTAINER_STOP_TIMEOUT,
        });
        Ok(Self {
            releases,
            toolchains,
            provisioner: Provisioner::new(
                runtime,
                config.disabled_services.clone(),
                config.service_settle,
            ),
            instrumenter: Arc::new(ToolInstrumenter {
                tool: config.tool.clone(),
                timeout: config.build_timeout,
            }),
            launcher: Arc::new(ProcessLauncher {
                timeout: config.run_timeout,
            }),
            surfaces: Arc::new(SurfaceCatalog {
                root: config.surfaces_root.clone(),
            }),
            pinner: Arc::new(GoGetPinner {
                go: config.go.clone(),
                timeout: config.build_timeout,
            }),
        })
    }
}

/// One (case, combination) unit of work.
struct Unit {
    order: usize,
    seq: usize,
    case: Arc<TestCase>,
    combination: VersionCombination,
}

pub struct Dispatcher<'r> {
    registry: &'r CaseRegistry,
    tools: Collaborators,
    config: HarnessConfig,
    cancel: CancelToken,
    log: SharedEmitter,
}

impl<'r> Dispatcher<'r> {
    /// Dispatcher logging into an in-memory buffer until [`Self::with_log`].
    #[must_use]
    pub fn new(registry: &'r CaseRegistry, tools: Collaborators, config: HarnessConfig) -> Self {
        Self {
            registry,
            tools,
            config,
            cancel: CancelToken::new(),
            log: Arc::new(Mutex::new(LogEmitter::to_buffer("run"))),
        }
    }

    #[must_use]
    pub fn with_log(mut self, emitter: LogEmitter) -> Self {
        self.log = Arc::new(Mutex::new(emitter));
        self
    }

    /// Share an externally controlled cancellation flag.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    #[must_use]
    pub fn log(&self) -> &SharedEmitter {
        &self.log
    }

    #[must_use]
    pub fn tools(&self) -> &Collaborators {
        &self.tools
    }

    /// Run every registered case whose name contains `filter`.
    ///
    /// Never fails: every per-case problem becomes a result.
    pub fn run(&self, filter: Option<&str>) -> CompatReport {
        let cancel = match self.config.run_deadline {
            Some(deadline) => self.cancel.deadline_after(deadline),
            None => self.cancel.clone(),
        };
        let run_id = self.log.lock().run_id().to_string();
        let started = Instant::now();
        let cases: Vec<Arc<TestCase>> = self
            .registry
            .all()
            .into_iter()
            .filter(|c| filter.is_none_or(|f| c.name.contains(f)))
            .collect();
        emit_shared(
            &self.log,
            LogEntry::new("", LogLevel::Info, "run_start").with_details(serde_json::json!({
                "cases": cases.len(),
                "jobs": self.config.jobs,
                "runtimes": self
                    .tools
                    .toolchains
                    .versions()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
            })),
        );

        let mut finished: Vec<(usize, usize, CaseResult)> = Vec::new();
        let mut units = Vec::new();
        let resolver = Resolver::new(
            self.tools.releases.as_ref(),
            &self.tools.toolchains,
            self.config.include_prerelease,
        );
        for (order, case) in cases.iter().enumerate() {
            match resolver.resolve(case, &cancel) {
                Err(err) => {
                    let result = CaseResult::resolution_failed(&case.name, case.variant(), &err);
                    self.log_terminal(&result);
                    finished.push((order, 0, result));
                }
                Ok(combos) if combos.is_empty() => {
                    let result = CaseResult::not_applicable(
                        &case.name,
                        case.variant(),
                        "no dependency or runtime version satisfies the declared ranges",
                    );
                    self.log_terminal(&result);
                    finished.push((order, 0, result));
                }
                Ok(combos) => {
                    units.extend(combos.into_iter().enumerate().map(|(seq, combination)| Unit {
                        order,
                        seq,
                        case: Arc::clone(case),
                        combination,
                    }));
                }
            }
        }

        finished.extend(self.run_units(&units, &cancel));
        finished.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let live = self.tools.provisioner.tracker().live();
        if live > 0 {
            eprintln!("WARN: {live} service lease(s) still live after the run");
            emit_shared(
                &self.log,
                LogEntry::new("", LogLevel::Error, "lease_leak")
                    .with_details(serde_json::json!({ "live": live })),
            );
        }

        let report = CompatReport::build(
            &run_id,
            &now_utc(),
            finished.into_iter().map(|(_, _, r)| r).collect(),
        );
        emit_shared(
            &self.log,
            LogEntry::new("", LogLevel::Info, "run_end")
                .with_duration_ms(duration_ms(started.elapsed()))
                .with_details(serde_json::to_value(&report.summary).unwrap_or_default()),
        );
        if let Err(err) = self.log.lock().flush() {
            eprintln!("WARN: structured log flush failed: {err}");
        }
        report
    }

    fn run_units(&self, units: &[Unit], cancel: &CancelToken) -> Vec<(usize, usize, CaseResult)> {
        let next = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(units.len()));
        let workers = self.config.jobs.max(1).min(units.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(unit) = units.get(idx) else {
                            break;
                        };
                        let result = if cancel.is_cancelled() {
                            CaseResult::cancelled(
                                &unit.case.name,
                                unit.case.variant(),
                                unit.combination.clone(),
                            )
                        } else {
                            self.run_unit(&unit.case, &unit.combination, cancel)
                        };
                        self.log_terminal(&result);
                        results.lock().push((unit.order, unit.seq, result));
                    }
                });
            }
        });
        results.into_inner()
    }

    /// Drive one unit to a terminal status.
    fn run_unit(
        &self,
        case: &TestCase,
        combination: &VersionCombination,
        cancel: &CancelToken,
    ) -> CaseResult {
        let started = Instant::now();
        let context =
            CaseContext::new(case, combination, &self.tools, &self.config, cancel, &self.log);
        let mut ctx = match context {
            Ok(ctx) => ctx,
            Err(err) => {
                return CaseResult {
                    case: case.name.clone(),
                    variant: case.variant(),
                    combination: Some(combination.clone()),
                    status: CaseStatus::InfraError,
                    stage_reached: Stage::Pending,
                    failure_kind: Some(FailureKind::Infrastructure),
                    diagnostic: Some(err.diagnostic()),
                    duration_ms: duration_ms(started.elapsed()),
                    artifacts: Vec::new(),
                };
            }
        };
        ctx.emit(ctx.entry(LogLevel::Info, "case_start"));

        let evaluated = panic::catch_unwind(AssertUnwindSafe(|| evaluate(&mut ctx, case)));
        // Leases are released here on every path, panics included.
        let released = ctx.release_services();

        let (status, failure_kind, diagnostic) = match evaluated {
            Err(payload) => (
                CaseStatus::Failed,
                Some(FailureKind::Panic),
                Some(format!("case behavior panicked: {}", panic_message(payload.as_ref()))),
            ),
            Ok(outcome) => match (judge(case, outcome, |err| ctx.is_rejection(err)), released) {
                (Ok(()), Ok(())) => (CaseStatus::Passed, None, None),
                (Ok(()), Err(err)) | (Err(err), _) => (
                    CaseStatus::for_error(&err, ctx.stage()),
                    Some(err.kind()),
                    Some(err.diagnostic()),
                ),
            },
        };

        CaseResult {
            case: case.name.clone(),
            variant: case.variant(),
            combination: Some(combination.clone()),
            status,
            stage_reached: ctx.stage(),
            failure_kind,
            diagnostic,
            duration_ms: duration_ms(started.elapsed()),
            artifacts: ctx.artifacts().iter().map(|p| p.display().to_string()).collect(),
        }
    }

    fn log_terminal(&self, result: &CaseResult) {
        let level = match result.status {
            CaseStatus::Passed | CaseStatus::Skipped => LogLevel::Info,
            CaseStatus::Failed | CaseStatus::InfraError => LogLevel::Error,
        };
        let mut entry = LogEntry::new("", level, "case_terminal")
            .with_case(&result.case)
            .with_stage(result.stage_reached.as_str())
            .with_outcome(result.status.outcome())
            .with_duration_ms(result.duration_ms)
            .with_artifacts(result.artifacts.clone())
            .with_details(serde_json::json!({
                "variant": result.variant.as_str(),
                "status": result.status.as_str(),
                "failure_kind": result.failure_kind.map(FailureKind::as_str),
            }));
        if let Some(combo) = &result.combination {
            entry = entry.with_combination(
                combo.dependency_version.as_ref().map(ToString::to_string),
                combo.runtime.to_string(),
            );
        }
        if matches!(result.status, CaseStatus::Failed | CaseStatus::InfraError) {
            eprintln!(
                "FAIL {} [{}]: {}",
                result.case,
                result.combination.as_ref().map_or_else(String::new, ToString::to_string),
                result.failure_kind.map_or("unknown", FailureKind::as_str)
            );
        }
        emit_shared(&self.log, entry);
    }
}

/// Provision the declared service, then run the variant's evaluation.
fn evaluate(ctx: &mut CaseContext<'_>, case: &TestCase) -> HarnessResult<()> {
    if let Some(service) = &case.service {
        ctx.provision(service)?;
    }
    let env = ctx.service_env();
    match &case.kind {
        CaseKind::General { behavior } | CaseKind::LatestDepth { behavior } => behavior(ctx, &env),
        CaseKind::Muzzle { sources } => ctx.check_surface(sources).map(|_| ()),
    }
}

/// Apply the negative-test remap for cases that expect failure. Only a
/// rejection raised by the instrumentation step counts as the expected
/// failure; `from_tool` tells the two apart.
fn judge(
    case: &TestCase,
    outcome: HarnessResult<()>,
    from_tool: impl Fn(&HarnessError) -> bool,
) -> HarnessResult<()> {
    if !case.expect_failure {
        return outcome;
    }
    match outcome {
        Ok(()) => Err(HarnessError::Assertion(format!(
            "case '{}' was expected to fail instrumentation but succeeded",
            case.name
        ))),
        Err(err @ (HarnessError::Configuration(_) | HarnessError::BuildFailure { .. }))
            if from_tool(&err) =>
        {
            Ok(())
        }
        Err(other) => Err(other),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_case(expect_failure: bool) -> TestCase {
        let case =
            TestCase::toolchain("t", "build", "1.18", "", crate::case::behavior(|_, _| Ok(())))
                .unwrap();
        if expect_failure { case.expecting_failure() } else { case }
    }

    fn tool_rejected(_: &HarnessError) -> bool {
        true
    }

    fn not_from_tool(_: &HarnessError) -> bool {
        false
    }

    fn build_failure() -> HarnessError {
        HarnessError::BuildFailure {
            exit_code: 1,
            summary: String::new(),
            log: String::new(),
        }
    }

    #[test]
    fn negative_cases_pass_on_tool_rejections() {
        let case = noop_case(true);
        let bad_rule = HarnessError::Configuration("bad rule".into());
        assert!(judge(&case, Err(bad_rule), tool_rejected).is_ok());
        assert!(judge(&case, Err(build_failure()), tool_rejected).is_ok());
        assert!(matches!(
            judge(&case, Ok(()), tool_rejected),
            Err(HarnessError::Assertion(_))
        ));
    }

    #[test]
    fn negative_cases_fail_on_errors_outside_the_tool_step() {
        let case = noop_case(true);
        let missing_app = HarnessError::Configuration("unknown application 'x'".into());
        assert!(matches!(
            judge(&case, Err(missing_app), not_from_tool),
            Err(HarnessError::Configuration(_))
        ));
        assert!(matches!(
            judge(&case, Err(HarnessError::Infrastructure("docker".into())), tool_rejected),
            Err(HarnessError::Infrastructure(_))
        ));
    }

    #[test]
    fn positive_cases_are_untouched() {
        let case = noop_case(false);
        assert!(judge(&case, Ok(()), tool_rejected).is_ok());
        let rule = HarnessError::Configuration("x".into());
        assert!(judge(&case, Err(rule), tool_rejected).is_err());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
    }
}
