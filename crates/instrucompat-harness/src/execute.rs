//! Execution runner: launch built artifacts, or run the static muzzle diff.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::case::EnvVars;
use crate::error::{HarnessError, HarnessResult};
use crate::muzzle::{ApiSurfaceSource, SurfaceReport, check_surface};
use crate::process::{CancelToken, ProcessOutput, ProcessSpec, run_process};
use crate::version::ModuleVersion;

/// Launches an instrumented artifact.
pub trait AppLauncher: Send + Sync {
    fn launch(
        &self,
        workdir: &Path,
        artifact: &str,
        env: &EnvVars,
        cancel: &CancelToken,
    ) -> HarnessResult<ProcessOutput>;
}

/// Runs `<workdir>/<artifact>` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub timeout: Duration,
}

impl AppLauncher for ProcessLauncher {
    fn launch(
        &self,
        workdir: &Path,
        artifact: &str,
        env: &EnvVars,
        cancel: &CancelToken,
    ) -> HarnessResult<ProcessOutput> {
        let program = workdir.join(artifact);
        if !program.is_file() {
            return Err(HarnessError::Infrastructure(format!(
                "artifact {} does not exist",
                program.display()
            )));
        }
        let spec = ProcessSpec::new(program, self.timeout).cwd(workdir).envs(env);
        run_process(&spec, cancel)
    }
}

/// A successful application run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub artifact: String,
    pub duration: Duration,
    /// Captured output, written next to the artifact.
    pub output_log: PathBuf,
}

/// Run `artifact` with `env` and judge it by its exit code.
///
/// Exit 0 passes. A non-zero exit or a timeout is a runtime failure carrying
/// the combined output. Launch problems stay infrastructure errors.
pub fn run_app(
    launcher: &dyn AppLauncher,
    workdir: &Path,
    artifact: &str,
    env: &EnvVars,
    cancel: &CancelToken,
) -> HarnessResult<RunRecord> {
    let out = launcher.launch(workdir, artifact, env, cancel)?;
    let output = out.combined();
    let output_log = workdir.join(format!("{artifact}.run.log"));
    fs::write(&output_log, &output)?;

    if out.success() {
        return Ok(RunRecord {
            artifact: artifact.to_string(),
            duration: out.duration,
            output_log,
        });
    }
    Err(HarnessError::RuntimeFailure {
        artifact: artifact.to_string(),
        exit_code: out.exit_code,
        output,
    })
}

/// Static API-surface check of `sources` (relative to `app_dir`) against
/// `dependency@version`. The JSON report is written to `report_dir`.
pub fn run_muzzle(
    surfaces: &dyn ApiSurfaceSource,
    app_dir: &Path,
    dependency: &str,
    version: &ModuleVersion,
    sources: &[String],
    report_dir: &Path,
) -> HarnessResult<SurfaceReport> {
    let mut files = Vec::with_capacity(sources.len());
    for source in sources {
        let path = app_dir.join(source);
        let body = fs::read_to_string(&path).map_err(|e| {
            HarnessError::Configuration(format!("muzzle source {} unreadable: {e}", path.display()))
        })?;
        files.push((source.clone(), body));
    }

    let surface = surfaces.surface(dependency, version)?;
    let report = check_surface(&files, &surface);
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| HarnessError::Infrastructure(format!("serialize muzzle report: {e}")))?;
    fs::write(report_dir.join("muzzle-report.json"), json)?;

    if report.passed() {
        return Ok(report);
    }
    Err(HarnessError::SurfaceViolation {
        dependency: dependency.to_string(),
        version: version.to_string(),
        count: report.violations.len(),
        report: report.to_text(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muzzle::InMemorySurfaces;

    struct FixedLauncher(i32, &'static str);

    impl AppLauncher for FixedLauncher {
        fn launch(
            &self,
            _workdir: &Path,
            _artifact: &str,
            _env: &EnvVars,
            _cancel: &CancelToken,
        ) -> HarnessResult<ProcessOutput> {
            Ok(ProcessOutput {
                exit_code: self.0,
                stdout: self.1.to_string(),
                stderr: String::new(),
                timed_out: false,
                duration: Duration::from_millis(3),
            })
        }
    }

    #[test]
    fn zero_exit_passes_and_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FixedLauncher(0, "ok");
        let record =
            run_app(&launcher, dir.path(), "app", &EnvVars::new(), &CancelToken::new()).unwrap();
        assert_eq!(fs::read_to_string(record.output_log).unwrap(), "ok");
    }

    #[test]
    fn nonzero_exit_is_runtime_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FixedLauncher(3, "boom");
        let err = run_app(&launcher, dir.path(), "app", &EnvVars::new(), &CancelToken::new())
            .unwrap_err();
        match err {
            HarnessError::RuntimeFailure { exit_code, output, .. } => {
                assert_eq!(exit_code, 3);
                assert_eq!(output, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_artifact_is_infrastructure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher {
            timeout: Duration::from_secs(1),
        };
        let err = run_app(&launcher, dir.path(), "nope", &EnvVars::new(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, HarnessError::Infrastructure(_)));
    }

    #[cfg(unix)]
    #[test]
    fn launcher_merges_environment() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("check_port");
        let body = "#!/bin/sh\n[ \"$MONGO_PORT\" = 32768 ] || exit 7\necho ready\n";
        fs::write(&script, body).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let launcher = ProcessLauncher {
            timeout: Duration::from_secs(10),
        };
        let mut env = EnvVars::new();
        assert!(run_app(&launcher, dir.path(), "check_port", &env, &CancelToken::new()).is_err());
        env.insert("MONGO_PORT".into(), "32768".into());
        run_app(&launcher, dir.path(), "check_port", &env, &CancelToken::new()).unwrap();
    }

    #[test]
    fn muzzle_flags_out_of_surface_symbols() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.go"),
            "package main\nimport \"example.com/dep\"\nfunc main() { dep.Old(); dep.New() }\n",
        )
        .unwrap();
        let mut surfaces = InMemorySurfaces::new();
        surfaces.insert("example.com/dep", "v1.0.0", &["Old", "New"]).unwrap();
        surfaces.insert("example.com/dep", "v2.0.0", &["New"]).unwrap();
        let sources = vec!["main.go".to_string()];
        let check = |version: &str| {
            let version = version.parse().unwrap();
            run_muzzle(&surfaces, dir.path(), "example.com/dep", &version, &sources, dir.path())
        };

        let ok = check("v1.0.0").unwrap();
        assert_eq!(ok.references, 2);
        assert!(dir.path().join("muzzle-report.json").is_file());

        let err = check("v2.0.0").unwrap_err();
        assert!(matches!(err, HarnessError::SurfaceViolation { count: 1, .. }));

        let err = check("v3.0.0").unwrap_err();
        assert!(matches!(err, HarnessError::Infrastructure(_)));
    }
}
