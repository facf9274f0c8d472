//! Instrumentation driver.
//!
//! Turns an instrumentation request (rule files, tool flags, build targets)
//! into an invocation of the external tool inside a case-scoped working copy
//! of the application, and classifies the outcome:
//! - malformed rule references never reach the tool (configuration error),
//! - the tool's own "invalid rule specification" exit is also configuration,
//! - any other failure is a build failure carrying the build log.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::case::EnvVars;
use crate::error::{HarnessError, HarnessResult};
use crate::process::{CancelToken, ProcessSpec, TIMEOUT_EXIT_CODE, run_process};
use crate::resolver::{VersionCombination, sanitize};

/// Rule presets the tool recognizes by name.
pub const KNOWN_PRESETS: &[&str] = &["default"];

/// Exit status the tool uses for an invalid rule specification.
pub const INVALID_RULE_EXIT_CODE: i32 = 2;

/// One entry of a rule specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEntry {
    Preset(String),
    /// Absolute path of an existing `.json` rule file.
    File(PathBuf),
}

/// Ordered set of rules applied in one instrumentation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSpec {
    entries: Vec<RuleEntry>,
}

impl RuleSpec {
    /// Parse a comma-separated rule argument. Relative paths resolve against
    /// `base_dir` (the application template directory).
    pub fn parse(raw: &str, base_dir: &Path) -> HarnessResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let entries = raw
            .split(',')
            .map(|item| parse_rule_entry(item.trim(), base_dir))
            .collect::<HarnessResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Rules of `self` followed by those of `other`.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.entries.extend(other.entries);
        self
    }

    #[must_use]
    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `-rule=<a>,<b>` or `None` when no rules were given.
    #[must_use]
    pub fn to_arg(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let joined = self
            .entries
            .iter()
            .map(|e| match e {
                RuleEntry::Preset(name) => name.clone(),
                RuleEntry::File(path) => path.display().to_string(),
            })
            .collect::<Vec<_>>()
            .join(",");
        Some(format!("-rule={joined}"))
    }
}

fn parse_rule_entry(item: &str, base_dir: &Path) -> HarnessResult<RuleEntry> {
    if item.is_empty() {
        return Err(HarnessError::Configuration(
            "empty entry in rule list".to_string(),
        ));
    }
    let looks_like_path = item.contains('/') || item.contains('\\') || item.contains('.');
    if !looks_like_path {
        if KNOWN_PRESETS.contains(&item) {
            return Ok(RuleEntry::Preset(item.to_string()));
        }
        return Err(HarnessError::Configuration(format!(
            "unknown rule preset '{item}'"
        )));
    }
    if Path::new(item).extension().and_then(|e| e.to_str()) != Some("json") {
        return Err(HarnessError::Configuration(format!(
            "rule file '{item}' must be a .json file"
        )));
    }
    let path = base_dir.join(item);
    let resolved = fs::canonicalize(&path).map_err(|e| {
        HarnessError::Configuration(format!("rule file {} not found: {e}", path.display()))
    })?;
    Ok(RuleEntry::File(resolved))
}

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildTarget {
    /// No explicit target; the tool builds the current module.
    CurrentModule,
    /// Build arguments: package paths, directories, files, `-o <name>`.
    Args(Vec<String>),
}

/// One instrumentation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentRequest {
    pub rules: RuleSpec,
    /// Tool flags other than `-rule`, e.g. `-debuglog`.
    pub flags: Vec<String>,
    pub target: BuildTarget,
}

impl InstrumentRequest {
    /// Parse tool-style arguments: flags, `--`, then build arguments.
    ///
    /// `-rule=` may repeat; its values are merged in order. Empty build
    /// arguments are dropped, and no remaining arguments means the current
    /// module.
    pub fn from_args(args: &[&str], base_dir: &Path) -> HarnessResult<Self> {
        let (tool_args, build_args) = match args.iter().position(|a| *a == "--") {
            Some(idx) => (&args[..idx], &args[idx + 1..]),
            None => (args, &[][..]),
        };

        let mut rules = RuleSpec::default();
        let mut flags = Vec::new();
        for arg in tool_args {
            if let Some(value) = arg.strip_prefix("-rule=") {
                rules = rules.merge(RuleSpec::parse(value, base_dir)?);
            } else if !arg.trim().is_empty() {
                flags.push((*arg).to_string());
            }
        }

        let build: Vec<String> = build_args
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        let target = if build.is_empty() {
            BuildTarget::CurrentModule
        } else {
            BuildTarget::Args(build)
        };

        Ok(Self {
            rules,
            flags,
            target,
        })
    }

    /// Full argument vector for the tool.
    #[must_use]
    pub fn to_tool_args(&self) -> Vec<String> {
        let mut out = self.flags.clone();
        if let Some(rule) = self.rules.to_arg() {
            out.push(rule);
        }
        out.push("--".to_string());
        if let BuildTarget::Args(args) = &self.target {
            out.extend(args.iter().cloned());
        }
        out
    }
}

/// A successful instrumented build left on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub dir: PathBuf,
    pub build_log: PathBuf,
}

/// The instrumentation tool.
pub trait Instrumenter: Send + Sync {
    fn instrument(
        &self,
        workdir: &Path,
        request: &InstrumentRequest,
        env: &EnvVars,
        cancel: &CancelToken,
    ) -> HarnessResult<BuildArtifact>;
}

/// Runs the tool binary as a subprocess.
#[derive(Debug, Clone)]
pub struct ToolInstrumenter {
    pub tool: PathBuf,
    pub timeout: Duration,
}

impl Instrumenter for ToolInstrumenter {
    fn instrument(
        &self,
        workdir: &Path,
        request: &InstrumentRequest,
        env: &EnvVars,
        cancel: &CancelToken,
    ) -> HarnessResult<BuildArtifact> {
        let spec = ProcessSpec::new(&self.tool, self.timeout)
            .args(request.to_tool_args())
            .cwd(workdir)
            .envs(env);
        let out = run_process(&spec, cancel).map_err(|err| match err {
            HarnessError::Infrastructure(msg) => {
                HarnessError::Infrastructure(format!("instrumentation tool unavailable: {msg}"))
            }
            other => other,
        })?;

        let log = format!("$ {}\n{}", spec.command_line(), out.combined());
        let build_log = workdir.join("build.log");
        fs::write(&build_log, &log)?;

        if out.success() {
            return Ok(BuildArtifact {
                dir: workdir.to_path_buf(),
                build_log,
            });
        }
        if out.timed_out {
            return Err(HarnessError::BuildFailure {
                exit_code: TIMEOUT_EXIT_CODE,
                summary: format!("build timed out after {:?}", self.timeout),
                log,
            });
        }
        if out.exit_code == INVALID_RULE_EXIT_CODE {
            return Err(HarnessError::Configuration(format!(
                "tool rejected rule specification: {}",
                last_line(&out.combined())
            )));
        }
        Err(HarnessError::BuildFailure {
            exit_code: out.exit_code,
            summary: last_line(&out.combined()),
            log,
        })
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .to_string()
}

/// Case-scoped working directory for one combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// `<work_root>/<case>/<combo>-<digest>`, created empty.
    ///
    /// The digest covers the unsanitized case name and combination, so two
    /// cases whose names sanitize alike still get distinct directories.
    pub fn create(
        work_root: &Path,
        case_name: &str,
        combination: &VersionCombination,
    ) -> HarnessResult<Self> {
        let slug = combination.slug();
        let digest = blake3::hash(format!("{case_name}\0{slug}").as_bytes()).to_hex();
        let root = work_root
            .join(sanitize(case_name))
            .join(format!("{slug}-{}", &digest.as_str()[..12]));
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy the application template `apps_root/<app>` into this workspace
    /// and return the copy's directory.
    pub fn checkout_app(&self, apps_root: &Path, app: &str) -> HarnessResult<PathBuf> {
        let template = apps_root.join(app);
        if !template.is_dir() {
            return Err(HarnessError::Configuration(format!(
                "unknown application '{app}' (no directory {})",
                template.display()
            )));
        }
        let dest = self.root.join(sanitize(app));
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        copy_dir(&template, &dest)?;
        Ok(dest)
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let dest = to.join(entry.file_name());
        if kind.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else if kind.is_file() {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::RuntimeVersion;

    fn rules_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkg/data")).unwrap();
        fs::create_dir_all(dir.path().join("test/build")).unwrap();
        fs::write(dir.path().join("pkg/data/default.json"), "[]").unwrap();
        fs::write(dir.path().join("pkg/data/test_fmt.json"), "[]").unwrap();
        dir
    }

    #[test]
    fn rule_path_without_extension_is_configuration_error() {
        let dir = rules_dir();
        let base = dir.path().join("test/build");
        let err = RuleSpec::parse("../../pkg/data/default", &base).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
        assert!(RuleSpec::parse("../../pkg/data/default.json", &base).is_ok());
        assert!(RuleSpec::parse("../../pkg/data/missing.json", &base).is_err());
        assert!(RuleSpec::parse("default", &base).is_ok());
        assert!(RuleSpec::parse("nonsense", &base).is_err());
    }

    #[test]
    fn comma_join_equals_merged_specs() {
        let dir = rules_dir();
        let base = dir.path().join("test/build");
        let joined =
            RuleSpec::parse("../../pkg/data/default.json,../../pkg/data/test_fmt.json", &base)
                .unwrap();
        let merged = RuleSpec::parse("../../pkg/data/default.json", &base)
            .unwrap()
            .merge(RuleSpec::parse("../../pkg/data/test_fmt.json", &base).unwrap());
        assert_eq!(joined, merged);
        assert_eq!(joined.entries().len(), 2);
        assert!(RuleSpec::parse("a.json,,b.json", &base).is_err());
    }

    #[test]
    fn request_splits_flags_rules_and_targets() {
        let dir = rules_dir();
        let base = dir.path().join("test/build");
        let req = InstrumentRequest::from_args(
            &[
                "-debuglog",
                "-rule=../../pkg/data/default.json",
                "--",
                "-o",
                "default",
                "cmd/foo.go",
            ],
            &base,
        )
        .unwrap();
        assert_eq!(req.flags, ["-debuglog"]);
        assert_eq!(req.rules.entries().len(), 1);
        assert_eq!(
            req.target,
            BuildTarget::Args(vec!["-o".into(), "default".into(), "cmd/foo.go".into()])
        );
        let args = req.to_tool_args();
        assert_eq!(args[0], "-debuglog");
        assert!(args[1].starts_with("-rule="));
        assert_eq!(args[2], "--");
    }

    #[test]
    fn empty_target_means_current_module() {
        let base = Path::new(".");
        let req = InstrumentRequest::from_args(&["--", ""], base).unwrap();
        assert_eq!(req.target, BuildTarget::CurrentModule);
        assert_eq!(req.to_tool_args(), ["--"]);
        let req = InstrumentRequest::from_args(&[], base).unwrap();
        assert_eq!(req.target, BuildTarget::CurrentModule);
    }

    #[test]
    fn workspaces_are_case_scoped() {
        let root = tempfile::tempdir().unwrap();
        let combo = VersionCombination {
            dependency_version: Some("v1.11.1".parse().unwrap()),
            runtime: RuntimeVersion::new(1, 18, 0),
        };
        let a = Workspace::create(root.path(), "a/b", &combo).unwrap();
        let b = Workspace::create(root.path(), "a_b", &combo).unwrap();
        assert_ne!(a.root(), b.root());
        assert!(a.root().is_dir());
    }

    #[test]
    fn checkout_copies_template_tree() {
        let apps = tempfile::tempdir().unwrap();
        fs::create_dir_all(apps.path().join("build/cmd")).unwrap();
        fs::write(apps.path().join("build/cmd/foo.go"), "package main").unwrap();
        let work = tempfile::tempdir().unwrap();
        let combo = VersionCombination {
            dependency_version: None,
            runtime: RuntimeVersion::new(1, 18, 0),
        };
        let ws = Workspace::create(work.path(), "build", &combo).unwrap();
        let app = ws.checkout_app(apps.path(), "build").unwrap();
        assert!(app.join("cmd/foo.go").is_file());
        assert!(matches!(
            ws.checkout_app(apps.path(), "nope"),
            Err(HarnessError::Configuration(_))
        ));
    }
}
