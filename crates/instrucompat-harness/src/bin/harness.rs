//! CLI entrypoint for the instrumentation compatibility harness.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use instrucompat_harness::config::{ServiceFilter, parse_runtime_list};
use instrucompat_harness::process::CancelToken;
use instrucompat_harness::structured_log::{ArtifactIndex, LogEmitter, validate_log_file};
use instrucompat_harness::{CaseRegistry, Collaborators, Dispatcher, HarnessConfig, Resolver, cases};

/// Instrumentation compatibility tooling.
#[derive(Debug, Parser)]
#[command(name = "harness")]
#[command(
    about = "Run instrumentation compatibility cases across dependency and toolchain versions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered cases.
    List,
    /// Print the resolved version matrix for one case.
    Resolve {
        #[arg(long)]
        case: String,
    },
    /// Run cases and write the report, log and artifact index.
    Run {
        /// Only run cases whose name contains this string.
        #[arg(long)]
        filter: Option<String>,
        /// Worker pool size (overrides COMPAT_JOBS).
        #[arg(long)]
        jobs: Option<usize>,
        /// Output report path (markdown); JSON goes next to it.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Optional fixed timestamp string for deterministic report generation.
        #[arg(long)]
        timestamp: Option<String>,
        /// Comma list of runtime versions (overrides detection).
        #[arg(long)]
        runtimes: Option<String>,
        /// Comma list of service kinds to disable, or `all`.
        #[arg(long)]
        disable_services: Option<String>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            let registry = load_registry()?;
            for case in registry.all() {
                let dependency = case.dependency.as_ref().map_or_else(
                    || "-".to_string(),
                    |d| format!("{} [{}, {}]", d.name, d.min, d.max),
                );
                let runtime = match case.max_runtime {
                    Some(max) => format!("go[{}, {max}]", case.min_runtime),
                    None => format!("go>={}", case.min_runtime),
                };
                println!(
                    "{:<36} {:<13} {dependency} {runtime}{}",
                    case.name,
                    case.variant().as_str(),
                    if case.expect_failure { " (expects failure)" } else { "" }
                );
            }
        }
        Command::Resolve { case } => {
            let registry = load_registry()?;
            let Some(case) = registry.get(&case) else {
                return Err(format!("unknown case '{case}'").into());
            };
            let config = HarnessConfig::from_env()?;
            let cancel = CancelToken::new();
            let tools = Collaborators::from_config(&config, &cancel)?;
            let resolver = Resolver::new(
                tools.releases.as_ref(),
                &tools.toolchains,
                config.include_prerelease,
            );
            let combos = resolver.resolve(&case, &cancel)?;
            if combos.is_empty() {
                println!("{}: no applicable combinations (Skipped)", case.name);
            }
            for combo in combos {
                println!("{}\t{combo}", case.name);
            }
        }
        Command::Run {
            filter,
            jobs,
            report,
            log,
            timestamp,
            runtimes,
            disable_services,
        } => {
            let mut config = HarnessConfig::from_env()?;
            if let Some(jobs) = jobs {
                config.jobs = jobs.max(1);
            }
            if let Some(raw) = runtimes {
                config.runtime_versions = Some(parse_runtime_list(&raw)?);
            }
            if let Some(raw) = disable_services {
                config.disabled_services = ServiceFilter::parse(&raw);
            }

            let registry = load_registry()?;
            let cancel = CancelToken::new();
            cancel.cancel_on_interrupt()?;
            let tools = Collaborators::from_config(&config, &cancel)?;
            let run_id = run_id(timestamp.as_deref());
            let log_path = log.unwrap_or_else(|| config.work_root.join("harness.log.jsonl"));
            let report_path = report.unwrap_or_else(|| config.work_root.join("report.md"));
            let work_root = config.work_root.clone();

            eprintln!(
                "Running {} registered case(s) with {} worker(s), log {}",
                registry.len(),
                config.jobs,
                log_path.display()
            );
            let dispatcher = Dispatcher::new(&registry, tools, config)
                .with_log(LogEmitter::to_file(&log_path, &run_id)?)
                .with_cancel(cancel);
            let mut compat = dispatcher.run(filter.as_deref());
            if let Some(ts) = timestamp {
                compat.generated_at = ts;
            }

            write_file(&report_path, &compat.to_markdown())?;
            let json_path = report_path.with_extension("json");
            write_file(&json_path, &compat.to_json())?;

            let mut index = ArtifactIndex::new(&run_id);
            index.add_file(&log_path, "structured_log", None)?;
            index.add_file(&report_path, "report_markdown", None)?;
            index.add_file(&json_path, "report_json", None)?;
            for result in &compat.results {
                for artifact in &result.artifacts {
                    let path = Path::new(artifact);
                    let added = index.add_file(path, artifact_kind(path), Some(&result.case));
                    if let Err(err) = added {
                        eprintln!("Skipping artifact {artifact}: {err}");
                    }
                }
            }
            write_file(&work_root.join("artifact_index.json"), &index.to_json()?)?;

            eprintln!(
                "Passed {} / Failed {} / Skipped {} / InfraError {} (report {})",
                compat.summary.passed,
                compat.summary.failed,
                compat.summary.skipped,
                compat.summary.infra_errors,
                report_path.display()
            );
            if !compat.all_passed() {
                return Err("compatibility run has failures".into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                let count = errors.len();
                return Err(format!("{count} invalid field(s) across {lines} line(s)").into());
            }
            eprintln!("{lines} line(s) valid");
        }
    }

    Ok(())
}

fn load_registry() -> Result<CaseRegistry, Box<dyn std::error::Error>> {
    let registry = CaseRegistry::new();
    cases::register_all(&registry)?;
    Ok(registry)
}

fn run_id(timestamp: Option<&str>) -> String {
    let stamp = timestamp.map_or_else(
        || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                .to_string()
        },
        |ts| ts.chars().filter(char::is_ascii_alphanumeric).collect(),
    );
    format!("compat-{stamp}")
}

fn artifact_kind(path: &Path) -> &'static str {
    match path.file_name().and_then(|n| n.to_str()) {
        Some("build.log") => "build_log",
        Some("muzzle-report.json") => "muzzle_report",
        Some(name) if name.ends_with(".run.log") => "run_output",
        _ => "other",
    }
}

fn write_file(path: &Path, body: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, body)
}
