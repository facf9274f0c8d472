//! Bounded external process execution.
//!
//! Every blocking call the harness makes (tool invocation, application run,
//! container CLI, `go list`) goes through [`run_process`], which enforces a
//! timeout and observes the run-wide [`CancelToken`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{HarnessError, HarnessResult};

/// Exit code reported for processes killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long output readers may lag behind a killed process tree.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Run-wide cancellation flag with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Same cancellation flag, with a deadline `timeout` from now.
    #[must_use]
    pub fn deadline_after(&self, timeout: Duration) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err(Cancelled)` once the run is cancelled or past its deadline.
    pub fn check(&self, what: &str) -> HarnessResult<()> {
        if self.is_cancelled() {
            return Err(HarnessError::Cancelled(what.to_string()));
        }
        Ok(())
    }

    /// Sleep up to `dur`, waking early on cancellation.
    pub fn sleep(&self, dur: Duration) -> HarnessResult<()> {
        let until = Instant::now() + dur;
        while Instant::now() < until {
            self.check("sleep interrupted")?;
            thread::sleep(POLL_INTERVAL.min(until.saturating_duration_since(Instant::now())));
        }
        Ok(())
    }

    /// Cancel this token on SIGINT or SIGTERM. The handler is process-wide,
    /// so install it once per process.
    pub fn cancel_on_interrupt(&self) -> HarnessResult<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            eprintln!("Interrupted: cancelling run and releasing services");
            token.cancel();
        })
        .map_err(|e| HarnessError::Infrastructure(format!("cannot install signal handler: {e}")))
    }
}

/// What to launch and under which bounds.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Merged over the ambient environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl ProcessSpec {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Display form for logs.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

/// Captured result of a finished (or killed) process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Launch `spec`, wait for it, and capture its output.
///
/// A spawn failure is an infrastructure error. A timeout kills the child and
/// returns an output with `timed_out` set and exit code 124. Cancellation
/// kills the child and returns `Cancelled`.
pub fn run_process(spec: &ProcessSpec, cancel: &CancelToken) -> HarnessResult<ProcessOutput> {
    cancel.check("before launch")?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    // Own process group, so a timeout can take down grandchildren too.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        HarnessError::Infrastructure(format!("failed to launch {}: {e}", spec.program.display()))
    })?;
    let stdout_rx = child.stdout.take().map(spawn_reader);
    let stderr_rx = child.stderr.take().map(spawn_reader);

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if start.elapsed() >= spec.timeout {
            timed_out = true;
        } else if cancel.is_cancelled() {
            cancelled = true;
        }
        if timed_out || cancelled {
            kill_tree(&mut child);
            break child.wait().ok();
        }
        thread::sleep(POLL_INTERVAL);
    };

    // A surviving grandchild may hold the pipes open; never wait on it past
    // the budget.
    let drain = if timed_out || cancelled {
        DRAIN_GRACE
    } else {
        spec.timeout.saturating_sub(start.elapsed()).max(DRAIN_GRACE)
    };
    let drain_deadline = Instant::now() + drain;
    let stdout = collect_output(stdout_rx, drain_deadline);
    let mut stderr = collect_output(stderr_rx, drain_deadline);
    if cancelled {
        return Err(HarnessError::Cancelled(format!(
            "{} killed on cancellation",
            spec.command_line()
        )));
    }
    if timed_out {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&format!("process timed out after {:?}", spec.timeout));
    }

    // Killed by a signal reports no code; keep it distinct from real exits.
    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        status.and_then(|s| s.code()).unwrap_or(-1)
    };

    Ok(ProcessOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Kill the child's whole process group, then the child itself.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .args(["-KILL", "--", &format!("-{}", child.id())])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// Reader output, or empty if it is still blocked at `deadline`. A reader
/// left behind exits on its own once the pipe closes.
fn collect_output(rx: Option<Receiver<String>>, deadline: Instant) -> String {
    rx.and_then(|rx| rx.recv_timeout(deadline.saturating_duration_since(Instant::now())).ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> ProcessSpec {
        ProcessSpec::new("/bin/sh", timeout).arg("-c").arg(script)
    }

    #[test]
    fn captures_exit_code_and_output() {
        let out = run_process(
            &sh("echo hello; echo oops >&2; exit 3", Duration::from_secs(10)),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.combined().contains("oops"));
    }

    #[test]
    fn env_is_merged_over_ambient() {
        let spec = sh("echo \"$MONGO_PORT:${PATH:+has-path}\"", Duration::from_secs(10))
            .env("MONGO_PORT", "32768");
        let out = run_process(&spec, &CancelToken::new()).unwrap();
        assert_eq!(out.stdout.trim(), "32768:has-path");
    }

    #[test]
    fn timeout_kills_the_whole_process_tree() {
        // `; true` keeps the shell alive, so `sleep` runs as a grandchild
        // holding the output pipes.
        let started = Instant::now();
        let out = run_process(
            &sh("sleep 5; true", Duration::from_millis(200)),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn cancellation_kills_the_whole_process_tree() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = Instant::now();
        let err = run_process(&sh("sleep 5; true", Duration::from_secs(30)), &cancel).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, HarnessError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn missing_binary_is_infrastructure() {
        let spec = ProcessSpec::new("/definitely/not/here", Duration::from_secs(1));
        let err = run_process(&spec, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, HarnessError::Infrastructure(_)));
    }

    #[test]
    fn cancelled_token_refuses_to_launch() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_process(&sh("true", Duration::from_secs(1)), &cancel).unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled(_)));
    }

    #[test]
    fn expired_deadline_counts_as_cancelled() {
        let cancel = CancelToken::with_deadline(Duration::ZERO);
        assert!(cancel.is_cancelled());
        assert!(cancel.sleep(Duration::from_secs(1)).is_err());
    }
}
