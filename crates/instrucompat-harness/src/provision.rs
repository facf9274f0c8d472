//! Ephemeral backing services (database containers and the like).
//!
//! [`Provisioner::provision`] returns a [`ServiceLease`]. The lease stops its
//! container exactly once: on explicit [`ServiceLease::release`], or on drop,
//! which also covers early returns, panics unwinding through a behavior, and
//! cancellation of the run.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::config::ServiceFilter;
use crate::error::{HarnessError, HarnessResult};
use crate::process::{CancelToken, ProcessSpec, run_process};
use crate::resolver::sanitize;

/// How to decide a freshly started service accepts connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Sleep a fixed settle delay.
    FixedDelay(Duration),
    /// Sleep `settle`, then connect to every mapped port until `timeout`.
    TcpProbe { settle: Duration, timeout: Duration },
}

/// Descriptor of a backing service a case needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Kind tag, matched against `COMPAT_DISABLE_SERVICES`.
    pub kind: String,
    pub image: String,
    /// Container-side TCP ports; the first one is the primary endpoint.
    pub exposed_ports: Vec<u16>,
    /// Prefix for injected variables, e.g. `MONGO` gives `MONGO_PORT`.
    pub env_prefix: String,
    pub readiness: Readiness,
}

impl ServiceSpec {
    /// MongoDB 4.0 on 27017 with a five second settle delay.
    #[must_use]
    pub fn mongo() -> Self {
        Self {
            kind: "mongo".to_string(),
            image: "mongo:4.0".to_string(),
            exposed_ports: vec![27017],
            env_prefix: "MONGO".to_string(),
            readiness: Readiness::FixedDelay(Duration::from_secs(5)),
        }
    }

    #[must_use]
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }
}

/// Runtime-side identity of a started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub kind: String,
}

/// Container lifecycle manager.
pub trait ContainerRuntime: Send + Sync {
    fn start(&self, spec: &ServiceSpec, cancel: &CancelToken) -> HarnessResult<ContainerHandle>;

    /// Host port bound to `container_port`.
    fn mapped_port(
        &self,
        handle: &ContainerHandle,
        container_port: u16,
        cancel: &CancelToken,
    ) -> HarnessResult<u16>;

    /// Terminate and remove. Must not observe run cancellation.
    fn stop(&self, handle: &ContainerHandle) -> HarnessResult<()>;
}

/// `docker` CLI backed runtime. Ports are published to random host ports
/// (`-P`), so concurrent cases never contend for the same one.
#[derive(Debug, Clone)]
pub struct DockerCli {
    pub docker: PathBuf,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl DockerCli {
    fn cli(&self, timeout: Duration) -> ProcessSpec {
        ProcessSpec::new(&self.docker, timeout)
    }

    /// Removes a container that `run` may have created before failing.
    /// Runs even when the run was cancelled.
    fn remove_named(&self, name: &str) -> HarnessResult<()> {
        let cmd = self.cli(self.stop_timeout).args(["rm", "-f", "-v", name]);
        let out = run_process(&cmd, &CancelToken::new())?;
        if out.success() {
            Ok(())
        } else {
            Err(HarnessError::Infrastructure(format!(
                "docker rm {name} failed: {}",
                out.combined().trim()
            )))
        }
    }

    fn run_named(
        &self,
        spec: &ServiceSpec,
        name: &str,
        cancel: &CancelToken,
    ) -> HarnessResult<String> {
        let mut cmd = self.cli(self.start_timeout).args([
            "run",
            "-d",
            "--name",
            name,
            "--label",
            "instrucompat=ephemeral",
        ]);
        for port in &spec.exposed_ports {
            cmd = cmd.arg("--expose").arg(port.to_string());
        }
        cmd = cmd.arg("-P").arg(&spec.image);

        let out = run_process(&cmd, cancel)?;
        if out.timed_out {
            return Err(HarnessError::timed_out("docker run", self.start_timeout));
        }
        let id = out.stdout.lines().last().unwrap_or_default().trim().to_string();
        if !out.success() || id.is_empty() {
            return Err(HarnessError::Infrastructure(format!(
                "docker run {} failed: {}",
                spec.image,
                out.combined().trim()
            )));
        }
        Ok(id)
    }
}

static NEXT_CONTAINER: AtomicUsize = AtomicUsize::new(0);

/// Process-unique container name, known before `docker run` returns.
fn container_name(kind: &str) -> String {
    let seq = NEXT_CONTAINER.fetch_add(1, Ordering::SeqCst);
    format!("instrucompat-{}-{}-{seq}", sanitize(kind), std::process::id())
}

impl ContainerRuntime for DockerCli {
    fn start(&self, spec: &ServiceSpec, cancel: &CancelToken) -> HarnessResult<ContainerHandle> {
        let name = container_name(&spec.kind);
        match self.run_named(spec, &name, cancel) {
            Ok(id) => Ok(ContainerHandle {
                id,
                kind: spec.kind.clone(),
            }),
            Err(err) => {
                if let Err(cleanup) = self.remove_named(&name) {
                    eprintln!("warning: failed to remove container {name}: {cleanup}");
                }
                Err(err)
            }
        }
    }

    fn mapped_port(
        &self,
        handle: &ContainerHandle,
        container_port: u16,
        cancel: &CancelToken,
    ) -> HarnessResult<u16> {
        let cmd = self
            .cli(self.stop_timeout)
            .arg("port")
            .arg(&handle.id)
            .arg(format!("{container_port}/tcp"));
        let out = run_process(&cmd, cancel)?;
        if !out.success() {
            return Err(HarnessError::Infrastructure(format!(
                "docker port {} {container_port}: {}",
                handle.id,
                out.combined().trim()
            )));
        }
        parse_docker_port(&out.stdout).ok_or_else(|| {
            HarnessError::Infrastructure(format!(
                "no host port mapped for {container_port}/tcp on {}",
                handle.id
            ))
        })
    }

    fn stop(&self, handle: &ContainerHandle) -> HarnessResult<()> {
        let cmd = self
            .cli(self.stop_timeout)
            .args(["rm", "-f", "-v"])
            .arg(&handle.id);
        let out = run_process(&cmd, &CancelToken::new())?;
        if !out.success() {
            return Err(HarnessError::Infrastructure(format!(
                "docker rm {} failed: {}",
                handle.id,
                out.combined().trim()
            )));
        }
        Ok(())
    }
}

/// First port in `docker port` output (`0.0.0.0:32768`, `[::]:32768`).
#[must_use]
pub fn parse_docker_port(stdout: &str) -> Option<u16> {
    stdout
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.trim().parse().ok())
}

/// Counts acquisitions and releases across a run.
#[derive(Debug, Clone, Default)]
pub struct LeaseTracker {
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl LeaseTracker {
    #[must_use]
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Leases acquired but not yet released.
    #[must_use]
    pub fn live(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

struct ReleaseGuard {
    runtime: Arc<dyn ContainerRuntime>,
    handle: Option<ContainerHandle>,
    tracker: LeaseTracker,
}

impl ReleaseGuard {
    fn new(
        runtime: Arc<dyn ContainerRuntime>,
        handle: ContainerHandle,
        tracker: LeaseTracker,
    ) -> Self {
        tracker.acquired.fetch_add(1, Ordering::SeqCst);
        Self {
            runtime,
            handle: Some(handle),
            tracker,
        }
    }

    fn release(&mut self) -> HarnessResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.tracker.released.fetch_add(1, Ordering::SeqCst);
        self.runtime.stop(&handle)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            eprintln!("warning: failed to release backing service: {err}");
        }
    }
}

/// Host endpoint of a running service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Exclusive ownership of one running backing service.
pub struct ServiceLease {
    kind: String,
    env_prefix: String,
    container_id: String,
    endpoint: Endpoint,
    ports: BTreeMap<u16, u16>,
    guard: ReleaseGuard,
}

impl std::fmt::Debug for ServiceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLease")
            .field("kind", &self.kind)
            .field("container_id", &self.container_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ServiceLease {
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Primary endpoint (first exposed port).
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }

    /// `<PREFIX>_HOST` / `<PREFIX>_PORT` assignments for the application.
    #[must_use]
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(format!("{}_HOST", self.env_prefix), self.endpoint.host.clone());
        vars.insert(format!("{}_PORT", self.env_prefix), self.endpoint.port.to_string());
        vars
    }

    /// Stop the service now and report the outcome. Dropping does the same
    /// but can only log a failure.
    pub fn release(mut self) -> HarnessResult<()> {
        self.guard.release()
    }
}

/// Starts services for case invocations.
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    disabled: ServiceFilter,
    settle_floor: Duration,
    tracker: LeaseTracker,
}

impl Provisioner {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        disabled: ServiceFilter,
        settle_floor: Duration,
    ) -> Self {
        Self {
            runtime,
            disabled,
            settle_floor,
            tracker: LeaseTracker::default(),
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &LeaseTracker {
        &self.tracker
    }

    /// Start `spec` and wait until it is ready. Not retried on failure.
    pub fn provision(
        &self,
        spec: &ServiceSpec,
        cancel: &CancelToken,
    ) -> HarnessResult<ServiceLease> {
        if self.disabled.disables(&spec.kind) {
            return Err(HarnessError::ServiceUnavailable(spec.kind.clone()));
        }
        let Some(&primary) = spec.exposed_ports.first() else {
            return Err(HarnessError::Configuration(format!(
                "service '{}' exposes no ports",
                spec.kind
            )));
        };
        cancel.check("before service start")?;

        let handle = self.runtime.start(spec, cancel).map_err(|err| match err {
            HarnessError::Cancelled(_) | HarnessError::Infrastructure(_) => err,
            other => {
                HarnessError::Infrastructure(format!("{} failed to start: {other}", spec.kind))
            }
        })?;
        let container_id = handle.id.clone();
        // From here on every early return drops the guard and stops the container.
        let guard = ReleaseGuard::new(
            Arc::clone(&self.runtime),
            handle.clone(),
            self.tracker.clone(),
        );

        let mut ports = BTreeMap::new();
        for &port in &spec.exposed_ports {
            ports.insert(port, self.runtime.mapped_port(&handle, port, cancel)?);
        }
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port: ports[&primary],
        };

        match spec.readiness {
            Readiness::FixedDelay(delay) => cancel.sleep(delay.max(self.settle_floor))?,
            Readiness::TcpProbe { settle, timeout } => {
                cancel.sleep(settle.max(self.settle_floor))?;
                for host_port in ports.values() {
                    probe_tcp(&endpoint.host, *host_port, timeout, cancel)?;
                }
            }
        }

        Ok(ServiceLease {
            kind: spec.kind.clone(),
            env_prefix: spec.env_prefix.clone(),
            container_id,
            endpoint,
            ports,
            guard,
        })
    }
}

fn probe_tcp(host: &str, port: u16, timeout: Duration, cancel: &CancelToken) -> HarnessResult<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| HarnessError::Infrastructure(format!("bad probe address: {e}")))?;
    let start = Instant::now();
    loop {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(250)).is_ok() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(HarnessError::timed_out(&format!("readiness probe on {addr}"), timeout));
        }
        cancel.sleep(Duration::from_millis(100))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeRuntime {
        fail_start: bool,
        fail_port: bool,
        stopped: Mutex<Vec<String>>,
        started: AtomicUsize,
    }

    impl ContainerRuntime for FakeRuntime {
        fn start(
            &self,
            spec: &ServiceSpec,
            _cancel: &CancelToken,
        ) -> HarnessResult<ContainerHandle> {
            if self.fail_start {
                return Err(HarnessError::Infrastructure("pull access denied".into()));
            }
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            Ok(ContainerHandle {
                id: format!("c{n}"),
                kind: spec.kind.clone(),
            })
        }

        fn mapped_port(
            &self,
            _h: &ContainerHandle,
            port: u16,
            _c: &CancelToken,
        ) -> HarnessResult<u16> {
            if self.fail_port {
                return Err(HarnessError::Infrastructure("no port".into()));
            }
            Ok(port + 10_000)
        }

        fn stop(&self, handle: &ContainerHandle) -> HarnessResult<()> {
            self.stopped.lock().push(handle.id.clone());
            Ok(())
        }
    }

    fn quick_mongo() -> ServiceSpec {
        ServiceSpec::mongo().with_readiness(Readiness::FixedDelay(Duration::ZERO))
    }

    #[test]
    fn lease_exposes_endpoint_and_releases_once() {
        let runtime = Arc::new(FakeRuntime::default());
        let prov = Provisioner::new(runtime.clone(), ServiceFilter::None, Duration::ZERO);
        let lease = prov.provision(&quick_mongo(), &CancelToken::new()).unwrap();
        assert_eq!(lease.endpoint().port, 37017);
        assert_eq!(lease.env_vars()["MONGO_PORT"], "37017");
        assert_eq!(prov.tracker().live(), 1);
        lease.release().unwrap();
        assert_eq!(runtime.stopped.lock().as_slice(), ["c0"]);
        assert_eq!(prov.tracker().live(), 0);
    }

    #[test]
    fn drop_releases_on_unwind() {
        let runtime = Arc::new(FakeRuntime::default());
        let prov = Provisioner::new(runtime.clone(), ServiceFilter::None, Duration::ZERO);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _lease = prov.provision(&quick_mongo(), &CancelToken::new()).unwrap();
            panic!("assertion inside behavior");
        }));
        assert!(result.is_err());
        assert_eq!(runtime.stopped.lock().len(), 1);
        assert_eq!(prov.tracker().released(), 1);
    }

    #[test]
    fn readiness_failure_stops_started_container() {
        let runtime = Arc::new(FakeRuntime {
            fail_port: true,
            ..FakeRuntime::default()
        });
        let prov = Provisioner::new(runtime.clone(), ServiceFilter::None, Duration::ZERO);
        let err = prov.provision(&quick_mongo(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, HarnessError::Infrastructure(_)));
        assert_eq!(runtime.stopped.lock().len(), 1);
        assert_eq!(prov.tracker().live(), 0);
    }

    #[test]
    fn start_failure_is_infrastructure_and_not_retried() {
        let runtime = Arc::new(FakeRuntime {
            fail_start: true,
            ..FakeRuntime::default()
        });
        let prov = Provisioner::new(runtime.clone(), ServiceFilter::None, Duration::ZERO);
        let err = prov.provision(&quick_mongo(), &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Infrastructure);
        assert_eq!(runtime.started.load(Ordering::SeqCst), 0);
        assert_eq!(prov.tracker().acquired(), 0);
    }

    #[test]
    fn disabled_kind_is_unavailable() {
        let runtime = Arc::new(FakeRuntime::default());
        let prov = Provisioner::new(runtime, ServiceFilter::parse("mongo"), Duration::ZERO);
        let err = prov.provision(&quick_mongo(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, HarnessError::ServiceUnavailable(_)));
    }

    #[test]
    fn parses_docker_port_output() {
        assert_eq!(parse_docker_port("0.0.0.0:32768\n[::]:32768\n"), Some(32768));
        assert_eq!(parse_docker_port(""), None);
    }

    #[test]
    fn container_names_are_unique_and_valid() {
        let a = container_name("mongo db");
        let b = container_name("mongo db");
        assert_ne!(a, b);
        assert!(a.starts_with("instrucompat-mongo_db-"));
    }

    /// A `docker` stand-in that records calls and hangs on `run`.
    #[cfg(unix)]
    fn hanging_docker(dir: &std::path::Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let ledger = dir.join("ledger");
        let script = dir.join("docker");
        let body = format!(
            "#!/bin/sh\n\
             case \"$1\" in\n\
             run) echo \"run $4\" >> '{ledger}'; sleep 5 ;;\n\
             rm) echo \"rm $4\" >> '{ledger}' ;;\n\
             esac\n",
            ledger = ledger.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, ledger)
    }

    #[cfg(unix)]
    #[test]
    fn start_timeout_removes_the_named_container() {
        let dir = tempfile::tempdir().unwrap();
        let (docker, ledger) = hanging_docker(dir.path());
        let cli = DockerCli {
            docker,
            start_timeout: Duration::from_millis(300),
            stop_timeout: Duration::from_secs(5),
        };

        let err = cli.start(&quick_mongo(), &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Infrastructure);

        let calls = std::fs::read_to_string(&ledger).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 2, "{calls}");
        let name = lines[0].strip_prefix("run ").unwrap();
        assert!(name.starts_with("instrucompat-mongo-"));
        assert_eq!(lines[1], format!("rm {name}"));
    }

    #[cfg(unix)]
    #[test]
    fn cancelled_start_still_removes_the_named_container() {
        let dir = tempfile::tempdir().unwrap();
        let (docker, ledger) = hanging_docker(dir.path());
        let cli = DockerCli {
            docker,
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
        };
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let err = cli.start(&quick_mongo(), &cancel).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, HarnessError::Cancelled(_)), "{err}");

        let calls = std::fs::read_to_string(&ledger).unwrap();
        assert!(calls.lines().any(|l| l.starts_with("rm instrucompat-mongo-")), "{calls}");
    }
}
