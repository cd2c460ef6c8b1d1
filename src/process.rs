use crate::config::{BackendDefaults, ModelConfig};
use crate::error::BackendError;
use crate::pool::HealthClient;
use crate::ports;
use crate::resolver::ArtifactResolver;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Interval for polling drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Log target for lines read from backend stdout/stderr
const BACKEND_LOG_TARGET: &str = "backend";

/// Lifecycle state of a named backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// No process exists for this name
    Absent,
    /// Process spawned, output draining attached
    Starting,
    /// Polling the health endpoint
    HealthChecking,
    /// Healthy and accepting traffic
    Ready,
    /// Shutting down
    Stopping,
}

/// Which pipe a line of backend output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Snapshot of a backend in the active set
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunningBackend {
    pub name: String,
    pub port: u16,
    pub pid: u32,
    pub state: BackendState,
}

/// A ready backend checked out for one request.
///
/// While a lease is alive the backend counts the request as in flight, and a
/// stop waits (up to the drain timeout) for it to be dropped.
#[derive(Debug)]
pub struct BackendLease {
    backend: RunningBackend,
    in_flight: Arc<AtomicUsize>,
}

impl BackendLease {
    pub fn backend(&self) -> &RunningBackend {
        &self.backend
    }

    pub fn name(&self) -> &str {
        &self.backend.name
    }

    pub fn port(&self) -> u16 {
        self.backend.port
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Information about a running backend
struct BackendProcess {
    /// Process handle; taken while a stop is signalling and waiting
    child: Option<Child>,
    port: u16,
    pid: u32,
    state: BackendState,
    /// Tasks forwarding stdout/stderr lines to the log
    drains: JoinSet<()>,
    /// Number of outstanding leases
    in_flight: Arc<AtomicUsize>,
}

/// A configured model with its required fields present
#[derive(Debug, Clone)]
struct LaunchSpec {
    repo: String,
    model_file: Option<String>,
    args: toml::Table,
    command: String,
}

/// Owns every backend process and enforces the swap policy.
///
/// All mutation of the process table (insert on start, delete on stop) runs
/// under a single async `lifecycle` lock, so two requests for different absent
/// models cannot both evict the current backend and launch their own.
/// Looking up an already ready backend bypasses the lock: [`acquire`] takes a
/// lease under the entry's own mutex, and a stop flips the entry to
/// `Stopping` under that same mutex before draining leases.
///
/// [`acquire`]: ProcessManager::acquire
pub struct ProcessManager {
    /// Active set keyed by model name
    processes: DashMap<String, Mutex<BackendProcess>>,
    /// Model definitions
    configs: HashMap<String, ModelConfig>,
    defaults: BackendDefaults,
    resolver: Arc<dyn ArtifactResolver>,
    health: HealthClient,
    /// Serializes swap, start and stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl ProcessManager {
    /// Create a new process manager.
    ///
    /// Returns `Arc<Self>` because the manager is shared by every request task.
    pub fn new(
        configs: HashMap<String, ModelConfig>,
        defaults: BackendDefaults,
        resolver: Arc<dyn ArtifactResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            processes: DashMap::new(),
            configs,
            defaults,
            resolver,
            health: HealthClient::new(),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    /// Check if a model exists in configuration
    pub fn has_backend(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    /// Configured model names, sorted
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn defaults(&self) -> &BackendDefaults {
        &self.defaults
    }

    /// Get the current state of a backend
    pub fn get_state(&self, name: &str) -> BackendState {
        self.processes
            .get(name)
            .map(|p| p.lock().state)
            .unwrap_or(BackendState::Absent)
    }

    /// Check if a backend is ready to accept traffic
    pub fn is_ready(&self, name: &str) -> bool {
        self.get_state(name) == BackendState::Ready
    }

    /// Get the number of outstanding leases for a backend
    pub fn get_in_flight(&self, name: &str) -> usize {
        self.processes
            .get(name)
            .map(|p| p.lock().in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Snapshot of every backend in the active set, sorted by name
    pub fn list_running(&self) -> Vec<RunningBackend> {
        let mut running: Vec<RunningBackend> = self
            .processes
            .iter()
            .map(|entry| {
                let guard = entry.value().lock();
                RunningBackend {
                    name: entry.key().clone(),
                    port: guard.port,
                    pid: guard.pid,
                    state: guard.state,
                }
            })
            .collect();
        running.sort_by(|a, b| a.name.cmp(&b.name));
        running
    }

    /// Return a lease on a ready backend, swapping it in if needed.
    ///
    /// Blocks until the backend has passed a health check.
    pub async fn acquire(&self, name: &str) -> Result<BackendLease, BackendError> {
        if let Some(lease) = self.try_lease(name) {
            return Ok(lease);
        }
        self.launch_spec(name)?;

        let _guard = self.lifecycle.lock().await;
        // Another request may have started it while we waited
        if let Some(lease) = self.try_lease(name) {
            return Ok(lease);
        }
        self.swap_locked(name).await?;

        self.try_lease(name).ok_or_else(|| BackendError::StartupFailed {
            name: name.to_string(),
            reason: "backend left the ready state before it could be used".to_string(),
        })
    }

    /// Stop every non-persistent backend, then start `name`. No-op if ready.
    pub async fn swap(&self, name: &str) -> Result<(), BackendError> {
        let _guard = self.lifecycle.lock().await;
        self.swap_locked(name).await
    }

    /// Start `name` without evicting anything. No-op if already running.
    pub async fn start(&self, name: &str) -> Result<(), BackendError> {
        let _guard = self.lifecycle.lock().await;
        let spec = self.launch_spec(name)?;
        if self.processes.contains_key(name) {
            debug!(model = name, "Backend already running");
            return Ok(());
        }
        self.launch(name, &spec).await
    }

    /// Stop a backend. Never fails; problems are logged.
    ///
    /// Waits up to `timeout` for exit after SIGTERM (or SIGKILL when `force`
    /// is set), then kills and waits for exit.
    pub async fn stop(&self, name: &str, timeout: Duration, force: bool) {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(name, timeout, force).await;
    }

    /// Stop a backend with the configured shutdown timeout
    pub async fn stop_backend(&self, name: &str) {
        self.stop(name, self.defaults.shutdown_timeout(), false).await;
    }

    /// Stop all backends, skipping persistent ones when `keep_persistent` is set
    pub async fn stop_all(&self, keep_persistent: bool) {
        let _guard = self.lifecycle.lock().await;
        self.stop_all_locked(keep_persistent).await;
    }

    /// Atomically check that `name` is ready and count a new in-flight request
    fn try_lease(&self, name: &str) -> Option<BackendLease> {
        let entry = self.processes.get(name)?;
        let guard = entry.lock();
        if guard.state != BackendState::Ready {
            return None;
        }
        guard.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(BackendLease {
            backend: RunningBackend {
                name: name.to_string(),
                port: guard.port,
                pid: guard.pid,
                state: guard.state,
            },
            in_flight: Arc::clone(&guard.in_flight),
        })
    }

    fn launch_spec(&self, name: &str) -> Result<LaunchSpec, BackendError> {
        let unknown = || BackendError::UnknownBackend(name.to_string());
        let config = self.configs.get(name).ok_or_else(unknown)?;
        let repo = config.repo.clone().ok_or_else(unknown)?;
        let args = config.args.clone().ok_or_else(unknown)?;
        Ok(LaunchSpec {
            repo,
            model_file: config.model_file.clone(),
            args,
            command: config.command(&self.defaults).to_string(),
        })
    }

    fn is_persistent(&self, name: &str) -> bool {
        self.configs.get(name).map(|c| c.persist).unwrap_or(false)
    }

    async fn swap_locked(&self, name: &str) -> Result<(), BackendError> {
        let spec = self.launch_spec(name)?;

        match self.get_state(name) {
            BackendState::Ready => return Ok(()),
            BackendState::Absent => {}
            state => {
                // Left over from a stop that failed part way
                warn!(model = name, ?state, "Backend not ready, restarting");
                self.stop_locked(name, self.defaults.shutdown_timeout(), true).await;
            }
        }

        // Eviction is not rolled back if the launch below fails
        self.stop_all_locked(true).await;
        self.launch(name, &spec).await
    }

    async fn stop_all_locked(&self, keep_persistent: bool) {
        let names: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if keep_persistent && self.is_persistent(&name) {
                debug!(model = %name, "Keeping persistent backend");
                continue;
            }
            self.stop_locked(&name, self.defaults.shutdown_timeout(), false).await;
        }
    }

    async fn launch(&self, name: &str, spec: &LaunchSpec) -> Result<(), BackendError> {
        if self.processes.contains_key(name) {
            return Err(BackendError::StartupFailed {
                name: name.to_string(),
                reason: "previous instance has not exited".to_string(),
            });
        }

        let artifact = self
            .resolver
            .resolve(&spec.repo, spec.model_file.as_deref())?;

        let port = ports::allocate().map_err(|e| BackendError::StartupFailed {
            name: name.to_string(),
            reason: format!("port allocation failed: {}", e),
        })?;

        let args = build_command_args(&artifact, port, &spec.args);
        info!(
            model = name,
            command = %spec.command,
            args = %args.join(" "),
            "Starting backend"
        );

        let mut cmd = Command::new(&spec.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BackendError::StartupFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().unwrap_or(0);

        let mut drains = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            drains.spawn(drain_output(name.to_string(), OutputStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.spawn(drain_output(name.to_string(), OutputStream::Stderr, stderr));
        }

        self.processes.insert(
            name.to_string(),
            Mutex::new(BackendProcess {
                child: Some(child),
                port,
                pid,
                state: BackendState::Starting,
                drains,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
        );
        info!(model = name, pid, port, "Backend process spawned");

        self.set_state(name, BackendState::HealthChecking);
        match self.wait_for_health(name, port).await {
            Ok(()) => {
                self.set_state(name, BackendState::Ready);
                info!(model = name, port, "Backend is now ready");
                Ok(())
            }
            Err(e) => {
                error!(model = name, error = %e, "Backend failed to become healthy");
                self.stop_locked(name, self.defaults.shutdown_timeout(), true).await;
                Err(e)
            }
        }
    }

    fn set_state(&self, name: &str, state: BackendState) {
        if let Some(process) = self.processes.get(name) {
            process.lock().state = state;
        }
    }

    /// Exit status if the backend process has already exited
    fn exit_status(&self, name: &str) -> Option<ExitStatus> {
        let process = self.processes.get(name)?;
        let mut guard = process.lock();
        guard.child.as_mut()?.try_wait().ok().flatten()
    }

    /// Poll the health endpoint until it succeeds or the startup budget runs out
    async fn wait_for_health(&self, name: &str, port: u16) -> Result<(), BackendError> {
        let budget = self.defaults.startup_timeout();
        let interval = self.defaults.health_check_interval();
        let probe_timeout = self.defaults.health_probe_timeout();
        let start = Instant::now();

        debug!(model = name, port, path = %self.defaults.health_path, "Starting health check polling");

        loop {
            if self
                .health
                .check(port, &self.defaults.health_path, probe_timeout)
                .await
            {
                return Ok(());
            }

            if let Some(status) = self.exit_status(name) {
                return Err(BackendError::StartupFailed {
                    name: name.to_string(),
                    reason: format!("process exited during startup ({})", status),
                });
            }

            if start.elapsed() >= budget {
                return Err(BackendError::StartupTimeout {
                    name: name.to_string(),
                    port,
                    secs: budget.as_secs(),
                });
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Stop sequence, run with the lifecycle lock held:
    /// 1. Mark as Stopping (no new leases)
    /// 2. Wait for in-flight requests to drain (skipped when forcing)
    /// 3. Cancel and await the output drain tasks
    /// 4. SIGTERM (or SIGKILL when forcing), wait up to `timeout`
    /// 5. SIGKILL and wait if still running
    /// 6. Remove the entry
    async fn stop_locked(&self, name: &str, timeout: Duration, force: bool) {
        let (child, mut drains, in_flight) = {
            let Some(process) = self.processes.get(name) else {
                warn!(model = name, "Backend not found");
                return;
            };
            let mut guard = process.lock();
            guard.state = BackendState::Stopping;
            (
                guard.child.take(),
                std::mem::take(&mut guard.drains),
                Arc::clone(&guard.in_flight),
            )
        };

        if !force {
            self.wait_for_drain(name, &in_flight).await;
        }

        drains.abort_all();
        while drains.join_next().await.is_some() {}

        let Some(mut child) = child else {
            self.processes.remove(name);
            info!(model = name, "Backend entry removed");
            return;
        };

        match terminate(name, &mut child, timeout, force).await {
            Ok(status) => {
                self.processes.remove(name);
                info!(model = name, ?status, "Backend terminated");
            }
            Err(e) => {
                error!(model = name, error = %e, "Error stopping backend");
                // Keep the handle so a later stop can retry
                if let Some(process) = self.processes.get(name) {
                    process.lock().child = Some(child);
                }
            }
        }
    }

    async fn wait_for_drain(&self, name: &str, counter: &AtomicUsize) {
        let drain_timeout = self.defaults.drain_timeout();
        let drain_start = Instant::now();
        while counter.load(Ordering::SeqCst) > 0 {
            if drain_start.elapsed() > drain_timeout {
                let remaining = counter.load(Ordering::SeqCst);
                warn!(model = name, remaining, "Drain timeout exceeded, proceeding with shutdown");
                return;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
        let drained_in = drain_start.elapsed();
        if drained_in > Duration::from_millis(100) {
            info!(model = name, drained_in_ms = drained_in.as_millis(), "Drained in-flight requests");
        }
    }
}

/// Arguments passed to the backend executable.
///
/// `-m <artifact> --port <port>` followed by each configured argument in
/// order: `true` emits the flag alone, `false` omits it, anything else emits
/// the flag and its string form.
pub fn build_command_args(artifact: &Path, port: u16, args: &toml::Table) -> Vec<String> {
    let mut command = vec![
        "-m".to_string(),
        artifact.display().to_string(),
        "--port".to_string(),
        port.to_string(),
    ];

    for (flag, value) in args {
        match value {
            toml::Value::Boolean(true) => command.push(flag.clone()),
            toml::Value::Boolean(false) => {}
            other => {
                command.push(flag.clone());
                command.push(arg_value(other));
            }
        }
    }

    command
}

fn arg_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        other => other.to_string(),
    }
}

/// Forward each non-empty line of a backend pipe to the log until EOF.
///
/// Lines are decoded lossily. The pipe is held open and read until EOF
/// whatever bytes the backend writes.
async fn drain_output<R>(name: String, stream: OutputStream, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.is_empty() {
                    info!(
                        target: BACKEND_LOG_TARGET,
                        model = %name,
                        stream = stream.as_str(),
                        "{}",
                        line
                    );
                }
            }
            Err(e) => {
                error!(model = %name, stream = stream.as_str(), error = %e, "Error reading backend output");
                break;
            }
        }
    }
}

/// Signal the process and wait for it to exit
async fn terminate(
    name: &str,
    child: &mut Child,
    timeout: Duration,
    force: bool,
) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    if force {
        info!(model = name, "Killing backend");
        child.start_kill()?;
    } else {
        send_sigterm(name, child)?;
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                model = name,
                timeout_secs = timeout.as_secs(),
                "Backend didn't terminate, force killing"
            );
            child.start_kill()?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_sigterm(name: &str, child: &mut Child) -> std::io::Result<()> {
    if let Some(pid) = child.id() {
        info!(model = name, pid, "Sending SIGTERM to backend");
        // The child is not reaped yet, so the pid still refers to it
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_sigterm(name: &str, child: &mut Child) -> std::io::Result<()> {
    info!(model = name, "Terminating backend");
    child.start_kill()
}
