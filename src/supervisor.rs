//! Child process supervision.
//!
//! The supervisor owns every child handle and drives the lifecycle state
//! machine: starting -> running -> stopped | crashed, with failed reserved
//! for spawns that never produced a child. Each handle carries its own
//! mutex covering state changes and the store writes that accompany them;
//! the process map itself is guarded by a separate coarse lock taken only
//! for insertion and lookup.
use std::os::unix::process::ExitStatusExt;
use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read},
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::SupervisorError,
    errorsink::ErrorSink,
    events::{CoreEvent, EventBus},
    logsink::LogSink,
    store::{
        HealthStatus, LogLevel, LogStream, ProcessFilter, ProcessRecord, ProcessStatus,
        Store, now_ms, short_id,
    },
};

const STOP_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Request to start a managed process.
#[derive(Debug, Clone, Default)]
pub struct StartSpec {
    /// Reuse this id when provided and free; otherwise a fresh id is
    /// assigned.
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Absolute command path.
    pub command: String,
    /// Argument list.
    pub args: Vec<String>,
    /// Environment overlay applied over the supervisor's own environment.
    pub env: HashMap<String, String>,
    /// Working directory; defaults to the supervisor's cwd.
    pub cwd: Option<PathBuf>,
    /// Restart automatically when a probe reports unhealthy.
    pub auto_restart: bool,
    /// External probe command.
    pub health_check_command: Option<String>,
    /// Probe interval in milliseconds.
    pub health_check_interval: Option<u64>,
    /// Owning group.
    pub group_id: Option<String>,
}

impl StartSpec {
    /// Minimal spec for a named command.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Rebuilds the spec persisted in a process row, keeping its id.
    pub fn from_record(rec: &ProcessRecord) -> Self {
        Self {
            id: Some(rec.id.clone()),
            name: rec.name.clone(),
            command: rec.command.clone(),
            args: rec.args.clone(),
            env: rec.env.clone(),
            cwd: rec.cwd.clone().map(PathBuf::from),
            auto_restart: rec.auto_restart,
            health_check_command: rec.health_check_command.clone(),
            health_check_interval: rec.health_check_interval,
            group_id: rec.group_id.clone(),
        }
    }
}

/// Field-wise overrides merged over the effective configuration on restart.
/// Env and args replace wholesale when provided.
#[derive(Debug, Clone, Default)]
pub struct RestartOverrides {
    /// Replacement command path.
    pub command: Option<String>,
    /// Replacement argument list.
    pub args: Option<Vec<String>>,
    /// Replacement environment overlay.
    pub env: Option<HashMap<String, String>>,
    /// Replacement working directory.
    pub cwd: Option<PathBuf>,
    /// Replacement auto-restart flag.
    pub auto_restart: Option<bool>,
    /// Replacement probe command.
    pub health_check_command: Option<String>,
    /// Replacement probe interval.
    pub health_check_interval: Option<u64>,
}

fn merge_overrides(spec: &mut StartSpec, overrides: RestartOverrides) {
    if let Some(command) = overrides.command {
        spec.command = command;
    }
    if let Some(args) = overrides.args {
        spec.args = args;
    }
    if let Some(env) = overrides.env {
        spec.env = env;
    }
    if let Some(cwd) = overrides.cwd {
        spec.cwd = Some(cwd);
    }
    if let Some(auto_restart) = overrides.auto_restart {
        spec.auto_restart = auto_restart;
    }
    if let Some(command) = overrides.health_check_command {
        spec.health_check_command = Some(command);
    }
    if let Some(interval) = overrides.health_check_interval {
        spec.health_check_interval = Some(interval);
    }
}

fn signal_name(raw: i32) -> String {
    Signal::try_from(raw)
        .map(|sig| sig.as_str().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

fn send_signal(pid: u32, sig: Signal) {
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), sig) {
        // ESRCH just means the child beat us to the exit.
        debug!("signal {sig} to pid {pid} failed: {err}");
    }
}

struct HandleState {
    spec: StartSpec,
    status: ProcessStatus,
    pid: Option<u32>,
    restart_count: u32,
    created_at: i64,
}

struct ProcessHandle {
    id: String,
    state: Mutex<HandleState>,
    exit: Condvar,
}

impl ProcessHandle {
    fn new(id: String) -> Self {
        Self {
            id,
            state: Mutex::new(HandleState {
                spec: StartSpec::default(),
                status: ProcessStatus::Stopped,
                pid: None,
                restart_count: 0,
                created_at: 0,
            }),
            exit: Condvar::new(),
        }
    }
}

struct SupervisorInner {
    config: Arc<Config>,
    store: Arc<Store>,
    logs: Arc<LogSink>,
    errors: Arc<ErrorSink>,
    bus: EventBus,
    handles: Mutex<HashMap<String, Arc<ProcessHandle>>>,
}

/// Owner of all child processes. Cheap to clone and share.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Builds a supervisor, repairing rows left stale by an unclean shutdown
    /// and running a retention sweep.
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        logs: Arc<LogSink>,
        errors: Arc<ErrorSink>,
        bus: EventBus,
    ) -> Result<Self, SupervisorError> {
        let repaired = store.reconcile_startup()?;
        if repaired > 0 {
            info!("reconciled {repaired} stale process rows to stopped");
        }
        match store.cleanup(config.log_retention_days) {
            Ok(stats) => debug!(
                "retention sweep removed {} logs, {} metrics, {} errors",
                stats.logs, stats.metrics, stats.errors
            ),
            Err(err) => warn!("retention sweep failed: {err}"),
        }

        Ok(Self {
            inner: Arc::new(SupervisorInner {
                config,
                store,
                logs,
                errors,
                bus,
                handles: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn handle(&self, id: &str) -> Result<Arc<ProcessHandle>, SupervisorError> {
        let handles = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound { id: id.to_string() })
    }

    /// Starts a process per `spec`. The row is persisted before the spawn is
    /// attempted; on spawn failure the row moves to failed and the error
    /// surfaces.
    pub fn start(&self, spec: StartSpec) -> Result<ProcessRecord, SupervisorError> {
        if !self.inner.config.is_command_allowed(&spec.command) {
            return Err(SupervisorError::CommandNotAllowed {
                command: spec.command,
            });
        }

        let handle = {
            let mut handles = self
                .inner
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let active = handles
                .values()
                .filter(|h| {
                    h.state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .status
                        .is_active()
                })
                .count();
            if active >= self.inner.config.max_processes {
                return Err(SupervisorError::CapacityExceeded {
                    limit: self.inner.config.max_processes,
                });
            }

            if let Some(ref want) = spec.id
                && let Some(existing) = handles.get(want)
            {
                let state = existing
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if state.status.is_active() {
                    return Err(SupervisorError::AlreadyRunning { id: want.clone() });
                }
            }

            let id = spec
                .id
                .clone()
                .unwrap_or_else(|| short_id(&spec.name));
            Arc::clone(
                handles
                    .entry(id.clone())
                    .or_insert_with(|| Arc::new(ProcessHandle::new(id))),
            )
        };

        self.start_on_handle(handle, spec)
    }

    fn start_on_handle(
        &self,
        handle: Arc<ProcessHandle>,
        mut spec: StartSpec,
    ) -> Result<ProcessRecord, SupervisorError> {
        let inner = &self.inner;
        let id = handle.id.clone();
        spec.id = Some(id.clone());

        let mut state = handle
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.status.is_active() {
            return Err(SupervisorError::AlreadyRunning { id });
        }

        // Adopt history from a persisted row the first time this handle is
        // used (group starts and restarts across supervisor reboots).
        if state.created_at == 0 {
            if let Some(prior) = inner.store.get_process(&id)? {
                state.created_at = prior.created_at;
                state.restart_count = prior.restart_count;
            } else {
                state.created_at = now_ms();
            }
        }
        state.spec = spec;
        state.status = ProcessStatus::Starting;
        state.pid = None;

        let mut record = Self::record_from(&id, &state);
        inner.store.upsert_process(&record)?;

        let mut cmd = Command::new(&state.spec.command);
        cmd.args(&state.spec.args)
            .envs(&state.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref cwd) = state.spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                state.status = ProcessStatus::Failed;
                state.pid = None;
                if let Err(store_err) = inner.store.mark_failed(&id) {
                    error!("failed to persist spawn failure of '{id}': {store_err}");
                }
                let name = state.spec.name.clone();
                drop(state);

                let message = format!("spawn failed: {err}");
                inner
                    .logs
                    .append(&id, LogStream::System, LogLevel::Error, &message);
                if let Err(sink_err) = inner.errors.record(&id, &message, None) {
                    error!("failed to record spawn error of '{id}': {sink_err}");
                }
                return Err(SupervisorError::SpawnFailed { name, source: err });
            }
        };

        let pid = child.id();
        let started_at = now_ms();
        state.status = ProcessStatus::Running;
        state.pid = Some(pid);
        inner.store.mark_running(&id, pid, started_at)?;

        record.status = ProcessStatus::Running;
        record.pid = Some(pid);
        record.started_at = Some(started_at);
        record.restart_count = state.restart_count;
        drop(state);

        info!("started '{}' ({}) with pid {pid}", record.name, id);
        inner.logs.append(
            &id,
            LogStream::System,
            LogLevel::Info,
            format!("started with pid {pid}"),
        );

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(Self::spawn_stream_reader(
                id.clone(),
                LogStream::Stdout,
                LogLevel::Info,
                stdout,
                Arc::clone(&inner.logs),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(Self::spawn_stream_reader(
                id.clone(),
                LogStream::Stderr,
                LogLevel::Error,
                stderr,
                Arc::clone(&inner.logs),
            ));
        }

        Self::spawn_wait_thread(Arc::clone(&self.inner), Arc::clone(&handle), child, readers);

        inner.bus.publish(CoreEvent::ProcessStarted(record.clone()));
        Ok(record)
    }

    fn record_from(id: &str, state: &HandleState) -> ProcessRecord {
        ProcessRecord {
            id: id.to_string(),
            name: state.spec.name.clone(),
            command: state.spec.command.clone(),
            args: state.spec.args.clone(),
            env: state.spec.env.clone(),
            cwd: state
                .spec
                .cwd
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            pid: state.pid,
            status: state.status,
            group_id: state.spec.group_id.clone(),
            created_at: state.created_at,
            started_at: None,
            stopped_at: None,
            restart_count: state.restart_count,
            auto_restart: state.spec.auto_restart,
            health_check_command: state.spec.health_check_command.clone(),
            health_check_interval: state.spec.health_check_interval,
            last_health_check: None,
            health_status: HealthStatus::Unknown,
        }
    }

    fn spawn_stream_reader(
        id: String,
        stream: LogStream,
        level: LogLevel,
        source: impl Read + Send + 'static,
        logs: Arc<LogSink>,
    ) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(format!("{}-{id}", stream.as_ref()))
            .spawn(move || {
                let reader = BufReader::new(source);
                for line in reader.lines().map_while(Result::ok) {
                    let frame = line.trim();
                    if frame.is_empty() {
                        continue;
                    }
                    logs.append(&id, stream, level, frame);
                }
            })
            .expect("failed to spawn stream reader")
    }

    fn spawn_wait_thread(
        inner: Arc<SupervisorInner>,
        handle: Arc<ProcessHandle>,
        mut child: Child,
        readers: Vec<thread::JoinHandle<()>>,
    ) {
        thread::Builder::new()
            .name(format!("wait-{}", handle.id))
            .spawn(move || {
                let wait_result = child.wait();

                // Readers drain to EOF once the child is gone; joining them
                // and flushing keeps exit records behind all output records.
                for reader in readers {
                    let _ = reader.join();
                }
                inner.logs.flush();

                let (status, code, sig) = match wait_result {
                    Ok(exit) => {
                        let code = exit.code();
                        let sig = exit.signal().map(signal_name);
                        let status = if sig.is_some() || code == Some(0) {
                            ProcessStatus::Stopped
                        } else {
                            ProcessStatus::Crashed
                        };
                        (status, code, sig)
                    }
                    Err(err) => {
                        error!("wait for '{}' failed: {err}", handle.id);
                        (ProcessStatus::Stopped, None, None)
                    }
                };

                let stopped_at = now_ms();
                let mut state = handle
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                state.status = status;
                state.pid = None;
                if let Err(err) = inner.store.mark_exited(&handle.id, status, stopped_at) {
                    error!("failed to persist exit of '{}': {err}", handle.id);
                }

                let code_text =
                    code.map_or_else(|| "null".to_string(), |c| c.to_string());
                let sig_text = sig.clone().unwrap_or_else(|| "null".to_string());
                let message = format!("exited with code {code_text}, signal {sig_text}");
                let level = if status == ProcessStatus::Crashed {
                    LogLevel::Error
                } else {
                    LogLevel::Info
                };
                debug!("process '{}' {message}", handle.id);
                inner
                    .logs
                    .append(&handle.id, LogStream::System, level, &message);

                // Publish before waking stop()/restart() waiters so a
                // follow-up start can never overtake the exit event.
                inner.bus.publish(CoreEvent::ProcessExited {
                    id: handle.id.clone(),
                    code,
                    signal: sig,
                    status,
                });
                handle.exit.notify_all();
                drop(state);
            })
            .expect("failed to spawn wait thread");
    }

    /// Stops a running process. Unknown ids fail with NotFound; a process
    /// that is not running is a no-op. The call returns only once the exit
    /// handler has moved the row out of running.
    pub fn stop(&self, id: &str, force: bool) -> Result<(), SupervisorError> {
        let handle = self.handle(id)?;
        let grace = if force { KILL_GRACE } else { STOP_GRACE };
        let first = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };

        let mut state = handle
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.status != ProcessStatus::Running {
            return Ok(());
        }
        let Some(pid) = state.pid else {
            return Ok(());
        };

        info!("stopping '{id}' (pid {pid}, force={force})");
        send_signal(pid, first);

        let deadline = Instant::now() + grace;
        let mut escalated = false;
        while state.status == ProcessStatus::Running {
            if !escalated && Instant::now() >= deadline {
                warn!("'{id}' still alive after {}s grace, killing", grace.as_secs());
                send_signal(pid, Signal::SIGKILL);
                escalated = true;
            }
            let (next, _timeout) = handle
                .exit
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        drop(state);

        self.inner
            .bus
            .publish(CoreEvent::ProcessStopped { id: id.to_string() });
        Ok(())
    }

    /// Restarts a process, merging `overrides` over its effective
    /// configuration. The restart counter is bumped before the new start
    /// attempt; a failed start leaves the process in its post-stop state.
    pub fn restart(
        &self,
        id: &str,
        overrides: Option<RestartOverrides>,
    ) -> Result<ProcessRecord, SupervisorError> {
        self.restart_with(id, overrides, false)
    }

    /// Forced restart: the stop phase uses the kill signal and its 1 s
    /// watchdog.
    pub fn kill(&self, id: &str) -> Result<ProcessRecord, SupervisorError> {
        self.restart_with(id, None, true)
    }

    fn restart_with(
        &self,
        id: &str,
        overrides: Option<RestartOverrides>,
        force: bool,
    ) -> Result<ProcessRecord, SupervisorError> {
        let handle = self.handle(id)?;

        let merged = {
            let mut state = handle
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.restart_count += 1;
            let count = state.restart_count;
            let mut spec = state.spec.clone();
            drop(state);

            self.inner.store.set_restart_count(id, count)?;
            if let Some(overrides) = overrides {
                merge_overrides(&mut spec, overrides);
            }
            spec.id = Some(id.to_string());
            spec
        };

        info!("restarting '{id}' (force={force})");
        self.stop(id, force)?;
        self.start_on_handle(handle, merged)
    }

    /// Point-in-time snapshot of persisted rows, filtered by status and/or
    /// group.
    pub fn list(&self, filter: &ProcessFilter) -> Result<Vec<ProcessRecord>, SupervisorError> {
        Ok(self.inner.store.list_processes(filter)?)
    }

    /// In-memory status for one id, if the supervisor holds a handle for it.
    pub fn status_of(&self, id: &str) -> Option<ProcessStatus> {
        let handles = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles.get(id).map(|h| {
            h.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .status
        })
    }

    /// Ids and pids of the currently running children.
    pub fn running(&self) -> Vec<(String, u32)> {
        let handles = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles
            .iter()
            .filter_map(|(id, handle)| {
                let state = handle
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                (state.status == ProcessStatus::Running)
                    .then(|| state.pid.map(|pid| (id.clone(), pid)))
                    .flatten()
            })
            .collect()
    }

    /// Stops every running child in parallel with the normal grace window,
    /// then flushes pending logs. Idempotent; probe registrations are the
    /// prober's to cancel (it observes the stop events).
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.running().into_iter().map(|(id, _)| id).collect();
        if ids.is_empty() {
            self.inner.logs.flush();
            return;
        }
        info!("shutting down {} running processes", ids.len());

        let stoppers: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let supervisor = self.clone();
                thread::spawn(move || {
                    if let Err(err) = supervisor.stop(&id, false) {
                        warn!("shutdown stop of '{id}' failed: {err}");
                    }
                })
            })
            .collect();
        for stopper in stoppers {
            let _ = stopper.join();
        }
        self.inner.logs.flush();
    }
}
