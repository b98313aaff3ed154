//! Active health checks with bounded probes and auto-restart.
//!
//! Probes run without a shell: the configured command line is split into
//! argv and argv[0] must pass the same allowlist rules as process commands.
//! A probe gets a 5 second wall-clock budget and 1 MiB of output per
//! stream; exceeding either kills the probe child and classifies the
//! process unhealthy. Without a probe command the check degrades to a
//! signal-0 liveness test of the child pid.
//!
//! The prober learns about processes by consuming lifecycle events, and
//! reaches the supervisor only through the narrow [`RestartHandle`] seam.
use std::{
    collections::HashMap,
    io::Read,
    process::{Command, Stdio},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use nix::{sys::signal, unistd::Pid};
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::{ProbeError, SupervisorError},
    events::{CoreEvent, EventBus},
    store::{HealthStatus, Store, now_ms},
};

/// Wall-clock budget for one probe execution.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Output cap per probe stream.
pub const PROBE_OUTPUT_CAP: usize = 1024 * 1024;

const SCHEDULER_TICK: Duration = Duration::from_millis(1000);

/// The one capability the prober needs from the supervisor.
pub trait RestartHandle: Send + Sync {
    /// Restart the process with its current effective configuration.
    fn restart_process(&self, id: &str) -> Result<(), SupervisorError>;
}

impl RestartHandle for crate::supervisor::Supervisor {
    fn restart_process(&self, id: &str) -> Result<(), SupervisorError> {
        self.restart(id, None).map(|_| ())
    }
}

#[derive(Debug, Clone)]
struct Registration {
    interval: Duration,
    command: Option<String>,
    auto_restart: bool,
    next_due: Instant,
}

struct ProberShared {
    config: Arc<Config>,
    store: Arc<Store>,
    restarter: Arc<dyn RestartHandle>,
    registrations: Mutex<HashMap<String, Registration>>,
}

/// Periodic health prober.
pub struct HealthProber {
    shared: Arc<ProberShared>,
    bus: EventBus,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl HealthProber {
    /// Builds a prober. Call [`HealthProber::start`] to begin scheduling.
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        bus: EventBus,
        restarter: Arc<dyn RestartHandle>,
    ) -> Self {
        Self {
            shared: Arc::new(ProberShared {
                config,
                store,
                restarter,
                registrations: Mutex::new(HashMap::new()),
            }),
            bus,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the scheduler and the lifecycle-event listener. A second call
    /// is a no-op.
    pub fn start(&self) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let scheduler = thread::Builder::new()
            .name("health-prober".into())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    Self::run_due_probes(&shared);
                    let mut slept = Duration::ZERO;
                    while slept < SCHEDULER_TICK {
                        if stop.load(Ordering::SeqCst) {
                            return;
                        }
                        let step = (SCHEDULER_TICK - slept).min(Duration::from_millis(100));
                        thread::sleep(step);
                        slept += step;
                    }
                }
            })
            .expect("failed to spawn health prober");
        workers.push(scheduler);

        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let subscription = self.bus.subscribe();
        let listener = thread::Builder::new()
            .name("health-prober-events".into())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match subscription.recv_timeout(Duration::from_millis(200)) {
                        Ok(CoreEvent::ProcessStarted(rec)) => {
                            if rec.health_check_command.is_some() {
                                let interval = rec
                                    .health_check_interval
                                    .unwrap_or(shared.config.health_check_interval_default);
                                Self::register(
                                    &shared,
                                    &rec.id,
                                    rec.health_check_command.clone(),
                                    interval,
                                    rec.auto_restart,
                                );
                            }
                        }
                        Ok(CoreEvent::ProcessExited { id, .. })
                        | Ok(CoreEvent::ProcessStopped { id }) => {
                            let mut registrations = shared
                                .registrations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner);
                            if registrations.remove(&id).is_some() {
                                debug!("probe registration for '{id}' cancelled on exit");
                            }
                        }
                        _ => {}
                    }
                }
            })
            .expect("failed to spawn prober event listener");
        workers.push(listener);
    }

    /// Stops both workers and waits for them.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn register(
        shared: &ProberShared,
        id: &str,
        command: Option<String>,
        interval_ms: u64,
        auto_restart: bool,
    ) {
        let interval = Duration::from_millis(
            interval_ms.max(crate::config::MIN_HEALTH_CHECK_INTERVAL_MS),
        );
        let mut registrations = shared
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registrations.insert(
            id.to_string(),
            Registration {
                interval,
                command,
                auto_restart,
                next_due: Instant::now() + interval,
            },
        );
        debug!("probe registered for '{id}' every {}ms", interval.as_millis());
    }

    /// Registers (or re-registers) a probe for a persisted process, using
    /// its stored probe command. `interval_ms` falls back to the row's
    /// interval, then the configured default.
    pub fn enable(&self, id: &str, interval_ms: Option<u64>) -> Result<(), ProbeError> {
        let rec = self
            .shared
            .store
            .get_process(id)?
            .ok_or_else(|| ProbeError::ProcessNotFound { id: id.to_string() })?;
        let interval = interval_ms
            .or(rec.health_check_interval)
            .unwrap_or(self.shared.config.health_check_interval_default);
        Self::register(
            &self.shared,
            id,
            rec.health_check_command,
            interval,
            rec.auto_restart,
        );
        Ok(())
    }

    /// Cancels a probe registration; returns whether one existed.
    pub fn disable(&self, id: &str) -> bool {
        let mut registrations = self
            .shared
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registrations.remove(id).is_some()
    }

    /// Cancels every registration.
    pub fn disable_all(&self) {
        let mut registrations = self
            .shared
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = registrations.len();
        registrations.clear();
        if count > 0 {
            debug!("cancelled {count} probe registrations");
        }
    }

    /// Ids with an active registration.
    pub fn registered(&self) -> Vec<String> {
        self.shared
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Probes one process immediately, persisting the outcome.
    pub fn check_one(&self, id: &str) -> Result<HealthStatus, ProbeError> {
        let registration = {
            let registrations = self
                .shared
                .registrations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registrations.get(id).cloned()
        };

        let (command, auto_restart) = match registration {
            Some(reg) => (reg.command, reg.auto_restart),
            None => {
                let rec = self.shared.store.get_process(id)?.ok_or_else(|| {
                    ProbeError::ProcessNotFound { id: id.to_string() }
                })?;
                (rec.health_check_command, rec.auto_restart)
            }
        };

        Ok(Self::probe_and_apply(
            &self.shared,
            id,
            command.as_deref(),
            auto_restart,
        ))
    }

    /// Probes every registered process immediately.
    pub fn check_all(&self) -> Vec<(String, HealthStatus)> {
        let targets: Vec<(String, Registration)> = {
            let registrations = self
                .shared
                .registrations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registrations
                .iter()
                .map(|(id, reg)| (id.clone(), reg.clone()))
                .collect()
        };

        targets
            .into_iter()
            .map(|(id, reg)| {
                let status = Self::probe_and_apply(
                    &self.shared,
                    &id,
                    reg.command.as_deref(),
                    reg.auto_restart,
                );
                (id, status)
            })
            .collect()
    }

    fn run_due_probes(shared: &Arc<ProberShared>) {
        let now = Instant::now();
        let due: Vec<(String, Registration)> = {
            let mut registrations = shared
                .registrations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registrations
                .iter_mut()
                .filter(|(_, reg)| reg.next_due <= now)
                .map(|(id, reg)| {
                    reg.next_due = now + reg.interval;
                    (id.clone(), reg.clone())
                })
                .collect()
        };

        for (id, reg) in due {
            Self::probe_and_apply(shared, &id, reg.command.as_deref(), reg.auto_restart);
        }
    }

    fn probe_and_apply(
        shared: &ProberShared,
        id: &str,
        command: Option<&str>,
        auto_restart: bool,
    ) -> HealthStatus {
        let status = match command {
            Some(command) => {
                match run_probe(&shared.config, command, PROBE_TIMEOUT, PROBE_OUTPUT_CAP) {
                    Ok(status) => status,
                    Err(ProbeError::Timeout(ms)) => {
                        warn!("probe for '{id}' timed out after {ms}ms");
                        HealthStatus::Unhealthy
                    }
                    Err(ProbeError::OutputTooLarge(cap)) => {
                        warn!("probe for '{id}' exceeded the {cap} byte output cap");
                        HealthStatus::Unhealthy
                    }
                    Err(ProbeError::CommandNotAllowed { command }) => {
                        warn!("probe command '{command}' for '{id}' is not allowed");
                        HealthStatus::Unhealthy
                    }
                    Err(err) => {
                        warn!("probe for '{id}' failed to execute: {err}");
                        HealthStatus::Unknown
                    }
                }
            }
            None => Self::liveness_probe(shared, id),
        };

        if let Err(err) = shared.store.update_health(id, status, now_ms()) {
            warn!("failed to persist health of '{id}': {err}");
        }

        if status == HealthStatus::Unhealthy
            && auto_restart
            && shared.config.auto_restart_enabled
            && Self::is_running(shared, id)
        {
            warn!("process '{id}' is unhealthy, requesting restart");
            // Drop the registration first; the restart's started event
            // re-registers, so an in-flight restart is never re-probed.
            {
                let mut registrations = shared
                    .registrations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                registrations.remove(id);
            }
            if let Err(err) = shared.restarter.restart_process(id) {
                warn!("auto-restart of '{id}' failed: {err}");
            }
        }

        status
    }

    fn is_running(shared: &ProberShared, id: &str) -> bool {
        matches!(
            shared.store.get_process(id),
            Ok(Some(rec)) if rec.status == crate::store::ProcessStatus::Running
        )
    }

    fn liveness_probe(shared: &ProberShared, id: &str) -> HealthStatus {
        let pid = match shared.store.get_process(id) {
            Ok(Some(rec)) => rec.pid,
            Ok(None) => return HealthStatus::Unknown,
            Err(err) => {
                warn!("liveness probe for '{id}' could not read the store: {err}");
                return HealthStatus::Unknown;
            }
        };
        match pid {
            // Signal 0 delivers nothing but reports reachability.
            Some(pid) => match signal::kill(Pid::from_raw(pid as i32), None) {
                Ok(()) => HealthStatus::Healthy,
                Err(_) => HealthStatus::Unhealthy,
            },
            None => HealthStatus::Unknown,
        }
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_capped_reader(
    mut stream: impl Read + Send + 'static,
    cap: usize,
    oversize: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        let mut total = 0usize;
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    total += n;
                    if total > cap {
                        oversize.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    })
}

/// Executes a probe command line (argv, no shell) under the wall-clock and
/// output limits. Exit 0 is healthy, any other exit unhealthy; a missing
/// command binary is unknown.
fn run_probe(
    config: &Config,
    command_line: &str,
    timeout: Duration,
    output_cap: usize,
) -> Result<HealthStatus, ProbeError> {
    let argv: Vec<&str> = command_line.split_whitespace().collect();
    let Some((program, args)) = argv.split_first() else {
        return Err(ProbeError::Exec(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty probe command",
        )));
    };

    if !config.is_command_allowed(program) {
        return Err(ProbeError::CommandNotAllowed {
            command: program.to_string(),
        });
    }

    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("probe command '{program}' not found");
            return Ok(HealthStatus::Unknown);
        }
        Err(err) => return Err(ProbeError::Exec(err)),
    };

    let oversize = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_capped_reader(stdout, output_cap, Arc::clone(&oversize)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_capped_reader(stderr, output_cap, Arc::clone(&oversize)));
    }

    let deadline = Instant::now() + timeout;
    let outcome = loop {
        if oversize.load(Ordering::Relaxed) {
            let _ = child.kill();
            let _ = child.wait();
            break Err(ProbeError::OutputTooLarge(output_cap));
        }
        match child.try_wait() {
            Ok(Some(exit)) => {
                break if oversize.load(Ordering::Relaxed) {
                    Err(ProbeError::OutputTooLarge(output_cap))
                } else if exit.success() {
                    Ok(HealthStatus::Healthy)
                } else {
                    Ok(HealthStatus::Unhealthy)
                };
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(ProbeError::Timeout(timeout.as_millis() as u64));
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                let _ = child.kill();
                break Err(ProbeError::Exec(err));
            }
        }
    };

    for reader in readers {
        let _ = reader.join();
    }
    outcome
}
