//! Periodic CPU/memory sampling for running processes and the system.
//!
//! A background worker samples every running child by pid each cycle,
//! persists the samples, and keeps a short per-process ring buffer for fast
//! recent reads. System stats are cached for synchronous readers. Sampling
//! failures are logged and skipped, never surfaced.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::StoreError,
    events::{CoreEvent, EventBus},
    store::{MetricAggregate, MetricSample, Store, now_ms},
};

/// Samples retained per process for fast recent reads.
const RING_CAP: usize = 100;

const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Point-in-time system statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    /// Global CPU usage percent.
    pub cpu_percent: f32,
    /// Free memory in bytes.
    pub memory_free_bytes: u64,
    /// Total memory in bytes.
    pub memory_total_bytes: u64,
    /// Used memory as a percentage of total.
    pub memory_percent: f32,
    /// Seconds since boot.
    pub uptime_secs: u64,
    /// 1/5/15 minute load averages. Reported as zeros.
    pub load_average: [f64; 3],
    /// Capture timestamp, epoch ms.
    pub captured_at: i64,
}

/// Payload of the metricsCollected event.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// System stats for the cycle.
    pub system: SystemSnapshot,
    /// One sample per running process.
    pub processes: Vec<MetricSample>,
}

/// Tuning for the collector worker.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Time between sampling cycles.
    pub sample_interval: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

/// The set of running processes to sample each cycle.
pub trait SampleTargets: Send + Sync {
    /// Ids and pids of currently running children.
    fn running(&self) -> Vec<(String, u32)>;
}

impl SampleTargets for crate::supervisor::Supervisor {
    fn running(&self) -> Vec<(String, u32)> {
        crate::supervisor::Supervisor::running(self)
    }
}

struct CollectorShared {
    store: Arc<Store>,
    bus: EventBus,
    config: Arc<Config>,
    targets: Arc<dyn SampleTargets>,
    settings: CollectorSettings,
    system_cache: RwLock<Option<SystemSnapshot>>,
    rings: Mutex<HashMap<String, VecDeque<MetricSample>>>,
}

impl CollectorShared {
    fn ingest(&self, sample: MetricSample) {
        if let Err(err) = self.store.append_metric(
            &sample.process_id,
            sample.cpu_percent,
            sample.memory_bytes,
            sample.timestamp,
        ) {
            warn!("failed to persist metric sample: {err}");
        }

        let max_memory_bytes = self.config.max_memory_mb as i64 * 1024 * 1024;
        if sample.cpu_percent > self.config.max_cpu_percent as f64 {
            warn!(
                "process '{}' cpu at {:.1}% exceeds threshold {}%",
                sample.process_id, sample.cpu_percent, self.config.max_cpu_percent
            );
        }
        if sample.memory_bytes > max_memory_bytes {
            warn!(
                "process '{}' memory at {} bytes exceeds threshold {} MB",
                sample.process_id, sample.memory_bytes, self.config.max_memory_mb
            );
        }

        let mut rings = self.rings.lock().unwrap_or_else(PoisonError::into_inner);
        let ring = rings.entry(sample.process_id.clone()).or_default();
        ring.push_back(sample);
        while ring.len() > RING_CAP {
            ring.pop_front();
        }
    }

    fn cycle(&self, system: &mut System) {
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        let used = system.used_memory();
        let snapshot = SystemSnapshot {
            cpu_percent: system.global_cpu_usage(),
            memory_free_bytes: system.free_memory(),
            memory_total_bytes: total,
            memory_percent: if total > 0 {
                used as f32 / total as f32 * 100.0
            } else {
                0.0
            },
            uptime_secs: System::uptime(),
            load_average: [0.0; 3],
            captured_at: now_ms(),
        };
        {
            let mut cache = self
                .system_cache
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *cache = Some(snapshot.clone());
        }

        let mut samples = Vec::new();
        for (process_id, pid) in self.targets.running() {
            match sample_process(system, pid) {
                Some((cpu_percent, memory_bytes)) => {
                    let sample = MetricSample {
                        id: 0,
                        process_id,
                        cpu_percent,
                        memory_bytes,
                        timestamp: now_ms(),
                    };
                    self.ingest(sample.clone());
                    samples.push(sample);
                }
                None => {
                    debug!("skipping metric sample for '{process_id}' (pid {pid} gone)");
                }
            }
        }

        self.bus.publish(CoreEvent::MetricsCollected(MetricsSnapshot {
            system: snapshot,
            processes: samples,
        }));
    }
}

fn sample_process(system: &mut System, pid: u32) -> Option<(f64, i64)> {
    let sys_pid = Pid::from_u32(pid);
    let pids = [sys_pid];
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&pids),
        true,
        ProcessRefreshKind::everything(),
    );
    system
        .process(sys_pid)
        .map(|process| (process.cpu_usage() as f64, process.memory() as i64))
}

/// Background worker that samples running processes and the system.
pub struct MetricsCollector {
    shared: Arc<CollectorShared>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MetricsCollector {
    /// Builds a collector with default tuning. Call [`MetricsCollector::start`]
    /// to begin sampling.
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        config: Arc<Config>,
        targets: Arc<dyn SampleTargets>,
    ) -> Self {
        Self::with_settings(store, bus, config, targets, CollectorSettings::default())
    }

    /// Builds a collector with explicit tuning.
    pub fn with_settings(
        store: Arc<Store>,
        bus: EventBus,
        config: Arc<Config>,
        targets: Arc<dyn SampleTargets>,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(CollectorShared {
                store,
                bus,
                config,
                targets,
                settings,
                system_cache: RwLock::new(None),
                rings: Mutex::new(HashMap::new()),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the sampling worker. A second call is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let interval = shared.settings.sample_interval;
        let handle = thread::Builder::new()
            .name("metrics-collector".into())
            .spawn(move || {
                let mut system = System::new();
                while !stop.load(Ordering::SeqCst) {
                    shared.cycle(&mut system);

                    // Sleep in short steps so stop() stays responsive.
                    let mut slept = Duration::ZERO;
                    while slept < interval {
                        if stop.load(Ordering::SeqCst) {
                            return;
                        }
                        let step = (interval - slept).min(Duration::from_millis(100));
                        thread::sleep(step);
                        slept += step;
                    }
                }
            })
            .expect("failed to spawn metrics collector");
        *worker = Some(handle);
    }

    /// Stops the worker and waits for it to finish.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Recent samples for one process, ascending by time. Served from the
    /// ring buffer when it covers the window, otherwise from the store.
    pub fn process_stats(
        &self,
        id: &str,
        window_ms: Option<i64>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let now = now_ms();
        {
            let rings = self
                .shared
                .rings
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(ring) = rings.get(id)
                && !ring.is_empty()
            {
                match window_ms {
                    None => return Ok(ring.iter().cloned().collect()),
                    Some(window) => {
                        let ring_age = now - ring.front().map(|s| s.timestamp).unwrap_or(now);
                        if window <= ring_age {
                            let cutoff = now - window;
                            return Ok(ring
                                .iter()
                                .filter(|s| s.timestamp >= cutoff)
                                .cloned()
                                .collect());
                        }
                    }
                }
            }
        }

        let since = window_ms.map(|w| now - w);
        let mut rows = self.shared.store.query_metrics(id, since, 1000)?;
        rows.reverse();
        Ok(rows)
    }

    /// Average and peak CPU/memory over a window; `None` without samples.
    pub fn aggregated(
        &self,
        id: &str,
        window_ms: i64,
    ) -> Result<Option<MetricAggregate>, StoreError> {
        self.shared
            .store
            .aggregate_metrics(id, now_ms() - window_ms)
    }

    /// The most recent system snapshot, if a cycle has completed.
    pub fn system(&self) -> Option<SystemSnapshot> {
        self.shared
            .system_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}
