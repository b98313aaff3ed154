//! Buffered log ingestion, historical queries, and live fan-out.
//!
//! Producers enqueue records under a short mutex; a dedicated writer thread
//! owns the flush path and persists batches in single store transactions.
//! When the queue is at its hard cap the oldest record is dropped and a
//! counter incremented. Every persisted record is re-published on the event
//! bus in persistence order.
use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, warn};

use crate::{
    error::StoreError,
    events::{CoreEvent, EventBus, EventSubscription},
    store::{
        CleanupStats, LogFilter, LogLevel, LogRecord, LogStats, LogStream, Store, now_ms,
    },
};

/// Tuning knobs for the ingestion buffer.
#[derive(Debug, Clone)]
pub struct SinkSettings {
    /// Queue length that triggers an immediate flush.
    pub flush_threshold: usize,
    /// Longest a record may sit unflushed.
    pub flush_interval: Duration,
    /// Queue length at which the oldest records are dropped.
    pub hard_cap: usize,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            flush_threshold: 100,
            flush_interval: Duration::from_secs(1),
            hard_cap: 10_000,
        }
    }
}

/// Log statistics including records lost to backpressure.
#[derive(Debug, Clone)]
pub struct SinkStats {
    /// Persisted-row statistics from the store.
    pub logs: LogStats,
    /// Records dropped before persistence since the sink was created.
    pub dropped_records: u64,
}

struct SinkState {
    queue: VecDeque<LogRecord>,
    flush_requested: u64,
    flush_completed: u64,
    shutdown: bool,
}

struct SinkShared {
    store: Arc<Store>,
    bus: EventBus,
    settings: SinkSettings,
    state: Mutex<SinkState>,
    wakeup: Condvar,
    dropped: AtomicU64,
}

/// Buffered log sink; cheap to clone and share.
pub struct LogSink {
    shared: Arc<SinkShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LogSink {
    /// Creates a sink with default tuning and spawns its writer thread.
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self::with_settings(store, bus, SinkSettings::default())
    }

    /// Creates a sink with explicit tuning and spawns its writer thread.
    pub fn with_settings(store: Arc<Store>, bus: EventBus, settings: SinkSettings) -> Self {
        let shared = Arc::new(SinkShared {
            store,
            bus,
            settings,
            state: Mutex::new(SinkState {
                queue: VecDeque::new(),
                flush_requested: 0,
                flush_completed: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            dropped: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("logsink-writer".into())
            .spawn(move || Self::writer_loop(worker_shared))
            .expect("failed to spawn logsink writer");

        Self {
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues a record. Never blocks on the store and never fails for a
    /// valid record; blank messages are discarded.
    pub fn add(&self, mut record: LogRecord) {
        record.message = record.message.trim().to_string();
        if record.message.is_empty() {
            return;
        }
        if record.timestamp == 0 {
            record.timestamp = now_ms();
        }

        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.shutdown {
            debug!("log record for '{}' discarded after shutdown", record.process_id);
            return;
        }
        while state.queue.len() >= self.shared.settings.hard_cap {
            state.queue.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        state.queue.push_back(record);
        if state.queue.len() >= self.shared.settings.flush_threshold {
            self.shared.wakeup.notify_all();
        }
    }

    /// Convenience constructor-and-enqueue used by the supervisor's stream
    /// readers.
    pub fn append(
        &self,
        process_id: &str,
        stream: LogStream,
        level: LogLevel,
        message: impl Into<String>,
    ) {
        self.add(LogRecord {
            id: 0,
            process_id: process_id.to_string(),
            stream,
            message: message.into(),
            timestamp: now_ms(),
            level,
        });
    }

    /// Blocks until everything enqueued before the call has been flushed.
    pub fn flush(&self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.shutdown {
            return;
        }
        state.flush_requested += 1;
        let target = state.flush_requested;
        self.shared.wakeup.notify_all();
        while state.flush_completed < target && !state.shutdown {
            let (next, _timeout) = self
                .shared
                .wakeup
                .wait_timeout(state, Duration::from_millis(200))
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }

    /// Flushes, then runs the store's retention sweep.
    pub fn cleanup(&self, retention_days: u32) -> Result<CleanupStats, StoreError> {
        self.flush();
        self.shared.store.cleanup(retention_days)
    }

    /// Historical query, newest first.
    pub fn get(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, StoreError> {
        self.shared.store.query_logs(filter)
    }

    /// Last `lines` records in ascending order; with `follow` a live
    /// subscription is returned alongside.
    pub fn tail(
        &self,
        process_id: Option<&str>,
        lines: usize,
        follow: bool,
    ) -> Result<(Vec<LogRecord>, Option<EventSubscription>), StoreError> {
        let subscription = follow.then(|| self.shared.bus.subscribe());
        let records = self.shared.store.tail_logs(process_id, lines)?;
        Ok((records, subscription))
    }

    /// Substring search, newest first.
    pub fn search(
        &self,
        query: &str,
        case_sensitive: bool,
        limit: usize,
    ) -> Result<Vec<LogRecord>, StoreError> {
        self.shared.store.search_logs(query, case_sensitive, limit)
    }

    /// Deletes a process's records, optionally only before a cutoff. Flushes
    /// first so pending records are visible to the delete.
    pub fn clear(
        &self,
        process_id: &str,
        before: Option<i64>,
    ) -> Result<usize, StoreError> {
        self.flush();
        self.shared.store.delete_logs(process_id, before)
    }

    /// Aggregate statistics for one process, including the backpressure
    /// counter.
    pub fn stats(&self, process_id: &str) -> Result<SinkStats, StoreError> {
        self.flush();
        Ok(SinkStats {
            logs: self.shared.store.log_stats(process_id)?,
            dropped_records: self.shared.dropped.load(Ordering::Relaxed),
        })
    }

    /// Live event subscription (NewLog and everything else on the bus).
    pub fn subscribe(&self) -> EventSubscription {
        self.shared.bus.subscribe()
    }

    /// Final flush, then stops the writer thread. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.shared.wakeup.notify_all();
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn writer_loop(shared: Arc<SinkShared>) {
        let mut retry: Option<Vec<LogRecord>> = None;
        let mut last_flush = Instant::now();

        loop {
            let have_retry = retry.is_some();
            let (batch, target, shutting_down) = {
                let mut state = shared
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                loop {
                    let interval_due = last_flush.elapsed() >= shared.settings.flush_interval
                        && (!state.queue.is_empty() || have_retry);
                    let due = state.queue.len() >= shared.settings.flush_threshold
                        || state.flush_requested > state.flush_completed
                        || state.shutdown
                        || interval_due;
                    if due {
                        break;
                    }
                    let (next, _timeout) = shared
                        .wakeup
                        .wait_timeout(state, shared.settings.flush_interval)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = next;
                }
                let batch: Vec<LogRecord> = state.queue.drain(..).collect();
                (batch, state.flush_requested, state.shutdown)
            };

            let mut pending = retry.take().unwrap_or_default();
            let retried = !pending.is_empty();
            pending.extend(batch);

            if !pending.is_empty() {
                match shared.store.append_logs(&mut pending) {
                    Ok(()) => {
                        for record in &pending {
                            shared.bus.publish(CoreEvent::NewLog(record.clone()));
                        }
                    }
                    Err(err) => {
                        error!("log flush failed ({} records): {err}", pending.len());
                        if retried {
                            warn!(
                                "dropping {} records after repeated flush failure",
                                pending.len()
                            );
                            shared
                                .dropped
                                .fetch_add(pending.len() as u64, Ordering::Relaxed);
                        } else {
                            retry = Some(pending);
                        }
                    }
                }
            }
            last_flush = Instant::now();

            {
                let mut state = shared
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                state.flush_completed = state.flush_completed.max(target);
                shared.wakeup.notify_all();
            }

            if shutting_down {
                if let Some(lost) = retry.take() {
                    shared
                        .dropped
                        .fetch_add(lost.len() as u64, Ordering::Relaxed);
                }
                break;
            }
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}
