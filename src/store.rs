//! Embedded relational store backing all supervisor state.
//!
//! The store owns the single database handle; every component persists
//! through the typed operations here. Hot paths run through cached prepared
//! statements and multi-step writes run inside one transaction. Write errors
//! surface verbatim to the caller; there is no hidden retry loop.
use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, named_params, types::Type};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum_macros::{AsRefStr, EnumString};
use tracing::{debug, info};

use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processes (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    command TEXT NOT NULL,
    args TEXT,
    env TEXT,
    cwd TEXT,
    pid INTEGER,
    status TEXT CHECK(status IN ('starting','running','stopped','failed','crashed')),
    group_id TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    stopped_at INTEGER,
    restart_count INTEGER DEFAULT 0,
    auto_restart BOOLEAN DEFAULT FALSE,
    health_check_command TEXT,
    health_check_interval INTEGER,
    last_health_check INTEGER,
    health_status TEXT CHECK(health_status IN ('healthy','unhealthy','unknown'))
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id TEXT REFERENCES processes(id) ON DELETE CASCADE,
    type TEXT CHECK(type IN ('stdout','stderr','system')),
    message TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    level TEXT CHECK(level IN ('debug','info','warn','error'))
);

CREATE TABLE IF NOT EXISTS errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id TEXT REFERENCES processes(id) ON DELETE CASCADE,
    error_type TEXT,
    message TEXT,
    stack_trace TEXT,
    timestamp INTEGER,
    resolved BOOLEAN DEFAULT FALSE,
    resolution_note TEXT
);

CREATE TABLE IF NOT EXISTS process_groups (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    created_at INTEGER NOT NULL,
    startup_order TEXT
);

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id TEXT REFERENCES processes(id) ON DELETE CASCADE,
    cpu_usage REAL,
    memory_usage INTEGER,
    timestamp INTEGER
);

CREATE INDEX IF NOT EXISTS idx_logs_process_time ON logs(process_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_errors_process_time ON errors(process_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_metrics_process_time ON metrics(process_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_processes_group ON processes(group_id);
CREATE INDEX IF NOT EXISTS idx_processes_status ON processes(status);
"#;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Default page size for log queries.
pub const LOG_QUERY_DEFAULT_LIMIT: usize = 100;
/// Upper bound on a single log query.
pub const LOG_QUERY_MAX_LIMIT: usize = 10_000;
/// Upper bound on a substring search.
pub const LOG_SEARCH_MAX_LIMIT: usize = 1000;
/// Upper bound on a metrics window query.
pub const METRIC_QUERY_MAX_LIMIT: usize = 1000;

/// Lifecycle state of a managed process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Row persisted, child not spawned yet.
    Starting,
    /// Child alive with a recorded pid.
    Running,
    /// Exited cleanly or by signal, or stopped on request.
    Stopped,
    /// The spawn itself failed.
    Failed,
    /// Exited with a non-zero code.
    Crashed,
}

impl ProcessStatus {
    /// Whether the state counts against the process capacity.
    pub fn is_active(self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }
}

/// Probe-reported health of a managed process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Last probe succeeded.
    Healthy,
    /// Last probe failed, timed out, or overflowed its output cap.
    Unhealthy,
    /// Never probed, or the probe target could not be found.
    #[default]
    Unknown,
}

/// Origin stream of a log record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Captured from the child's stdout.
    Stdout,
    /// Captured from the child's stderr.
    Stderr,
    /// Emitted by the supervisor itself (start/exit markers).
    System,
}

/// Severity of a log record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic chatter.
    Debug,
    /// Normal output.
    Info,
    /// Something worth attention.
    Warn,
    /// Failure output.
    Error,
}

/// A persisted process row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Opaque short identifier, unique forever.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Absolute command path.
    pub command: String,
    /// Ordered argument list.
    pub args: Vec<String>,
    /// Environment overlay applied over the parent environment.
    pub env: HashMap<String, String>,
    /// Working directory; `None` means the supervisor's own cwd.
    pub cwd: Option<String>,
    /// OS pid, present iff status is running.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub status: ProcessStatus,
    /// Owning group, if any.
    pub group_id: Option<String>,
    /// Creation timestamp, epoch ms.
    pub created_at: i64,
    /// Last successful spawn timestamp, epoch ms.
    pub started_at: Option<i64>,
    /// Last exit timestamp, epoch ms.
    pub stopped_at: Option<i64>,
    /// Number of restarts performed over the row's lifetime.
    pub restart_count: u32,
    /// Whether an unhealthy probe may trigger a restart.
    pub auto_restart: bool,
    /// External probe command, when configured.
    pub health_check_command: Option<String>,
    /// Probe interval in milliseconds.
    pub health_check_interval: Option<u64>,
    /// Timestamp of the last completed probe, epoch ms.
    pub last_health_check: Option<i64>,
    /// Probe-reported health.
    pub health_status: HealthStatus,
}

/// A persisted log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Row id; zero until persisted.
    pub id: i64,
    /// Owning process.
    pub process_id: String,
    /// Origin stream.
    pub stream: LogStream,
    /// Trimmed, non-empty message.
    pub message: String,
    /// Epoch ms.
    pub timestamp: i64,
    /// Severity.
    pub level: LogLevel,
}

/// A persisted error record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Row id; zero until persisted.
    pub id: i64,
    /// Owning process.
    pub process_id: String,
    /// Kind assigned by the classifier.
    pub kind: String,
    /// Raw error message.
    pub message: String,
    /// Captured stack trace, if any.
    pub stack_trace: Option<String>,
    /// Epoch ms.
    pub timestamp: i64,
    /// Whether the error has been marked resolved.
    pub resolved: bool,
    /// Free-form note recorded at resolution time.
    pub resolution_note: Option<String>,
}

/// A persisted metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Row id; zero until persisted.
    pub id: i64,
    /// Owning process.
    pub process_id: String,
    /// CPU usage percent (0..100 per core).
    pub cpu_percent: f64,
    /// Resident memory in bytes.
    pub memory_bytes: i64,
    /// Epoch ms.
    pub timestamp: i64,
}

/// A persisted group row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Opaque short identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Creation timestamp, epoch ms.
    pub created_at: i64,
    /// Ordered member ids; may contain ids of deleted processes.
    pub startup_order: Vec<String>,
}

/// Filter for process listings.
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    /// Restrict to one lifecycle state.
    pub status: Option<ProcessStatus>,
    /// Restrict to members of one group.
    pub group_id: Option<String>,
}

/// Filter for log queries.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Restrict to one process.
    pub process_id: Option<String>,
    /// Restrict to one stream.
    pub stream: Option<LogStream>,
    /// Restrict to one severity.
    pub level: Option<LogLevel>,
    /// Inclusive lower timestamp bound, epoch ms.
    pub start_time: Option<i64>,
    /// Inclusive upper timestamp bound, epoch ms.
    pub end_time: Option<i64>,
    /// Case-insensitive substring match on the message.
    pub search: Option<String>,
    /// Page size; defaults to 100, capped at 10000.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: Option<usize>,
}

/// Filter for error queries.
#[derive(Debug, Clone, Default)]
pub struct ErrorFilter {
    /// Restrict to one process.
    pub process_id: Option<String>,
    /// Restrict to one classifier kind.
    pub kind: Option<String>,
    /// Restrict by resolution state.
    pub resolved: Option<bool>,
    /// Inclusive lower timestamp bound, epoch ms.
    pub since: Option<i64>,
    /// Page size.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: Option<usize>,
}

/// Aggregate counts returned by [`Store::log_stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogStats {
    /// Total persisted records for the process.
    pub total: i64,
    /// Record counts keyed by stream.
    pub by_stream: HashMap<String, i64>,
    /// Record counts keyed by level.
    pub by_level: HashMap<String, i64>,
    /// Oldest record timestamp, epoch ms.
    pub oldest: Option<i64>,
    /// Newest record timestamp, epoch ms.
    pub newest: Option<i64>,
    /// Approximate size of stored messages in bytes.
    pub approximate_bytes: i64,
}

/// Aggregate returned by [`Store::aggregate_metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricAggregate {
    /// Mean CPU percent across the window.
    pub avg_cpu: f64,
    /// Peak CPU percent across the window.
    pub max_cpu: f64,
    /// Mean resident memory in bytes.
    pub avg_memory: f64,
    /// Peak resident memory in bytes.
    pub max_memory: i64,
    /// Number of samples aggregated.
    pub sample_count: i64,
}

/// Row counts removed by [`Store::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Deleted log rows.
    pub logs: usize,
    /// Deleted metric rows.
    pub metrics: usize,
    /// Deleted resolved error rows.
    pub errors: usize,
}

/// Returns the current wall clock as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates an opaque 16-hex-char identifier seeded with `seed`.
pub fn short_id(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_be_bytes(),
    );
    hasher.update(ID_COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes());
    let digest = hasher.finalize();
    format!(
        "{:016x}",
        u64::from_be_bytes(digest[0..8].try_into().expect("digest is 32 bytes"))
    )
}

fn parse_enum<T: std::str::FromStr>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
    })
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<T> {
    match raw {
        None => Ok(T::default()),
        Some(text) => serde_json::from_str(&text).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
        }),
    }
}

/// Durable store for processes, logs, errors, metrics, and groups.
///
/// The handle is cheap to share behind an `Arc`; all access serializes on an
/// internal mutex. After [`Store::close`] every operation fails with
/// [`StoreError::Closed`].
pub struct Store {
    conn: Mutex<Option<Connection>>,
}

impl Store {
    /// Opens (creating if necessary) the database at `path` and initializes
    /// the schema idempotently.
    pub fn open(path: impl AsRef<Path>) -> Result<Store, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            PRAGMA journal_size_limit=67108864;
            PRAGMA foreign_keys=ON;
            "#,
        )?;
        conn.execute_batch(SCHEMA)?;
        Self::migrate(&conn)?;

        info!("store opened at {:?}", path);
        Ok(Store {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Additive migrations for databases created before a column existed.
    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        let has_note: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('errors') WHERE name='resolution_note'",
            [],
            |row| row.get(0),
        )?;
        if !has_note {
            conn.execute("ALTER TABLE errors ADD COLUMN resolution_note TEXT", [])?;
        }
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    /// Runs `f` atomically. A call made while a transaction is already open
    /// on the handle is flattened into the outer transaction.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.with_conn(|conn| {
            if !conn.is_autocommit() {
                return f(conn);
            }
            let tx = conn.unchecked_transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Runs the storage-engine optimize hook and releases the handle.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(conn) => {
                conn.execute_batch("PRAGMA optimize;")?;
                drop(conn);
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }

    /// Deletes logs and metrics older than the cutoff, and resolved errors
    /// older than the cutoff, in one transaction. Process and group rows are
    /// never touched.
    pub fn cleanup(&self, retention_days: u32) -> Result<CleanupStats, StoreError> {
        let cutoff = now_ms() - retention_days as i64 * MS_PER_DAY;
        self.transaction(|conn| {
            let logs = conn.execute(
                "DELETE FROM logs WHERE timestamp < :cutoff",
                named_params! { ":cutoff": cutoff },
            )?;
            let metrics = conn.execute(
                "DELETE FROM metrics WHERE timestamp < :cutoff",
                named_params! { ":cutoff": cutoff },
            )?;
            let errors = conn.execute(
                "DELETE FROM errors WHERE timestamp < :cutoff AND resolved = TRUE",
                named_params! { ":cutoff": cutoff },
            )?;
            debug!("retention sweep removed {logs} logs, {metrics} metrics, {errors} errors");
            Ok(CleanupStats {
                logs,
                metrics,
                errors,
            })
        })
    }

    // ------------------------------------------------------------------
    // processes
    // ------------------------------------------------------------------

    /// Inserts or refreshes a process row. `created_at` is preserved for an
    /// existing row.
    pub fn upsert_process(&self, rec: &ProcessRecord) -> Result<(), StoreError> {
        let args = serde_json::to_string(&rec.args)?;
        let env = serde_json::to_string(&rec.env)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT INTO processes (
                    id, name, command, args, env, cwd, pid, status, group_id,
                    created_at, started_at, stopped_at, restart_count,
                    auto_restart, health_check_command, health_check_interval,
                    last_health_check, health_status
                ) VALUES (
                    :id, :name, :command, :args, :env, :cwd, :pid, :status,
                    :group_id, :created_at, :started_at, :stopped_at,
                    :restart_count, :auto_restart, :health_check_command,
                    :health_check_interval, :last_health_check, :health_status
                )
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    command = excluded.command,
                    args = excluded.args,
                    env = excluded.env,
                    cwd = excluded.cwd,
                    pid = excluded.pid,
                    status = excluded.status,
                    group_id = excluded.group_id,
                    started_at = excluded.started_at,
                    stopped_at = excluded.stopped_at,
                    restart_count = excluded.restart_count,
                    auto_restart = excluded.auto_restart,
                    health_check_command = excluded.health_check_command,
                    health_check_interval = excluded.health_check_interval,
                    last_health_check = excluded.last_health_check,
                    health_status = excluded.health_status
                "#,
            )?;
            stmt.execute(named_params! {
                ":id": rec.id,
                ":name": rec.name,
                ":command": rec.command,
                ":args": args,
                ":env": env,
                ":cwd": rec.cwd,
                ":pid": rec.pid,
                ":status": rec.status.as_ref(),
                ":group_id": rec.group_id,
                ":created_at": rec.created_at,
                ":started_at": rec.started_at,
                ":stopped_at": rec.stopped_at,
                ":restart_count": rec.restart_count,
                ":auto_restart": rec.auto_restart,
                ":health_check_command": rec.health_check_command,
                ":health_check_interval": rec.health_check_interval.map(|v| v as i64),
                ":last_health_check": rec.last_health_check,
                ":health_status": rec.health_status.as_ref(),
            })?;
            Ok(())
        })
    }

    fn row_to_process(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessRecord> {
        Ok(ProcessRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            command: row.get(2)?,
            args: parse_json(3, row.get(3)?)?,
            env: parse_json(4, row.get(4)?)?,
            cwd: row.get(5)?,
            pid: row.get(6)?,
            status: parse_enum(7, row.get::<_, String>(7)?)?,
            group_id: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            stopped_at: row.get(11)?,
            restart_count: row.get(12)?,
            auto_restart: row.get(13)?,
            health_check_command: row.get(14)?,
            health_check_interval: row
                .get::<_, Option<i64>>(15)?
                .map(|v| v as u64),
            last_health_check: row.get(16)?,
            health_status: parse_enum(17, row.get::<_, String>(17)?)?,
        })
    }

    const PROCESS_COLUMNS: &'static str = "id, name, command, args, env, cwd, pid, \
         status, group_id, created_at, started_at, stopped_at, restart_count, \
         auto_restart, health_check_command, health_check_interval, \
         last_health_check, health_status";

    /// Fetches one process row.
    pub fn get_process(&self, id: &str) -> Result<Option<ProcessRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql =
                format!("SELECT {} FROM processes WHERE id = :id", Self::PROCESS_COLUMNS);
            let mut stmt = conn.prepare_cached(&sql)?;
            let rec = stmt
                .query_row(named_params! { ":id": id }, Self::row_to_process)
                .optional()?;
            Ok(rec)
        })
    }

    /// Lists process rows, optionally filtered by status and group.
    pub fn list_processes(
        &self,
        filter: &ProcessFilter,
    ) -> Result<Vec<ProcessRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut sql = format!(
                "SELECT {} FROM processes WHERE 1=1",
                Self::PROCESS_COLUMNS
            );
            let status = filter.status.map(|s| s.as_ref().to_string());
            let mut params: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
            if let Some(ref status) = status {
                sql.push_str(" AND status = :status");
                params.push((":status", status));
            }
            if let Some(ref group) = filter.group_id {
                sql.push_str(" AND group_id = :group_id");
                params.push((":group_id", group));
            }
            sql.push_str(" ORDER BY created_at ASC");

            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params.as_slice(), Self::row_to_process)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Counts rows in the starting or running states.
    pub fn count_active(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT COUNT(*) FROM processes WHERE status IN ('starting','running')",
            )?;
            let count: i64 = stmt.query_row([], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Records a successful spawn: status running, pid and started_at set.
    pub fn mark_running(
        &self,
        id: &str,
        pid: u32,
        started_at: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE processes SET status = 'running', pid = :pid, \
                 started_at = :started_at WHERE id = :id",
            )?;
            stmt.execute(named_params! { ":pid": pid, ":started_at": started_at, ":id": id })?;
            Ok(())
        })
    }

    /// Records an exit: pid cleared, stopped_at stamped, status per the exit
    /// classification.
    pub fn mark_exited(
        &self,
        id: &str,
        status: ProcessStatus,
        stopped_at: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE processes SET status = :status, pid = NULL, \
                 stopped_at = :stopped_at WHERE id = :id",
            )?;
            stmt.execute(named_params! {
                ":status": status.as_ref(),
                ":stopped_at": stopped_at,
                ":id": id,
            })?;
            Ok(())
        })
    }

    /// Records a spawn failure: status failed, pid and started_at cleared.
    pub fn mark_failed(&self, id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE processes SET status = 'failed', pid = NULL, \
                 started_at = NULL WHERE id = :id",
            )?;
            stmt.execute(named_params! { ":id": id })?;
            Ok(())
        })
    }

    /// Persists a restart counter value.
    pub fn set_restart_count(&self, id: &str, count: u32) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE processes SET restart_count = :count WHERE id = :id",
            )?;
            stmt.execute(named_params! { ":count": count, ":id": id })?;
            Ok(())
        })
    }

    /// Persists a probe outcome.
    pub fn update_health(
        &self,
        id: &str,
        health: HealthStatus,
        checked_at: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE processes SET health_status = :health, \
                 last_health_check = :checked_at WHERE id = :id",
            )?;
            stmt.execute(named_params! {
                ":health": health.as_ref(),
                ":checked_at": checked_at,
                ":id": id,
            })?;
            Ok(())
        })
    }

    /// Sets or clears a process's group membership.
    pub fn set_process_group(
        &self,
        id: &str,
        group_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE processes SET group_id = :group_id WHERE id = :id",
            )?;
            let changed =
                stmt.execute(named_params! { ":group_id": group_id, ":id": id })?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "process",
                    id: id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Startup sweep: rows left starting/running by an unclean shutdown move
    /// to stopped with pid and started_at cleared. Returns the repair count.
    pub fn reconcile_startup(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let repaired = conn.execute(
                "UPDATE processes SET status = 'stopped', pid = NULL, \
                 started_at = NULL WHERE status IN ('starting','running')",
                [],
            )?;
            Ok(repaired)
        })
    }

    // ------------------------------------------------------------------
    // logs
    // ------------------------------------------------------------------

    /// Appends a batch of log records in one transaction, assigning row ids
    /// in place.
    pub fn append_logs(&self, batch: &mut [LogRecord]) -> Result<(), StoreError> {
        self.transaction(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO logs (process_id, type, message, timestamp, level) \
                 VALUES (:process_id, :type, :message, :timestamp, :level)",
            )?;
            for rec in batch.iter_mut() {
                stmt.execute(named_params! {
                    ":process_id": rec.process_id,
                    ":type": rec.stream.as_ref(),
                    ":message": rec.message,
                    ":timestamp": rec.timestamp,
                    ":level": rec.level.as_ref(),
                })?;
                rec.id = conn.last_insert_rowid();
            }
            Ok(())
        })
    }

    fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRecord> {
        Ok(LogRecord {
            id: row.get(0)?,
            process_id: row.get(1)?,
            stream: parse_enum(2, row.get::<_, String>(2)?)?,
            message: row.get(3)?,
            timestamp: row.get(4)?,
            level: parse_enum(5, row.get::<_, String>(5)?)?,
        })
    }

    /// Filtered log query, newest first.
    pub fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, process_id, type, message, timestamp, level \
                 FROM logs WHERE 1=1",
            );
            let stream = filter.stream.map(|s| s.as_ref().to_string());
            let level = filter.level.map(|l| l.as_ref().to_string());
            let pattern = filter.search.as_ref().map(|s| format!("%{s}%"));
            let limit = filter
                .limit
                .unwrap_or(LOG_QUERY_DEFAULT_LIMIT)
                .min(LOG_QUERY_MAX_LIMIT) as i64;
            let offset = filter.offset.unwrap_or(0) as i64;

            let mut params: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
            if let Some(ref pid) = filter.process_id {
                sql.push_str(" AND process_id = :process_id");
                params.push((":process_id", pid));
            }
            if let Some(ref stream) = stream {
                sql.push_str(" AND type = :type");
                params.push((":type", stream));
            }
            if let Some(ref level) = level {
                sql.push_str(" AND level = :level");
                params.push((":level", level));
            }
            if let Some(ref start) = filter.start_time {
                sql.push_str(" AND timestamp >= :start");
                params.push((":start", start));
            }
            if let Some(ref end) = filter.end_time {
                sql.push_str(" AND timestamp <= :end");
                params.push((":end", end));
            }
            if let Some(ref pattern) = pattern {
                sql.push_str(" AND message LIKE :pattern");
                params.push((":pattern", pattern));
            }
            sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT :limit OFFSET :offset");
            params.push((":limit", &limit));
            params.push((":offset", &offset));

            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params.as_slice(), Self::row_to_log)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Returns the last `lines` records in ascending timestamp order.
    pub fn tail_logs(
        &self,
        process_id: Option<&str>,
        lines: usize,
    ) -> Result<Vec<LogRecord>, StoreError> {
        self.with_conn(|conn| {
            let lines = lines.min(LOG_QUERY_MAX_LIMIT) as i64;
            let mut rows = if let Some(pid) = process_id {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, process_id, type, message, timestamp, level \
                     FROM logs WHERE process_id = :process_id \
                     ORDER BY timestamp DESC, id DESC LIMIT :limit",
                )?;
                let rows = stmt.query_map(
                    named_params! { ":process_id": pid, ":limit": lines },
                    Self::row_to_log,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            } else {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, process_id, type, message, timestamp, level \
                     FROM logs ORDER BY timestamp DESC, id DESC LIMIT :limit",
                )?;
                let rows =
                    stmt.query_map(named_params! { ":limit": lines }, Self::row_to_log)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            rows.reverse();
            Ok(rows)
        })
    }

    /// Substring search over messages, newest first.
    pub fn search_logs(
        &self,
        query: &str,
        case_sensitive: bool,
        limit: usize,
    ) -> Result<Vec<LogRecord>, StoreError> {
        self.with_conn(|conn| {
            let limit = limit.min(LOG_SEARCH_MAX_LIMIT) as i64;
            if case_sensitive {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, process_id, type, message, timestamp, level \
                     FROM logs WHERE instr(message, :query) > 0 \
                     ORDER BY timestamp DESC, id DESC LIMIT :limit",
                )?;
                let rows = stmt.query_map(
                    named_params! { ":query": query, ":limit": limit },
                    Self::row_to_log,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            } else {
                let pattern = format!("%{query}%");
                let mut stmt = conn.prepare_cached(
                    "SELECT id, process_id, type, message, timestamp, level \
                     FROM logs WHERE message LIKE :pattern \
                     ORDER BY timestamp DESC, id DESC LIMIT :limit",
                )?;
                let rows = stmt.query_map(
                    named_params! { ":pattern": pattern, ":limit": limit },
                    Self::row_to_log,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            }
        })
    }

    /// Deletes a process's log rows, optionally only those before a cutoff.
    /// Returns the deleted count.
    pub fn delete_logs(
        &self,
        process_id: &str,
        before: Option<i64>,
    ) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let deleted = match before {
                Some(cutoff) => {
                    let mut stmt = conn.prepare_cached(
                        "DELETE FROM logs WHERE process_id = :process_id \
                         AND timestamp < :cutoff",
                    )?;
                    stmt.execute(
                        named_params! { ":process_id": process_id, ":cutoff": cutoff },
                    )?
                }
                None => {
                    let mut stmt = conn
                        .prepare_cached("DELETE FROM logs WHERE process_id = :process_id")?;
                    stmt.execute(named_params! { ":process_id": process_id })?
                }
            };
            Ok(deleted)
        })
    }

    /// Aggregate statistics for a process's logs.
    pub fn log_stats(&self, process_id: &str) -> Result<LogStats, StoreError> {
        self.with_conn(|conn| {
            let mut stats = LogStats::default();

            let mut stmt = conn.prepare_cached(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp), \
                 COALESCE(SUM(LENGTH(message)), 0) \
                 FROM logs WHERE process_id = :process_id",
            )?;
            stmt.query_row(named_params! { ":process_id": process_id }, |row| {
                stats.total = row.get(0)?;
                stats.oldest = row.get(1)?;
                stats.newest = row.get(2)?;
                stats.approximate_bytes = row.get(3)?;
                Ok(())
            })?;

            let mut stmt = conn.prepare_cached(
                "SELECT type, COUNT(*) FROM logs WHERE process_id = :process_id \
                 GROUP BY type",
            )?;
            let rows = stmt.query_map(named_params! { ":process_id": process_id }, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (stream, count) = row?;
                stats.by_stream.insert(stream, count);
            }

            let mut stmt = conn.prepare_cached(
                "SELECT level, COUNT(*) FROM logs WHERE process_id = :process_id \
                 GROUP BY level",
            )?;
            let rows = stmt.query_map(named_params! { ":process_id": process_id }, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (level, count) = row?;
                stats.by_level.insert(level, count);
            }

            Ok(stats)
        })
    }

    // ------------------------------------------------------------------
    // errors
    // ------------------------------------------------------------------

    /// Appends an error record, assigning its row id in place.
    pub fn append_error(&self, rec: &mut ErrorRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO errors (process_id, error_type, message, stack_trace, \
                 timestamp, resolved, resolution_note) \
                 VALUES (:process_id, :error_type, :message, :stack_trace, \
                 :timestamp, :resolved, :resolution_note)",
            )?;
            stmt.execute(named_params! {
                ":process_id": rec.process_id,
                ":error_type": rec.kind,
                ":message": rec.message,
                ":stack_trace": rec.stack_trace,
                ":timestamp": rec.timestamp,
                ":resolved": rec.resolved,
                ":resolution_note": rec.resolution_note,
            })?;
            rec.id = conn.last_insert_rowid();
            Ok(())
        })
    }

    fn row_to_error(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErrorRecord> {
        Ok(ErrorRecord {
            id: row.get(0)?,
            process_id: row.get(1)?,
            kind: row.get(2)?,
            message: row.get(3)?,
            stack_trace: row.get(4)?,
            timestamp: row.get(5)?,
            resolved: row.get(6)?,
            resolution_note: row.get(7)?,
        })
    }

    const ERROR_COLUMNS: &'static str =
        "id, process_id, error_type, message, stack_trace, timestamp, resolved, \
         resolution_note";

    /// Fetches one error row.
    pub fn get_error(&self, id: i64) -> Result<Option<ErrorRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM errors WHERE id = :id", Self::ERROR_COLUMNS);
            let mut stmt = conn.prepare_cached(&sql)?;
            let rec = stmt
                .query_row(named_params! { ":id": id }, Self::row_to_error)
                .optional()?;
            Ok(rec)
        })
    }

    /// Filtered error query, newest first.
    pub fn query_errors(
        &self,
        filter: &ErrorFilter,
    ) -> Result<Vec<ErrorRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut sql =
                format!("SELECT {} FROM errors WHERE 1=1", Self::ERROR_COLUMNS);
            let limit = filter.limit.unwrap_or(LOG_QUERY_DEFAULT_LIMIT) as i64;
            let offset = filter.offset.unwrap_or(0) as i64;

            let mut params: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
            if let Some(ref pid) = filter.process_id {
                sql.push_str(" AND process_id = :process_id");
                params.push((":process_id", pid));
            }
            if let Some(ref kind) = filter.kind {
                sql.push_str(" AND error_type = :error_type");
                params.push((":error_type", kind));
            }
            if let Some(ref resolved) = filter.resolved {
                sql.push_str(" AND resolved = :resolved");
                params.push((":resolved", resolved));
            }
            if let Some(ref since) = filter.since {
                sql.push_str(" AND timestamp >= :since");
                params.push((":since", since));
            }
            sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT :limit OFFSET :offset");
            params.push((":limit", &limit));
            params.push((":offset", &offset));

            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params.as_slice(), Self::row_to_error)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Marks an error resolved. Returns whether the row was previously
    /// unresolved; a missing id is an error.
    pub fn resolve_error(
        &self,
        id: i64,
        note: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.transaction(|conn| {
            let resolved: Option<bool> = conn
                .prepare_cached("SELECT resolved FROM errors WHERE id = :id")?
                .query_row(named_params! { ":id": id }, |row| row.get(0))
                .optional()?;
            let Some(resolved) = resolved else {
                return Err(StoreError::NotFound {
                    entity: "error",
                    id: id.to_string(),
                });
            };
            if resolved {
                return Ok(false);
            }
            let mut stmt = conn.prepare_cached(
                "UPDATE errors SET resolved = TRUE, resolution_note = :note \
                 WHERE id = :id",
            )?;
            stmt.execute(named_params! { ":note": note, ":id": id })?;
            Ok(true)
        })
    }

    /// Errors sharing kind and process with the anchor, ordered by timestamp
    /// distance from it.
    pub fn similar_errors(
        &self,
        anchor: &ErrorRecord,
        limit: usize,
    ) -> Result<Vec<ErrorRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM errors WHERE error_type = :error_type \
                 AND process_id = :process_id AND id != :id \
                 ORDER BY ABS(timestamp - :anchor_ts) ASC LIMIT :limit",
                Self::ERROR_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(
                named_params! {
                    ":error_type": anchor.kind,
                    ":process_id": anchor.process_id,
                    ":id": anchor.id,
                    ":anchor_ts": anchor.timestamp,
                    ":limit": limit as i64,
                },
                Self::row_to_error,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ------------------------------------------------------------------
    // metrics
    // ------------------------------------------------------------------

    /// Appends one metric sample.
    pub fn append_metric(
        &self,
        process_id: &str,
        cpu_percent: f64,
        memory_bytes: i64,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO metrics (process_id, cpu_usage, memory_usage, timestamp) \
                 VALUES (:process_id, :cpu_usage, :memory_usage, :timestamp)",
            )?;
            stmt.execute(named_params! {
                ":process_id": process_id,
                ":cpu_usage": cpu_percent,
                ":memory_usage": memory_bytes,
                ":timestamp": timestamp,
            })?;
            Ok(())
        })
    }

    /// Samples for one process since a cutoff, newest first, capped at 1000.
    pub fn query_metrics(
        &self,
        process_id: &str,
        since: Option<i64>,
        limit: usize,
    ) -> Result<Vec<MetricSample>, StoreError> {
        self.with_conn(|conn| {
            let limit = limit.min(METRIC_QUERY_MAX_LIMIT) as i64;
            let since = since.unwrap_or(0);
            let mut stmt = conn.prepare_cached(
                "SELECT id, process_id, cpu_usage, memory_usage, timestamp \
                 FROM metrics WHERE process_id = :process_id AND timestamp >= :since \
                 ORDER BY timestamp DESC, id DESC LIMIT :limit",
            )?;
            let rows = stmt.query_map(
                named_params! { ":process_id": process_id, ":since": since, ":limit": limit },
                |row| {
                    Ok(MetricSample {
                        id: row.get(0)?,
                        process_id: row.get(1)?,
                        cpu_percent: row.get(2)?,
                        memory_bytes: row.get(3)?,
                        timestamp: row.get(4)?,
                    })
                },
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Aggregate CPU/memory over a window; `None` when no samples exist.
    pub fn aggregate_metrics(
        &self,
        process_id: &str,
        since: i64,
    ) -> Result<Option<MetricAggregate>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT AVG(cpu_usage), MAX(cpu_usage), AVG(memory_usage), \
                 MAX(memory_usage), COUNT(*) \
                 FROM metrics WHERE process_id = :process_id AND timestamp >= :since",
            )?;
            let agg = stmt.query_row(
                named_params! { ":process_id": process_id, ":since": since },
                |row| {
                    let count: i64 = row.get(4)?;
                    if count == 0 {
                        return Ok(None);
                    }
                    Ok(Some(MetricAggregate {
                        avg_cpu: row.get(0)?,
                        max_cpu: row.get(1)?,
                        avg_memory: row.get(2)?,
                        max_memory: row.get(3)?,
                        sample_count: count,
                    }))
                },
            )?;
            Ok(agg)
        })
    }

    // ------------------------------------------------------------------
    // groups
    // ------------------------------------------------------------------

    /// Inserts a group row.
    pub fn insert_group(&self, rec: &GroupRecord) -> Result<(), StoreError> {
        let order = serde_json::to_string(&rec.startup_order)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO process_groups (id, name, description, created_at, \
                 startup_order) VALUES (:id, :name, :description, :created_at, :order)",
            )?;
            stmt.execute(named_params! {
                ":id": rec.id,
                ":name": rec.name,
                ":description": rec.description,
                ":created_at": rec.created_at,
                ":order": order,
            })?;
            Ok(())
        })
    }

    fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupRecord> {
        Ok(GroupRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            created_at: row.get(3)?,
            startup_order: parse_json(4, row.get(4)?)?,
        })
    }

    /// Fetches one group row.
    pub fn get_group(&self, id: &str) -> Result<Option<GroupRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, description, created_at, startup_order \
                 FROM process_groups WHERE id = :id",
            )?;
            let rec = stmt
                .query_row(named_params! { ":id": id }, Self::row_to_group)
                .optional()?;
            Ok(rec)
        })
    }

    /// Lists all group rows.
    pub fn list_groups(&self) -> Result<Vec<GroupRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, description, created_at, startup_order \
                 FROM process_groups ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], Self::row_to_group)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Replaces a group's startup order.
    pub fn update_group_order(
        &self,
        id: &str,
        order: &[String],
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(order)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE process_groups SET startup_order = :order WHERE id = :id",
            )?;
            let changed = stmt.execute(named_params! { ":order": encoded, ":id": id })?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "group",
                    id: id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Deletes a group row. Emptiness is the orchestrator's responsibility.
    pub fn delete_group(&self, id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("DELETE FROM process_groups WHERE id = :id")?;
            let changed = stmt.execute(named_params! { ":id": id })?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "group",
                    id: id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Counts processes referencing a group.
    pub fn group_member_count(&self, id: &str) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT COUNT(*) FROM processes WHERE group_id = :id",
            )?;
            let count: i64 = stmt.query_row(named_params! { ":id": id }, |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}
