//! Configuration management for procman.
//!
//! Configuration is read from the process environment (`PM_*` variables) with
//! validated defaults. The allowlist check resolves symlinks before comparing
//! paths, so a command may only be approved through its canonical location.
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use strum_macros::{AsRefStr, EnumString};
use tracing::debug;

use crate::error::ConfigError;

const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;
const DEFAULT_MAX_PROCESSES: usize = 50;
const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_LOG_SIZE_MB: u64 = 100;
const DEFAULT_MAX_CPU_PERCENT: u8 = 80;
const DEFAULT_MAX_MEMORY_MB: u64 = 1024;

/// Minimum accepted health check interval in milliseconds.
pub const MIN_HEALTH_CHECK_INTERVAL_MS: u64 = 1000;

/// Verbosity threshold recognized by the `PM_LOG_LEVEL` variable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, AsRefStr, EnumString, Default,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevelSetting {
    /// Everything, including debug chatter.
    Debug,
    /// Informational messages and above.
    #[default]
    Info,
    /// Warnings and errors only.
    Warn,
    /// Errors only.
    Error,
}

/// Typed runtime configuration for the supervisor core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the embedded database file.
    pub database_path: PathBuf,
    /// Days of log/metric/resolved-error history kept by `cleanup`.
    pub log_retention_days: u32,
    /// Maximum number of concurrently managed processes.
    pub max_processes: usize,
    /// Default probe interval applied when a registration omits one.
    pub health_check_interval_default: u64,
    /// Whether unhealthy processes may be restarted automatically.
    pub auto_restart_enabled: bool,
    /// Default verbosity exposed to the embedding host.
    pub log_level: LogLevelSetting,
    /// Ordered absolute path roots commands must resolve under. Empty means
    /// allow-all.
    pub allowed_commands: Vec<PathBuf>,
    /// Upper bound on log storage, in mebibytes.
    pub max_log_size_mb: u64,
    /// CPU threshold above which a sampled process is flagged.
    pub max_cpu_percent: u8,
    /// Memory threshold above which a sampled process is flagged.
    pub max_memory_mb: u64,
    /// Destination for the out-of-core audit sink; `None` when disabled via
    /// the `OFF` literal.
    pub audit_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
            max_processes: DEFAULT_MAX_PROCESSES,
            health_check_interval_default: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            auto_restart_enabled: true,
            log_level: LogLevelSetting::Info,
            allowed_commands: Vec::new(),
            max_log_size_mb: DEFAULT_MAX_LOG_SIZE_MB,
            max_cpu_percent: DEFAULT_MAX_CPU_PERCENT,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            audit_log: None,
        }
    }
}

fn default_database_path() -> PathBuf {
    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    home.join(".local/share/procman/procman.db")
}

fn ranged_u64(
    variable: &'static str,
    min: u64,
    max: u64,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = env::var(variable).ok() else {
        return Ok(default);
    };
    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            variable,
            value: raw.clone(),
        })?;
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            variable,
            min: min as i64,
            max: max as i64,
            value: value as i64,
        });
    }
    Ok(value)
}

fn boolean(variable: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = env::var(variable).ok() else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            variable,
            value: raw,
        }),
    }
}

/// Expands the `pwd`/`$PWD` tokens and a leading `~` in an allowlist entry.
fn expand_allowlist_entry(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "pwd" || trimmed == "$PWD" {
        return env::current_dir().ok();
    }
    if let Some(rest) = trimmed.strip_prefix('~') {
        let home = env::var_os("HOME").map(PathBuf::from)?;
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        return Some(home.join(rest));
    }
    Some(PathBuf::from(trimmed))
}

impl Config {
    /// Loads configuration from the process environment, applying defaults and
    /// validating ranges.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = env::var_os("PM_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path);

        let log_retention_days =
            ranged_u64("PM_LOG_RETENTION_DAYS", 1, 365, DEFAULT_LOG_RETENTION_DAYS as u64)?
                as u32;
        let max_processes =
            ranged_u64("PM_MAX_PROCESSES", 1, 1000, DEFAULT_MAX_PROCESSES as u64)? as usize;
        let health_check_interval_default = ranged_u64(
            "PM_HEALTH_CHECK_INTERVAL_DEFAULT",
            MIN_HEALTH_CHECK_INTERVAL_MS,
            i64::MAX as u64,
            DEFAULT_HEALTH_CHECK_INTERVAL_MS,
        )?;
        let auto_restart_enabled = boolean("PM_AUTO_RESTART_ENABLED", true)?;

        let log_level = match env::var("PM_LOG_LEVEL") {
            Ok(raw) => {
                raw.trim()
                    .parse::<LogLevelSetting>()
                    .map_err(|_| ConfigError::InvalidValue {
                        variable: "PM_LOG_LEVEL",
                        value: raw,
                    })?
            }
            Err(_) => LogLevelSetting::Info,
        };

        let allowed_commands = match env::var("PM_ALLOWED_COMMANDS") {
            Ok(raw) => raw
                .split(',')
                .filter_map(expand_allowlist_entry)
                .collect(),
            Err(_) => Vec::new(),
        };

        let max_log_size_mb =
            ranged_u64("PM_MAX_LOG_SIZE_MB", 1, 10_000, DEFAULT_MAX_LOG_SIZE_MB)?;
        let max_cpu_percent =
            ranged_u64("PM_MAX_CPU_PERCENT", 1, 100, DEFAULT_MAX_CPU_PERCENT as u64)? as u8;
        let max_memory_mb =
            ranged_u64("PM_MAX_MEMORY_MB", 1, 32_000, DEFAULT_MAX_MEMORY_MB)?;

        let audit_log = match env::var("PM_AUDIT_LOG") {
            Ok(raw) if raw.trim().eq_ignore_ascii_case("off") => None,
            Ok(raw) if !raw.trim().is_empty() => Some(PathBuf::from(raw.trim())),
            _ => None,
        };

        Ok(Self {
            database_path,
            log_retention_days,
            max_processes,
            health_check_interval_default,
            auto_restart_enabled,
            log_level,
            allowed_commands,
            max_log_size_mb,
            max_cpu_percent,
            max_memory_mb,
            audit_log,
        })
    }

    /// Returns whether `command` resolves into the configured allowlist.
    ///
    /// Both the command and each root are resolved to canonical real paths so
    /// symlinks cannot escape a root. An empty allowlist admits everything; a
    /// filesystem error while resolving admits nothing.
    pub fn is_command_allowed(&self, command: impl AsRef<Path>) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }

        let real_cmd = match fs::canonicalize(command.as_ref()) {
            Ok(path) => path,
            Err(err) => {
                debug!(
                    "allowlist check failed to resolve {:?}: {err}",
                    command.as_ref()
                );
                return false;
            }
        };

        for root in &self.allowed_commands {
            let Ok(real_root) = fs::canonicalize(root) else {
                continue;
            };
            // starts_with compares whole components, so /usr/local cannot
            // match a /usr/loc root.
            if real_cmd == real_root || real_cmd.starts_with(&real_root) {
                return true;
            }
        }

        false
    }
}
