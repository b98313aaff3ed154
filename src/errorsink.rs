//! Process error categorization and incident review.
//!
//! Classification rules are kept in declaration order and applied first
//! match wins; upper-case OS codes match case-insensitively on word
//! boundaries while phrases match as case-insensitive substrings. A small
//! set of kinds is considered critical and emits a dedicated event on top
//! of the regular one.
use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

use crate::{
    error::StoreError,
    events::{CoreEvent, EventBus, EventSubscription},
    store::{ErrorFilter, ErrorRecord, Store, now_ms},
};

/// Kind assigned when no rule matches and no prefix can be extracted.
pub const UNKNOWN_KIND: &str = "UnknownError";

const CRITICAL_KINDS: &[&str] = &["OutOfMemory", "DiskSpace", "PermissionDenied"];

const DEFAULT_SUMMARY_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

struct Rule {
    kind: &'static str,
    codes: Vec<Regex>,
    phrases: &'static [&'static str],
}

impl Rule {
    fn new(kind: &'static str, codes: &[&str], phrases: &'static [&'static str]) -> Self {
        let codes = codes
            .iter()
            .map(|code| {
                Regex::new(&format!(r"(?i)\b{code}\b")).expect("static code pattern")
            })
            .collect();
        Self {
            kind,
            codes,
            phrases,
        }
    }

    fn matches(&self, message: &str, lowered: &str) -> bool {
        self.codes.iter().any(|re| re.is_match(message))
            || self.phrases.iter().any(|phrase| lowered.contains(phrase))
    }
}

/// Summary returned by [`ErrorSink::summary`].
#[derive(Debug, Clone)]
pub struct ErrorSummary {
    /// Errors inside the window.
    pub total: usize,
    /// Unresolved errors inside the window.
    pub unresolved: usize,
    /// Counts keyed by classifier kind.
    pub by_kind: HashMap<String, usize>,
    /// Counts keyed by process id.
    pub by_process: HashMap<String, usize>,
    /// The newest error inside the window.
    pub most_recent: Option<ErrorRecord>,
    /// Errors per hour over the window.
    pub rate_per_hour: f64,
}

/// One descending time bucket returned by [`ErrorSink::trends`].
#[derive(Debug, Clone)]
pub struct TrendBucket {
    /// Bucket start, epoch ms, aligned to the bucket width.
    pub bucket_start: i64,
    /// Errors in the bucket.
    pub count: usize,
    /// Per-kind counts in the bucket.
    pub by_kind: HashMap<String, usize>,
}

/// Categorizing error recorder.
pub struct ErrorSink {
    store: std::sync::Arc<Store>,
    bus: EventBus,
    rules: Vec<Rule>,
}

impl ErrorSink {
    /// Creates a sink with the built-in rule table.
    pub fn new(store: std::sync::Arc<Store>, bus: EventBus) -> Self {
        // Order matters: rules are evaluated top to bottom, first match wins.
        let rules = vec![
            Rule::new(
                "OutOfMemory",
                &["ENOMEM"],
                &["out of memory", "heap out of memory"],
            ),
            Rule::new(
                "PermissionDenied",
                &["EACCES"],
                &["permission denied", "access denied"],
            ),
            Rule::new(
                "FileNotFound",
                &["ENOENT"],
                &["no such file", "file not found"],
            ),
            Rule::new(
                "ConnectionError",
                &["ECONNREFUSED", "ETIMEDOUT"],
                &["connection refused", "connection timeout"],
            ),
            Rule::new(
                "SyntaxError",
                &[],
                &["syntaxerror", "unexpected token", "parsing error"],
            ),
            Rule::new(
                "TypeError",
                &[],
                &["typeerror", "undefined is not", "cannot read property"],
            ),
            Rule::new(
                "NetworkError",
                &["EHOSTUNREACH", "ENETUNREACH"],
                &["network unreachable"],
            ),
            Rule::new(
                "DiskSpace",
                &["ENOSPC"],
                &["no space left", "disk full"],
            ),
        ];
        Self { store, bus, rules }
    }

    /// Assigns a kind to `message` using the ordered rule table.
    pub fn classify(&self, message: &str) -> String {
        let lowered = message.to_lowercase();
        for rule in &self.rules {
            if rule.matches(message, &lowered) {
                return rule.kind.to_string();
            }
        }

        // A "Name: details" message contributes its prefix as the kind.
        if let Some((prefix, _rest)) = message.split_once(':') {
            let prefix = prefix.trim();
            if !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return prefix.to_string();
            }
        }

        UNKNOWN_KIND.to_string()
    }

    /// Whether a kind triggers the criticalError event.
    pub fn is_critical(kind: &str) -> bool {
        CRITICAL_KINDS.contains(&kind)
    }

    /// Classifies and persists an error, emitting NewError and, for critical
    /// kinds, CriticalError.
    pub fn record(
        &self,
        process_id: &str,
        message: &str,
        stack: Option<&str>,
    ) -> Result<ErrorRecord, StoreError> {
        let kind = self.classify(message);
        let mut rec = ErrorRecord {
            id: 0,
            process_id: process_id.to_string(),
            kind,
            message: message.to_string(),
            stack_trace: stack.map(str::to_string),
            timestamp: now_ms(),
            resolved: false,
            resolution_note: None,
        };
        self.store.append_error(&mut rec)?;

        if Self::is_critical(&rec.kind) {
            warn!(
                "critical error '{}' recorded for process '{}'",
                rec.kind, rec.process_id
            );
            self.bus.publish(CoreEvent::CriticalError(rec.clone()));
        }
        self.bus.publish(CoreEvent::NewError(rec.clone()));
        Ok(rec)
    }

    /// Filtered query, newest first.
    pub fn get(&self, filter: &ErrorFilter) -> Result<Vec<ErrorRecord>, StoreError> {
        self.store.query_errors(filter)
    }

    /// The most recent errors, optionally unresolved only.
    pub fn latest(
        &self,
        limit: usize,
        unresolved_only: bool,
    ) -> Result<Vec<ErrorRecord>, StoreError> {
        self.store.query_errors(&ErrorFilter {
            resolved: unresolved_only.then_some(false),
            limit: Some(limit),
            ..ErrorFilter::default()
        })
    }

    /// Marks an error resolved. The resolution event fires only on the first
    /// transition; repeating the call is a quiet no-op. A missing id fails
    /// with NotFound.
    pub fn mark_resolved(
        &self,
        id: i64,
        note: Option<&str>,
    ) -> Result<(), StoreError> {
        let transitioned = self.store.resolve_error(id, note)?;
        if transitioned {
            self.bus.publish(CoreEvent::ErrorResolved {
                id,
                note: note.map(str::to_string),
            });
        }
        Ok(())
    }

    /// Aggregate review over a window (default 24 h).
    pub fn summary(
        &self,
        process_id: Option<&str>,
        window_ms: Option<i64>,
    ) -> Result<ErrorSummary, StoreError> {
        let window = window_ms.unwrap_or(DEFAULT_SUMMARY_WINDOW_MS).max(1);
        let since = now_ms() - window;
        let rows = self.store.query_errors(&ErrorFilter {
            process_id: process_id.map(str::to_string),
            since: Some(since),
            limit: Some(10_000),
            ..ErrorFilter::default()
        })?;

        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut by_process: HashMap<String, usize> = HashMap::new();
        let mut unresolved = 0;
        for row in &rows {
            *by_kind.entry(row.kind.clone()).or_default() += 1;
            *by_process.entry(row.process_id.clone()).or_default() += 1;
            if !row.resolved {
                unresolved += 1;
            }
        }

        let hours = (window as f64 / 3_600_000.0).max(1.0);
        Ok(ErrorSummary {
            total: rows.len(),
            unresolved,
            by_kind,
            by_process,
            most_recent: rows.first().cloned(),
            rate_per_hour: rows.len() as f64 / hours,
        })
    }

    /// Descending time buckets of error counts.
    pub fn trends(
        &self,
        process_id: Option<&str>,
        bucket_ms: i64,
        limit: usize,
    ) -> Result<Vec<TrendBucket>, StoreError> {
        let bucket_ms = bucket_ms.max(1);
        let since = now_ms() - bucket_ms * limit as i64;
        let rows = self.store.query_errors(&ErrorFilter {
            process_id: process_id.map(str::to_string),
            since: Some(since),
            limit: Some(10_000),
            ..ErrorFilter::default()
        })?;

        let mut buckets: HashMap<i64, TrendBucket> = HashMap::new();
        for row in &rows {
            let start = row.timestamp - row.timestamp.rem_euclid(bucket_ms);
            let bucket = buckets.entry(start).or_insert_with(|| TrendBucket {
                bucket_start: start,
                count: 0,
                by_kind: HashMap::new(),
            });
            bucket.count += 1;
            *bucket.by_kind.entry(row.kind.clone()).or_default() += 1;
        }

        let mut out: Vec<TrendBucket> = buckets.into_values().collect();
        out.sort_by(|a, b| b.bucket_start.cmp(&a.bucket_start));
        out.truncate(limit);
        Ok(out)
    }

    /// Errors sharing kind and process with `id`, nearest in time first.
    pub fn similar(
        &self,
        id: i64,
        limit: usize,
    ) -> Result<Vec<ErrorRecord>, StoreError> {
        let anchor = self.store.get_error(id)?.ok_or(StoreError::NotFound {
            entity: "error",
            id: id.to_string(),
        })?;
        self.store.similar_errors(&anchor, limit)
    }

    /// Live event subscription.
    pub fn subscribe(&self) -> EventSubscription {
        self.bus.subscribe()
    }
}
