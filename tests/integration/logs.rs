#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{core, wait_for, wait_for_status};
use procman::{
    events::CoreEvent,
    store::{LogFilter, LogLevel, LogRecord, LogStream, ProcessStatus},
    supervisor::StartSpec,
};

fn seeded_record(message: &str, timestamp: i64) -> LogRecord {
    LogRecord {
        id: 0,
        process_id: "seed".into(),
        stream: LogStream::Stdout,
        message: message.into(),
        timestamp,
        level: LogLevel::Info,
    }
}

fn seed_row(fx: &common::CoreFixture) {
    // Give the seeded log records a parent row for the FK.
    let record = fx
        .supervisor
        .start({
            let mut spec = StartSpec::new("seed", "/bin/true");
            spec.id = Some("seed".into());
            spec
        })
        .expect("seed process");
    wait_for_status(fx, &record.id, ProcessStatus::Stopped);
}

#[test]
fn burst_of_150_records_is_fully_persisted_by_the_timer() {
    let fx = core();
    seed_row(&fx);

    for i in 0..150 {
        fx.logs.add(seeded_record(&format!("burst {i}"), 10_000 + i));
    }

    // No explicit flush: the threshold covers the first hundred and the
    // 1 s timer the rest.
    wait_for("all 150 records persisted", Duration::from_secs(5), || {
        fx.logs
            .get(&LogFilter {
                process_id: Some("seed".into()),
                limit: Some(1000),
                ..LogFilter::default()
            })
            .map(|rows| rows.iter().filter(|r| r.message.starts_with("burst")).count() == 150)
            .unwrap_or(false)
    });

    let rows = fx
        .logs
        .get(&LogFilter {
            process_id: Some("seed".into()),
            search: Some("burst".into()),
            limit: Some(1000),
            ..LogFilter::default()
        })
        .unwrap();
    assert_eq!(rows.len(), 150);
    // Descending by timestamp.
    assert!(rows.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    assert_eq!(rows[0].message, "burst 149");
}

#[test]
fn captured_output_is_totally_ordered_and_bracketed_by_system_records() {
    let fx = core();

    let mut spec = StartSpec::new("counter", "/bin/sh");
    spec.args = vec!["-c".into(), "i=1; while [ $i -le 50 ]; do echo line$i; i=$((i+1)); done".into()];
    let record = fx.supervisor.start(spec).expect("start");

    wait_for_status(&fx, &record.id, ProcessStatus::Stopped);
    fx.logs.flush();

    let all = fx
        .logs
        .get(&LogFilter {
            process_id: Some(record.id.clone()),
            limit: Some(1000),
            ..LogFilter::default()
        })
        .unwrap();

    // Ascending by row id mirrors ingestion order.
    let mut ascending = all.clone();
    ascending.sort_by_key(|rec| rec.id);

    assert!(ascending.first().unwrap().message.starts_with("started with pid"));
    assert!(ascending.last().unwrap().message.starts_with("exited with code"));

    let stdout: Vec<&LogRecord> = ascending
        .iter()
        .filter(|rec| rec.stream == LogStream::Stdout)
        .collect();
    assert_eq!(stdout.len(), 50);
    for (index, rec) in stdout.iter().enumerate() {
        assert_eq!(rec.message, format!("line{}", index + 1));
    }
    // Output precedes the exit marker in id order.
    let exit_id = ascending.last().unwrap().id;
    assert!(stdout.iter().all(|rec| rec.id < exit_id));
}

#[test]
fn add_then_get_round_trips_the_record() {
    let fx = core();
    seed_row(&fx);

    fx.logs.add(seeded_record("the one record", 123_456));
    fx.logs.flush();

    let rows = fx
        .logs
        .get(&LogFilter {
            process_id: Some("seed".into()),
            search: Some("the one record".into()),
            ..LogFilter::default()
        })
        .unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.message, "the one record");
    assert_eq!(row.timestamp, 123_456);
    assert_eq!(row.stream, LogStream::Stdout);
    assert_eq!(row.level, LogLevel::Info);
    assert!(row.id > 0);
}

#[test]
fn tail_returns_ascending_and_follow_streams_new_records() {
    let fx = core();
    seed_row(&fx);

    for i in 0..5 {
        fx.logs.add(seeded_record(&format!("old {i}"), 1000 + i));
    }
    fx.logs.flush();

    let (records, follow) = fx.logs.tail(Some("seed"), 3, true).unwrap();
    let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(messages, vec!["old 2", "old 3", "old 4"]);
    let follow = follow.expect("subscription");

    fx.logs.add(seeded_record("fresh", 2000));
    fx.logs.flush();

    wait_for("followed record", Duration::from_secs(3), || {
        matches!(
            follow.try_recv(),
            Some(CoreEvent::NewLog(rec)) if rec.message == "fresh"
        )
    });
}

#[test]
fn stats_bucket_by_stream_and_level() {
    let fx = core();
    seed_row(&fx);

    let mut error = seeded_record("boom", 3000);
    error.stream = LogStream::Stderr;
    error.level = LogLevel::Error;
    fx.logs.add(seeded_record("fine", 2000));
    fx.logs.add(error);

    let stats = fx.logs.stats("seed").unwrap();
    // The seed process also wrote its own system records.
    assert!(stats.logs.total >= 2);
    assert_eq!(stats.logs.by_stream.get("stdout").copied(), Some(1));
    assert_eq!(stats.logs.by_stream.get("stderr").copied(), Some(1));
    assert!(stats.logs.by_level.get("error").copied().unwrap_or(0) >= 1);
    assert!(stats.logs.approximate_bytes > 0);
    assert!(stats.logs.oldest.is_some());
    assert_eq!(stats.dropped_records, 0);
}

#[test]
fn clear_with_cutoff_deletes_only_older_rows() {
    let fx = core();
    seed_row(&fx);
    // Drop the seed process's own system records for a clean slate.
    fx.logs.clear("seed", None).unwrap();

    fx.logs.add(seeded_record("old", 1000));
    fx.logs.add(seeded_record("new", 9000));

    let deleted = fx.logs.clear("seed", Some(5000)).unwrap();
    assert_eq!(deleted, 1);

    let rows = fx
        .logs
        .get(&LogFilter {
            process_id: Some("seed".into()),
            ..LogFilter::default()
        })
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].message, "new");
}
