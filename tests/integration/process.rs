#[path = "common/mod.rs"]
mod common;

use std::{collections::HashMap, path::PathBuf, time::Duration};

use common::{core, core_with, wait_for, wait_for_status};
use procman::{
    config::Config,
    error::SupervisorError,
    store::{LogFilter, LogLevel, LogStream, ProcessFilter, ProcessStatus},
    supervisor::{RestartOverrides, StartSpec},
};

#[test]
fn echo_runs_captures_stdout_and_stops() {
    let fx = core_with(Config {
        allowed_commands: vec![PathBuf::from("/bin")],
        max_processes: 10,
        ..Config::default()
    });

    let mut spec = StartSpec::new("echo", "/bin/echo");
    spec.args = vec!["Hello".into()];
    let record = fx.supervisor.start(spec).expect("start echo");

    wait_for_status(&fx, &record.id, ProcessStatus::Stopped);
    fx.logs.flush();

    let row = fx.store.get_process(&record.id).unwrap().unwrap();
    assert_eq!(row.status, ProcessStatus::Stopped);
    assert_eq!(row.pid, None);
    assert_eq!(row.restart_count, 0);
    assert!(row.stopped_at.is_some());

    let stdout = fx
        .logs
        .get(&LogFilter {
            process_id: Some(record.id.clone()),
            stream: Some(LogStream::Stdout),
            ..LogFilter::default()
        })
        .unwrap();
    assert!(stdout.iter().any(|rec| rec.message.contains("Hello")));
}

#[test]
fn nonzero_exit_is_crashed_with_system_error_log() {
    let fx = core();

    let mut spec = StartSpec::new("failer", "/bin/sh");
    spec.args = vec!["-c".into(), "exit 1".into()];
    let record = fx.supervisor.start(spec).expect("start sh");

    wait_for_status(&fx, &record.id, ProcessStatus::Crashed);
    fx.logs.flush();

    let system = fx
        .logs
        .get(&LogFilter {
            process_id: Some(record.id.clone()),
            stream: Some(LogStream::System),
            ..LogFilter::default()
        })
        .unwrap();
    let exit = system
        .iter()
        .find(|rec| rec.message.starts_with("exited"))
        .expect("exit record");
    assert_eq!(exit.message, "exited with code 1, signal null");
    assert_eq!(exit.level, LogLevel::Error);
}

#[test]
fn signal_termination_is_recorded_stopped() {
    let fx = core();

    let mut spec = StartSpec::new("sleeper", "/bin/sleep");
    spec.args = vec!["30".into()];
    let record = fx.supervisor.start(spec).expect("start sleep");

    fx.supervisor.stop(&record.id, false).expect("stop");
    fx.logs.flush();

    let row = fx.store.get_process(&record.id).unwrap().unwrap();
    assert_eq!(row.status, ProcessStatus::Stopped);
    assert_eq!(row.pid, None);

    let system = fx
        .logs
        .get(&LogFilter {
            process_id: Some(record.id.clone()),
            stream: Some(LogStream::System),
            ..LogFilter::default()
        })
        .unwrap();
    let exit = system
        .iter()
        .find(|rec| rec.message.starts_with("exited"))
        .expect("exit record");
    assert_eq!(exit.message, "exited with code null, signal SIGTERM");
    assert_eq!(exit.level, LogLevel::Info);
}

#[test]
fn capacity_limit_rejects_one_more_start() {
    let fx = core_with(Config {
        max_processes: 1,
        ..Config::default()
    });

    let mut spec = StartSpec::new("sleeper", "/bin/sleep");
    spec.args = vec!["30".into()];
    let first = fx.supervisor.start(spec.clone()).expect("first start");

    let err = fx.supervisor.start(spec).unwrap_err();
    assert!(matches!(err, SupervisorError::CapacityExceeded { limit: 1 }));

    fx.supervisor.stop(&first.id, true).unwrap();
}

#[test]
fn allowlist_rejects_uncovered_commands() {
    let fx = core_with(Config {
        allowed_commands: vec![PathBuf::from("/usr/bin")],
        ..Config::default()
    });

    let err = fx
        .supervisor
        .start(StartSpec::new("echo", "/bin/echo"))
        .unwrap_err();
    assert!(matches!(err, SupervisorError::CommandNotAllowed { .. }));
}

#[test]
fn spawn_failure_marks_failed_and_records_error() {
    let fx = core();

    let spec = StartSpec::new("ghost", "/definitely/not/a/binary");
    let err = fx.supervisor.start(spec).unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnFailed { .. }));

    let rows = fx
        .supervisor
        .list(&ProcessFilter {
            status: Some(ProcessStatus::Failed),
            ..ProcessFilter::default()
        })
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].pid, None);

    // The io error text names the missing file, which classifies it.
    let latest = fx.errors.latest(10, false).unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].kind, "FileNotFound");
}

#[test]
fn stop_semantics_for_unknown_and_idle_processes() {
    let fx = core();

    assert!(matches!(
        fx.supervisor.stop("missing", false),
        Err(SupervisorError::NotFound { .. })
    ));

    let record = fx
        .supervisor
        .start(StartSpec::new("true", "/bin/true"))
        .expect("start");
    wait_for_status(&fx, &record.id, ProcessStatus::Stopped);

    // Stopping a process that already exited is a no-op.
    fx.supervisor.stop(&record.id, false).expect("noop stop");
}

#[test]
fn restart_increments_count_and_changes_pid() {
    let fx = core();

    let mut spec = StartSpec::new("sleeper", "/bin/sleep");
    spec.args = vec!["30".into()];
    let first = fx.supervisor.start(spec).expect("start");
    let first_pid = first.pid.expect("running pid");

    let second = fx.supervisor.restart(&first.id, None).expect("restart");
    assert_eq!(second.id, first.id);
    assert_eq!(second.restart_count, 1);
    let second_pid = second.pid.expect("running pid");
    assert_ne!(first_pid, second_pid);

    let row = fx.store.get_process(&first.id).unwrap().unwrap();
    assert_eq!(row.restart_count, 1);
    assert_eq!(row.status, ProcessStatus::Running);

    fx.supervisor.stop(&first.id, true).unwrap();
}

#[test]
fn restart_overrides_merge_field_wise() {
    let fx = core();

    let mut spec = StartSpec::new("sleeper", "/bin/sleep");
    spec.args = vec!["30".into()];
    spec.env = HashMap::from([("KEEP".into(), "yes".into())]);
    let record = fx.supervisor.start(spec).expect("start");

    let overrides = RestartOverrides {
        args: Some(vec!["60".into()]),
        ..RestartOverrides::default()
    };
    let restarted = fx
        .supervisor
        .restart(&record.id, Some(overrides))
        .expect("restart");
    assert_eq!(restarted.args, vec!["60"]);
    // Untouched fields keep their effective values.
    assert_eq!(restarted.env.get("KEEP").map(String::as_str), Some("yes"));
    assert_eq!(restarted.command, "/bin/sleep");

    fx.supervisor.stop(&record.id, true).unwrap();
}

#[test]
fn row_status_matches_in_memory_status_after_lifecycle() {
    let fx = core();

    let mut spec = StartSpec::new("sleeper", "/bin/sleep");
    spec.args = vec!["30".into()];
    let record = fx.supervisor.start(spec).expect("start");

    for _ in 0..2 {
        fx.supervisor.restart(&record.id, None).expect("restart");
    }
    fx.supervisor.stop(&record.id, false).expect("stop");

    let row = fx.store.get_process(&record.id).unwrap().unwrap();
    let in_memory = fx.supervisor.status_of(&record.id).expect("handle");
    assert_eq!(row.status, in_memory);
    assert_eq!(row.restart_count, 2);
    assert_eq!(row.pid.is_some(), row.status == ProcessStatus::Running);
}

#[test]
fn kill_is_a_forced_restart() {
    let fx = core();

    let mut spec = StartSpec::new("sleeper", "/bin/sleep");
    spec.args = vec!["30".into()];
    let record = fx.supervisor.start(spec).expect("start");

    let killed = fx.supervisor.kill(&record.id).expect("kill");
    assert_eq!(killed.restart_count, 1);
    assert_eq!(killed.status, ProcessStatus::Running);

    fx.supervisor.stop(&record.id, true).unwrap();
}

#[test]
fn starting_a_running_id_is_rejected() {
    let fx = core();

    let mut spec = StartSpec::new("sleeper", "/bin/sleep");
    spec.args = vec!["30".into()];
    let record = fx.supervisor.start(spec.clone()).expect("start");

    spec.id = Some(record.id.clone());
    assert!(matches!(
        fx.supervisor.start(spec),
        Err(SupervisorError::AlreadyRunning { .. })
    ));

    fx.supervisor.stop(&record.id, true).unwrap();
}

#[test]
fn reconcile_repairs_rows_from_an_unclean_shutdown() {
    let fx = core();

    let mut spec = StartSpec::new("sleeper", "/bin/sleep");
    spec.args = vec!["30".into()];
    let record = fx.supervisor.start(spec).expect("start");

    // Simulate a crashed supervisor: the row still says running, but a new
    // supervisor over the same store holds no handle for it.
    let fresh = procman::supervisor::Supervisor::new(
        std::sync::Arc::clone(&fx.config),
        std::sync::Arc::clone(&fx.store),
        std::sync::Arc::clone(&fx.logs),
        std::sync::Arc::clone(&fx.errors),
        fx.bus.clone(),
    )
    .expect("rebuild supervisor");
    drop(fresh);

    let row = fx.store.get_process(&record.id).unwrap().unwrap();
    assert_eq!(row.status, ProcessStatus::Stopped);
    assert_eq!(row.pid, None);
    assert_eq!(row.started_at, None);

    // The original supervisor still owns the child; reap it for real.
    fx.supervisor.shutdown();
}

#[test]
fn shutdown_stops_every_running_child() {
    let fx = core();

    let mut ids = Vec::new();
    for i in 0..3 {
        let mut spec = StartSpec::new(format!("sleeper-{i}"), "/bin/sleep");
        spec.args = vec!["30".into()];
        ids.push(fx.supervisor.start(spec).expect("start").id);
    }

    fx.supervisor.shutdown();

    for id in &ids {
        let row = fx.store.get_process(id).unwrap().unwrap();
        assert_eq!(row.status, ProcessStatus::Stopped);
        assert_eq!(row.pid, None);
    }

    // Shutdown is idempotent.
    fx.supervisor.shutdown();
}

#[test]
fn list_filters_by_status() {
    let fx = core();

    let mut spec = StartSpec::new("sleeper", "/bin/sleep");
    spec.args = vec!["30".into()];
    let running = fx.supervisor.start(spec).expect("start");

    let done = fx
        .supervisor
        .start(StartSpec::new("true", "/bin/true"))
        .expect("start");
    wait_for_status(&fx, &done.id, ProcessStatus::Stopped);

    let running_rows = fx
        .supervisor
        .list(&ProcessFilter {
            status: Some(ProcessStatus::Running),
            ..ProcessFilter::default()
        })
        .unwrap();
    assert_eq!(running_rows.len(), 1);
    assert_eq!(running_rows[0].id, running.id);

    fx.supervisor.stop(&running.id, true).unwrap();

    wait_for("both rows stopped", Duration::from_secs(5), || {
        fx.supervisor
            .list(&ProcessFilter {
                status: Some(ProcessStatus::Stopped),
                ..ProcessFilter::default()
            })
            .map(|rows| rows.len() == 2)
            .unwrap_or(false)
    });
}
