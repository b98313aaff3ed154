#[path = "common/mod.rs"]
mod common;

use std::{sync::Arc, time::Duration};

use common::{core, wait_for, wait_for_status};
use procman::{
    prober::HealthProber,
    store::{HealthStatus, ProcessStatus},
    supervisor::StartSpec,
};

fn prober(fx: &common::CoreFixture) -> HealthProber {
    HealthProber::new(
        Arc::clone(&fx.config),
        Arc::clone(&fx.store),
        fx.bus.clone(),
        Arc::new(fx.supervisor.clone()),
    )
}

#[test]
fn failing_probe_restarts_an_auto_restart_process() {
    let fx = core();
    let prober = prober(&fx);
    prober.start();

    let mut spec = StartSpec::new("flaky", "/bin/sleep");
    spec.id = Some("flaky".into());
    spec.args = vec!["60".into()];
    spec.auto_restart = true;
    spec.health_check_command = Some("/bin/false".into());
    spec.health_check_interval = Some(1000);
    fx.supervisor.start(spec).expect("start");

    // Probe fires after ~1 s, reports unhealthy, and requests a restart;
    // the restart re-registers the probe so the count keeps climbing.
    wait_for("restart counter to climb", Duration::from_secs(20), || {
        fx.store
            .get_process("flaky")
            .ok()
            .flatten()
            .map(|rec| rec.restart_count >= 2)
            .unwrap_or(false)
    });

    prober.stop();
    // With probing halted the process settles in its restarted state.
    wait_for("flaky to settle running", Duration::from_secs(10), || {
        fx.store
            .get_process("flaky")
            .ok()
            .flatten()
            .map(|rec| rec.status == ProcessStatus::Running)
            .unwrap_or(false)
    });

    fx.supervisor.stop("flaky", true).unwrap();
}

#[test]
fn passing_probe_marks_the_process_healthy() {
    let fx = core();
    let prober = prober(&fx);
    prober.start();

    let mut spec = StartSpec::new("steady", "/bin/sleep");
    spec.id = Some("steady".into());
    spec.args = vec!["60".into()];
    spec.health_check_command = Some("/bin/true".into());
    spec.health_check_interval = Some(1000);
    fx.supervisor.start(spec).expect("start");

    wait_for("healthy status", Duration::from_secs(10), || {
        fx.store
            .get_process("steady")
            .ok()
            .flatten()
            .map(|rec| {
                rec.health_status == HealthStatus::Healthy
                    && rec.last_health_check.is_some()
            })
            .unwrap_or(false)
    });

    // No auto-restart configured: the counter stays put.
    let row = fx.store.get_process("steady").unwrap().unwrap();
    assert_eq!(row.restart_count, 0);

    prober.stop();
    fx.supervisor.stop("steady", true).unwrap();
}

#[test]
fn liveness_probe_tracks_the_pid() {
    let fx = core();
    let prober = prober(&fx);

    let mut spec = StartSpec::new("plain", "/bin/sleep");
    spec.id = Some("plain".into());
    spec.args = vec!["60".into()];
    fx.supervisor.start(spec).expect("start");

    // Running child with no probe command: a signal-0 check.
    let status = prober.check_one("plain").unwrap();
    assert_eq!(status, HealthStatus::Healthy);

    fx.supervisor.stop("plain", true).unwrap();
    wait_for_status(&fx, "plain", ProcessStatus::Stopped);

    // No pid on a stopped row: nothing to assert liveness against.
    let status = prober.check_one("plain").unwrap();
    assert_eq!(status, HealthStatus::Unknown);

    let row = fx.store.get_process("plain").unwrap().unwrap();
    assert!(row.last_health_check.is_some());
}

#[test]
fn registrations_follow_the_process_lifecycle() {
    let fx = core();
    let prober = prober(&fx);
    prober.start();

    let mut spec = StartSpec::new("tracked", "/bin/sleep");
    spec.id = Some("tracked".into());
    spec.args = vec!["60".into()];
    spec.health_check_command = Some("/bin/true".into());
    spec.health_check_interval = Some(60_000);
    fx.supervisor.start(spec).expect("start");

    wait_for("registration to appear", Duration::from_secs(5), || {
        prober.registered().contains(&"tracked".to_string())
    });

    fx.supervisor.stop("tracked", false).unwrap();
    wait_for("registration to disappear", Duration::from_secs(5), || {
        prober.registered().is_empty()
    });

    prober.stop();
}

#[test]
fn disable_all_clears_registrations() {
    let fx = core();
    let prober = prober(&fx);

    let mut spec = StartSpec::new("one", "/bin/sleep");
    spec.id = Some("one".into());
    spec.args = vec!["60".into()];
    fx.supervisor.start(spec).expect("start");

    prober.enable("one", Some(30_000)).unwrap();
    assert_eq!(prober.registered(), vec!["one".to_string()]);

    prober.disable_all();
    assert!(prober.registered().is_empty());
    assert!(!prober.disable("one"));

    fx.supervisor.stop("one", true).unwrap();
}
