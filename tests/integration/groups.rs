#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{core, wait_for};
use procman::{
    events::CoreEvent,
    groups::{GroupOrchestrator, StartGroupOptions, StopGroupOptions, StopStrategy},
    store::{ProcessFilter, ProcessStatus},
    supervisor::StartSpec,
};

fn orchestrator(fx: &common::CoreFixture) -> GroupOrchestrator {
    GroupOrchestrator::new(
        std::sync::Arc::clone(&fx.store),
        fx.supervisor.clone(),
        fx.bus.clone(),
    )
}

fn start_sleeper(fx: &common::CoreFixture, id: &str) {
    let mut spec = StartSpec::new(id, "/bin/sleep");
    spec.id = Some(id.into());
    spec.args = vec!["60".into()];
    fx.supervisor.start(spec).expect("start sleeper");
}

fn quick_start_options() -> StartGroupOptions {
    StartGroupOptions {
        startup_delay: Duration::from_millis(20),
        skip_running: true,
    }
}

#[test]
fn reverse_stop_walks_the_startup_order_backwards() {
    let fx = core();
    let groups = orchestrator(&fx);

    for id in ["p1", "p2", "p3"] {
        start_sleeper(&fx, id);
    }
    let group = groups.create("tier", None, vec![]).unwrap();
    for id in ["p1", "p2", "p3"] {
        groups.add(id, &group.id).unwrap();
    }

    let sub = fx.bus.subscribe();
    groups
        .stop(
            &group.id,
            &StopGroupOptions {
                strategy: StopStrategy::Reverse,
                force: false,
            },
        )
        .unwrap();

    let stopped: Vec<String> = sub
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            CoreEvent::ProcessStopped { id } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(stopped, vec!["p3", "p2", "p1"]);

    let running = fx
        .supervisor
        .list(&ProcessFilter {
            status: Some(ProcessStatus::Running),
            ..ProcessFilter::default()
        })
        .unwrap();
    assert!(running.is_empty());
}

#[test]
fn start_walks_order_and_reports_members() {
    let fx = core();
    let groups = orchestrator(&fx);

    // Persist rows without leaving children running.
    for id in ["a", "b"] {
        start_sleeper(&fx, id);
        fx.supervisor.stop(id, true).unwrap();
    }

    let group = groups.create("web", None, vec![]).unwrap();
    groups.add("a", &group.id).unwrap();
    groups.add("b", &group.id).unwrap();

    let started = groups.start(&group.id, &quick_start_options()).unwrap();
    let ids: Vec<&str> = started.iter().map(|rec| rec.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    let status = groups.status(&group.id).unwrap();
    assert_eq!(status.running, 2);
    assert_eq!(status.stopped, 0);

    groups
        .stop(
            &group.id,
            &StopGroupOptions {
                strategy: StopStrategy::Parallel,
                force: true,
            },
        )
        .unwrap();

    wait_for("group fully stopped", Duration::from_secs(10), || {
        groups
            .status(&group.id)
            .map(|s| s.running == 0 && s.stopped == 2)
            .unwrap_or(false)
    });
}

#[test]
fn restarting_a_fully_running_group_spawns_nothing_new() {
    let fx = core();
    let groups = orchestrator(&fx);

    for id in ["a", "b"] {
        start_sleeper(&fx, id);
    }
    let group = groups.create("web", None, vec![]).unwrap();
    groups.add("a", &group.id).unwrap();
    groups.add("b", &group.id).unwrap();

    let before: Vec<Option<u32>> = ["a", "b"]
        .iter()
        .map(|id| fx.store.get_process(id).unwrap().unwrap().pid)
        .collect();

    let sub = fx.bus.subscribe();
    let started = groups.start(&group.id, &quick_start_options()).unwrap();
    assert_eq!(started.len(), 2);

    let after: Vec<Option<u32>> = ["a", "b"]
        .iter()
        .map(|id| fx.store.get_process(id).unwrap().unwrap().pid)
        .collect();
    assert_eq!(before, after);

    let events = sub.drain();
    assert!(events.iter().any(|event| matches!(
        event,
        CoreEvent::GroupStarted { started, .. } if started.len() == 2
    )));
    assert!(!events
        .iter()
        .any(|event| matches!(event, CoreEvent::GroupStartErrors { .. })));

    groups
        .stop(
            &group.id,
            &StopGroupOptions {
                strategy: StopStrategy::Parallel,
                force: true,
            },
        )
        .unwrap();
}

#[test]
fn failed_members_are_collected_not_fatal() {
    let fx = core();
    let groups = orchestrator(&fx);

    start_sleeper(&fx, "good");
    fx.supervisor.stop("good", true).unwrap();

    // A member whose binary is gone fails to start; the pass continues.
    let mut ghost = StartSpec::new("ghost", "/definitely/not/here");
    ghost.id = Some("ghost".into());
    let _ = fx.supervisor.start(ghost);

    let group = groups.create("mixed", None, vec![]).unwrap();
    groups.add("ghost", &group.id).unwrap();
    groups.add("good", &group.id).unwrap();

    let sub = fx.bus.subscribe();
    let started = groups.start(&group.id, &quick_start_options()).unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].id, "good");

    let events = sub.drain();
    assert!(events.iter().any(|event| matches!(
        event,
        CoreEvent::GroupStartErrors { errors, .. } if errors.len() == 1
    )));

    fx.supervisor.stop("good", true).unwrap();
}

#[test]
fn delete_guards_membership_and_disappears_from_list() {
    let fx = core();
    let groups = orchestrator(&fx);

    start_sleeper(&fx, "p1");
    fx.supervisor.stop("p1", true).unwrap();

    let group = groups.create("tier", None, vec![]).unwrap();
    groups.add("p1", &group.id).unwrap();

    assert!(groups.delete(&group.id).is_err());

    groups.remove("p1").unwrap();
    groups.delete(&group.id).unwrap();

    assert!(groups.list().unwrap().iter().all(|g| g.id != group.id));
}
