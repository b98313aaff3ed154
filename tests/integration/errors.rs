#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{core, wait_for_status};
use procman::{
    error::StoreError,
    events::CoreEvent,
    store::{ErrorFilter, ProcessStatus},
    supervisor::StartSpec,
};

fn seed_process(fx: &common::CoreFixture, id: &str) {
    let record = fx
        .supervisor
        .start({
            let mut spec = StartSpec::new(id, "/bin/true");
            spec.id = Some(id.into());
            spec
        })
        .expect("seed process");
    wait_for_status(fx, &record.id, ProcessStatus::Stopped);
}

#[test]
fn enomem_is_critical_and_counted_in_the_summary() {
    let fx = core();
    seed_process(&fx, "p1");
    let sub = fx.errors.subscribe();

    let rec = fx
        .errors
        .record("p1", "ENOMEM: out of memory", None)
        .expect("record");
    assert_eq!(rec.kind, "OutOfMemory");

    let events = sub.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::CriticalError(err) if err.id == rec.id)));

    let summary = fx.errors.summary(None, None).unwrap();
    assert!(summary.by_kind.get("OutOfMemory").copied().unwrap_or(0) >= 1);
    assert_eq!(summary.unresolved, 1);
}

#[test]
fn resolution_is_idempotent_and_audited_once() {
    let fx = core();
    seed_process(&fx, "p1");

    let rec = fx.errors.record("p1", "plain failure", None).unwrap();
    let sub = fx.errors.subscribe();

    fx.errors.mark_resolved(rec.id, Some("rebooted")).unwrap();
    fx.errors.mark_resolved(rec.id, Some("rebooted twice")).unwrap();

    let resolutions: Vec<_> = sub
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            CoreEvent::ErrorResolved { id, note } => Some((id, note)),
            _ => None,
        })
        .collect();
    assert_eq!(resolutions.len(), 1);
    assert_eq!(resolutions[0].1.as_deref(), Some("rebooted"));

    let row = fx
        .errors
        .get(&ErrorFilter {
            process_id: Some("p1".into()),
            ..ErrorFilter::default()
        })
        .unwrap()
        .remove(0);
    assert!(row.resolved);
    assert_eq!(row.resolution_note.as_deref(), Some("rebooted"));

    assert!(matches!(
        fx.errors.mark_resolved(987_654, None),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn latest_can_exclude_resolved_errors() {
    let fx = core();
    seed_process(&fx, "p1");

    let open = fx.errors.record("p1", "first", None).unwrap();
    let closed = fx.errors.record("p1", "second", None).unwrap();
    fx.errors.mark_resolved(closed.id, None).unwrap();

    let unresolved = fx.errors.latest(10, true).unwrap();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].id, open.id);

    let everything = fx.errors.latest(10, false).unwrap();
    assert_eq!(everything.len(), 2);
}

#[test]
fn trends_and_similarity_work_over_persisted_errors() {
    let fx = core();
    seed_process(&fx, "p1");

    let anchor = fx.errors.record("p1", "no such file: a.txt", None).unwrap();
    let nearby = fx.errors.record("p1", "file not found: b.txt", None).unwrap();
    fx.errors.record("p1", "ENOMEM", None).unwrap();

    let buckets = fx.errors.trends(Some("p1"), 60_000, 5).unwrap();
    assert_eq!(buckets.iter().map(|b| b.count).sum::<usize>(), 3);

    let similar = fx.errors.similar(anchor.id, 5).unwrap();
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0].id, nearby.id);
}

#[test]
fn crashed_children_do_not_pollute_the_error_sink() {
    let fx = core();

    let mut spec = StartSpec::new("crasher", "/bin/sh");
    spec.args = vec!["-c".into(), "exit 3".into()];
    let record = fx.supervisor.start(spec).unwrap();
    wait_for_status(&fx, &record.id, ProcessStatus::Crashed);

    // A non-zero exit drives state, it is not an incident by itself.
    std::thread::sleep(Duration::from_millis(200));
    assert!(fx.errors.latest(10, false).unwrap().is_empty());
}
