#![allow(dead_code)]

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use procman::{
    config::Config,
    errorsink::ErrorSink,
    events::EventBus,
    logsink::LogSink,
    store::{ProcessStatus, Store},
    supervisor::Supervisor,
};
use tempfile::TempDir;

pub struct CoreFixture {
    pub temp: TempDir,
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub bus: EventBus,
    pub logs: Arc<LogSink>,
    pub errors: Arc<ErrorSink>,
    pub supervisor: Supervisor,
}

pub fn core() -> CoreFixture {
    core_with(Config::default())
}

pub fn core_with(config: Config) -> CoreFixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();

    let temp = TempDir::new().expect("tempdir");
    let store = Arc::new(Store::open(temp.path().join("procman.db")).expect("open store"));
    let config = Arc::new(config);
    let bus = EventBus::new();
    let logs = Arc::new(LogSink::new(Arc::clone(&store), bus.clone()));
    let errors = Arc::new(ErrorSink::new(Arc::clone(&store), bus.clone()));
    let supervisor = Supervisor::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&logs),
        Arc::clone(&errors),
        bus.clone(),
    )
    .expect("build supervisor");

    CoreFixture {
        temp,
        store,
        config,
        bus,
        logs,
        errors,
        supervisor,
    }
}

/// Polls `check` until it passes or the deadline expires.
pub fn wait_for(what: &str, timeout: Duration, check: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Waits until the persisted row for `id` reaches `status`.
pub fn wait_for_status(fixture: &CoreFixture, id: &str, status: ProcessStatus) {
    wait_for(
        &format!("process '{id}' to reach {status:?}"),
        Duration::from_secs(10),
        || {
            fixture
                .store
                .get_process(id)
                .ok()
                .flatten()
                .map(|rec| rec.status == status)
                .unwrap_or(false)
        },
    );
}
