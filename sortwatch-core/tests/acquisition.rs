//! Integration tests for supervisors and the coordinator, driven by a
//! scripted mock connector (no network).

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;

use sortwatch_core::config::CoreConfig;
use sortwatch_core::error::{CoreError, Result};
use sortwatch_core::history::MachineHistory;
use sortwatch_core::session::{Connector, Session};
use sortwatch_core::supervisor::{self, BackoffPolicy};
use sortwatch_core::types::{MachineConfig, StorageHealth, SupervisorState, TagUpdate};
use sortwatch_core::Coordinator;

/// Shared observable state for the mock protocol.
#[derive(Default)]
struct MockHub {
    connect_attempts: StdMutex<Vec<tokio::time::Instant>>,
    live_sessions: AtomicUsize,
    max_live: AtomicUsize,
    fail_connect: AtomicBool,
    /// Updates delivered once on the next subscribe.
    script: StdMutex<Vec<TagUpdate>>,
}

impl MockHub {
    fn attempts(&self) -> usize {
        self.connect_attempts.lock().unwrap().len()
    }
}

#[derive(Clone)]
struct MockConnector(Arc<MockHub>);

struct MockSession {
    hub: Arc<MockHub>,
}

impl Connector for MockConnector {
    type Session = MockSession;

    fn connect(
        &self,
        _config: &MachineConfig,
    ) -> impl Future<Output = Result<MockSession>> + Send {
        let hub = Arc::clone(&self.0);
        async move {
            hub.connect_attempts
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());
            if hub.fail_connect.load(Ordering::SeqCst) {
                return Err(CoreError::Connection("connection refused".into()));
            }
            let live = hub.live_sessions.fetch_add(1, Ordering::SeqCst) + 1;
            hub.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(MockSession { hub })
        }
    }
}

impl Session for MockSession {
    fn subscribe(
        &mut self,
        _tags: &[String],
    ) -> impl Future<Output = Result<mpsc::Receiver<TagUpdate>>> + Send {
        let script: Vec<TagUpdate> = std::mem::take(&mut *self.hub.script.lock().unwrap());
        async move {
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for update in script {
                    if tx.send(update).await.is_err() {
                        return;
                    }
                }
                // Hold the sender so the session stays live.
                std::future::pending::<()>().await;
            });
            Ok(rx)
        }
    }

    fn close(self) -> impl Future<Output = ()> + Send {
        let hub = self.hub;
        async move {
            hub.live_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn machine(name: &str) -> MachineConfig {
    let mut cfg = MachineConfig::new(name, "ws://127.0.0.1:3000/ws");
    cfg.counters = vec!["c1".to_string()];
    cfg.tag_offset = 0;
    cfg
}

fn update(tag: &str, value: f64) -> TagUpdate {
    TagUpdate {
        tag: tag.to_string(),
        timestamp: None,
        value,
    }
}

fn core_config(data_dir: &std::path::Path) -> CoreConfig {
    CoreConfig {
        data_dir: data_dir.to_path_buf(),
        shutdown_timeout_secs: 2,
        ..CoreConfig::default()
    }
}

async fn wait_for_step<F: Fn() -> bool>(cond: F, step: Duration, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(step).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    wait_for_step(cond, Duration::from_millis(10), what).await;
}

#[tokio::test(start_paused = true)]
async fn backoff_delay_doubles_to_the_cap_then_plateaus() {
    let hub = Arc::new(MockHub::default());
    hub.fail_connect.store(true, Ordering::SeqCst);

    let handle = supervisor::spawn(
        Arc::new(MockConnector(Arc::clone(&hub))),
        machine("m1"),
        Arc::new(MachineHistory::new(16)),
        1e-3,
        BackoffPolicy {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(60),
        },
    );

    // Paused clock: the backoff sleeps auto-advance deterministically.
    // Coarse polling steps so the virtual clock covers the full schedule.
    wait_for_step(
        || hub.attempts() >= 6,
        Duration::from_secs(5),
        "six connection attempts",
    )
    .await;

    let attempts = hub.connect_attempts.lock().unwrap().clone();
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        &gaps[..5],
        &[
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(40),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ]
    );

    assert!(handle.stop_and_join(Duration::from_secs(5)).await);
}

#[tokio::test(start_paused = true)]
async fn stop_request_mid_backoff_resolves_promptly() {
    let hub = Arc::new(MockHub::default());
    hub.fail_connect.store(true, Ordering::SeqCst);

    let handle = supervisor::spawn(
        Arc::new(MockConnector(Arc::clone(&hub))),
        machine("m1"),
        Arc::new(MachineHistory::new(16)),
        1e-3,
        BackoffPolicy {
            initial: Duration::from_secs(3600),
            max: Duration::from_secs(3600),
        },
    );

    let mut states = handle.state_watch();
    wait_for(|| *states.borrow() == SupervisorState::Backoff, "backoff state").await;

    // The stop must win against a pending hour-long backoff sleep.
    let clean = handle.stop_and_join(Duration::from_secs(5)).await;
    assert!(clean, "supervisor should stop within the deadline");
    assert_eq!(*states.borrow_and_update(), SupervisorState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn reconnect_request_short_circuits_backoff() {
    let hub = Arc::new(MockHub::default());
    hub.fail_connect.store(true, Ordering::SeqCst);

    let handle = supervisor::spawn(
        Arc::new(MockConnector(Arc::clone(&hub))),
        machine("m1"),
        Arc::new(MachineHistory::new(16)),
        1e-3,
        BackoffPolicy {
            initial: Duration::from_secs(3600),
            max: Duration::from_secs(3600),
        },
    );

    let mut states = handle.state_watch();
    wait_for(|| *states.borrow() == SupervisorState::Backoff, "backoff state").await;
    let before = hub.attempts();

    hub.fail_connect.store(false, Ordering::SeqCst);
    handle.reconnect_now().await;
    wait_for(|| hub.attempts() > before, "immediate retry").await;
    wait_for(
        || *states.borrow() == SupervisorState::Connected,
        "connected after manual reconnect",
    )
    .await;

    assert!(handle.stop_and_join(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn near_zero_values_clamp_at_ingestion() {
    let td = tempfile::tempdir().unwrap();
    let hub = Arc::new(MockHub::default());
    // Counter "c1" at offset 0 maps to channel 0 on the wire.
    *hub.script.lock().unwrap() = vec![
        update("Settings.ColorSort.Primary0.DefectRate", 0.0005),
        update("Settings.ColorSort.Primary0.DefectRate", 2.0),
        update("Settings.ColorSort.Primary0.DefectRate", 0.0003),
    ];

    let coord = Coordinator::new(
        core_config(td.path()),
        MockConnector(Arc::clone(&hub)),
    )
    .unwrap();
    coord.add_machine(machine("M1")).await.unwrap();

    wait_for(
        || coord.snapshot("M1", "c1").map(|s| s.len()).unwrap_or(0) == 3,
        "three recorded samples",
    )
    .await;

    let values: Vec<f64> = coord
        .snapshot("M1", "c1")
        .unwrap()
        .iter()
        .map(|s| s.value)
        .collect();
    assert_eq!(values, vec![0.0, 2.0, 0.0]);
    assert_eq!(coord.latest("M1", "c1").unwrap().unwrap().value, 0.0);

    coord.shutdown().await;
}

#[tokio::test]
async fn duplicate_machine_is_rejected() {
    let td = tempfile::tempdir().unwrap();
    let hub = Arc::new(MockHub::default());
    let coord = Coordinator::new(core_config(td.path()), MockConnector(hub)).unwrap();

    coord.add_machine(machine("M1")).await.unwrap();
    let err = coord.add_machine(machine("M1")).await.unwrap_err();
    assert!(matches!(err, CoreError::DuplicateMachine(name) if name == "M1"));

    coord.shutdown().await;
}

#[tokio::test]
async fn malformed_config_never_reaches_connecting() {
    let td = tempfile::tempdir().unwrap();
    let hub = Arc::new(MockHub::default());
    let coord =
        Coordinator::new(core_config(td.path()), MockConnector(Arc::clone(&hub))).unwrap();

    let mut bad = machine("M1");
    bad.endpoint = "not a url".to_string();
    assert!(matches!(
        coord.add_machine(bad).await,
        Err(CoreError::InvalidConfig { .. })
    ));
    assert_eq!(hub.attempts(), 0);

    coord.shutdown().await;
}

#[tokio::test]
async fn add_remove_cycles_never_run_duplicate_supervisors() {
    let td = tempfile::tempdir().unwrap();
    let hub = Arc::new(MockHub::default());
    let coord =
        Coordinator::new(core_config(td.path()), MockConnector(Arc::clone(&hub))).unwrap();

    for _ in 0..5 {
        coord.add_machine(machine("M1")).await.unwrap();
        wait_for(
            || hub.live_sessions.load(Ordering::SeqCst) == 1,
            "session established",
        )
        .await;
        coord.remove_machine("M1").await.unwrap();
    }

    assert_eq!(hub.max_live.load(Ordering::SeqCst), 1);
    assert_eq!(hub.live_sessions.load(Ordering::SeqCst), 0);
    assert!(matches!(
        coord.health("M1").await,
        Err(CoreError::UnknownMachine(_))
    ));

    coord.shutdown().await;
}

#[tokio::test]
async fn list_machines_reports_each_supervisor() {
    let td = tempfile::tempdir().unwrap();
    let hub = Arc::new(MockHub::default());
    let coord =
        Coordinator::new(core_config(td.path()), MockConnector(Arc::clone(&hub))).unwrap();

    coord.add_machine(machine("alpha")).await.unwrap();
    coord.add_machine(machine("beta")).await.unwrap();

    let listed = coord.list_machines().await;
    let names: Vec<&str> = listed.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    coord.remove_machine("alpha").await.unwrap();
    let listed = coord.list_machines().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, "beta");

    coord.shutdown().await;
}

#[tokio::test]
async fn buffer_pressure_triggers_flush_before_eviction() {
    let td = tempfile::tempdir().unwrap();
    let hub = Arc::new(MockHub::default());
    *hub.script.lock().unwrap() = (0..6)
        .map(|i| update("Settings.ColorSort.Primary0.DefectRate", i as f64 + 1.0))
        .collect();

    // Tiny capacity, hour-scale flush interval: only the backlog signal
    // can persist anything within the test budget.
    let config = CoreConfig {
        history_capacity: 8,
        flush_interval_secs: 3600,
        ..core_config(td.path())
    };
    let coord = Coordinator::new(config, MockConnector(Arc::clone(&hub))).unwrap();
    coord.add_machine(machine("M1")).await.unwrap();
    coord.spawn_flush_loop();

    let current = td.path().join("M1").join("current.json");
    wait_for(
        || {
            std::fs::read_to_string(&current)
                .ok()
                .and_then(|s| serde_json::from_str::<sortwatch_core::HourlyRecord>(&s).ok())
                .and_then(|r| r.counters.get("c1").map(|c| c.count >= 4))
                .unwrap_or(false)
        },
        "early flush from history pressure",
    )
    .await;

    // Nothing was evicted, so storage health stays clean.
    assert_eq!(coord.storage_health("M1"), StorageHealth::Ok);
    coord.shutdown().await;
}

#[tokio::test]
async fn forced_reconnect_replaces_the_live_session() {
    let td = tempfile::tempdir().unwrap();
    let hub = Arc::new(MockHub::default());
    let coord =
        Coordinator::new(core_config(td.path()), MockConnector(Arc::clone(&hub))).unwrap();

    coord.add_machine(machine("M1")).await.unwrap();
    wait_for(
        || hub.live_sessions.load(Ordering::SeqCst) == 1,
        "initial session",
    )
    .await;
    let before = hub.attempts();

    coord.reconnect("M1").await.unwrap();
    wait_for(|| hub.attempts() > before, "fresh connection attempt").await;
    wait_for(
        || hub.live_sessions.load(Ordering::SeqCst) == 1,
        "replacement session",
    )
    .await;
    // The old session was closed before the new one connected.
    assert_eq!(hub.max_live.load(Ordering::SeqCst), 1);

    coord.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_supervisors_and_flushes() {
    let td = tempfile::tempdir().unwrap();
    let hub = Arc::new(MockHub::default());
    *hub.script.lock().unwrap() = vec![update("Settings.ColorSort.Primary0.DefectRate", 3.5)];

    let coord =
        Coordinator::new(core_config(td.path()), MockConnector(Arc::clone(&hub))).unwrap();
    coord.add_machine(machine("M1")).await.unwrap();
    wait_for(
        || coord.latest("M1", "c1").map(|s| s.is_some()).unwrap_or(false),
        "sample delivered",
    )
    .await;

    coord.shutdown().await;
    assert_eq!(hub.live_sessions.load(Ordering::SeqCst), 0);

    // The final flush persisted the in-progress hour.
    let current = td.path().join("M1").join("current.json");
    let rec: sortwatch_core::HourlyRecord =
        serde_json::from_str(&std::fs::read_to_string(current).unwrap()).unwrap();
    assert_eq!(rec.counters["c1"].count, 1);
    assert_eq!(rec.counters["c1"].sum, 3.5);
}
