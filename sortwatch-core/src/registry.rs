//! Registry & coordinator: the process-wide owner of machines.
//!
//! Holds the authoritative machine table behind one lock, guarantees at
//! most one live supervisor per machine, and runs the periodic flush
//! cycle. The control API here is the only way supervisors are created
//! or destroyed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::history::HistoryBook;
use crate::session::Connector;
use crate::store::HourlyStore;
use crate::supervisor::{self, BackoffPolicy, SupervisorHandle};
use crate::types::{HourlyRecord, MachineConfig, Sample, StorageHealth, SupervisorState};

pub struct Coordinator<C: Connector> {
    connector: Arc<C>,
    config: CoreConfig,
    history: Arc<HistoryBook>,
    store: Arc<HourlyStore>,
    machines: Mutex<HashMap<String, SupervisorHandle>>,
    flush_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Coordinator<C> {
    pub fn new(config: CoreConfig, connector: C) -> Result<Arc<Self>> {
        let store = HourlyStore::new(&config.data_dir)?;
        let history = Arc::new(HistoryBook::new(config.history_capacity));
        Ok(Arc::new(Self {
            connector: Arc::new(connector),
            config,
            history,
            store: Arc::new(store),
            machines: Mutex::new(HashMap::new()),
            flush_task: std::sync::Mutex::new(None),
        }))
    }

    fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: self.config.backoff_initial(),
            max: self.config.backoff_max(),
        }
    }

    /// Start the periodic flush cycle. Idempotent.
    pub fn spawn_flush_loop(self: &Arc<Self>) {
        let mut guard = self.flush_task.lock().unwrap();
        if guard.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let pressure = this.history.pressure();
            let mut ticker = tokio::time::interval(this.config.flush_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = pressure.notified() => {
                        debug!("history buffers near capacity, flushing early");
                    }
                }
                this.flush_now();
            }
        }));
    }

    /// Drain histories into the durable store once. Failures are contained
    /// per machine and retried on the next interval.
    pub fn flush_now(&self) {
        let views = self.history.list();
        let failures = self.store.flush(Utc::now(), &views);
        for (machine, error) in failures {
            warn!(machine, %error, "hourly flush failed");
        }
    }

    /// Create a machine and start its supervisor. Fails if the name is
    /// taken or the config is malformed; the machine never reaches
    /// Connecting in either case.
    pub async fn add_machine(&self, config: MachineConfig) -> Result<()> {
        config.validate()?;
        let mut machines = self.machines.lock().await;
        if machines.contains_key(&config.name) {
            return Err(CoreError::DuplicateMachine(config.name));
        }

        self.store.open_machine(&config.name, Utc::now())?;
        let history = self.history.insert(&config.name);
        let handle = supervisor::spawn(
            Arc::clone(&self.connector),
            config.clone(),
            history,
            self.config.clamp_threshold,
            self.backoff_policy(),
        );
        info!(machine = %config.name, endpoint = %config.endpoint, "machine added");
        machines.insert(config.name, handle);
        Ok(())
    }

    /// Stop the supervisor, drop live buffers, keep durable records.
    /// The table lock is held across the stop so a concurrent add cannot
    /// observe a half-removed machine.
    pub async fn remove_machine(&self, name: &str) -> Result<()> {
        let mut machines = self.machines.lock().await;
        let handle = machines
            .remove(name)
            .ok_or_else(|| CoreError::UnknownMachine(name.to_string()))?;

        let clean = handle.stop_and_join(self.config.shutdown_timeout()).await;
        if !clean {
            warn!(machine = name, "supervisor missed stop deadline, aborted");
        }
        self.history.remove(name);
        self.store.forget(name);
        info!(machine = name, "machine removed");
        Ok(())
    }

    /// Request an immediate retry regardless of any backoff timer.
    pub async fn reconnect(&self, name: &str) -> Result<()> {
        let machines = self.machines.lock().await;
        let handle = machines
            .get(name)
            .ok_or_else(|| CoreError::UnknownMachine(name.to_string()))?;
        handle.reconnect_now().await;
        Ok(())
    }

    pub async fn health(&self, name: &str) -> Result<SupervisorState> {
        let machines = self.machines.lock().await;
        machines
            .get(name)
            .map(|h| h.state())
            .ok_or_else(|| CoreError::UnknownMachine(name.to_string()))
    }

    pub async fn list_machines(&self) -> Vec<(String, SupervisorState)> {
        let machines = self.machines.lock().await;
        let mut out: Vec<_> = machines
            .iter()
            .map(|(name, h)| (name.clone(), h.state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Most recent live sample for one counter, or None before first data.
    pub fn latest(&self, machine: &str, counter: &str) -> Result<Option<Sample>> {
        let hist = self
            .history
            .get(machine)
            .ok_or_else(|| CoreError::UnknownMachine(machine.to_string()))?;
        Ok(hist.latest(counter))
    }

    /// Current bounded history window for one counter, receive order.
    pub fn snapshot(&self, machine: &str, counter: &str) -> Result<Vec<Sample>> {
        let hist = self
            .history
            .get(machine)
            .ok_or_else(|| CoreError::UnknownMachine(machine.to_string()))?;
        Ok(hist.snapshot(counter))
    }

    /// Historical hour records overlapping `[start, end)`. Also answers
    /// for machines that were removed; their durable records remain.
    pub fn query(
        &self,
        machine: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyRecord>> {
        self.store.query(machine, start, end)
    }

    pub fn storage_health(&self, machine: &str) -> StorageHealth {
        self.store.storage_health(machine)
    }

    /// Stop every supervisor (bounded per-machine deadline, laggards are
    /// aborted and logged), then run one final flush.
    pub async fn shutdown(&self) {
        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }

        let entries: Vec<(String, SupervisorHandle)> = {
            let mut machines = self.machines.lock().await;
            machines.drain().collect()
        };
        let deadline = self.config.shutdown_timeout();
        let stops = entries.into_iter().map(|(name, handle)| async move {
            if !handle.stop_and_join(deadline).await {
                warn!(machine = %name, "supervisor did not stop in time, abandoned");
            }
        });
        join_all(stops).await;

        self.flush_now();
        info!("coordinator shut down");
    }
}
