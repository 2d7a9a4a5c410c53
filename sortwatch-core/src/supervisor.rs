//! Connection supervisor: one independent task per machine.
//!
//! Owns the live session for its machine and is the only writer into that
//! machine's history buffers. Every failure inside the loop is contained
//! here (logged, then a backoff transition) so one machine's
//! instability never affects others or the aggregation writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::history::{normalize, MachineHistory};
use crate::session::{Connector, Session};
use crate::types::{MachineConfig, SupervisorState, TagUpdate};

/// Retry-delay schedule after failed connection attempts: starts at
/// `initial`, doubles each failure, plateaus at `max`, retried forever.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Backoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    fn next(&mut self) -> Duration {
        let d = match self.current {
            None => self.policy.initial,
            Some(d) => (d * 2).min(self.policy.max),
        };
        self.current = Some(d);
        d
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Stop,
    ReconnectNow,
}

/// Handle owned by the coordinator. Dropping it does not stop the task;
/// `stop_and_join` does, with a bounded deadline.
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SupervisorState>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// Short-circuit a backoff wait (or force a fresh session when
    /// connected). No-op if the supervisor already stopped.
    pub async fn reconnect_now(&self) {
        let _ = self.cmd_tx.send(Command::ReconnectNow).await;
    }

    /// Request stop and wait for the task to finish. A task that misses
    /// the deadline is forcibly aborted; returns false in that case.
    pub async fn stop_and_join(self, deadline: Duration) -> bool {
        let _ = self.cmd_tx.send(Command::Stop).await;
        let abort = self.task.abort_handle();
        match tokio::time::timeout(deadline, self.task).await {
            Ok(_) => true,
            Err(_) => {
                abort.abort();
                false
            }
        }
    }
}

pub fn spawn<C: Connector>(
    connector: Arc<C>,
    config: MachineConfig,
    history: Arc<MachineHistory>,
    clamp_threshold: f64,
    policy: BackoffPolicy,
) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (state_tx, state_rx) = watch::channel(SupervisorState::Disconnected);
    let task = tokio::spawn(run(
        connector,
        config,
        history,
        clamp_threshold,
        policy,
        cmd_rx,
        state_tx,
    ));
    SupervisorHandle {
        cmd_tx,
        state_rx,
        task,
    }
}

async fn run<C: Connector>(
    connector: Arc<C>,
    config: MachineConfig,
    history: Arc<MachineHistory>,
    clamp_threshold: f64,
    policy: BackoffPolicy,
    mut cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<SupervisorState>,
) {
    let mut backoff = Backoff::new(policy);

    // Tag-name mapping is fixed per config and applied once per session.
    let tag_map = config.tag_map();
    let tags: Vec<String> = tag_map.iter().map(|(t, _)| t.clone()).collect();
    let counters: HashMap<String, String> = tag_map.into_iter().collect();

    'lifecycle: loop {
        let _ = state_tx.send(SupervisorState::Connecting);
        let connect = connector.connect(&config);
        tokio::pin!(connect);
        let connected = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Stop) | None => break 'lifecycle,
                Some(Command::ReconnectNow) => continue 'lifecycle,
            },
            res = &mut connect => res,
        };

        match connected {
            Ok(mut session) => match session.subscribe(&tags).await {
                Ok(mut updates) => {
                    let _ = state_tx.send(SupervisorState::Connected);
                    backoff.reset();
                    info!(machine = %config.name, endpoint = %config.endpoint, "connected");

                    loop {
                        tokio::select! {
                            cmd = cmd_rx.recv() => match cmd {
                                Some(Command::Stop) | None => {
                                    session.close().await;
                                    break 'lifecycle;
                                }
                                Some(Command::ReconnectNow) => {
                                    info!(machine = %config.name, "forced reconnect");
                                    session.close().await;
                                    continue 'lifecycle;
                                }
                            },
                            update = updates.recv() => match update {
                                Some(u) => deliver(&history, &counters, &config, clamp_threshold, u),
                                None => {
                                    warn!(machine = %config.name, "session lost");
                                    session.close().await;
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    warn!(machine = %config.name, error = %e, "subscribe failed");
                    session.close().await;
                }
            },
            Err(e) => {
                debug!(machine = %config.name, error = %e, "connect failed");
            }
        }

        let _ = state_tx.send(SupervisorState::Backoff);
        let delay = backoff.next();
        debug!(machine = %config.name, delay_secs = delay.as_secs_f64(), "backing off");
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Stop) | None => break 'lifecycle,
                Some(Command::ReconnectNow) => {
                    info!(machine = %config.name, "reconnect requested, skipping backoff wait");
                }
            },
            _ = sleep(delay) => {}
        }
    }

    let _ = state_tx.send(SupervisorState::Disconnected);
    debug!(machine = %config.name, "supervisor stopped");
}

/// The only path that mutates a machine's history buffers. Values are
/// normalized at this ingestion boundary, before they reach the buffer.
fn deliver(
    history: &MachineHistory,
    counters: &HashMap<String, String>,
    config: &MachineConfig,
    clamp_threshold: f64,
    update: TagUpdate,
) {
    let Some(counter) = counters.get(&update.tag) else {
        debug!(machine = %config.name, tag = %update.tag, "update for unsubscribed tag");
        return;
    };
    let value = normalize(update.value, clamp_threshold);
    let timestamp = update.timestamp.unwrap_or_else(Utc::now);
    history.record(counter, timestamp, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_plateaus() {
        let mut b = Backoff::new(BackoffPolicy {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(60),
        });
        let delays: Vec<u64> = (0..6).map(|_| b.next().as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn backoff_reset_restarts_schedule() {
        let mut b = Backoff::new(BackoffPolicy::default());
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(10));
    }
}
