//! Keeps the daemon's state in line with client demand
//!
//! The loop wakes whenever the connection count changes, with a short poll
//! interval as a safety net, and issues at most one Start or Stop per tick.

use crate::app::wait_for_shutdown;
use crate::counter::ConnectionCounter;
use crate::process::{ProcessState, ProcessSupervisor, SupervisorError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default safety-net polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a single tick decided to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationDecision {
    NoAction,
    RequestStart,
    RequestStop,
}

/// Compare demand against the daemon's state.
///
/// The daemon should run iff `count > 0`. A Stop is only requested once the
/// count has been zero for `stop_after_idle_ticks` consecutive ticks
/// (`idle_ticks` includes the current one). `Starting` permits neither
/// transition.
pub fn decide(
    count: usize,
    state: ProcessState,
    idle_ticks: u32,
    stop_after_idle_ticks: u32,
) -> ReconciliationDecision {
    match state {
        ProcessState::Stopped if count > 0 => ReconciliationDecision::RequestStart,
        ProcessState::Running if count == 0 && idle_ticks >= stop_after_idle_ticks.max(1) => {
            ReconciliationDecision::RequestStop
        }
        _ => ReconciliationDecision::NoAction,
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Upper bound on the time between ticks
    pub poll_interval: Duration,
    /// Consecutive idle ticks required before stopping (1 = stop on the first)
    pub stop_after_idle_ticks: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_after_idle_ticks: 1,
        }
    }
}

pub struct ReconciliationLoop {
    counter: Arc<ConnectionCounter>,
    supervisor: Arc<ProcessSupervisor>,
    config: ReconcileConfig,
    last_count: usize,
    idle_ticks: u32,
    reported_exit: bool,
}

impl ReconciliationLoop {
    pub fn new(
        counter: Arc<ConnectionCounter>,
        supervisor: Arc<ProcessSupervisor>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            counter,
            supervisor,
            config,
            last_count: 0,
            idle_ticks: 0,
            reported_exit: false,
        }
    }

    /// Run one reconciliation and return the decision it acted on.
    ///
    /// Usage errors only happen when something else transitioned the daemon
    /// between the state read and the call; they are logged and the next
    /// tick sees the new state. Every other supervisor error is returned.
    pub async fn tick(&mut self) -> Result<ReconciliationDecision, SupervisorError> {
        let count = self.counter.count();
        if count != self.last_count {
            debug!(from = self.last_count, to = count, "Connection count changed");
            self.last_count = count;
        }

        if count == 0 {
            self.idle_ticks = self.idle_ticks.saturating_add(1);
        } else {
            self.idle_ticks = 0;
        }

        let state = self.supervisor.state();
        self.check_unexpected_exit(state);

        let decision = decide(count, state, self.idle_ticks, self.config.stop_after_idle_ticks);
        let result = match decision {
            ReconciliationDecision::NoAction => return Ok(decision),
            ReconciliationDecision::RequestStart => {
                info!(connections = count, "Active connections detected and daemon is not running, starting");
                self.supervisor.start().await
            }
            ReconciliationDecision::RequestStop => {
                info!("No active connections and daemon is running, stopping");
                self.supervisor.stop().await
            }
        };

        match result {
            Ok(()) => Ok(decision),
            Err(e) if e.is_usage() => {
                warn!(error = %e, "Daemon transition raced with another caller, retrying next tick");
                Ok(ReconciliationDecision::NoAction)
            }
            Err(e) => Err(e),
        }
    }

    /// A daemon that exits on its own keeps reporting Running; this only
    /// makes that visible in the logs.
    fn check_unexpected_exit(&mut self, state: ProcessState) {
        if state != ProcessState::Running {
            self.reported_exit = false;
            return;
        }
        if self.reported_exit {
            return;
        }
        if let Some(status) = self.supervisor.exited_status() {
            warn!(%status, "Daemon exited on its own, still tracked as running until the next stop");
            self.reported_exit = true;
        }
    }

    /// Reconcile until shutdown, or until a supervisor error that cannot be
    /// retried.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            stop_after_idle_ticks = self.config.stop_after_idle_ticks,
            "Reconciliation loop started"
        );

        let counter = Arc::clone(&self.counter);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "Daemon transition failed, giving up");
                return Err(e);
            }

            tokio::select! {
                _ = counter.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        debug!("Reconciliation loop stopped");
        Ok(())
    }
}
