//! Wiring of all components and the ordered shutdown sequence

use crate::config::Config;
use crate::counter::ConnectionCounter;
use crate::gate::{HealthGate, HttpProbe};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::{ProcessSupervisor, SupervisorError};
use crate::proxy::{ProxyError, ProxyOptions, ProxyServer};
use crate::reconcile::{ReconcileConfig, ReconciliationLoop};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Resolve once `shutdown_rx` holds `true`.
///
/// A dropped sender never resolves, so a receiver outliving its owner does
/// not trigger a spurious shutdown.
pub async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// All long-lived components, built once at startup
pub struct App {
    config: Config,
    counter: Arc<ConnectionCounter>,
    pool: Arc<ConnectionPool>,
    gate: Arc<HealthGate>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    reconcile: ReconcileConfig,
    cancel_tx: watch::Sender<bool>,
}

impl App {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let target = config.backend_uri()?;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let counter = ConnectionCounter::new();
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let probe = Arc::new(HttpProbe::new(Arc::clone(&pool), config.gate.probe_timeout));
        let gate = Arc::new(HealthGate::new(target, probe, config.gate.retry_interval));

        let supervisor = if config.process.enabled() {
            Some(ProcessSupervisor::new(config.process.supervisor_config(), cancel_rx))
        } else {
            None
        };

        Ok(Self {
            reconcile: config.reconcile.loop_config(),
            config,
            counter,
            pool,
            gate,
            supervisor,
            cancel_tx,
        })
    }

    pub fn counter(&self) -> Arc<ConnectionCounter> {
        Arc::clone(&self.counter)
    }

    pub fn supervisor(&self) -> Option<Arc<ProcessSupervisor>> {
        self.supervisor.clone()
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}: {}", addr, e))
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.listen_addr()?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", addr, e))
    }

    /// Serve until `signal` resolves or the reconciliation loop fails, then
    /// shut down in order and return the process exit code.
    ///
    /// Order: cancel the loop, the output consumers and parked requests;
    /// stop the daemon; drain the proxy.
    pub async fn run<F>(self, listener: TcpListener, signal: F) -> i32
    where
        F: Future<Output = ()>,
    {
        let (drain_tx, drain_rx) = watch::channel(false);
        let drain_timeout = self.config.server.drain_timeout;

        let proxy = ProxyServer::new(
            listener,
            self.counter.clone(),
            Arc::clone(&self.gate),
            Arc::clone(&self.pool),
            self.cancel_tx.subscribe(),
            ProxyOptions {
                idle_timeout: self.config.server.idle_timeout,
                drain_timeout,
            },
        );
        let proxy_handle = tokio::spawn(proxy.run(drain_rx));

        let mut loop_handle: Option<JoinHandle<Result<(), SupervisorError>>> =
            self.supervisor.as_ref().map(|supervisor| {
                let reconciler = ReconciliationLoop::new(
                    Arc::clone(&self.counter),
                    Arc::clone(supervisor),
                    self.reconcile.clone(),
                );
                tokio::spawn(reconciler.run(self.cancel_tx.subscribe()))
            });

        if self.supervisor.is_none() {
            info!("No daemon command configured, running as a plain reverse proxy");
        }

        let mut exit_code = 0;
        tokio::pin!(signal);

        match loop_handle.as_mut() {
            Some(handle) => {
                let mut finished = false;
                tokio::select! {
                    _ = &mut signal => {}
                    result = handle => {
                        finished = true;
                        if !loop_succeeded(result) {
                            exit_code = 1;
                        }
                    }
                }
                if finished {
                    loop_handle = None;
                }
            }
            None => signal.await,
        }

        info!("Shutting down");
        self.cancel_tx.send_replace(true);

        if let Some(handle) = loop_handle {
            if !loop_succeeded(handle.await) {
                exit_code = 1;
            }
        }

        if let Some(ref supervisor) = self.supervisor {
            info!("Stopping daemon");
            match supervisor.stop().await {
                Ok(()) => debug!("Daemon stopped"),
                Err(SupervisorError::AlreadyStopped) => debug!("Daemon was not running"),
                Err(e) => {
                    error!(error = %e, "Failed to stop daemon");
                    exit_code = 1;
                }
            }
        }

        info!("Shutting down proxy");
        drain_tx.send_replace(true);

        // The proxy bounds its own drain; the extra second covers abort time
        match tokio::time::timeout(drain_timeout + Duration::from_secs(1), proxy_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e @ ProxyError::DrainTimedOut { .. }))) => {
                info!(reason = %e, "Proxy drain cut short");
            }
            Ok(Err(e)) => {
                error!(error = %e, "Proxy task panicked");
                exit_code = 1;
            }
            Err(_) => {
                warn!("Timed out waiting for proxy to drain");
            }
        }

        info!(exit_code, "Terminating");
        exit_code
    }
}

fn loop_succeeded(result: Result<Result<(), SupervisorError>, tokio::task::JoinError>) -> bool {
    match result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "Reconciliation loop failed");
            false
        }
        Err(e) => {
            error!(error = %e, "Reconciliation loop panicked");
            false
        }
    }
}
