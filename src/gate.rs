//! Readiness gate in front of the backend
//!
//! Requests are held here until the backend answers a probe. This absorbs
//! the startup latency of a daemon that was just started because a client
//! connected.

use crate::app::wait_for_shutdown;
use crate::pool::{ConnectionPool, PoolError};
use futures::future::BoxFuture;
use hyper::Uri;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Default sleep between failed probes
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default per-attempt probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a single readiness probe failed
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe failed: {0}")]
    Request(#[from] PoolError),
}

/// Why the gate gave up waiting
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("shutting down")]
    ShuttingDown,
}

/// One readiness check against the backend
pub trait ReadinessProbe: Send + Sync {
    fn probe<'a>(&'a self, target: &'a Uri) -> BoxFuture<'a, Result<(), ProbeError>>;
}

/// HEAD request through the pooled client.
///
/// Any HTTP response counts as ready; only transport failures and timeouts
/// keep the gate closed.
pub struct HttpProbe {
    pool: Arc<ConnectionPool>,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(pool: Arc<ConnectionPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

impl ReadinessProbe for HttpProbe {
    fn probe<'a>(&'a self, target: &'a Uri) -> BoxFuture<'a, Result<(), ProbeError>> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.pool.head(target)).await {
                Ok(Ok(status)) => {
                    trace!(backend = %target, %status, "Readiness probe answered");
                    Ok(())
                }
                Ok(Err(e)) => Err(ProbeError::Request(e)),
                Err(_) => Err(ProbeError::Timeout(self.timeout)),
            }
        })
    }
}

pub struct HealthGate {
    target: Uri,
    probe: Arc<dyn ReadinessProbe>,
    retry_interval: Duration,
}

impl HealthGate {
    pub fn new(target: Uri, probe: Arc<dyn ReadinessProbe>, retry_interval: Duration) -> Self {
        Self {
            target,
            probe,
            retry_interval,
        }
    }

    /// Probe until the backend answers, then return the target to forward to.
    ///
    /// There is no retry bound: the reconciliation loop has already been
    /// woken by this request's connection and will start the daemon. The wait
    /// only ends early when shutdown is signalled.
    pub async fn wait_ready(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<Uri, GateError> {
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            let result = tokio::select! {
                result = self.probe.probe(&self.target) => result,
                _ = wait_for_shutdown(shutdown_rx) => return Err(GateError::ShuttingDown),
            };

            match result {
                Ok(()) => {
                    if attempts > 1 {
                        debug!(backend = %self.target, attempts, "Backend became ready");
                    }
                    return Ok(self.target.clone());
                }
                Err(e) => {
                    // Connection refused is expected while the daemon starts
                    trace!(backend = %self.target, attempts, error = %e, "Backend not ready yet");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = wait_for_shutdown(shutdown_rx) => return Err(GateError::ShuttingDown),
            }
        }
    }
}
