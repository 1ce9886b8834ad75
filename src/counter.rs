//! Connection tracking for the proxy front door
//!
//! The front door reports every transport-level connection transition to a
//! [`ConnectionObserver`]. [`ConnectionCounter`] turns those transitions into
//! a live count of open client connections, which drives the decision to
//! keep the backend running.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

/// A connection state transition reported by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connection was accepted
    New,
    /// A request started on the connection
    Active,
    /// The connection is waiting for its next request
    Idle,
    /// The connection was taken over by an upgrade tunnel
    Hijacked,
    /// The connection was closed
    Closed,
}

impl ConnectionEvent {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionEvent::New => 0,
            ConnectionEvent::Active => 1,
            ConnectionEvent::Idle => 2,
            ConnectionEvent::Hijacked => 3,
            ConnectionEvent::Closed => 4,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectionEvent::New),
            1 => Some(ConnectionEvent::Active),
            2 => Some(ConnectionEvent::Idle),
            3 => Some(ConnectionEvent::Hijacked),
            4 => Some(ConnectionEvent::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionEvent::New => "new",
            ConnectionEvent::Active => "active",
            ConnectionEvent::Idle => "idle",
            ConnectionEvent::Hijacked => "hijacked",
            ConnectionEvent::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Receives connection state transitions from the front door.
///
/// Called once per transition, from any task, without external locking.
pub trait ConnectionObserver: Send + Sync {
    fn on_state_change(&self, event: ConnectionEvent);
}

const NO_EVENT: u8 = u8::MAX;

/// Counts open client connections
pub struct ConnectionCounter {
    open: AtomicUsize,
    last_event: AtomicU8,
    changed: Notify,
}

impl ConnectionCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of open connections at the time of the call
    pub fn count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Most recently reported event, if any
    pub fn last_event(&self) -> Option<ConnectionEvent> {
        ConnectionEvent::from_u8(self.last_event.load(Ordering::Relaxed))
    }

    /// Wait until the count changes.
    ///
    /// A change that happens between two calls is not lost: `Notify` keeps a
    /// single permit for a waiter that has not arrived yet.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    fn increment(&self) {
        self.open.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_one();
    }

    fn decrement(&self) {
        let result = self
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match result {
            Ok(_) => self.changed.notify_one(),
            Err(_) => warn!("Connection closed without a matching open, ignoring"),
        }
    }
}

impl Default for ConnectionCounter {
    fn default() -> Self {
        Self {
            open: AtomicUsize::new(0),
            last_event: AtomicU8::new(NO_EVENT),
            changed: Notify::new(),
        }
    }
}

impl ConnectionObserver for ConnectionCounter {
    fn on_state_change(&self, event: ConnectionEvent) {
        self.last_event.store(event.as_u8(), Ordering::Relaxed);
        match event {
            ConnectionEvent::New => self.increment(),
            ConnectionEvent::Hijacked | ConnectionEvent::Closed => self.decrement(),
            ConnectionEvent::Active | ConnectionEvent::Idle => {}
        }
    }
}

/// Per-connection guard held by the front door.
///
/// Reports `New` when created and exactly one of `Hijacked` or `Closed` when
/// the last clone is dropped, so an accepted connection can never leak or
/// double-count.
pub struct TrackedConnection {
    observer: Arc<dyn ConnectionObserver>,
    hijacked: AtomicBool,
}

impl TrackedConnection {
    pub fn open(observer: Arc<dyn ConnectionObserver>) -> Arc<Self> {
        observer.on_state_change(ConnectionEvent::New);
        Arc::new(Self {
            observer,
            hijacked: AtomicBool::new(false),
        })
    }

    pub fn active(&self) {
        self.observer.on_state_change(ConnectionEvent::Active);
    }

    pub fn idle(&self) {
        self.observer.on_state_change(ConnectionEvent::Idle);
    }

    /// Mark the connection as handed off to an upgrade tunnel.
    ///
    /// The tunnel must hold a clone of the guard; the final report is then
    /// `Hijacked` and happens when the tunnel ends.
    pub fn hijack(&self) {
        self.hijacked.store(true, Ordering::SeqCst);
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        let event = if self.hijacked.load(Ordering::SeqCst) {
            ConnectionEvent::Hijacked
        } else {
            ConnectionEvent::Closed
        };
        self.observer.on_state_change(event);
    }
}
