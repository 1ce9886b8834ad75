//! Idlegate - a reverse proxy that runs its backend only while clients are connected
//!
//! This library provides:
//! - An HTTP/1.1 and HTTP/2 reverse proxy to a single backend URL
//! - Live client connection counting through a connection state hook
//! - A supervisor that starts and stops one shell-command daemon
//! - A reconciliation loop that keeps the daemon running iff connections exist
//! - A readiness gate that holds requests until the backend answers
//! - Ordered, bounded shutdown on SIGINT/SIGTERM

pub mod app;
pub mod config;
pub mod counter;
pub mod error;
pub mod gate;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod reconcile;
