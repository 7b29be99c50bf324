//! # nexfi-sync
//!
//! Reconciles locally held messages with the backend. A [`SyncEngine`] pass
//! pushes every message the store still holds as `local` or `delivered` to
//! `POST /api/messages/sync` and marks each acknowledged one `synced`. The
//! [`SyncWatcher`] decides when passes run.

pub mod backend;
pub mod connectivity;
pub mod engine;
pub mod watcher;

mod error;
#[cfg(test)]
mod testing;

pub use backend::{HttpBackend, SyncBackend, IDEMPOTENCY_HEADER};
pub use connectivity::{AlwaysOnline, Connectivity, ConnectivityMonitor};
pub use engine::{CompletionCallback, SyncEngine, SyncOutcome, SyncReport};
pub use error::{Result, SyncError};
pub use watcher::{start_sync_watcher, SyncSchedule, SyncWatcher};
