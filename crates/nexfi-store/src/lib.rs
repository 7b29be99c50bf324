//! # nexfi-store
//!
//! Local message storage for NexFi, backed by SQLite.
//!
//! Every direct message this device authors or receives lands here first,
//! together with its delivery status (`local` → `delivered` → `synced`). The
//! crate exposes a synchronous [`Database`] wrapping a `rusqlite::Connection`
//! with typed helpers, and a cloneable async [`StoreHandle`] that serializes
//! all access through a single store thread.

pub mod actor;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use actor::StoreHandle;
pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
