//! # nexfi-client
//!
//! Wires the message store, the LAN service and the sync engine into one
//! [`NexfiContext`] constructed at startup, and owns the process-level
//! concerns: configuration and tracing.

pub mod config;
pub mod context;

mod error;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use context::{DeliveryRoute, MessageDraft, NexfiContext, Platform, SendReceipt};
pub use error::{ClientError, Result};

const DEFAULT_LOG_FILTER: &str =
    "nexfi_client=debug,nexfi_lan=debug,nexfi_store=info,nexfi_sync=info,warn";

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling this again after a subscriber is installed does nothing.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();

    if installed.is_ok() {
        tracing::info!("tracing initialised");
    }
}
