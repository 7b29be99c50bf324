use nexfi_lan::LanError;
use nexfi_store::StoreError;
use nexfi_sync::SyncError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LAN error: {0}")]
    Lan(#[from] LanError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A draft with no text and no attachment.
    #[error("Message has no content")]
    EmptyMessage,
}

pub type Result<T> = std::result::Result<T, ClientError>;
