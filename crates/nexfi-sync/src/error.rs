use nexfi_store::StoreError;
use thiserror::Error;

/// Errors produced while pushing messages to the backend.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport failure, timeout or undecodable response body.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status code.
    #[error("Backend returned status {0}")]
    Status(u16),

    /// The backend answered `success: false`.
    #[error("Backend rejected the message")]
    Rejected,

    /// The backend reported success without assigning an id.
    #[error("Backend response carried no message_id")]
    MissingMessageId,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
