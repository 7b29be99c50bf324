use nexfi_shared::ProtocolError;
use nexfi_store::StoreError;
use thiserror::Error;

/// Errors produced by the direct-transport layer.
#[derive(Error, Debug)]
pub enum LanError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Data channel is not open")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A peer session did not open before its connect deadline.
    #[error("Peer session timed out")]
    Timeout,

    /// The LAN service task has exited.
    #[error("LAN service is no longer running")]
    ServiceStopped,

    /// Direct connections are disabled on this platform.
    #[error("Direct connections are unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, LanError>;
