//! Host-platform connection capability.
//!
//! A [`ConnectionFactory`] produces one [`PeerConnection`] per peer session.
//! Everything the connection observes asynchronously (local ICE candidates,
//! connectivity changes, data-channel lifecycle and inbound text frames) is
//! pushed into the [`TransportEvent`] sender handed to
//! [`ConnectionFactory::create`], so the owning session task sees one ordered
//! stream of events.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use nexfi_shared::protocol::{IceCandidate, SessionDescription};
use nexfi_shared::UserId;

use crate::error::{LanError, Result};

/// Connectivity as reported by the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the session cannot recover.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Asynchronous notifications from a peer connection to its session.
pub enum TransportEvent {
    /// A local ICE candidate to forward to the remote peer.
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    /// The remote peer opened a data channel towards us.
    RemoteChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    /// A text frame arrived on the data channel.
    ChannelMessage(String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            Self::RemoteChannel(_) => f.write_str("RemoteChannel"),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(&m.len()).finish(),
        }
    }
}

/// An ordered, reliable, text-capable data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;
}

/// One offer/answer/ICE negotiation with a single remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open an ordered data channel from this side.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and install it as the local description. The remote
    /// offer must already be set.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer: &UserId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>>;
}

/// Connection capability for platforms without direct transport. Every
/// attempt fails, so sessions close immediately and callers fall back to
/// the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledConnections;

#[async_trait]
impl ConnectionFactory for DisabledConnections {
    async fn create(
        &self,
        peer: &UserId,
        _events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>> {
        tracing::debug!(peer = %peer, "direct connections disabled");
        Err(LanError::Unavailable)
    }
}
