//! # nexfi-lan
//!
//! Direct peer-to-peer messaging over a negotiated data channel.
//!
//! A single service task ([`spawn_lan`]) owns every peer session and the
//! observer lists; each session runs in its own task and drives one
//! offer/answer/ICE handshake over the signaling channel. The transport and
//! the signaling channel are capabilities supplied by the host:
//!
//! - [`WebRtcConnectionFactory`]: real WebRTC via the `webrtc` crate
//! - [`LoopbackNetwork`] / [`SignalingHub`]: deterministic in-memory stand-ins
//! - [`DisabledConnections`]: every attempt fails, callers fall back to sync

pub mod loopback;
pub mod manager;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod webrtc_peer;

mod error;

pub use error::{LanError, Result};
pub use loopback::{LoopbackConnector, LoopbackNetwork, SignalingHub};
pub use manager::{spawn_lan, LanConfig, LanDeps, LanHandle, MessageListener, StatusListener};
pub use session::SessionState;
pub use signaling::SignalingChannel;
pub use transport::{
    ConnectionFactory, ConnectionState, DataChannel, DisabledConnections, PeerConnection,
    TransportEvent,
};
pub use webrtc_peer::WebRtcConnectionFactory;
