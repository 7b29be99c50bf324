//! [`ConnectionFactory`] backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use nexfi_shared::constants::{DATA_CHANNEL_LABEL, DEFAULT_ICE_SERVERS};
use nexfi_shared::protocol::{IceCandidate, SdpKind, SessionDescription};
use nexfi_shared::UserId;

use crate::error::{LanError, Result};
use crate::transport::{
    ConnectionFactory, ConnectionState, DataChannel, PeerConnection, TransportEvent,
};

fn webrtc_err(e: webrtc::Error) -> LanError {
    LanError::WebRtc(e.to_string())
}

pub struct WebRtcConnectionFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcConnectionFactory {
    /// An empty `ice_servers` list falls back to the public STUN servers.
    pub fn new(ice_servers: Vec<String>) -> Self {
        let ice_servers = if ice_servers.is_empty() {
            DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            ice_servers
        };
        Self {
            api: APIBuilder::new().build(),
            ice_servers,
        }
    }
}

impl Default for WebRtcConnectionFactory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        peer: &UserId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(webrtc_err)?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!(error = %e, "failed to serialize local ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::ConnectionState(map_state(state)));
            })
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    debug!(label = %dc.label(), "ignoring unexpected data channel");
                    return;
                }
                let channel = WebRtcChannel { inner: dc.clone() };
                let _ = tx.send(TransportEvent::RemoteChannel(Arc::new(channel)));
                wire_channel(&dc, tx);
            })
        }));

        debug!(peer = %peer, "webrtc peer connection created");
        Ok(Box::new(WebRtcConnection { pc, events }))
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

/// Forward a data channel's lifecycle and text frames into the session's
/// event stream.
fn wire_channel(dc: &Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<TransportEvent>) {
    let open_tx = tx.clone();
    dc.on_open(Box::new(move || {
        let tx = open_tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelOpen);
        })
    }));

    let close_tx = tx.clone();
    dc.on_close(Box::new(move || {
        let tx = close_tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelClosed);
        })
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            if !msg.is_string {
                debug!(len = msg.data.len(), "ignoring binary data channel frame");
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(TransportEvent::ChannelMessage(text));
                }
                Err(e) => warn!(error = %e, "dropping non-UTF-8 text frame"),
            }
        })
    }));

    // The channel may have opened before the handlers were attached.
    if dc.ready_state() == RTCDataChannelState::Open {
        let _ = tx.send(TransportEvent::ChannelOpen);
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(webrtc_err)?;
        wire_channel(&dc, self.events.clone());
        Ok(Arc::new(WebRtcChannel { inner: dc }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let desc = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpKind::Rollback => {
                return Err(LanError::WebRtc("rollback descriptions are not supported".into()))
            }
        }
        .map_err(webrtc_err)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(webrtc_err)
    }
}

struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(LanError::ChannelClosed);
        }
        self.inner.send_text(text).await.map_err(webrtc_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_map_to_terminal() {
        assert!(map_state(RTCPeerConnectionState::Failed).is_terminal());
        assert!(map_state(RTCPeerConnectionState::Disconnected).is_terminal());
        assert!(map_state(RTCPeerConnectionState::Closed).is_terminal());
        assert!(!map_state(RTCPeerConnectionState::Connected).is_terminal());
    }

    #[tokio::test]
    async fn initiator_produces_an_offer() {
        let factory = WebRtcConnectionFactory::new(Vec::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = factory.create(&"peer".into(), tx).await.unwrap();

        conn.create_data_channel(DATA_CHANNEL_LABEL).await.unwrap();
        let offer = conn.create_offer().await.unwrap();

        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        conn.close().await.unwrap();
    }
}
