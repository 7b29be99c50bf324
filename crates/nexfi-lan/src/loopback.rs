//! Deterministic in-memory transport and signaling, for tests and for
//! development without a LAN.
//!
//! A [`LoopbackNetwork`] stands in for the WebRTC stack. Descriptions are
//! `"loopback <conn>"` and each connection offers a single candidate
//! `"candidate:<conn>"`. Two connections link once each has its local and
//! remote description set and has received the other's candidate; the
//! answering side then sees the remote data channel and both sides see it
//! open.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use nexfi_shared::protocol::{IceCandidate, SessionDescription, SignalEnvelope};
use nexfi_shared::UserId;

use crate::error::{LanError, Result};
use crate::signaling::SignalingChannel;
use crate::transport::{
    ConnectionFactory, ConnectionState, DataChannel, PeerConnection, TransportEvent,
};

const INBOUND_BUFFER: usize = 256;
/// Sent frames kept for [`LoopbackNetwork::sent_frames_from`].
const FRAME_LOG_LIMIT: usize = 1024;

// ---------------------------------------------------------------------------
// Signaling hub
// ---------------------------------------------------------------------------

/// In-memory signaling channel routing envelopes by their `to` field.
/// Every emitted envelope is also recorded, delivered or not.
#[derive(Clone, Default)]
pub struct SignalingHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    routes: HashMap<UserId, mpsc::Sender<SignalEnvelope>>,
    emitted: Vec<SignalEnvelope>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `user` to the hub. Returns its outbound channel and the
    /// receiver for envelopes addressed to it.
    pub fn register(
        &self,
        user: UserId,
    ) -> (Arc<dyn SignalingChannel>, mpsc::Receiver<SignalEnvelope>) {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        if let Ok(mut inner) = self.inner.lock() {
            inner.routes.insert(user.clone(), tx);
        }
        let endpoint = HubEndpoint {
            user,
            hub: self.clone(),
        };
        (Arc::new(endpoint), rx)
    }

    /// Every envelope emitted so far, in emission order.
    pub fn emitted(&self) -> Vec<SignalEnvelope> {
        match self.inner.lock() {
            Ok(inner) => inner.emitted.clone(),
            Err(_) => Vec::new(),
        }
    }
}

struct HubEndpoint {
    user: UserId,
    hub: SignalingHub,
}

#[async_trait]
impl SignalingChannel for HubEndpoint {
    async fn emit(&self, envelope: SignalEnvelope) -> Result<()> {
        let route = {
            let mut inner = self
                .hub
                .inner
                .lock()
                .map_err(|e| LanError::Signaling(format!("hub lock poisoned: {e}")))?;
            inner.emitted.push(envelope.clone());
            inner.routes.get(envelope.target()).cloned()
        };

        match route {
            Some(tx) => {
                if tx.send(envelope).await.is_err() {
                    tracing::debug!(from = %self.user, "recipient no longer listening");
                }
            }
            None => tracing::debug!(from = %self.user, to = %envelope.target(), "no route for envelope"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loopback network
// ---------------------------------------------------------------------------

/// Shared in-memory "network" connecting [`LoopbackConnector`]s.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetInner>>,
}

#[derive(Default)]
struct NetInner {
    next_id: u64,
    slots: HashMap<u64, Slot>,
    frames: VecDeque<(UserId, String)>,
}

struct Slot {
    owner: UserId,
    events: mpsc::UnboundedSender<TransportEvent>,
    has_channel: bool,
    local_set: bool,
    remote: Option<u64>,
    got_candidate: bool,
    linked: Option<u64>,
}

impl Slot {
    fn ready(&self) -> bool {
        self.local_set && self.remote.is_some() && self.got_candidate && self.linked.is_none()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection factory for `user` on this network.
    pub fn connector(&self, user: UserId) -> LoopbackConnector {
        LoopbackConnector {
            user,
            net: self.clone(),
        }
    }

    /// Text frames written by `user`'s data channels, in order.
    pub fn sent_frames_from(&self, user: &UserId) -> Vec<String> {
        match self.inner.lock() {
            Ok(inner) => inner
                .frames
                .iter()
                .filter(|(from, _)| from == user)
                .map(|(_, text)| text.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Deliver a raw text frame to `to` as if `from` had written it on their
    /// open channel. Returns false when no such channel is linked. The frame
    /// is not recorded as sent.
    pub fn inject(&self, from: &UserId, to: &UserId, text: &str) -> bool {
        let Ok(inner) = self.inner.lock() else {
            return false;
        };
        let target = inner.slots.values().find_map(|slot| {
            let remote = inner.slots.get(&slot.linked?)?;
            (slot.owner == *from && remote.owner == *to).then_some(remote)
        });
        match target {
            Some(remote) => remote
                .events
                .send(TransportEvent::ChannelMessage(text.to_string()))
                .is_ok(),
            None => false,
        }
    }

    /// Report `state` on every live connection owned by `user`, as a real
    /// stack does when the path to the peer fails. Returns how many
    /// connections were notified.
    pub fn interrupt(&self, user: &UserId, state: ConnectionState) -> usize {
        let Ok(inner) = self.inner.lock() else {
            return 0;
        };
        inner
            .slots
            .values()
            .filter(|slot| slot.owner == *user)
            .filter(|slot| {
                slot.events
                    .send(TransportEvent::ConnectionState(state))
                    .is_ok()
            })
            .count()
    }

    /// Connections created and not yet closed.
    pub fn connection_count(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.slots.len(),
            Err(_) => 0,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, NetInner>> {
        self.inner
            .lock()
            .map_err(|e| LanError::WebRtc(format!("loopback lock poisoned: {e}")))
    }
}

impl NetInner {
    fn slot_mut(&mut self, id: u64) -> Result<&mut Slot> {
        self.slots
            .get_mut(&id)
            .ok_or_else(|| LanError::WebRtc(format!("unknown loopback connection {id}")))
    }

    /// Link `id` with its remote end once both are ready. The side that did
    /// not create the data channel receives it as a remote channel.
    fn try_link(&mut self, net: &LoopbackNetwork, id: u64) {
        let Some(remote_id) = self.slots.get(&id).and_then(|s| s.remote) else {
            return;
        };
        let ready = |s: Option<&Slot>| s.is_some_and(Slot::ready);
        if !ready(self.slots.get(&id)) || !ready(self.slots.get(&remote_id)) {
            return;
        }
        if self.slots.get(&remote_id).and_then(|s| s.remote) != Some(id) {
            return;
        }

        for (this, other) in [(id, remote_id), (remote_id, id)] {
            let Some(slot) = self.slots.get_mut(&this) else {
                continue;
            };
            slot.linked = Some(other);
            let _ = slot
                .events
                .send(TransportEvent::ConnectionState(ConnectionState::Connected));
            if !slot.has_channel {
                let channel = LoopbackChannel {
                    conn: this,
                    net: net.clone(),
                };
                let _ = slot.events.send(TransportEvent::RemoteChannel(Arc::new(channel)));
            }
            let _ = slot.events.send(TransportEvent::ChannelOpen);
        }
        tracing::debug!(a = id, b = remote_id, "loopback connections linked");
    }
}

/// [`ConnectionFactory`] bound to one user on a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackConnector {
    user: UserId,
    net: LoopbackNetwork,
}

#[async_trait]
impl ConnectionFactory for LoopbackConnector {
    async fn create(
        &self,
        peer: &UserId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>> {
        let mut inner = self.net.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.slots.insert(
            id,
            Slot {
                owner: self.user.clone(),
                events,
                has_channel: false,
                local_set: false,
                remote: None,
                got_candidate: false,
                linked: None,
            },
        );
        tracing::debug!(user = %self.user, peer = %peer, conn = id, "loopback connection created");
        Ok(Box::new(LoopbackConnection {
            id,
            net: self.net.clone(),
        }))
    }
}

struct LoopbackConnection {
    id: u64,
    net: LoopbackNetwork,
}

impl LoopbackConnection {
    fn describe_local(&self) -> Result<String> {
        let mut inner = self.net.lock()?;
        let slot = inner.slot_mut(self.id)?;
        slot.local_set = true;
        let _ = slot.events.send(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{}", self.id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        inner.try_link(&self.net, self.id);
        Ok(format!("loopback {}", self.id))
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_data_channel(&self, _label: &str) -> Result<Arc<dyn DataChannel>> {
        self.net.lock()?.slot_mut(self.id)?.has_channel = true;
        Ok(Arc::new(LoopbackChannel {
            conn: self.id,
            net: self.net.clone(),
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(self.describe_local()?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let has_remote = self.net.lock()?.slot_mut(self.id)?.remote.is_some();
        if !has_remote {
            return Err(LanError::WebRtc("answer requested before remote offer".into()));
        }
        Ok(SessionDescription::answer(self.describe_local()?))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = parse_suffix(&description.sdp, "loopback ")?;
        let mut inner = self.net.lock()?;
        inner.slot_mut(self.id)?.remote = Some(remote);
        inner.try_link(&self.net, self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let from = parse_suffix(&candidate.candidate, "candidate:")?;
        let mut inner = self.net.lock()?;
        let slot = inner.slot_mut(self.id)?;
        if slot.remote != Some(from) {
            return Err(LanError::WebRtc(format!(
                "candidate {from} does not match remote description"
            )));
        }
        slot.got_candidate = true;
        inner.try_link(&self.net, self.id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.net.lock()?;
        let Some(slot) = inner.slots.remove(&self.id) else {
            return Ok(());
        };
        if let Some(remote) = slot.linked.and_then(|id| inner.slots.get(&id)) {
            let _ = remote.events.send(TransportEvent::ChannelClosed);
        }
        Ok(())
    }
}

struct LoopbackChannel {
    conn: u64,
    net: LoopbackNetwork,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn is_open(&self) -> bool {
        let Ok(inner) = self.net.inner.lock() else {
            return false;
        };
        inner
            .slots
            .get(&self.conn)
            .and_then(|slot| slot.linked)
            .is_some_and(|id| inner.slots.contains_key(&id))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut inner = self.net.lock()?;
        let slot = inner.slots.get(&self.conn).ok_or(LanError::ChannelClosed)?;
        let remote = slot
            .linked
            .and_then(|id| inner.slots.get(&id))
            .ok_or(LanError::ChannelClosed)?;
        remote
            .events
            .send(TransportEvent::ChannelMessage(text.clone()))
            .map_err(|_| LanError::ChannelClosed)?;
        let owner = slot.owner.clone();
        if inner.frames.len() == FRAME_LOG_LIMIT {
            inner.frames.pop_front();
        }
        inner.frames.push_back((owner, text));
        Ok(())
    }
}

fn parse_suffix(value: &str, prefix: &str) -> Result<u64> {
    value
        .strip_prefix(prefix)
        .and_then(|rest| rest.trim().parse().ok())
        .ok_or_else(|| LanError::WebRtc(format!("unrecognised loopback value {value:?}")))
}
