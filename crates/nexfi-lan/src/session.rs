//! One task per peer session.
//!
//! The session task exclusively owns its [`PeerConnection`] and data channel.
//! It negotiates first (initiator: channel + offer, responder: answer), then
//! multiplexes commands from the LAN service with events from the transport.
//! Commands that arrive while negotiation is still in flight wait in the
//! queue and are applied in arrival order afterwards.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use nexfi_shared::constants::DATA_CHANNEL_LABEL;
use nexfi_shared::protocol::{DirectFrame, DmPayload, IceCandidate, SessionDescription, SignalEnvelope};
use nexfi_shared::UserId;
use nexfi_store::{Message, MessageStatus, StoreHandle, Transition};

use crate::error::{LanError, Result};
use crate::signaling::SignalingChannel;
use crate::transport::{ConnectionFactory, DataChannel, PeerConnection, TransportEvent};

/// Lifecycle of a peer session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open)
                | (Self::Connecting, Self::Closed)
                | (Self::Open, Self::Closed)
        )
    }

    /// Whether a session in this state still occupies its peer slot.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

// ---------------------------------------------------------------------------
// Service <-> session messages
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum Role {
    /// This side opens the data channel and sends the offer.
    Initiator,
    /// This side answers the given remote offer.
    Responder(SessionDescription),
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    ApplyAnswer(SessionDescription),
    AddIce(IceCandidate),
    Send {
        frame: String,
        resp: oneshot::Sender<bool>,
    },
    Close,
}

/// Reports from a session task back to the LAN service. `session_id` lets
/// the service discard reports from superseded sessions.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    State {
        peer: UserId,
        session_id: u64,
        state: SessionState,
    },
    MessageStored {
        peer: UserId,
        message: Message,
    },
}

pub(crate) struct SessionContext {
    pub local: UserId,
    pub peer: UserId,
    pub session_id: u64,
    pub connect_timeout: Duration,
    pub connections: Arc<dyn ConnectionFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub store: StoreHandle,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

pub(crate) async fn run_session(
    ctx: SessionContext,
    role: Role,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
    let deadline = Instant::now() + ctx.connect_timeout;

    let conn = match ctx.connections.create(&ctx.peer, transport_tx).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(peer = %ctx.peer, error = %e, "failed to create peer connection");
            ctx.report(SessionState::Closed);
            return;
        }
    };

    let negotiated = match timeout_at(deadline, negotiate(&ctx, conn.as_ref(), role)).await {
        Ok(result) => result,
        Err(_) => Err(LanError::Timeout),
    };
    let mut channel = match negotiated {
        Ok(channel) => channel,
        Err(e) => {
            warn!(peer = %ctx.peer, error = %e, "negotiation failed");
            ctx.report(SessionState::Closed);
            close_connection(&ctx, conn.as_ref()).await;
            return;
        }
    };

    let mut state = SessionState::Connecting;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(SessionCommand::ApplyAnswer(answer)) => {
                        if let Err(e) = conn.set_remote_description(answer).await {
                            warn!(peer = %ctx.peer, error = %e, "failed to apply answer");
                            break;
                        }
                        debug!(peer = %ctx.peer, "remote answer applied");
                    }
                    Some(SessionCommand::AddIce(candidate)) => {
                        if let Err(e) = conn.add_ice_candidate(candidate).await {
                            warn!(peer = %ctx.peer, error = %e, "failed to add remote ICE candidate");
                        }
                    }
                    Some(SessionCommand::Send { frame, resp }) => {
                        let sent = send_frame(&ctx, channel.as_deref(), frame).await;
                        let _ = resp.send(sent);
                    }
                    Some(SessionCommand::Close) | None => break,
                }
            }

            _ = sleep_until(deadline), if state == SessionState::Connecting => {
                warn!(peer = %ctx.peer, session = ctx.session_id, "session did not open in time");
                break;
            }

            event = transport_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        let envelope =
                            SignalEnvelope::ice(ctx.local.clone(), ctx.peer.clone(), candidate);
                        if let Err(e) = ctx.signaling.emit(envelope).await {
                            warn!(peer = %ctx.peer, error = %e, "failed to send ICE candidate");
                        }
                    }
                    TransportEvent::ConnectionState(conn_state) => {
                        debug!(peer = %ctx.peer, state = ?conn_state, "peer connection state changed");
                        if conn_state.is_terminal() {
                            break;
                        }
                    }
                    TransportEvent::RemoteChannel(remote) => {
                        debug!(peer = %ctx.peer, "remote data channel attached");
                        channel = Some(remote);
                    }
                    TransportEvent::ChannelOpen => {
                        if state.can_transition_to(SessionState::Open) {
                            state = SessionState::Open;
                            info!(peer = %ctx.peer, session = ctx.session_id, "direct channel open");
                            ctx.report(state);
                        }
                    }
                    TransportEvent::ChannelClosed => {
                        debug!(peer = %ctx.peer, "direct channel closed");
                        break;
                    }
                    TransportEvent::ChannelMessage(text) => {
                        handle_frame(&ctx, channel.as_deref(), &text).await;
                    }
                }
            }
        }
    }

    info!(peer = %ctx.peer, session = ctx.session_id, "peer session closed");
    ctx.report(SessionState::Closed);
    close_connection(&ctx, conn.as_ref()).await;
}

impl SessionContext {
    fn report(&self, state: SessionState) {
        let _ = self.events.send(SessionEvent::State {
            peer: self.peer.clone(),
            session_id: self.session_id,
            state,
        });
    }
}

async fn negotiate(
    ctx: &SessionContext,
    conn: &dyn PeerConnection,
    role: Role,
) -> Result<Option<Arc<dyn DataChannel>>> {
    match role {
        Role::Initiator => {
            let channel = conn.create_data_channel(DATA_CHANNEL_LABEL).await?;
            let offer = conn.create_offer().await?;
            ctx.signaling
                .emit(SignalEnvelope::offer(ctx.local.clone(), ctx.peer.clone(), offer))
                .await?;
            debug!(peer = %ctx.peer, "offer sent");
            Ok(Some(channel))
        }
        Role::Responder(offer) => {
            conn.set_remote_description(offer).await?;
            let answer = conn.create_answer().await?;
            ctx.signaling
                .emit(SignalEnvelope::answer(ctx.local.clone(), ctx.peer.clone(), answer))
                .await?;
            debug!(peer = %ctx.peer, "answer sent");
            Ok(None)
        }
    }
}

async fn close_connection(ctx: &SessionContext, conn: &dyn PeerConnection) {
    if let Err(e) = conn.close().await {
        debug!(peer = %ctx.peer, error = %e, "error while closing peer connection");
    }
}

async fn send_frame(ctx: &SessionContext, channel: Option<&dyn DataChannel>, frame: String) -> bool {
    let Some(channel) = channel.filter(|c| c.is_open()) else {
        debug!(peer = %ctx.peer, "no open channel for outbound frame");
        return false;
    };
    match channel.send_text(frame).await {
        Ok(()) => true,
        Err(e) => {
            warn!(peer = %ctx.peer, error = %e, "failed to write direct frame");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

async fn handle_frame(ctx: &SessionContext, channel: Option<&dyn DataChannel>, text: &str) {
    match DirectFrame::parse(text) {
        Ok(Some(DirectFrame::Dm(payload))) => handle_dm(ctx, channel, payload).await,
        Ok(Some(DirectFrame::Ack { local_id })) => handle_ack(ctx, &local_id).await,
        Ok(None) => debug!(peer = %ctx.peer, "ignoring frame of unknown type"),
        Err(e) => warn!(peer = %ctx.peer, error = %e, "dropping malformed direct frame"),
    }
}

/// Only our own messages addressed to this peer may be advanced by its ack.
async fn handle_ack(ctx: &SessionContext, local_id: &str) {
    match ctx.store.get(local_id).await {
        Ok(Some(m)) if m.sent_by_me && m.to_user_id == ctx.peer => {}
        Ok(Some(_)) => {
            warn!(peer = %ctx.peer, msg_id = %local_id, "ignoring acknowledgment for a message not sent to this peer");
            return;
        }
        Ok(None) => {
            debug!(peer = %ctx.peer, msg_id = %local_id, "acknowledgment for unknown message");
            return;
        }
        Err(e) => {
            warn!(msg_id = %local_id, error = %e, "failed to look up acknowledged message");
            return;
        }
    }

    match ctx.store.mark_delivered(local_id).await {
        Ok(Transition::Applied) => debug!(peer = %ctx.peer, msg_id = %local_id, "message acknowledged"),
        Ok(_) => {}
        Err(e) => warn!(msg_id = %local_id, error = %e, "failed to record acknowledgment"),
    }
}

async fn handle_dm(ctx: &SessionContext, channel: Option<&dyn DataChannel>, payload: DmPayload) {
    if payload.from_user_id != ctx.peer || payload.to_user_id != ctx.local {
        warn!(
            peer = %ctx.peer,
            msg_id = %payload.local_id,
            from = %payload.from_user_id,
            to = %payload.to_user_id,
            "dropping direct message with foreign addressing"
        );
        return;
    }

    let message = Message {
        id: payload.local_id,
        from_user_id: payload.from_user_id,
        to_user_id: payload.to_user_id,
        text: payload.text,
        image: payload.image,
        voice: payload.voice,
        mood: payload.mood,
        timestamp: payload.timestamp.unwrap_or_else(Utc::now),
        status: MessageStatus::Delivered,
        sent_by_me: false,
        read: false,
        remote_id: None,
    };
    let id = message.id.clone();

    let stored = match ctx.store.upsert(vec![message]).await {
        Ok(()) => ctx.store.get(&id).await,
        Err(e) => Err(e),
    };
    let stored = match stored {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            warn!(msg_id = %id, "stored direct message vanished");
            return;
        }
        Err(e) => {
            warn!(peer = %ctx.peer, msg_id = %id, error = %e, "failed to store direct message");
            return;
        }
    };

    debug!(peer = %ctx.peer, msg_id = %id, "direct message stored");

    match (DirectFrame::Ack { local_id: id.clone() }).to_json() {
        Ok(ack) => {
            send_frame(ctx, channel, ack).await;
        }
        Err(e) => warn!(msg_id = %id, error = %e, "failed to encode acknowledgment"),
    }

    let _ = ctx.events.send(SessionEvent::MessageStored {
        peer: ctx.peer.clone(),
        message: stored,
    });
}
