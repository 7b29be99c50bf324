//! LAN service orchestration with a tokio mpsc command pattern.
//!
//! The service loop runs in a dedicated tokio task that exclusively owns the
//! session map and the observer lists. External code talks to it through a
//! cloneable [`LanHandle`]; inbound signaling envelopes arrive on their own
//! channel; session tasks report back on a third. Every check-and-mutate of
//! the session map happens inside a single handler without suspending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nexfi_shared::constants::{MAX_FRAME_SIZE, SESSION_CONNECT_TIMEOUT_SECS};
use nexfi_shared::protocol::{DirectFrame, DmPayload, SdpSignal, SignalEnvelope};
use nexfi_shared::UserId;
use nexfi_store::{Message, StoreHandle};

use crate::error::{LanError, Result};
use crate::session::{
    run_session, Role, SessionCommand, SessionContext, SessionEvent, SessionState,
};
use crate::signaling::SignalingChannel;
use crate::transport::ConnectionFactory;

const COMMAND_BUFFER: usize = 256;

/// Observer invoked with every persisted inbound message.
pub type MessageListener = Box<dyn Fn(&Message) + Send>;
/// Observer invoked when a peer session opens or closes.
pub type StatusListener = Box<dyn Fn(&UserId, SessionState) + Send>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub struct LanConfig {
    /// Id of the user on this device; envelopes addressed elsewhere are dropped.
    pub local_user: UserId,
    /// How long teardown waits for each session to close before aborting it.
    pub teardown_grace: Duration,
    /// A session still connecting after this long is closed.
    pub connect_timeout: Duration,
}

impl LanConfig {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            teardown_grace: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(SESSION_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Capabilities the service is built on, chosen once at startup.
pub struct LanDeps {
    pub connections: Arc<dyn ConnectionFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub store: StoreHandle,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum LanCommand {
    Connect(UserId),
    IsReachable(UserId, oneshot::Sender<bool>),
    State(UserId, oneshot::Sender<Option<SessionState>>),
    Send {
        peer: UserId,
        frame: String,
        resp: oneshot::Sender<bool>,
    },
    OnMessage(MessageListener),
    OnStatus(StatusListener),
    Teardown(oneshot::Sender<()>),
}

/// Cloneable handle to the LAN service task.
#[derive(Clone)]
pub struct LanHandle {
    tx: mpsc::Sender<LanCommand>,
    local_user: UserId,
}

impl LanHandle {
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Start negotiating a direct session with `peer`. Does nothing if a
    /// session is already connecting or open.
    pub async fn connect_to_peer(&self, peer: &UserId) -> Result<()> {
        self.tx
            .send(LanCommand::Connect(peer.clone()))
            .await
            .map_err(|_| LanError::ServiceStopped)
    }

    /// Whether a session with `peer` exists and its data channel is open.
    pub async fn is_peer_reachable(&self, peer: &UserId) -> bool {
        self.query(|resp| LanCommand::IsReachable(peer.clone(), resp))
            .await
            .unwrap_or(false)
    }

    pub async fn session_state(&self, peer: &UserId) -> Option<SessionState> {
        self.query(|resp| LanCommand::State(peer.clone(), resp))
            .await
            .flatten()
    }

    /// Write one `dm` frame to `peer`.
    ///
    /// Returns `false` when there is no open channel, the frame exceeds
    /// [`MAX_FRAME_SIZE`], or the write fails. Never errors: callers fall
    /// back to the backend path on `false`.
    pub async fn send_message(&self, peer: &UserId, payload: DmPayload) -> bool {
        let frame = match DirectFrame::Dm(payload).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to encode direct frame");
                return false;
            }
        };

        if frame.len() > MAX_FRAME_SIZE {
            warn!(peer = %peer, size = frame.len(), "direct frame exceeds size cap");
            return false;
        }

        self.query(|resp| LanCommand::Send {
            peer: peer.clone(),
            frame,
            resp,
        })
        .await
        .unwrap_or(false)
    }

    /// Register a listener for stored inbound messages. Listeners run on the
    /// service task in registration order and must not block.
    pub async fn on_message(&self, listener: impl Fn(&Message) + Send + 'static) -> Result<()> {
        self.tx
            .send(LanCommand::OnMessage(Box::new(listener)))
            .await
            .map_err(|_| LanError::ServiceStopped)
    }

    /// Register a listener for session open/close transitions.
    pub async fn on_status_change(
        &self,
        listener: impl Fn(&UserId, SessionState) + Send + 'static,
    ) -> Result<()> {
        self.tx
            .send(LanCommand::OnStatus(Box::new(listener)))
            .await
            .map_err(|_| LanError::ServiceStopped)
    }

    /// Close every session and forget all session state. Listeners stay
    /// registered. Safe to call repeatedly.
    pub async fn teardown(&self) {
        if self.query(LanCommand::Teardown).await.is_none() {
            debug!("teardown requested after LAN service stopped");
        }
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> LanCommand) -> Option<T> {
        let (resp, rx) = oneshot::channel();
        self.tx.send(make(resp)).await.ok()?;
        rx.await.ok()
    }
}

// ---------------------------------------------------------------------------
// Service task
// ---------------------------------------------------------------------------

struct SessionEntry {
    id: u64,
    state: SessionState,
    initiator: bool,
    commands: mpsc::UnboundedSender<SessionCommand>,
    join: JoinHandle<()>,
}

struct LanService {
    config: LanConfig,
    deps: LanDeps,
    sessions: HashMap<UserId, SessionEntry>,
    next_session_id: u64,
    message_listeners: Vec<MessageListener>,
    status_listeners: Vec<StatusListener>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Spawn the LAN service in a background tokio task.
///
/// `inbound` carries signaling envelopes received by the host; the service
/// keeps running after it closes, it just stops accepting remote offers.
pub fn spawn_lan(
    config: LanConfig,
    deps: LanDeps,
    mut inbound: mpsc::Receiver<SignalEnvelope>,
) -> LanHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<LanCommand>(COMMAND_BUFFER);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let local_user = config.local_user.clone();

    info!(user = %local_user, "LAN service starting");

    let mut service = LanService {
        config,
        deps,
        sessions: HashMap::new(),
        next_session_id: 1,
        message_listeners: Vec::new(),
        status_listeners: Vec::new(),
        events_tx,
    };

    tokio::spawn(async move {
        let mut inbound_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => service.handle_command(cmd),
                        None => break,
                    }
                }

                envelope = inbound.recv(), if inbound_open => {
                    match envelope {
                        Some(envelope) => service.handle_signal(envelope),
                        None => {
                            debug!("inbound signaling channel closed");
                            inbound_open = false;
                        }
                    }
                }

                Some(event) = events_rx.recv() => service.handle_session_event(event),
            }
        }

        service.close_all();
        info!("LAN service stopped");
    });

    LanHandle {
        tx: cmd_tx,
        local_user,
    }
}

impl LanService {
    fn handle_command(&mut self, cmd: LanCommand) {
        match cmd {
            LanCommand::Connect(peer) => self.connect(peer),
            LanCommand::IsReachable(peer, resp) => {
                let open = self
                    .sessions
                    .get(&peer)
                    .is_some_and(|s| s.state == SessionState::Open);
                let _ = resp.send(open);
            }
            LanCommand::State(peer, resp) => {
                let _ = resp.send(self.sessions.get(&peer).map(|s| s.state));
            }
            LanCommand::Send { peer, frame, resp } => match self.sessions.get(&peer) {
                Some(entry) if entry.state == SessionState::Open => {
                    if let Err(mpsc::error::SendError(SessionCommand::Send { resp, .. })) =
                        entry.commands.send(SessionCommand::Send { frame, resp })
                    {
                        let _ = resp.send(false);
                    }
                }
                _ => {
                    debug!(peer = %peer, "no open session for direct send");
                    let _ = resp.send(false);
                }
            },
            LanCommand::OnMessage(listener) => self.message_listeners.push(listener),
            LanCommand::OnStatus(listener) => self.status_listeners.push(listener),
            LanCommand::Teardown(resp) => {
                let joins = self.close_all();
                let grace = self.config.teardown_grace;
                tokio::spawn(async move {
                    futures::future::join_all(joins.into_iter().map(|join| reap(join, grace)))
                        .await;
                    let _ = resp.send(());
                });
            }
        }
    }

    fn connect(&mut self, peer: UserId) {
        if peer == self.config.local_user {
            warn!("refusing to open a direct session with ourselves");
            return;
        }
        if let Some(entry) = self.sessions.get(&peer) {
            if entry.state.is_active() {
                debug!(peer = %peer, state = %entry.state, "session already in progress");
                return;
            }
        }
        info!(peer = %peer, "connecting to peer");
        self.start_session(peer, Role::Initiator);
    }

    fn handle_signal(&mut self, envelope: SignalEnvelope) {
        if envelope.target() != &self.config.local_user {
            debug!(
                event = envelope.event_name(),
                to = %envelope.target(),
                "dropping envelope addressed elsewhere"
            );
            return;
        }

        match envelope {
            SignalEnvelope::Offer(signal) => self.handle_offer(signal),
            SignalEnvelope::Answer(SdpSignal { from, sdp, .. }) => {
                self.forward(&from, "answer", SessionCommand::ApplyAnswer(sdp));
            }
            SignalEnvelope::IceCandidate(signal) => {
                self.forward(&signal.from, "ice", SessionCommand::AddIce(signal.candidate));
            }
        }
    }

    fn handle_offer(&mut self, signal: SdpSignal) {
        let peer = signal.from;

        if let Some(entry) = self.sessions.get(&peer) {
            match entry.state {
                SessionState::Connecting if entry.initiator => {
                    // Both sides offered at once: the smaller id answers. If our
                    // offer was lost the connect timeout frees the slot.
                    if self.config.local_user > peer {
                        debug!(peer = %peer, "offer glare, keeping our own offer");
                        return;
                    }
                    debug!(peer = %peer, "offer glare, yielding to remote offer");
                }
                SessionState::Open => {
                    info!(peer = %peer, "peer renegotiating, replacing open session");
                }
                _ => {}
            }
            if let Some(old) = self.sessions.remove(&peer) {
                let _ = old.commands.send(SessionCommand::Close);
            }
        }

        info!(peer = %peer, "accepting direct offer");
        self.start_session(peer, Role::Responder(signal.sdp));
    }

    fn forward(&mut self, peer: &UserId, kind: &str, cmd: SessionCommand) {
        match self.sessions.get(peer) {
            Some(entry) if entry.state.is_active() => {
                if entry.commands.send(cmd).is_err() {
                    debug!(peer = %peer, kind, "session task already gone");
                }
            }
            _ => debug!(peer = %peer, kind, "no session for signal, dropping"),
        }
    }

    fn start_session(&mut self, peer: UserId, role: Role) {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let initiator = matches!(role, Role::Initiator);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            local: self.config.local_user.clone(),
            peer: peer.clone(),
            session_id: id,
            connect_timeout: self.config.connect_timeout,
            connections: Arc::clone(&self.deps.connections),
            signaling: Arc::clone(&self.deps.signaling),
            store: self.deps.store.clone(),
            events: self.events_tx.clone(),
        };
        let join = tokio::spawn(run_session(ctx, role, commands_rx));

        self.sessions.insert(
            peer,
            SessionEntry {
                id,
                state: SessionState::Connecting,
                initiator,
                commands,
                join,
            },
        );
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::State {
                peer,
                session_id,
                state,
            } => {
                let Some(entry) = self.sessions.get_mut(&peer) else {
                    debug!(peer = %peer, session = session_id, "state report for unknown session");
                    return;
                };
                if entry.id != session_id {
                    debug!(peer = %peer, session = session_id, "ignoring stale session report");
                    return;
                }
                if !entry.state.can_transition_to(state) {
                    return;
                }
                entry.state = state;
                for listener in &self.status_listeners {
                    listener(&peer, state);
                }
            }
            SessionEvent::MessageStored { peer, message } => {
                debug!(peer = %peer, msg_id = %message.id, "notifying message listeners");
                for listener in &self.message_listeners {
                    listener(&message);
                }
            }
        }
    }

    /// Ask every session to close and forget them all.
    fn close_all(&mut self) -> Vec<JoinHandle<()>> {
        if !self.sessions.is_empty() {
            info!(count = self.sessions.len(), "tearing down peer sessions");
        }
        self.sessions
            .drain()
            .map(|(_, entry)| {
                let _ = entry.commands.send(SessionCommand::Close);
                entry.join
            })
            .collect()
    }
}

async fn reap(mut join: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut join).await.is_err() {
        warn!("peer session did not close in time, aborting");
        join.abort();
    }
}
