//! The process-wide NexFi context.
//!
//! Built once at startup from a [`ClientConfig`] and the host's
//! [`Platform`] capabilities, then passed to whoever needs it. Owns the
//! store actor, the LAN service and the sync watcher.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use nexfi_lan::{
    spawn_lan, ConnectionFactory, DisabledConnections, LanConfig, LanDeps, LanHandle,
    SignalingChannel, WebRtcConnectionFactory,
};
use nexfi_shared::protocol::{DmPayload, SignalEnvelope};
use nexfi_shared::UserId;
use nexfi_store::{Database, Message, StoreHandle};
use nexfi_sync::{
    start_sync_watcher, AlwaysOnline, Connectivity, HttpBackend, SyncBackend, SyncEngine,
    SyncOutcome, SyncWatcher,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Capabilities supplied by the host.
pub struct Platform {
    /// Outbound half of the signaling channel.
    pub signaling: Arc<dyn SignalingChannel>,
    /// Inbound signaling envelopes for this user.
    pub inbound_signals: mpsc::Receiver<SignalEnvelope>,
    /// Peer connection factory. `None` selects WebRTC with the configured
    /// ICE servers.
    pub connections: Option<Arc<dyn ConnectionFactory>>,
    pub connectivity: Arc<dyn Connectivity>,
    /// Sync backend. `None` selects HTTP against the configured API.
    pub backend: Option<Arc<dyn SyncBackend>>,
}

impl Platform {
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        inbound_signals: mpsc::Receiver<SignalEnvelope>,
    ) -> Self {
        Self {
            signaling,
            inbound_signals,
            connections: None,
            connectivity: Arc::new(AlwaysOnline::default()),
            backend: None,
        }
    }

    pub fn with_connections(mut self, connections: Arc<dyn ConnectionFactory>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn SyncBackend>) -> Self {
        self.backend = Some(backend);
        self
    }
}

/// Content of a message about to be sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDraft {
    pub text: String,
    pub image: Option<String>,
    pub voice: Option<String>,
    pub mood: Option<String>,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self.image.is_none()
            && self.voice.is_none()
            && self.mood.is_none()
    }
}

/// How a sent message left the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRoute {
    /// Written to an open direct channel.
    Direct,
    /// No open channel; the message waits for the next sync pass.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub local_id: String,
    pub route: DeliveryRoute,
}

pub struct NexfiContext {
    user: UserId,
    store: StoreHandle,
    lan: LanHandle,
    engine: Arc<SyncEngine>,
    watcher: SyncWatcher,
}

impl NexfiContext {
    /// Open the store and start the LAN service and the sync watcher.
    pub async fn start(config: ClientConfig, platform: Platform) -> Result<Self> {
        let user = config
            .user_id
            .clone()
            .ok_or_else(|| ClientError::Config("NEXFI_USER_ID is not set".into()))?;

        let db = match &config.db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        let store = StoreHandle::spawn(db)?;

        let connections: Arc<dyn ConnectionFactory> = if !config.lan_enabled {
            info!("direct connections disabled");
            Arc::new(DisabledConnections)
        } else {
            match platform.connections {
                Some(connections) => connections,
                None => Arc::new(WebRtcConnectionFactory::new(config.ice_servers.clone())),
            }
        };

        let lan = spawn_lan(
            LanConfig::new(user.clone()),
            LanDeps {
                connections,
                signaling: platform.signaling,
                store: store.clone(),
            },
            platform.inbound_signals,
        );

        let backend: Arc<dyn SyncBackend> = match platform.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::new(
                &config.api_url,
                config.api_timeout,
                config.api_token.clone(),
            )?),
        };

        let engine = Arc::new(
            SyncEngine::new(store.clone(), backend)
                .with_on_complete(|synced| info!(synced, "messages reconciled with backend")),
        );
        let watcher = start_sync_watcher(
            Arc::clone(&engine),
            platform.connectivity,
            config.sync_schedule(),
        );

        info!(user = %user, "NexFi context started");

        Ok(Self {
            user,
            store,
            lan,
            engine,
            watcher,
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn lan(&self) -> &LanHandle {
        &self.lan
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Author a message to `to`, persist it as `local`, then try the direct
    /// channel. Without one the sync watcher is nudged instead.
    pub async fn send_direct_message(
        &self,
        to: &UserId,
        draft: MessageDraft,
    ) -> Result<SendReceipt> {
        if draft.is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        let mut message = Message::local(self.user.clone(), to.clone(), draft.text);
        message.image = draft.image;
        message.voice = draft.voice;
        message.mood = draft.mood;

        self.store.upsert(vec![message.clone()]).await?;

        let local_id = message.id.clone();
        let payload = DmPayload {
            local_id: message.id,
            from_user_id: message.from_user_id,
            to_user_id: message.to_user_id,
            text: message.text,
            image: message.image,
            voice: message.voice,
            mood: message.mood,
            timestamp: Some(message.timestamp),
        };

        let route = if self.lan.send_message(to, payload).await {
            DeliveryRoute::Direct
        } else {
            debug!(peer = %to, msg_id = %local_id, "no direct channel, deferring to sync");
            self.watcher.trigger();
            DeliveryRoute::Deferred
        };

        Ok(SendReceipt { local_id, route })
    }

    /// Begin negotiating a direct session with `peer`.
    pub async fn open_chat(&self, peer: &UserId) -> Result<()> {
        self.lan.connect_to_peer(peer).await?;
        Ok(())
    }

    /// Every message exchanged with `peer`, oldest first.
    pub async fn conversation(&self, peer: &UserId) -> Result<Vec<Message>> {
        Ok(self.store.conversation(&self.user, peer).await?)
    }

    /// Run a sync pass now and wait for it.
    pub async fn sync_now(&self) -> SyncOutcome {
        self.engine.sync_now().await
    }

    pub async fn shutdown(&self) {
        self.watcher.stop().await;
        self.lan.teardown().await;
        self.store.shutdown().await;
        info!(user = %self.user, "NexFi context stopped");
    }
}
