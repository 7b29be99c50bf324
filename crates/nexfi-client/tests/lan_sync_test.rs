//! Two clients on one loopback network, each with its own database and a
//! recording sync backend.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use nexfi_client::{ClientConfig, ClientError, DeliveryRoute, MessageDraft, NexfiContext, Platform};
use nexfi_lan::{LoopbackNetwork, SessionState, SignalingHub};
use nexfi_shared::protocol::{SyncRequest, SyncResponse};
use nexfi_shared::UserId;
use nexfi_store::MessageStatus;
use nexfi_sync::{ConnectivityMonitor, SyncBackend, SyncOutcome};

#[derive(Default)]
struct RecordingBackend {
    pushed: Mutex<Vec<SyncRequest>>,
}

impl RecordingBackend {
    fn pushed_ids(&self) -> Vec<String> {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.local_id.clone())
            .collect()
    }
}

#[async_trait]
impl SyncBackend for RecordingBackend {
    async fn push(&self, request: &SyncRequest) -> nexfi_sync::Result<SyncResponse> {
        let mut pushed = self.pushed.lock().unwrap();
        pushed.push(request.clone());
        Ok(SyncResponse {
            success: true,
            message_id: Some(pushed.len().to_string()),
        })
    }
}

struct Node {
    ctx: NexfiContext,
    backend: Arc<RecordingBackend>,
    _dir: TempDir,
}

async fn start_node(user: &str, net: &LoopbackNetwork, hub: &SignalingHub) -> Result<Node> {
    let dir = tempfile::tempdir()?;
    let user = UserId::from(user);

    let config = ClientConfig {
        user_id: Some(user.clone()),
        db_path: Some(dir.path().join("nexfi.db")),
        ..ClientConfig::default()
    };

    let (signaling, inbound) = hub.register(user.clone());
    let backend = Arc::new(RecordingBackend::default());
    let platform = Platform::new(signaling, inbound)
        .with_connections(Arc::new(net.connector(user)))
        // Offline: passes run only when a test asks for one.
        .with_connectivity(Arc::new(ConnectivityMonitor::new(false)))
        .with_backend(backend.clone());

    let ctx = NexfiContext::start(config, platform).await?;
    Ok(Node {
        ctx,
        backend,
        _dir: dir,
    })
}

async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

#[tokio::test]
async fn direct_message_is_delivered_acked_and_synced() -> Result<()> {
    let net = LoopbackNetwork::new();
    let hub = SignalingHub::new();
    let alice = start_node("1", &net, &hub).await?;
    let bob = start_node("2", &net, &hub).await?;
    let (a, b) = (UserId::from("1"), UserId::from("2"));

    alice.ctx.open_chat(&b).await?;
    eventually("session to open", || alice.ctx.lan().is_peer_reachable(&b)).await?;

    let receipt = alice
        .ctx
        .send_direct_message(&b, MessageDraft::text("hello over the LAN"))
        .await?;
    assert_eq!(receipt.route, DeliveryRoute::Direct);

    eventually("bob to store the message", || async {
        bob.ctx.conversation(&a).await.map(|m| m.len() == 1).unwrap_or(false)
    })
    .await?;
    let received = bob.ctx.conversation(&a).await?.remove(0);
    assert_eq!(received.id, receipt.local_id);
    assert_eq!(received.text, "hello over the LAN");
    assert_eq!(received.status, MessageStatus::Delivered);
    assert!(!received.sent_by_me);

    eventually("the ack to mark alice's copy delivered", || async {
        matches!(
            alice.ctx.store().get(&receipt.local_id).await,
            Ok(Some(m)) if m.status == MessageStatus::Delivered
        )
    })
    .await?;

    let outcome = alice.ctx.sync_now().await;
    assert!(matches!(outcome, SyncOutcome::Completed(r) if r.synced == 1));
    assert_eq!(alice.backend.pushed_ids(), [receipt.local_id.clone()]);

    let synced = alice
        .ctx
        .store()
        .get(&receipt.local_id)
        .await?
        .context("message vanished")?;
    assert_eq!(synced.status, MessageStatus::Synced);
    assert_eq!(synced.remote_id.as_deref(), Some("1"));

    // A second pass has nothing left to push.
    alice.ctx.sync_now().await;
    assert_eq!(alice.backend.pushed_ids().len(), 1);

    alice.ctx.shutdown().await;
    bob.ctx.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_peer_defers_to_sync() -> Result<()> {
    let net = LoopbackNetwork::new();
    let hub = SignalingHub::new();
    let alice = start_node("1", &net, &hub).await?;
    let carol = UserId::from("3");

    let receipt = alice
        .ctx
        .send_direct_message(&carol, MessageDraft::text("are you there?"))
        .await?;
    assert_eq!(receipt.route, DeliveryRoute::Deferred);

    // The deferred send nudges the watcher even though we are offline.
    eventually("the deferred message to be pushed", || async {
        alice.backend.pushed_ids() == [receipt.local_id.clone()]
    })
    .await?;
    eventually("the message to be marked synced", || async {
        matches!(
            alice.ctx.store().get(&receipt.local_id).await,
            Ok(Some(m)) if m.is_synced()
        )
    })
    .await?;

    let history = alice.ctx.conversation(&carol).await?;
    assert_eq!(history.len(), 1);
    assert!(history[0].sent_by_me);

    alice.ctx.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn empty_draft_is_refused_and_nothing_is_stored() -> Result<()> {
    let net = LoopbackNetwork::new();
    let hub = SignalingHub::new();
    let alice = start_node("1", &net, &hub).await?;

    let err = alice
        .ctx
        .send_direct_message(&UserId::from("2"), MessageDraft::text("   "))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::EmptyMessage));
    assert_eq!(alice.ctx.store().count().await?, 0);

    alice.ctx.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn start_requires_a_user_id() -> Result<()> {
    let hub = SignalingHub::new();
    let (signaling, inbound) = hub.register(UserId::from("1"));
    let dir = tempfile::tempdir()?;

    let config = ClientConfig {
        db_path: Some(dir.path().join("nexfi.db")),
        ..ClientConfig::default()
    };
    let platform = Platform::new(signaling, inbound)
        .with_backend(Arc::new(RecordingBackend::default()));

    match NexfiContext::start(config, platform).await {
        Err(ClientError::Config(_)) => Ok(()),
        Err(e) => bail!("unexpected error: {e}"),
        Ok(_) => bail!("context started without a user id"),
    }
}

#[tokio::test]
async fn lan_disabled_falls_back_to_sync() -> Result<()> {
    let hub = SignalingHub::new();
    let dir = tempfile::tempdir()?;
    let user = UserId::from("1");
    let (signaling, inbound) = hub.register(user.clone());
    let backend = Arc::new(RecordingBackend::default());

    let config = ClientConfig {
        user_id: Some(user),
        db_path: Some(dir.path().join("nexfi.db")),
        lan_enabled: false,
        ..ClientConfig::default()
    };
    let platform = Platform::new(signaling, inbound)
        .with_connectivity(Arc::new(ConnectivityMonitor::new(false)))
        .with_backend(backend.clone());
    let ctx = NexfiContext::start(config, platform).await?;

    let peer = UserId::from("2");
    ctx.open_chat(&peer).await?;
    eventually("the failed session to close", || async {
        !matches!(
            ctx.lan().session_state(&peer).await,
            Some(SessionState::Connecting)
        )
    })
    .await?;

    let receipt = ctx
        .send_direct_message(&peer, MessageDraft::text("fallback"))
        .await?;
    assert_eq!(receipt.route, DeliveryRoute::Deferred);

    ctx.shutdown().await;
    Ok(())
}
