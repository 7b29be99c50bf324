//! Sync pass: push every unsynced message to the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use nexfi_shared::protocol::SyncRequest;
use nexfi_store::{Message, StoreHandle, Transition};

use crate::backend::SyncBackend;
use crate::error::{Result, SyncError};

/// Invoked with the number of messages synced by a pass, when non-zero.
pub type CompletionCallback = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another pass was in progress; this trigger was dropped.
    AlreadyRunning,
    Completed(SyncReport),
}

pub struct SyncEngine {
    store: StoreHandle,
    backend: Arc<dyn SyncBackend>,
    syncing: AtomicBool,
    on_complete: Option<CompletionCallback>,
}

/// Clears the `syncing` flag when a pass ends, including by cancellation.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(store: StoreHandle, backend: Arc<dyn SyncBackend>) -> Self {
        Self {
            store,
            backend,
            syncing: AtomicBool::new(false),
            on_complete: None,
        }
    }

    pub fn with_on_complete(mut self, callback: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Run one pass unless one is already running.
    ///
    /// Records are pushed one at a time, oldest first. A failed record is
    /// logged and left unsynced; the pass continues with the next one.
    pub async fn sync_now(&self) -> SyncOutcome {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already in progress, dropping trigger");
            return SyncOutcome::AlreadyRunning;
        }
        let guard = SyncingGuard(&self.syncing);

        let pending = match self.store.get_unsynced().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "failed to read unsynced messages");
                Vec::new()
            }
        };

        let mut report = SyncReport {
            attempted: pending.len(),
            ..SyncReport::default()
        };

        for message in &pending {
            match self.sync_one(message).await {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    warn!(msg_id = %message.id, error = %e, "failed to sync message");
                    report.failed += 1;
                }
            }
        }

        drop(guard);

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                "sync pass finished"
            );
        }
        if report.synced > 0 {
            if let Some(callback) = &self.on_complete {
                callback(report.synced);
            }
        }

        SyncOutcome::Completed(report)
    }

    async fn sync_one(&self, message: &Message) -> Result<()> {
        let response = self.backend.push(&sync_request(message)).await?;
        if !response.success {
            return Err(SyncError::Rejected);
        }
        let remote_id = response.message_id.ok_or(SyncError::MissingMessageId)?;

        match self.store.mark_synced(&message.id, &remote_id).await? {
            Transition::Applied => debug!(msg_id = %message.id, remote_id = %remote_id, "message synced"),
            Transition::Unchanged => debug!(msg_id = %message.id, "message was already synced"),
            Transition::NotFound => warn!(msg_id = %message.id, "synced message no longer in store"),
        }
        Ok(())
    }
}

fn sync_request(message: &Message) -> SyncRequest {
    SyncRequest {
        from_user_id: message.from_user_id.clone(),
        to_user_id: message.to_user_id.clone(),
        text: message.text.clone(),
        image: message.image.clone(),
        voice: message.voice.clone(),
        mood: message.mood.clone(),
        local_id: message.id.clone(),
        timestamp: message.timestamp,
    }
}
