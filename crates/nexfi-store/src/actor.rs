//! Async front end for [`Database`].
//!
//! `rusqlite::Connection` is blocking and `!Sync`, so a single dedicated
//! thread owns the database and serves commands sent over a channel. Every
//! store operation is therefore atomic with respect to every other one.

use std::thread;

use tokio::sync::{mpsc, oneshot};

use nexfi_shared::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, Transition};

const COMMAND_BUFFER: usize = 64;

enum StoreCommand {
    Upsert {
        messages: Vec<Message>,
        resp: oneshot::Sender<Result<()>>,
    },
    Get {
        id: String,
        resp: oneshot::Sender<Result<Option<Message>>>,
    },
    GetUnsynced {
        resp: oneshot::Sender<Result<Vec<Message>>>,
    },
    MarkDelivered {
        id: String,
        resp: oneshot::Sender<Result<Transition>>,
    },
    MarkSynced {
        id: String,
        remote_id: String,
        resp: oneshot::Sender<Result<Transition>>,
    },
    Conversation {
        a: UserId,
        b: UserId,
        resp: oneshot::Sender<Result<Vec<Message>>>,
    },
    Count {
        resp: oneshot::Sender<Result<u64>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the store thread.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Move `db` onto a new store thread and return a handle to it.
    pub fn spawn(db: Database) -> Result<Self> {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        thread::Builder::new()
            .name("nexfi-store".into())
            .spawn(move || run(db, rx))?;
        Ok(Self { tx })
    }

    /// Insert or update messages; see [`Database::upsert_messages`].
    pub async fn upsert(&self, messages: Vec<Message>) -> Result<()> {
        self.request(|resp| StoreCommand::Upsert { messages, resp })
            .await?
    }

    pub async fn get(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_string();
        self.request(|resp| StoreCommand::Get { id, resp }).await?
    }

    pub async fn get_unsynced(&self) -> Result<Vec<Message>> {
        self.request(|resp| StoreCommand::GetUnsynced { resp })
            .await?
    }

    pub async fn mark_delivered(&self, id: &str) -> Result<Transition> {
        let id = id.to_string();
        self.request(|resp| StoreCommand::MarkDelivered { id, resp })
            .await?
    }

    pub async fn mark_synced(&self, id: &str, remote_id: &str) -> Result<Transition> {
        let id = id.to_string();
        let remote_id = remote_id.to_string();
        self.request(|resp| StoreCommand::MarkSynced {
            id,
            remote_id,
            resp,
        })
        .await?
    }

    pub async fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>> {
        let (a, b) = (a.clone(), b.clone());
        self.request(|resp| StoreCommand::Conversation { a, b, resp })
            .await?
    }

    pub async fn count(&self) -> Result<u64> {
        self.request(|resp| StoreCommand::Count { resp }).await?
    }

    /// Stop the store thread once queued commands are served. Later calls
    /// on any clone fail with [`StoreError::ActorClosed`].
    pub async fn shutdown(&self) {
        if self.request(|resp| StoreCommand::Shutdown { resp }).await.is_err() {
            tracing::debug!("store actor already stopped");
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> StoreCommand,
    ) -> Result<T> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(make(resp))
            .await
            .map_err(|_| StoreError::ActorClosed)?;
        rx.await.map_err(|_| StoreError::ActorClosed)
    }
}

fn run(mut db: Database, mut rx: mpsc::Receiver<StoreCommand>) {
    tracing::debug!("store actor started");

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            StoreCommand::Upsert { messages, resp } => {
                let result = db.upsert_messages(&messages);
                if let Err(ref e) = result {
                    tracing::warn!(error = %e, count = messages.len(), "upsert failed");
                }
                let _ = resp.send(result);
            }
            StoreCommand::Get { id, resp } => {
                let _ = resp.send(db.get_message(&id));
            }
            StoreCommand::GetUnsynced { resp } => {
                let _ = resp.send(db.get_unsynced_messages());
            }
            StoreCommand::MarkDelivered { id, resp } => {
                let _ = resp.send(db.mark_message_delivered(&id));
            }
            StoreCommand::MarkSynced {
                id,
                remote_id,
                resp,
            } => {
                let _ = resp.send(db.mark_message_synced(&id, &remote_id));
            }
            StoreCommand::Conversation { a, b, resp } => {
                let _ = resp.send(db.get_conversation(&a, &b));
            }
            StoreCommand::Count { resp } => {
                let _ = resp.send(db.count_messages());
            }
            StoreCommand::Shutdown { resp } => {
                rx.close();
                let _ = resp.send(());
                break;
            }
        }
    }

    tracing::debug!("store actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageStatus;

    #[tokio::test]
    async fn handle_serves_all_operations() {
        let store = StoreHandle::spawn(Database::open_in_memory().unwrap()).unwrap();
        let m = Message::local("1".into(), "2".into(), "hi");

        store.upsert(vec![m.clone()]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get_unsynced().await.unwrap().len(), 1);

        assert_eq!(store.mark_delivered(&m.id).await.unwrap(), Transition::Applied);
        assert_eq!(store.mark_synced(&m.id, "77").await.unwrap(), Transition::Applied);

        let stored = store.get(&m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Synced);
        assert_eq!(stored.remote_id.as_deref(), Some("77"));

        let convo = store.conversation(&"2".into(), &"1".into()).await.unwrap();
        assert_eq!(convo.len(), 1);
    }

    #[tokio::test]
    async fn clones_share_one_store_and_shutdown_closes_all() {
        let store = StoreHandle::spawn(Database::open_in_memory().unwrap()).unwrap();
        let other = store.clone();

        other
            .upsert(vec![Message::local("1".into(), "2".into(), "x")])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        store.shutdown().await;
        assert!(matches!(other.count().await, Err(StoreError::ActorClosed)));
        other.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_upserts_are_serialized() {
        let store = StoreHandle::spawn(Database::open_in_memory().unwrap()).unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let m = Message::local("1".into(), "2".into(), format!("m{i}"));
                    store.upsert(vec![m]).await
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 20);
    }
}
