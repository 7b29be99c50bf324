//! Background scheduling of sync passes.
//!
//! Passes are triggered by a delayed first attempt when online at startup,
//! a periodic timer while online, a debounced "connectivity restored"
//! transition, and manual triggers. Each pass runs in its own task; the
//! engine's `syncing` flag drops triggers that overlap a running pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info};

use nexfi_shared::constants::{
    SYNC_INITIAL_DELAY_MS, SYNC_INTERVAL_SECS, SYNC_RECONNECT_DEBOUNCE_MS,
};

use crate::connectivity::Connectivity;
use crate::engine::SyncEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSchedule {
    /// Period of the timer that runs while online.
    pub interval: Duration,
    /// Delay before the first pass when online at startup.
    pub initial_delay: Duration,
    /// Delay between connectivity returning and the pass it triggers.
    pub reconnect_debounce: Duration,
}

impl Default for SyncSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(SYNC_INTERVAL_SECS),
            initial_delay: Duration::from_millis(SYNC_INITIAL_DELAY_MS),
            reconnect_debounce: Duration::from_millis(SYNC_RECONNECT_DEBOUNCE_MS),
        }
    }
}

#[derive(Debug)]
enum WatcherCommand {
    Trigger,
    Stop,
}

/// Handle to the running watcher task.
pub struct SyncWatcher {
    tx: mpsc::Sender<WatcherCommand>,
    join: JoinHandle<()>,
}

impl SyncWatcher {
    /// Request a pass now. Triggers that arrive while one is queued
    /// coalesce.
    pub fn trigger(&self) {
        if self.tx.try_send(WatcherCommand::Trigger).is_err() {
            debug!("sync trigger dropped");
        }
    }

    /// Stop scheduling further passes. A pass already running is left to
    /// finish. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.tx.send(WatcherCommand::Stop).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.join.is_finished()
    }
}

pub fn start_sync_watcher(
    engine: Arc<SyncEngine>,
    connectivity: Arc<dyn Connectivity>,
    schedule: SyncSchedule,
) -> SyncWatcher {
    let (tx, mut rx) = mpsc::channel(1);

    let join = tokio::spawn(async move {
        let mut online_rx = connectivity.subscribe();
        let mut online = *online_rx.borrow_and_update();
        let mut watching = true;

        let mut ticker = interval_at(Instant::now() + schedule.interval, schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Pending one-shot pass: the startup delay or the reconnect debounce.
        let mut deadline = online.then(|| Instant::now() + schedule.initial_delay);

        info!(online, "sync watcher started");

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(WatcherCommand::Trigger) => {
                        debug!("manual sync trigger");
                        spawn_pass(&engine);
                    }
                    Some(WatcherCommand::Stop) | None => break,
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    spawn_pass(&engine);
                }

                _ = ticker.tick(), if online => {
                    debug!("periodic sync");
                    spawn_pass(&engine);
                }

                changed = online_rx.changed(), if watching => {
                    if changed.is_err() {
                        debug!("connectivity source closed");
                        watching = false;
                        continue;
                    }
                    let now_online = *online_rx.borrow_and_update();
                    if now_online && !online {
                        info!("connectivity restored, scheduling sync");
                        deadline = Some(Instant::now() + schedule.reconnect_debounce);
                        ticker.reset();
                    } else if !now_online {
                        deadline = None;
                    }
                    online = now_online;
                }
            }
        }

        info!("sync watcher stopped");
    });

    SyncWatcher { tx, join }
}

fn spawn_pass(engine: &Arc<SyncEngine>) {
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        engine.sync_now().await;
    });
}

#[cfg(test)]
mod tests {
    use nexfi_store::{Database, Message, StoreHandle};

    use super::*;
    use crate::connectivity::{AlwaysOnline, ConnectivityMonitor};
    use crate::testing::FakeBackend;

    const HOUR: Duration = Duration::from_secs(3600);

    async fn store_with_pending() -> StoreHandle {
        let store = StoreHandle::spawn(Database::open_in_memory().unwrap()).unwrap();
        store
            .upsert(vec![Message::local("1".into(), "2".into(), "pending")])
            .await
            .unwrap();
        store
    }

    fn schedule(interval: Duration, initial: u64, debounce: u64) -> SyncSchedule {
        SyncSchedule {
            interval,
            initial_delay: Duration::from_millis(initial),
            reconnect_debounce: Duration::from_millis(debounce),
        }
    }

    #[tokio::test]
    async fn first_pass_runs_after_startup_delay_when_online() {
        let store = store_with_pending().await;
        let backend = Arc::new(FakeBackend::new());
        let engine = Arc::new(SyncEngine::new(store.clone(), backend.clone()));

        let watcher = start_sync_watcher(engine, Arc::new(AlwaysOnline::default()), schedule(HOUR, 20, 10));

        backend.wait_for_calls(1).await;
        assert!(store.get_unsynced().await.unwrap().is_empty());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn offline_start_waits_for_reconnect() {
        let store = store_with_pending().await;
        let backend = Arc::new(FakeBackend::new());
        let engine = Arc::new(SyncEngine::new(store.clone(), backend.clone()));
        let monitor = ConnectivityMonitor::new(false);

        let watcher = start_sync_watcher(engine, Arc::new(monitor.clone()), schedule(HOUR, 10, 20));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.calls(), 0);

        monitor.set_online(true);
        backend.wait_for_calls(1).await;
        watcher.stop().await;
    }

    #[tokio::test]
    async fn periodic_passes_retry_failed_records() {
        let store = store_with_pending().await;
        let backend = Arc::new(FakeBackend::new().failing_always());
        let engine = Arc::new(SyncEngine::new(store.clone(), backend.clone()));

        let watcher = start_sync_watcher(
            engine,
            Arc::new(AlwaysOnline::default()),
            schedule(Duration::from_millis(30), 10, 10),
        );

        backend.wait_for_calls(3).await;
        assert_eq!(store.get_unsynced().await.unwrap().len(), 1);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn manual_trigger_works_offline_and_stop_ends_scheduling() {
        let store = store_with_pending().await;
        let backend = Arc::new(FakeBackend::new().failing_always());
        let engine = Arc::new(SyncEngine::new(store.clone(), backend.clone()));
        let monitor = ConnectivityMonitor::new(false);

        let watcher = start_sync_watcher(engine, Arc::new(monitor.clone()), schedule(HOUR, 10, 10));

        watcher.trigger();
        backend.wait_for_calls(1).await;

        watcher.stop().await;
        watcher.stop().await;
        for _ in 0..50 {
            if watcher.is_stopped() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(watcher.is_stopped());

        let before = backend.calls();
        watcher.trigger();
        monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.calls(), before);
    }
}
