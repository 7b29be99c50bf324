//! Scriptable in-memory backend for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use nexfi_shared::protocol::{SyncRequest, SyncResponse};

use crate::backend::SyncBackend;
use crate::error::{Result, SyncError};

#[derive(Default)]
pub(crate) struct FakeBackend {
    calls: AtomicUsize,
    pushed: Mutex<Vec<String>>,
    failing: HashSet<String>,
    fail_all: bool,
    responses: HashMap<String, SyncResponse>,
    gate: Option<Semaphore>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the push of `id` with a 503.
    pub fn failing_on(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    pub fn failing_always(mut self) -> Self {
        self.fail_all = true;
        self
    }

    pub fn responding(mut self, id: &str, response: SyncResponse) -> Self {
        self.responses.insert(id.to_string(), response);
        self
    }

    /// Block every push until [`release`](Self::release) grants it.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release(&self, pushes: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(pushes);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..500 {
            if self.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backend saw {} calls, expected {n}", self.calls());
    }
}

#[async_trait]
impl SyncBackend for FakeBackend {
    async fn push(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.pushed.lock().unwrap().push(request.local_id.clone());

        if self.fail_all || self.failing.contains(&request.local_id) {
            return Err(SyncError::Status(503));
        }
        if let Some(response) = self.responses.get(&request.local_id) {
            return Ok(response.clone());
        }
        Ok(SyncResponse {
            success: true,
            message_id: Some(format!("srv-{}", request.local_id)),
        })
    }
}
