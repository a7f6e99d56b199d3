//! Wait queue for requests nothing could serve yet.
//!
//! Requests are served by effective priority (requester priority plus the
//! group's boost), highest first, and first-come first-served within the
//! same priority.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testfarm_id::RequestId;
use tokio::sync::Mutex;

use crate::policy::Requester;
use crate::selection::Requirements;

/// A waiting allocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub request_id: RequestId,
    pub requester: Requester,
    pub requirements: Requirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Why it could not be served when it arrived.
    pub reason: String,
}

type QueueKey = (Reverse<i32>, u64);

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    order: BTreeMap<QueueKey, QueuedRequest>,
    index: HashMap<RequestId, QueueKey>,
}

#[derive(Debug, Default)]
pub struct AllocationQueue {
    state: Mutex<QueueState>,
}

impl AllocationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or re-prioritize a request. Returns its 1-based position.
    ///
    /// A request already waiting keeps its arrival order.
    pub async fn enqueue(&self, request: QueuedRequest) -> usize {
        let mut state = self.state.lock().await;

        let seq = match state.index.remove(&request.request_id) {
            Some(old) => {
                state.order.remove(&old);
                old.1
            }
            None => {
                state.next_seq += 1;
                state.next_seq
            }
        };

        let key = (Reverse(request.priority), seq);
        state.index.insert(request.request_id, key);
        state.order.insert(key, request);
        state.order.range(..=key).count()
    }

    pub async fn remove(&self, id: &RequestId) -> Option<QueuedRequest> {
        let mut state = self.state.lock().await;
        let key = state.index.remove(id)?;
        state.order.remove(&key)
    }

    pub async fn get(&self, id: &RequestId) -> Option<QueuedRequest> {
        let state = self.state.lock().await;
        let key = state.index.get(id)?;
        state.order.get(key).cloned()
    }

    /// 1-based position in service order.
    pub async fn position(&self, id: &RequestId) -> Option<usize> {
        let state = self.state.lock().await;
        let key = *state.index.get(id)?;
        Some(state.order.range(..=key).count())
    }

    /// Waiting requests in service order.
    pub async fn ordered(&self) -> Vec<QueuedRequest> {
        self.state.lock().await.order.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
