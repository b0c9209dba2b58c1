//! Correlation of outstanding requests with their replies.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::messages::RequestId;

/// How a request completed: the answer's result, or the error value.
pub type Completion = std::result::Result<Option<Value>, Value>;

/// Table of requests waiting for a reply.
///
/// Ids start at 1, increase monotonically and are never reused. An entry is
/// removed the moment it completes, is cancelled, or the table is cleared.
pub struct PendingRequests {
    next_id: AtomicU64,
    waiting: DashMap<RequestId, oneshot::Sender<Completion>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: DashMap::new(),
        }
    }

    /// Allocate a fresh id and the receiver its completion arrives on.
    pub fn register(&self) -> (RequestId, oneshot::Receiver<Completion>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        (id, rx)
    }

    /// Complete a request. Returns false when nothing was waiting on `id`.
    pub fn complete(&self, id: RequestId, completion: Completion) -> bool {
        match self.waiting.remove(&id) {
            Some((_, tx)) => {
                // The caller may have stopped waiting; the entry is gone either way.
                let _ = tx.send(completion);
                true
            }
            None => false,
        }
    }

    /// Forget a request without completing it.
    pub fn cancel(&self, id: RequestId) {
        self.waiting.remove(&id);
    }

    /// Drop every waiter. Their receivers observe a closed channel.
    pub fn clear(&self) {
        self.waiting.clear();
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
