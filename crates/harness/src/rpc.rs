//! Request/response correlation for line- and frame-based JSON protocols

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

use crate::error::Result;

type Waiter = oneshot::Sender<Result<Value>>;

/// Outstanding requests keyed by message id
pub(crate) struct PendingCalls {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next id without registering a waiter
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate an id and the receiver its reply will be delivered to
    pub fn register(&self) -> (u64, oneshot::Receiver<Result<Value>>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver a reply; returns false for unknown ids
    pub fn resolve(&self, id: u64, reply: Result<Value>) -> bool {
        match self.waiters.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: u64) {
        self.waiters.lock().remove(&id);
    }

    /// Drop every waiter so their receivers observe a closed channel
    pub fn fail_all(&self) {
        self.waiters.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}
