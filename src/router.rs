//! Return router - matches `return_py` envelopes to waiting callers.
//!
//! Sending an evaluate request and awaiting its result are separate acts:
//! the sender registers the request id here and gets a [`PendingReturn`];
//! the connection's read loop later resolves it by `caller_id`.
//!
//! Unknown or already-resolved ids are dropped silently. When the owning
//! connection closes, every outstanding entry is failed with
//! [`ConnectionClosed`](crate::PagewireError::ConnectionClosed) and later
//! registrations fail immediately.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{PagewireError, Result};

#[derive(Default)]
struct PendingState {
    waiters: HashMap<String, oneshot::Sender<Value>>,
    closed: bool,
}

/// Outstanding evaluate requests for one connection.
#[derive(Default)]
pub struct PendingCalls {
    state: Mutex<PendingState>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a continuation for the request `id`.
    pub fn register(&self, id: &str) -> PendingReturn {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state();
        if !state.closed {
            state.waiters.insert(id.to_string(), tx);
        }
        PendingReturn {
            id: id.to_string(),
            rx,
        }
    }

    /// Deliver a return value. Returns false if nobody was waiting.
    pub fn resolve(&self, caller_id: &str, retval: Value) -> bool {
        let waiter = self.state().waiters.remove(caller_id);
        match waiter {
            // A dropped receiver means the caller gave up; still counts as routed.
            Some(tx) => {
                let _ = tx.send(retval);
                true
            }
            None => {
                tracing::debug!(caller_id = %caller_id, "Dropping return for unknown caller");
                false
            }
        }
    }

    /// Forget a registration (e.g. after a timeout).
    pub fn cancel(&self, id: &str) -> bool {
        self.state().waiters.remove(id).is_some()
    }

    /// Fail all outstanding entries and refuse new ones.
    ///
    /// Returns how many entries were failed.
    pub fn close(&self) -> usize {
        let mut state = self.state();
        state.closed = true;
        let failed = state.waiters.len();
        state.waiters.clear();
        failed
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.state().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Continuation for one evaluate request.
#[derive(Debug)]
pub struct PendingReturn {
    id: String,
    rx: oneshot::Receiver<Value>,
}

impl PendingReturn {
    /// Id of the evaluate request this waits on.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the return value.
    ///
    /// Fails with `ConnectionClosed` if the connection closes first.
    pub async fn wait(self) -> Result<Value> {
        self.rx.await.map_err(|_| PagewireError::ConnectionClosed)
    }
}
