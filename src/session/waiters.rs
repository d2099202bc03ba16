//! Request-response correlation for the command plane
//!
//! Commands sent over a control channel (or relayed across nodes) are
//! answered asynchronously; a [ResponseWaiters] map pairs each request id
//! with a buffered one-slot channel the response is delivered through.
//! Every response kind gets its own instance owned by the session manager
//! so tests can run with independent maps.

use hashbrown::HashMap;
use log::warn;
use parking_lot::RwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for response")]
    Timeout,
    #[error("wait cancelled by shutdown")]
    Cancelled,
    #[error("response channel closed")]
    Closed,
}

/// Map of outstanding request ids to their response slots
pub struct ResponseWaiters<T> {
    waiters: RwLock<HashMap<String, mpsc::Sender<T>>>,
}

impl<T> Default for ResponseWaiters<T> {
    fn default() -> Self {
        Self {
            waiters: Default::default(),
        }
    }
}

impl<T> ResponseWaiters<T> {
    /// Registers a pending request, returning the receiver the response
    /// will arrive on
    pub fn register(&self, request_id: &str) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(1);
        self.waiters.write().insert(request_id.to_string(), tx);
        rx
    }

    /// Delivers a response to its waiter
    ///
    /// At most one response is held per request id; a second response for
    /// the same id (or one for an unknown id) is logged and dropped.
    pub fn handle_response(&self, request_id: &str, response: T) -> bool {
        let waiters = self.waiters.read();
        let tx = match waiters.get(request_id) {
            Some(value) => value,
            None => {
                warn!("dropping response for unknown request {}", request_id);
                return false;
            }
        };

        if tx.try_send(response).is_err() {
            warn!("dropping duplicate response for request {}", request_id);
            return false;
        }
        true
    }

    /// Waits for the response, unregistering the request on the way out
    pub async fn wait_for_response(
        &self,
        request_id: &str,
        mut rx: mpsc::Receiver<T>,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<T, WaitError> {
        let result = tokio::select! {
            value = rx.recv() => value.ok_or(WaitError::Closed),
            _ = tokio::time::sleep(timeout) => Err(WaitError::Timeout),
            _ = cancel.wait_for(|stop| *stop) => Err(WaitError::Cancelled),
        };

        self.unregister(request_id);
        result
    }

    pub fn unregister(&self, request_id: &str) {
        self.waiters.write().remove(request_id);
    }

    pub fn has_waiter(&self, request_id: &str) -> bool {
        self.waiters.read().contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.read().len()
    }
}
