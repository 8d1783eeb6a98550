//! Request/response correlation.

use crate::error::CoreError;
use easycom_protocol::Reply;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// Maximum number of requests awaiting a response on one connection.
pub const MAX_PENDING: usize = 65_535;

/// Identifiers cycle through `0..ID_SPACE`; `u16::MAX` is never issued.
const ID_SPACE: u16 = u16::MAX;

struct Pending {
    next_id: u16,
    waiters: HashMap<u16, oneshot::Sender<Reply>>,
}

fn advance(id: u16) -> u16 {
    if id + 1 >= ID_SPACE {
        0
    } else {
        id + 1
    }
}

/// Tracks requests awaiting responses on one connection.
pub struct RequestCorrelator {
    pending: Mutex<Pending>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                next_id: 0,
                waiters: HashMap::new(),
            }),
        }
    }

    /// Allocates a request identifier and a receiver for its reply.
    ///
    /// Identifiers still awaiting a reply are skipped, so a wrapped counter
    /// never aliases a live request.
    pub fn register(&self) -> Result<(u16, oneshot::Receiver<Reply>), CoreError> {
        let mut pending = self.pending.lock();
        if pending.waiters.len() >= MAX_PENDING {
            return Err(CoreError::TooManyPending(MAX_PENDING));
        }

        let mut id = pending.next_id;
        while pending.waiters.contains_key(&id) {
            id = advance(id);
        }
        pending.next_id = advance(id);

        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(id, tx);
        Ok((id, rx))
    }

    /// Delivers `reply` to the request `id`.
    ///
    /// Hands the reply back if nobody is waiting for it any more.
    pub fn resolve(&self, id: u16, reply: Reply) -> Result<(), Reply> {
        let mut pending = self.pending.lock();
        match pending.waiters.remove(&id) {
            Some(tx) => tx.send(reply),
            None => Err(reply),
        }
    }

    /// Forgets request `id`. Returns whether it was still pending.
    pub fn cancel(&self, id: u16) -> bool {
        self.pending.lock().waiters.remove(&id).is_some()
    }

    /// Resolves every pending request as released.
    pub fn release_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.waiters.len();
        for (_, tx) in pending.waiters.drain() {
            let _ = tx.send(Reply::released());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the reply to request `id`, resolving as a timeout once
    /// `timeout` elapses.
    ///
    /// Dropping the returned future before it completes forgets the
    /// request, so an abandoned wait never holds on to its id.
    pub async fn wait(
        &self,
        id: u16,
        mut rx: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> Reply {
        let guard = WaitGuard {
            correlator: self,
            id,
            armed: true,
        };

        let reply = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            // Sender dropped without a reply: the connection went away.
            Ok(Err(_)) => Reply::released(),
            Err(_) => {
                if self.cancel(id) {
                    tracing::debug!("Request id={} timed out", id);
                    Reply::timeout()
                } else {
                    // Resolved between the deadline and the cancel.
                    rx.try_recv().unwrap_or_else(|_| Reply::timeout())
                }
            }
        };
        guard.disarm();
        reply
    }
}

/// Removes a request from the table if its waiter goes away early.
///
/// Disarmed once the entry is gone, since the id may already belong to a
/// newer request by the time the guard drops.
struct WaitGuard<'a> {
    correlator: &'a RequestCorrelator,
    id: u16,
    armed: bool,
}

impl WaitGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.correlator.cancel(self.id) {
            tracing::debug!("Request id={} abandoned by its caller", self.id);
        }
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
