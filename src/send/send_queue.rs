use crate::send::meta_submessage::MetaSubmessage;
use crate::wire::guid::Guid;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Default)]
struct QueueState {
    queue: Vec<MetaSubmessage>,
    in_flight: usize,
}

/// Collects outbound sub-messages from concurrently running state machine invocations.
///
/// Work that produces sub-messages runs inside a [SendTransaction]. Draining waits for running
///  transactions to finish so that a burst of work (e.g. one received datagram that is
///  dispatched to several readers) is sent as a single batch, and that batch can be
///  deduplicated and bundled as a whole.
#[derive(Default)]
pub struct SendQueue {
    state: Mutex<QueueState>,
    idle: Notify,
}

/// Marks a section of work whose sub-messages belong together. The transaction ends when the
///  guard is dropped.
pub struct SendTransaction<'a> {
    queue: &'a SendQueue,
}

impl Drop for SendTransaction<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.queue.idle.notify_waiters();
        }
    }
}

impl SendQueue {
    pub fn new() -> SendQueue {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin_transaction(&self) -> SendTransaction<'_> {
        self.lock().in_flight += 1;
        SendTransaction { queue: self }
    }

    pub fn enqueue(&self, msg: MetaSubmessage) {
        self.lock().queue.push(msg);
    }

    pub fn enqueue_all(&self, msgs: impl IntoIterator<Item = MetaSubmessage>) {
        self.lock().queue.extend(msgs);
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn num_transactions(&self) -> usize {
        self.lock().in_flight
    }

    /// Removes queued sub-messages from or to an entity that is going away
    pub fn purge(&self, id: Guid) -> usize {
        let purged = self.purge_where(|msg| msg.involves(id));
        if purged > 0 {
            debug!("purged {} queued sub-messages involving {:?}", purged, id);
        }
        purged
    }

    /// Removes queued sub-messages between two entities that were disassociated
    pub fn purge_between(&self, a: Guid, b: Guid) -> usize {
        let purged = self.purge_where(|msg| msg.connects(a, b));
        if purged > 0 {
            debug!("purged {} queued sub-messages between {:?} and {:?}", purged, a, b);
        }
        purged
    }

    fn purge_where(&self, matches: impl Fn(&MetaSubmessage) -> bool) -> usize {
        let mut state = self.lock();
        let before = state.queue.len();
        state.queue.retain(|msg| !matches(msg));
        before - state.queue.len()
    }

    /// Takes everything that is queued once no transaction is running. Transactions are short,
    ///  but the wait is bounded by `timeout` nonetheless: after that, whatever is queued is
    ///  taken.
    pub async fn drain(&self, timeout: Duration) -> Vec<MetaSubmessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register before checking, so that a transaction ending in between is not missed
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.in_flight == 0 {
                    return std::mem::take(&mut state.queue);
                }
                trace!("waiting for {} running transactions before draining the send queue", state.in_flight);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!("send queue: transactions did not finish within {:?} - draining anyway", timeout);
                return std::mem::take(&mut self.lock().queue);
            }
        }
    }
}
