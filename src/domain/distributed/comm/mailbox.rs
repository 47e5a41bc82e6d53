use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::domain::distributed::comm::{CommError, RecvFrom, Tag};
use crate::domain::node::WorkerId;

struct Queues {
    /// Point-to-point messages, FIFO per (source, tag) pair.
    direct: HashMap<(WorkerId, Tag), VecDeque<Vec<u8>>>,

    /// Collective payloads, FIFO per root rank.
    collective: HashMap<WorkerId, VecDeque<Vec<u8>>>,

    closed: bool,
}

/// Inbound message buffer of one group member.
///
/// Transport tasks push, receivers pop; matching is by (source, tag) for
/// point-to-point traffic and by root for collectives, so a receive never
/// consumes a message another caller is waiting on. Once closed, pops drain
/// what is buffered and then fail with `Closed`.
pub(crate) struct Mailbox {
    queues: Mutex<Queues>,
    notify: Notify,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(Queues { direct: HashMap::new(), collective: HashMap::new(), closed: false }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn push_direct(&self, src: WorkerId, tag: Tag, payload: Vec<u8>) {
        let mut guard = self.queues.lock().expect("Mailbox lock poisoned");
        guard.direct.entry((src, tag)).or_default().push_back(payload);
        drop(guard);

        self.notify.notify_waiters();
    }

    pub(crate) fn push_collective(&self, root: WorkerId, payload: Vec<u8>) {
        let mut guard = self.queues.lock().expect("Mailbox lock poisoned");
        guard.collective.entry(root).or_default().push_back(payload);
        drop(guard);

        self.notify.notify_waiters();
    }

    /// Marks the mailbox closed and wakes every blocked receiver.
    pub(crate) fn close(&self) {
        let mut guard = self.queues.lock().expect("Mailbox lock poisoned");
        guard.closed = true;
        drop(guard);

        self.notify.notify_waiters();
    }

    /// Pops the next point-to-point message matching `src` and `tag`,
    /// waiting if none is buffered. For `RecvFrom::Any` the lowest waiting
    /// source rank wins, which keeps multi-sender tests deterministic.
    pub(crate) async fn pop_direct(&self, src: RecvFrom, tag: Tag) -> Result<(WorkerId, Vec<u8>), CommError> {
        loop {
            // The notified future must exist before the queue check, so a
            // push between check and await cannot be missed.
            let notified = self.notify.notified();

            {
                let mut guard = self.queues.lock().expect("Mailbox lock poisoned");

                let matching = match src {
                    RecvFrom::Peer(peer) => {
                        let has_message = guard.direct.get(&(peer, tag)).is_some_and(|queue| !queue.is_empty());
                        has_message.then_some(peer)
                    }
                    RecvFrom::Any => guard
                        .direct
                        .iter()
                        .filter(|((_, queued_tag), queue)| *queued_tag == tag && !queue.is_empty())
                        .map(|((peer, _), _)| *peer)
                        .min(),
                };

                if let Some(peer) = matching {
                    if let Some(payload) = guard.direct.get_mut(&(peer, tag)).and_then(VecDeque::pop_front) {
                        return Ok((peer, payload));
                    }
                }

                if guard.closed {
                    return Err(CommError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Pops the next collective payload broadcast from `root`, waiting if
    /// none is buffered.
    pub(crate) async fn pop_collective(&self, root: WorkerId) -> Result<Vec<u8>, CommError> {
        loop {
            let notified = self.notify.notified();

            {
                let mut guard = self.queues.lock().expect("Mailbox lock poisoned");

                if let Some(payload) = guard.collective.get_mut(&root).and_then(VecDeque::pop_front) {
                    return Ok(payload);
                }

                if guard.closed {
                    return Err(CommError::Closed);
                }
            }

            notified.await;
        }
    }
}
