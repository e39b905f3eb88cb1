use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde_json::Value;
use tokio::{
    sync::oneshot,
    time::{self, Instant},
};

use crate::{codec::Tag, Outcome};

/// Value delivered to a waiting request.
#[derive(Debug)]
pub(crate) enum Resolution {
    Reply(Value),
    /// The child's output ended before a reply arrived.
    Disconnected,
}

/// Result of handing a reply to the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// The tag is registered but its waiter already received a value.
    AlreadyResolved,
    /// Nobody is waiting on the tag (late reply or unknown tag).
    Unknown,
}

#[derive(Default)]
struct TableState {
    next_tag: Tag,
    /// `None` once the waiter has been resolved; the entry stays until deregistration.
    waiters: HashMap<Tag, Option<oneshot::Sender<Resolution>>>,
    disconnected: bool,
}

/// Tag → waiter map shared by request callers and the reader task.
///
/// Every operation takes the lock for a short, non-blocking section only. The lock is
/// never held across an `.await`.
#[derive(Default)]
pub(crate) struct CorrelationTable {
    state: Mutex<TableState>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates the next tag and parks a waiter under it.
    ///
    /// Once the table has been disconnected the returned waiter is already resolved
    /// with [`Resolution::Disconnected`].
    pub(crate) fn register(&self) -> Registration<'_> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();

        let mut tag = state.next_tag;
        while state.waiters.contains_key(&tag) {
            tag = tag.wrapping_add(1);
        }
        state.next_tag = tag.wrapping_add(1);

        let slot = if state.disconnected {
            let _ = tx.send(Resolution::Disconnected);
            None
        } else {
            Some(tx)
        };
        state.waiters.insert(tag, slot);
        drop(state);

        Registration {
            table: self,
            tag,
            receiver: rx,
        }
    }

    /// Hands `resolution` to the waiter registered under `tag`, if any.
    ///
    /// Only the first resolution of a tag is delivered.
    pub(crate) fn resolve(&self, tag: Tag, resolution: Resolution) -> Delivery {
        let mut state = self.lock();
        match state.waiters.get_mut(&tag) {
            Some(slot) => match slot.take() {
                Some(tx) => {
                    // The receiver may have been dropped by a cancelled request; the
                    // guard removes the entry right after.
                    let _ = tx.send(resolution);
                    Delivery::Delivered
                }
                None => Delivery::AlreadyResolved,
            },
            None => Delivery::Unknown,
        }
    }

    /// Resolves every pending waiter with [`Resolution::Disconnected`] and marks the
    /// table so later registrations resolve immediately. Returns the number of waiters
    /// woken.
    pub(crate) fn resolve_all(&self) -> usize {
        let mut state = self.lock();
        state.disconnected = true;
        let mut woken = 0;
        for slot in state.waiters.values_mut() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Resolution::Disconnected);
                woken += 1;
            }
        }
        woken
    }

    pub(crate) fn deregister(&self, tag: Tag) -> bool {
        self.lock().waiters.remove(&tag).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.lock().disconnected
    }
}

/// A registered waiter. Dropping it removes the tag from the table, whatever the
/// outcome of the request (including a cancelled future).
pub(crate) struct Registration<'a> {
    table: &'a CorrelationTable,
    tag: Tag,
    receiver: oneshot::Receiver<Resolution>,
}

impl Registration<'_> {
    pub(crate) fn tag(&self) -> Tag {
        self.tag
    }

    /// Waits for the resolution, bounded by `deadline` when given.
    ///
    /// A deadline already in the past never blocks: an already delivered reply is
    /// returned, otherwise the wait reports [`Outcome::TimedOut`].
    pub(crate) async fn wait(&mut self, deadline: Option<Instant>) -> Outcome {
        let received = match deadline {
            Some(deadline) => match time::timeout_at(deadline, &mut self.receiver).await {
                Ok(received) => received,
                Err(_) => return Outcome::TimedOut,
            },
            None => (&mut self.receiver).await,
        };

        match received {
            Ok(Resolution::Reply(value)) => Outcome::Reply(value),
            Ok(Resolution::Disconnected) | Err(_) => Outcome::Disconnected,
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.table.deregister(self.tag);
    }
}
