//! Per-slot mutual exclusion
//!
//! Resolution for a state slot must never run twice in flight. The lock is
//! built from chained oneshot futures: each acquirer captures the previous
//! holder's completion signal and installs its own. The table only remembers
//! the latest waiter per key; earlier waiters keep the receiver they captured
//! at acquire time, so per-waiter ordering is preserved even though the
//! table's view of "who is waiting" is lossy.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use accord_core::StateKey;

struct Waiter {
    seq: u64,
    done: oneshot::Receiver<()>,
}

/// Keyed asynchronous mutual exclusion over state slots.
///
/// Operations on the same key observe a strict happens-before order matching
/// acquire order; operations on different keys are fully concurrent. Acquire
/// never blocks the calling thread.
#[derive(Default)]
pub struct KeyedLock {
    pending: Mutex<PendingTable>,
}

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<StateKey, Waiter>,
    next_seq: u64,
}

impl KeyedLock {
    pub fn new() -> Self {
        KeyedLock::default()
    }

    /// Acquire the lock for `key`, suspending until the previous holder
    /// releases. Returns immediately if the key is uncontended.
    ///
    /// The returned guard releases on drop, so every exit path of the caller
    /// releases the slot.
    pub async fn acquire(&self, key: StateKey) -> KeyGuard<'_> {
        let (done_tx, done_rx) = oneshot::channel();

        let (seq, previous) = {
            let mut table = self.pending.lock();
            table.next_seq += 1;
            let seq = table.next_seq;
            let previous = table.waiters.insert(
                key.clone(),
                Waiter {
                    seq,
                    done: done_rx,
                },
            );
            (seq, previous)
        };

        if let Some(previous) = previous {
            // A closed channel means the holder dropped without signalling;
            // either way it no longer holds the slot.
            let _ = previous.done.await;
        }

        KeyGuard {
            lock: self,
            key,
            seq,
            done: Some(done_tx),
        }
    }

    /// Number of keys with an in-flight holder or waiter.
    pub fn contended_keys(&self) -> usize {
        self.pending.lock().waiters.len()
    }
}

/// Holder's handle on a slot; dropping it releases the slot.
pub struct KeyGuard<'a> {
    lock: &'a KeyedLock,
    key: StateKey,
    seq: u64,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        {
            let mut table = self.lock.pending.lock();
            // Only reap the table entry if no later acquire superseded it;
            // a newer waiter's receiver must stay in place.
            if table
                .waiters
                .get(&self.key)
                .is_some_and(|w| w.seq == self.seq)
            {
                table.waiters.remove(&self.key);
            }
        }

        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
