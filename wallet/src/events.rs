//! The wallet event queue.
//!
//! Events are pushed by wallet internals and consumed through
//! [`EventQueue::pop`], which waits until an event is available or the queue
//! is shut down. Per-queue ordering is FIFO.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::WalletError;

/// Something the wallet wants its caller to know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    /// Block synchronization advanced.
    SyncProgressUpdated {
        /// Blocks processed so far.
        processed: u32,
        /// Total blocks known.
        total: u32,
    },
    /// Block synchronization finished.
    SyncCompleted,
    /// Previously locked funds became spendable.
    BalanceUnlocked,
    /// A transaction entered the wallet.
    TransactionCreated {
        /// Index into the wallet's transaction log.
        transaction_id: usize,
    },
    /// A known transaction changed.
    TransactionUpdated {
        /// Index into the wallet's transaction log.
        transaction_id: usize,
    },
}

pub(crate) struct EventQueue {
    queue: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    events: VecDeque<WalletEvent>,
    stopped: bool,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(QueueState {
                events: VecDeque::new(),
                stopped: false,
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn push(&self, event: WalletEvent) {
        let mut state = self.queue.lock().unwrap();
        if state.stopped {
            return;
        }
        state.events.push_back(event);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wait for the next event. Fails with `OperationCancelled` once the
    /// queue is stopped and drained.
    pub(crate) async fn pop(&self) -> Result<WalletEvent, WalletError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the queue so a push between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            {
                let mut state = self.queue.lock().unwrap();
                if let Some(event) = state.events.pop_front() {
                    return Ok(event);
                }
                if state.stopped {
                    return Err(WalletError::OperationCancelled);
                }
            }
            notified.await;
        }
    }

    /// Stop the queue: wakes all waiters, further pushes are dropped.
    pub(crate) fn stop(&self) {
        self.queue.lock().unwrap().stopped = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_come_out_in_order() {
        let queue = EventQueue::new();
        queue.push(WalletEvent::SyncCompleted);
        queue.push(WalletEvent::BalanceUnlocked);
        assert_eq!(queue.pop().await.unwrap(), WalletEvent::SyncCompleted);
        assert_eq!(queue.pop().await.unwrap(), WalletEvent::BalanceUnlocked);
    }

    #[tokio::test]
    async fn stop_cancels_waiters() {
        let queue = std::sync::Arc::new(EventQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.stop();
        assert_eq!(waiter.await.unwrap(), Err(WalletError::OperationCancelled));
    }

    #[tokio::test]
    async fn queued_events_drain_before_cancellation() {
        let queue = EventQueue::new();
        queue.push(WalletEvent::SyncCompleted);
        queue.stop();
        assert_eq!(queue.pop().await.unwrap(), WalletEvent::SyncCompleted);
        assert_eq!(queue.pop().await, Err(WalletError::OperationCancelled));
    }
}
