// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-consumer work queues with delayed submission.
//!
//! Every adapter owns a handful of these: work items run one at a time, in
//! submission order, on a task dedicated to the queue. A work item must never
//! flush the queue it is running on.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use slog::{debug, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

enum Item {
    Work(BoxFuture<'static, ()>),
    Barrier(oneshot::Sender<()>),
}

#[derive(Clone)]
pub(crate) struct WorkQueue {
    tx: mpsc::UnboundedSender<Item>,
}

impl WorkQueue {
    /// Create a queue and spawn its consumer.
    ///
    /// Must be called from a Tokio runtime. The consumer exits once every
    /// handle to the queue has been dropped.
    pub(crate) fn new(name: String, log: &Logger) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log = log.new(slog::o!("queue" => name));
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Item::Work(work) => work.await,
                    Item::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(log, "work queue closed");
        });
        Self { tx }
    }

    /// Append `work` to the queue. Returns false if the consumer is gone.
    pub(crate) fn queue<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.send(Item::Work(Box::pin(work))).is_ok()
    }

    /// Wait until everything queued before this call has run.
    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Item::Barrier(done_tx)).is_err() {
            return;
        }
        // A consumer which died mid-item drops the barrier; there is nothing
        // left to wait for in that case either.
        let _ = done_rx.await;
    }

    /// Queue `work` after `delay` has elapsed, unless cancelled first.
    pub(crate) fn queue_delayed<F>(
        &self,
        delay: Duration,
        work: F,
    ) -> DelayedWork
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(Mutex::new(DelayState::Pending));
        let queue = self.clone();
        let timer_state = state.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = timer_state.lock().unwrap();
            if *state == DelayState::Pending {
                *state = DelayState::Queued;
                // Submitted under the state lock so a canceller which sees
                // `Queued` is guaranteed to find the item ahead of its flush.
                queue.queue(work);
            }
        });
        DelayedWork { state, timer: timer.abort_handle() }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DelayState {
    Pending,
    Queued,
    Cancelled,
}

/// Handle to a delayed work item.
pub(crate) struct DelayedWork {
    state: Arc<Mutex<DelayState>>,
    timer: AbortHandle,
}

impl DelayedWork {
    /// Attempt to cancel the work before it is queued.
    ///
    /// Returns false if the delay already elapsed (or the work was cancelled
    /// earlier). The work may then be queued or running, and a caller that
    /// needs it finished must flush the queue it was submitted to.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == DelayState::Pending {
            *state = DelayState::Cancelled;
            self.timer.abort();
            true
        } else {
            false
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        *self.state.lock().unwrap() == DelayState::Pending
    }
}
