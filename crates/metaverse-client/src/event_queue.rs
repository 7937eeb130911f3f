//! Event-queue long-poll loop.
//!
//! Continuously polls the `EventQueueGet` capability and forwards each
//! received event to the simulator's pump in arrival order. HTTP 404 is
//! terminal; any other failure keeps the acknowledgement counter and
//! retries after a short backoff.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::{sync::mpsc, task::AbortHandle};
use tracing::{debug, trace};

use crate::capability::{EventQueueGet, QueueEvent, QueuePoll};

/// Backoff between polls after a transient failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Handle to one simulator's polling task.
///
/// Starting again cancels the previous task; closing is idempotent and
/// cooperative (the in-flight poll is simply dropped).
#[derive(Default)]
pub(crate) struct EventQueue {
    task: Mutex<Option<AbortHandle>>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn the poll loop against `capability`, delivering events into
    /// `tx`. Replaces any previous loop.
    pub(crate) fn start(&self, capability: EventQueueGet, tx: mpsc::Sender<QueueEvent>) {
        let handle = tokio::spawn(run(capability, tx)).abort_handle();
        if let Some(previous) = lock(&self.task).replace(handle) {
            previous.abort();
        }
    }

    /// Stop polling. Idempotent.
    pub(crate) fn close(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(task: &Mutex<Option<AbortHandle>>) -> MutexGuard<'_, Option<AbortHandle>> {
    task.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run(capability: EventQueueGet, tx: mpsc::Sender<QueueEvent>) {
    let mut ack = 0;
    loop {
        match capability.poll(ack, false).await {
            QueuePoll::Terminal => {
                debug!("event queue is terminal, polling stopped");
                return;
            }
            QueuePoll::Retry => {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            QueuePoll::Events { ack: next, events } => {
                for event in events {
                    trace!(name = event.name, "queue event");
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                ack = next;
            }
        }
    }
}
