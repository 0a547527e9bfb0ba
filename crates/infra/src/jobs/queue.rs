//! Bounded channel carrying job-ready notifications to the worker pool.
//!
//! Only ids travel through the queue; the job state lives in the store.
//! Capacity is fixed at construction and a full queue is reported to the
//! submitter rather than buffered.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use docket_core::JobId;

use super::error::JobError;

/// Create a queue with room for `capacity` pending notifications.
///
/// A capacity of zero is raised to one.
pub fn channel(capacity: usize) -> (JobQueue, JobReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        JobQueue { tx, capacity },
        JobReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<JobId>,
    capacity: usize,
}

/// A reserved place in the queue.
///
/// Dropping the slot without sending gives the capacity back.
#[derive(Debug)]
pub struct QueueSlot {
    permit: mpsc::OwnedPermit<JobId>,
}

impl QueueSlot {
    pub fn send(self, id: JobId) {
        self.permit.send(id);
    }
}

impl JobQueue {
    /// Reserve a slot without waiting.
    pub fn try_reserve(&self) -> Result<QueueSlot, JobError> {
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(JobError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(JobError::QueueClosed),
        }
    }

    /// Reserve a slot, waiting for capacity.
    pub async fn reserve(&self) -> Result<QueueSlot, JobError> {
        self.tx
            .clone()
            .reserve_owned()
            .await
            .map(|permit| QueueSlot { permit })
            .map_err(|_| JobError::QueueClosed)
    }

    /// Send an id, waiting for capacity.
    pub async fn send(&self, id: JobId) -> Result<(), JobError> {
        self.tx.send(id).await.map_err(|_| JobError::QueueClosed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Notifications currently waiting (including reserved slots).
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, shared by every worker. Cheap to clone.
///
/// Each id is delivered to exactly one receiver.
#[derive(Debug, Clone)]
pub struct JobReceiver {
    rx: Arc<Mutex<mpsc::Receiver<JobId>>>,
}

impl JobReceiver {
    /// Wait for the next id. `None` once every producer is gone.
    pub async fn recv(&self) -> Option<JobId> {
        self.rx.lock().await.recv().await
    }
}
