//! Bounded queue between the acquisition loop and the workers.

use tokio::sync::{mpsc, Mutex};

use flowjob_store::JobRecord;

use crate::error::ExecutorError;

/// Bounded FIFO of locked jobs waiting for a worker.
///
/// Pushing blocks while the queue is full and popping blocks while it is
/// empty. Workers share the single receiver.
pub struct DispatchQueue {
    tx: mpsc::Sender<JobRecord>,
    rx: Mutex<mpsc::Receiver<JobRecord>>,
    capacity: usize,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn free_capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn push(&self, job: JobRecord) -> Result<(), ExecutorError> {
        self.tx.send(job).await.map_err(|_| ExecutorError::QueueClosed)
    }

    /// Next job, or `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<JobRecord> {
        self.rx.lock().await.recv().await
    }

    /// Wait until at least one slot is free.
    pub async fn wait_for_space(&self) -> Result<(), ExecutorError> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| ExecutorError::QueueClosed)?;
        drop(permit);
        Ok(())
    }

    /// Remove every queued job without waiting.
    pub(crate) async fn drain(&self) -> Vec<JobRecord> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(job) = rx.try_recv() {
            drained.push(job);
        }
        drained
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
