use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::protocol::JobResult;

/// Correlation table from job id to the submitter waiting on it.
///
/// Removing an entry is what claims it: whichever of delivery, timeout or
/// disconnect removes the sender first decides the outcome, and the others
/// find nothing. Clones share the same table.
#[derive(Clone, Default)]
pub struct PendingResults {
    slots: Arc<Mutex<HashMap<String, oneshot::Sender<JobResult>>>>,
}

impl PendingResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `job_id` and return the receiving end.
    pub async fn register(&self, job_id: &str) -> oneshot::Receiver<JobResult> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().await.insert(job_id.to_string(), tx);
        rx
    }

    /// Hand `result` to the waiting submitter. Returns false when nobody is
    /// waiting for that id any more.
    pub async fn fulfill(&self, result: JobResult) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.remove(&result.id) {
            // The receiver may have been dropped by a cancelled submitter.
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop the slot for `job_id`, closing its receiver. Returns false if it
    /// was already claimed.
    pub async fn abandon(&self, job_id: &str) -> bool {
        self.slots.lock().await.remove(job_id).is_some()
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.slots.lock().await.contains_key(job_id)
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str) -> JobResult {
        JobResult {
            id: id.to_string(),
            success: true,
            output: "ok".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fulfill_delivers_once() {
        let pending = PendingResults::new();
        let rx = pending.register("job-1").await;

        assert!(pending.fulfill(result("job-1")).await);
        assert!(!pending.fulfill(result("job-1")).await);
        assert_eq!(rx.await.unwrap().output, "ok");
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_result_is_dropped() {
        let pending = PendingResults::new();
        let _rx = pending.register("job-1").await;

        assert!(!pending.fulfill(result("job-2")).await);
        assert!(pending.contains("job-1").await);
    }

    #[tokio::test]
    async fn abandon_closes_receiver() {
        let pending = PendingResults::new();
        let rx = pending.register("job-1").await;

        assert!(pending.abandon("job-1").await);
        assert!(!pending.abandon("job-1").await);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn late_result_after_abandon_is_ignored() {
        let pending = PendingResults::new();
        let _rx = pending.register("job-1").await;
        pending.abandon("job-1").await;

        assert!(!pending.fulfill(result("job-1")).await);
        assert_eq!(pending.len().await, 0);
    }
}
