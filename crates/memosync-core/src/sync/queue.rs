//! Single-consumer, ordered work queue for one account.
//!
//! Every unit of network-visible work for an account goes through one
//! `OperationQueue`. A dedicated worker task runs the units strictly in
//! enqueue order; unit N starts only after unit N-1 has finished, and a unit
//! that fails or panics does not stop the ones behind it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueuedJob {
    label: &'static str,
    job: Job,
}

/// Handle to an account's operation queue. Cloning shares the same worker.
#[derive(Clone)]
pub struct OperationQueue {
    job_tx: mpsc::UnboundedSender<QueuedJob>,
    account: Arc<str>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("OperationQueue")
            .field("account", &self.account)
            .field("closed", &self.job_tx.is_closed())
            .finish()
    }
}

impl OperationQueue {
    /// Start the worker for `account`. Must be called inside a tokio runtime.
    pub fn spawn(account: impl Into<String>) -> Self {
        let account: Arc<str> = Arc::from(account.into());
        let (job_tx, job_rx) = mpsc::unbounded_channel();

        tokio::spawn(worker_task(Arc::clone(&account), job_rx));
        debug!(account = %account, "Started operation queue");

        Self { job_tx, account }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Append a unit of work without waiting for it.
    pub fn enqueue<F>(&self, label: &'static str, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.job_tx
            .send(QueuedJob {
                label,
                job: Box::pin(job),
            })
            .map_err(|_| Error::QueueClosed)
    }

    /// Append a unit of work and wait for its output.
    pub async fn run<F, T>(&self, label: &'static str, job: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.enqueue(label, async move {
            // The caller may have stopped waiting.
            let _ = result_tx.send(job.await);
        })?;

        // A dropped sender means the job panicked or the worker shut down.
        result_rx.await.map_err(|_| Error::QueueClosed)
    }

    /// Wait until every unit enqueued before this call has finished.
    pub async fn flush(&self) -> Result<()> {
        self.run("flush", async {}).await
    }
}

async fn worker_task(account: Arc<str>, mut job_rx: mpsc::UnboundedReceiver<QueuedJob>) {
    while let Some(QueuedJob { label, job }) = job_rx.recv().await {
        debug!(account = %account, operation = label, "Running queued operation");
        // Spawned so a panic stays inside the unit; awaited so order is kept.
        if let Err(join_error) = tokio::spawn(job).await {
            error!(
                account = %account,
                operation = label,
                error = %join_error,
                "Queued operation aborted"
            );
        }
    }

    debug!(account = %account, "Operation queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn jobs_run_in_enqueue_order_without_overlap() {
        let queue = OperationQueue::spawn("alice");
        let log = Arc::new(Mutex::new(Vec::new()));

        for index in 0..5u64 {
            let log = Arc::clone(&log);
            queue
                .enqueue("record", async move {
                    log.lock().unwrap().push(format!("start {index}"));
                    // Later jobs sleep less; overlap would reorder the log.
                    tokio::time::sleep(Duration::from_millis(20 - index * 4)).await;
                    log.lock().unwrap().push(format!("end {index}"));
                })
                .unwrap();
        }
        queue.flush().await.unwrap();

        let expected: Vec<String> = (0..5)
            .flat_map(|index| [format!("start {index}"), format!("end {index}")])
            .collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_returns_the_job_output() {
        let queue = OperationQueue::spawn("alice");
        let value = queue.run("answer", async { 41 + 1 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_panicking_job_does_not_stop_the_queue() {
        let queue = OperationQueue::spawn("alice");

        let failed = queue
            .run("explode", async {
                panic!("boom");
            })
            .await;
        assert!(matches!(failed, Err(Error::QueueClosed)));

        let value = queue.run("after", async { "still running" }).await.unwrap();
        assert_eq!(value, "still running");
    }
}
