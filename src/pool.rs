use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

type Job = BoxFuture<'static, ()>;

/// Runs background work with at most `size` jobs in flight. Jobs are admitted
/// in submission order: a single dispatcher hands out slots from a FIFO queue,
/// so job `n + 1` never starts before job `n` has been given a slot.
#[derive(Clone)]
pub struct WorkerPool {
    jobs: mpsc::UnboundedSender<Job>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Must be called from within a tokio runtime. The dispatcher stops once
    /// every handle is dropped and the queue has drained.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let permits = Arc::new(Semaphore::new(size));
        let (jobs, queue) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(queue, permits.clone()));
        Self {
            jobs,
            permits,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently holding a slot.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    pub fn spawn<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.jobs.send(job.boxed()).is_err() {
            debug!("worker pool dispatcher is gone, dropping job");
        }
    }
}

async fn dispatch(mut queue: mpsc::UnboundedReceiver<Job>, permits: Arc<Semaphore>) {
    while let Some(job) = queue.recv().await {
        // The semaphore is never closed.
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
    }
}
